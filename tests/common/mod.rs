#![allow(dead_code)]

use chrono::Utc;
use ledgersync::application::checkout::CheckoutReconciler;
use ledgersync::application::ledger_client::TransactionLedgerClient;
use ledgersync::config::SyncConfig;
use ledgersync::domain::event::{ChangeEvent, Operation};
use ledgersync::domain::ledger::{Amount, CreditPlan};
use ledgersync::domain::ports::{LedgerStoreRef, PaymentCollaboratorRef};
use ledgersync::domain::quote::{Quote, QuoteStatus};
use ledgersync::infrastructure::in_memory::{InMemoryLedgerStore, SimulatedPaymentCollaborator};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub struct CheckoutHarness {
    pub ledger: Arc<InMemoryLedgerStore>,
    pub payments: Arc<SimulatedPaymentCollaborator>,
    pub client: Arc<TransactionLedgerClient>,
    pub reconciler: Arc<CheckoutReconciler>,
}

/// Ledger, simulated provider and reconciler wired with the default configuration.
pub fn checkout_harness(settle_on_reconcile: bool) -> CheckoutHarness {
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let payments = Arc::new(
        SimulatedPaymentCollaborator::new(ledger.clone()).settle_on_reconcile(settle_on_reconcile),
    );
    let harness = with_collaborator(ledger.clone(), payments.clone());
    CheckoutHarness {
        ledger,
        payments,
        client: harness.0,
        reconciler: harness.1,
    }
}

/// Reconciler over any ledger store and provider, with the default configuration.
pub fn with_collaborator(
    ledger: LedgerStoreRef,
    payments: PaymentCollaboratorRef,
) -> (Arc<TransactionLedgerClient>, Arc<CheckoutReconciler>) {
    let config = SyncConfig::default();
    let client = Arc::new(TransactionLedgerClient::new(ledger, config.ledger_staleness));
    let reconciler = Arc::new(CheckoutReconciler::new(
        client.clone(),
        payments,
        config.checkout,
        config.collaborator_timeout,
    ));
    (client, reconciler)
}

pub fn plan() -> CreditPlan {
    CreditPlan {
        id: "starter".into(),
        credits: 50,
        price: Amount::from_minor_units(2000).unwrap(),
    }
}

pub fn quote(id: &str, project: &str, client: &str, freelancer: &str, status: QuoteStatus) -> Quote {
    let created_at = Utc::now();
    Quote {
        id: id.into(),
        project_id: project.into(),
        client_id: client.into(),
        freelancer_id: freelancer.into(),
        status,
        created_at,
        updated_at: created_at,
    }
}

pub fn status_update(filter: &str, id: &str, old: &str, new: &str) -> ChangeEvent {
    ChangeEvent {
        operation: Operation::Update,
        table: "quotes".into(),
        filter: filter.into(),
        old_row: Some(json!({"id": id, "status": old})),
        new_row: Some(json!({"id": id, "status": new})),
    }
}

pub fn quote_insert(filter: &str, id: &str) -> ChangeEvent {
    ChangeEvent {
        operation: Operation::Insert,
        table: "quotes".into(),
        filter: filter.into(),
        old_row: None,
        new_row: Some(json!({"id": id, "status": "pending"})),
    }
}

/// Refetch callback that counts its runs and reports each one on a channel.
#[derive(Clone)]
pub struct RefetchProbe {
    pub runs: Arc<AtomicUsize>,
    signals: mpsc::UnboundedSender<usize>,
}

impl RefetchProbe {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        (
            Self {
                runs: Arc::new(AtomicUsize::new(0)),
                signals,
            },
            receiver,
        )
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn callback(&self) -> impl Fn() -> futures::future::Ready<()> + Send + Sync + 'static {
        let probe = self.clone();
        move || {
            let run = probe.runs.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = probe.signals.send(run);
            futures::future::ready(())
        }
    }
}
