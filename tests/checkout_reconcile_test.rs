mod common;

use async_trait::async_trait;
use common::{checkout_harness, plan, with_collaborator};
use ledgersync::application::checkout::{ReconcileOutcome, ReconcileState};
use ledgersync::domain::ids::{SessionRef, UserId};
use ledgersync::domain::ledger::{CreditAccount, CreditPlan, CreditTransaction, TransactionStatus};
use ledgersync::domain::ports::{LedgerStore, PaymentCollaborator};
use ledgersync::error::Result;
use ledgersync::infrastructure::in_memory::{InMemoryLedgerStore, SimulatedPaymentCollaborator};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_example_run_completes_after_corrective_action() {
    let h = checkout_harness(true);
    let user = UserId::from("u1");

    let session = h.reconciler.start_checkout(&user, &plan()).await.unwrap();
    assert_eq!(session.session_ref.as_str(), "cs_1");

    let started = Instant::now();
    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();

    let ReconcileOutcome::Completed { transaction, balance } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(transaction.status, TransactionStatus::Completed);
    assert_eq!(transaction.credits_purchased, 50);
    assert_eq!(transaction.amount.minor_units(), 2000);
    assert_eq!(balance, 50);
    assert_eq!(started.elapsed(), Duration::from_secs(9));
    assert_eq!(h.payments.reconcile_calls(), vec![SessionRef::from("cs_1")]);
    assert_eq!(h.client.get_balance(&user).await.unwrap(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_completion_on_second_poll() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let payments = h.payments.clone();
    let reference = session.session_ref.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        payments.complete(&reference).await.unwrap();
    });

    let started = Instant::now();
    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Completed { balance: 50, .. }));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert!(h.payments.reconcile_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_six_attempts_with_one_corrective() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let started = Instant::now();
    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::GaveUp {
            session_ref: "cs_1".into(),
            attempts: 6,
            corrective_action_sent: true,
        }
    );
    assert!(outcome.is_retryable());
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(h.payments.reconcile_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconciles_dispatch_corrective_once() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let reconciler = h.reconciler.clone();
            let reference = session.session_ref.clone();
            tokio::spawn(async move { reconciler.reconcile(&reference, &CancellationToken::new()).await })
        })
        .collect();

    for call in calls {
        let outcome = call.await.unwrap().unwrap();
        assert!(matches!(outcome, ReconcileOutcome::GaveUp { attempts: 6, .. }));
    }
    assert_eq!(h.payments.reconcile_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_give_up_gets_fresh_budget_without_second_corrective() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    let cancel = CancellationToken::new();

    let first = h.reconciler.reconcile(&session.session_ref, &cancel).await.unwrap();
    assert!(matches!(first, ReconcileOutcome::GaveUp { .. }));

    let started = Instant::now();
    let second = h.reconciler.reconcile(&session.session_ref, &cancel).await.unwrap();
    assert_eq!(
        second,
        ReconcileOutcome::GaveUp {
            session_ref: "cs_1".into(),
            attempts: 6,
            corrective_action_sent: false,
        }
    );
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(h.payments.reconcile_calls().len(), 1);
    assert!(h.reconciler.corrective_dispatched(&session.session_ref));
    assert!(second.into_result().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_session_state_tracks_corrective_and_give_up() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    let reference = session.session_ref.clone();
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::Pending);

    let spawn_reconcile = || {
        let reconciler = h.reconciler.clone();
        let reference = reference.clone();
        tokio::spawn(async move { reconciler.reconcile(&reference, &CancellationToken::new()).await })
    };

    let first = spawn_reconcile();
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::Pending);

    // The corrective request goes out right after the third poll at t=6.
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::CorrectiveSent);

    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, ReconcileOutcome::GaveUp { .. }));
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::GaveUp);

    let second = spawn_reconcile();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::CorrectiveSent);

    h.payments.complete(&reference).await.unwrap();
    let outcome = second.await.unwrap().unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Completed { .. }));
    assert_eq!(h.reconciler.session_state(&reference), ReconcileState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_settled_sessions_return_without_polling() {
    let h = checkout_harness(false);
    let completed = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    let failed = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    h.payments.complete(&completed.session_ref).await.unwrap();
    h.payments.fail(&failed.session_ref).await.unwrap();

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let outcome = h.reconciler.reconcile(&completed.session_ref, &cancel).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Completed { balance: 50, .. }));

    let outcome = h.reconciler.reconcile(&failed.session_ref, &cancel).await.unwrap();
    let ReconcileOutcome::Failed { transaction } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_failure_observed_while_polling() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let payments = h.payments.clone();
    let reference = session.session_ref.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(4)).await;
        payments.fail(&reference).await.unwrap();
    });

    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert_eq!(h.client.get_balance(&"u1".into()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_reconcile_fires_no_corrective() {
    let h = checkout_harness(true);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    let cancel = CancellationToken::new();

    let reconciler = h.reconciler.clone();
    let reference = session.session_ref.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { reconciler.reconcile(&reference, &token).await });

    sleep(Duration::from_secs(4)).await;
    cancel.cancel();
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Cancelled {
            session_ref: "cs_1".into()
        }
    );

    sleep(Duration::from_secs(30)).await;
    assert!(h.payments.reconcile_calls().is_empty());
    assert!(!h.reconciler.corrective_dispatched(&session.session_ref));
}

#[tokio::test(start_paused = true)]
async fn test_failed_corrective_does_not_abort_polling() {
    let h = checkout_harness(true);
    h.payments.fail_next_reconciles(1);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::GaveUp {
            session_ref: "cs_1".into(),
            attempts: 6,
            corrective_action_sent: false,
        }
    );

    // The latch holds even though the request failed.
    h.reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.payments.reconcile_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_failures_are_retried() {
    let h = checkout_harness(false);
    let session = h.reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();
    h.payments.complete(&session.session_ref).await.unwrap();
    h.ledger.fail_next_reads(2);

    let started = Instant::now();
    let outcome = h
        .reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Completed { balance: 50, .. }));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

/// Provider whose reconcile endpoint never answers.
struct UnresponsiveCollaborator {
    inner: SimulatedPaymentCollaborator,
}

#[async_trait]
impl PaymentCollaborator for UnresponsiveCollaborator {
    async fn initiate_checkout(&self, user_id: &UserId, plan: &CreditPlan) -> Result<SessionRef> {
        self.inner.initiate_checkout(user_id, plan).await
    }

    async fn reconcile_session(&self, _session_ref: &SessionRef) -> Result<()> {
        sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_corrective_call_is_bounded_by_collaborator_timeout() {
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let payments = Arc::new(UnresponsiveCollaborator {
        inner: SimulatedPaymentCollaborator::new(ledger.clone()),
    });
    let (_, reconciler) = with_collaborator(ledger, payments);
    let session = reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let started = Instant::now();
    let outcome = reconciler
        .reconcile(&session.session_ref, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ReconcileOutcome::GaveUp {
            attempts: 6,
            corrective_action_sent: false,
            ..
        }
    ));
    // Six polls three seconds apart plus the ten second corrective timeout.
    assert_eq!(started.elapsed(), Duration::from_secs(25));
}

/// Ledger whose session lookups stop answering from the third call on.
struct StallingLedger {
    inner: Arc<InMemoryLedgerStore>,
    lookups: AtomicU32,
}

#[async_trait]
impl LedgerStore for StallingLedger {
    async fn account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.inner.account(user_id).await
    }

    async fn transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        self.inner.transactions(user_id).await
    }

    async fn transaction_by_reference(&self, session_ref: &SessionRef) -> Result<Option<CreditTransaction>> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) >= 2 {
            sleep(Duration::from_secs(3600)).await;
        }
        self.inner.transaction_by_reference(session_ref).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_ledger_read_still_gives_up() {
    let inner = Arc::new(InMemoryLedgerStore::new());
    let payments = Arc::new(SimulatedPaymentCollaborator::new(inner.clone()));
    let ledger = Arc::new(StallingLedger {
        inner,
        lookups: AtomicU32::new(0),
    });
    let (_, reconciler) = with_collaborator(ledger, payments.clone());
    let session = reconciler.start_checkout(&"u1".into(), &plan()).await.unwrap();

    let started = Instant::now();
    let outcome = timeout(
        Duration::from_secs(3600),
        reconciler.reconcile(&session.session_ref, &CancellationToken::new()),
    )
    .await
    .expect("reconcile is bounded")
    .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::GaveUp {
            session_ref: "cs_1".into(),
            attempts: 6,
            corrective_action_sent: true,
        }
    );
    // One good poll, then five ten second timeouts with three second gaps.
    assert_eq!(started.elapsed(), Duration::from_secs(65));
    assert_eq!(payments.reconcile_calls().len(), 1);
    assert_eq!(reconciler.session_state(&session.session_ref), ReconcileState::GaveUp);
}
