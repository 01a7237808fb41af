use crate::domain::event::{ChangeEvent, EntityKey, Notification, Severity};
use crate::domain::ids::{SessionRef, UserId};
use crate::domain::ledger::{CreditAccount, CreditPlan, CreditTransaction, TransactionStatus};
use crate::domain::ports::{
    LedgerStore, NotificationSink, PaymentCollaborator, ProfileStore, PushTransport, QuoteQuery,
    QuoteStore,
};
use crate::domain::quote::{ProfileProjection, Quote};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Counts down injected read failures; each failed read surfaces as a transient error.
#[derive(Default, Clone)]
struct FailureInjector {
    remaining: Arc<AtomicU32>,
}

impl FailureInjector {
    fn arm(&self, reads: u32) {
        self.remaining.store(reads, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<()> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(SyncError::TransientFetch(format!("{what} read failed")))
        } else {
            Ok(())
        }
    }
}

/// A thread-safe in-memory credit ledger.
///
/// Reads go through the [`LedgerStore`] port; `insert_transaction` and `settle` stand in
/// for the payment collaborator, the ledger's single writer.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    accounts: Arc<RwLock<HashMap<UserId, CreditAccount>>>,
    transactions: Arc<RwLock<HashMap<SessionRef, CreditTransaction>>>,
    failures: FailureInjector,
}

impl InMemoryLedgerStore {
    /// Creates an empty ledger with no injected failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `reads` port calls fail with a transient error.
    pub fn fail_next_reads(&self, reads: u32) {
        self.failures.arm(reads);
    }

    /// Seeds or replaces the account of `account.user_id`.
    pub async fn put_account(&self, account: CreditAccount) {
        self.accounts
            .write()
            .await
            .insert(account.user_id.clone(), account);
    }

    /// Records a new transaction; each external reference maps to at most one.
    pub async fn insert_transaction(&self, tx: CreditTransaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.external_reference) {
            return Err(SyncError::InvariantViolation(format!(
                "external reference {} already has a transaction",
                tx.external_reference
            )));
        }
        transactions.insert(tx.external_reference.clone(), tx);
        Ok(())
    }

    /// Moves a transaction to `status`, crediting the account on first completion.
    pub async fn settle(&self, reference: &SessionRef, status: TransactionStatus) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions.get_mut(reference).ok_or_else(|| {
            SyncError::InvariantViolation(format!("no transaction for reference {reference}"))
        })?;
        let newly_completed =
            tx.status != TransactionStatus::Completed && status == TransactionStatus::Completed;
        tx.transition(status)?;

        if newly_completed {
            let mut accounts = self.accounts.write().await;
            accounts
                .entry(tx.user_id.clone())
                .or_insert_with(|| CreditAccount::new(tx.user_id.clone()))
                .credit(tx.credits_purchased)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.failures.check("account")?;
        Ok(self.accounts.read().await.get(user_id).cloned())
    }

    async fn transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        self.failures.check("transactions")?;
        let mut rows: Vec<_> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn transaction_by_reference(
        &self,
        reference: &SessionRef,
    ) -> Result<Option<CreditTransaction>> {
        self.failures.check("transaction")?;
        Ok(self.transactions.read().await.get(reference).cloned())
    }
}

/// A thread-safe in-memory quotes table.
#[derive(Default, Clone)]
pub struct InMemoryQuoteStore {
    quotes: Arc<RwLock<Vec<Quote>>>,
    selects: Arc<AtomicU32>,
    failures: FailureInjector,
}

impl InMemoryQuoteStore {
    /// Creates an empty quotes table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `reads` selects fail with a transient error.
    pub fn fail_next_reads(&self, reads: u32) {
        self.failures.arm(reads);
    }

    /// Number of `select` calls served so far.
    pub fn select_count(&self) -> u32 {
        self.selects.load(Ordering::SeqCst)
    }

    /// Inserts `quote`, or replaces the row with the same id.
    pub async fn upsert(&self, quote: Quote) {
        let mut quotes = self.quotes.write().await;
        match quotes.iter_mut().find(|q| q.id == quote.id) {
            Some(existing) => *existing = quote,
            None => quotes.push(quote),
        }
    }
}

#[async_trait]
impl QuoteStore for InMemoryQuoteStore {
    async fn select(&self, query: &QuoteQuery) -> Result<Vec<Quote>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.failures.check("quotes")?;
        let mut rows: Vec<_> = self
            .quotes
            .read()
            .await
            .iter()
            .filter(|quote| query.matches(quote))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

/// Profile projections keyed by user id, recording every batch it serves.
#[derive(Default, Clone)]
pub struct InMemoryProfileStore {
    profiles: Arc<RwLock<HashMap<UserId, ProfileProjection>>>,
    batches: Arc<Mutex<Vec<Vec<UserId>>>>,
    failures: FailureInjector,
}

impl InMemoryProfileStore {
    /// Creates a store with no profiles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `reads` batch lookups fail with a transient error.
    pub fn fail_next_reads(&self, reads: u32) {
        self.failures.arm(reads);
    }

    /// Seeds or replaces the profile of `profile.user_id`.
    pub async fn put(&self, profile: ProfileProjection) {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    /// The id batches requested so far, in call order.
    pub fn requested_batches(&self) -> Vec<Vec<UserId>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn profiles(&self, user_ids: &[UserId]) -> Result<Vec<ProfileProjection>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_ids.to_vec());
        self.failures.check("profiles")?;
        let profiles = self.profiles.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| profiles.get(id).cloned())
            .collect())
    }
}

/// Push transport that fans published events out to every open stream for the key.
#[derive(Default, Clone)]
pub struct InMemoryPushTransport {
    channels: Arc<Mutex<HashMap<EntityKey, Vec<UnboundedSender<ChangeEvent>>>>>,
}

impl InMemoryPushTransport {
    /// Creates a transport with no open streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to the streams subscribed to its key; returns how many received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = channels.get_mut(&event.key()) else {
            return 0;
        };
        senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
        senders.len()
    }

    /// Number of streams currently open for `key`.
    pub fn open_streams(&self, key: &EntityKey) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl PushTransport for InMemoryPushTransport {
    async fn open(&self, key: &EntityKey) -> Result<BoxStream<'static, ChangeEvent>> {
        let (sender, receiver) = mpsc::unbounded();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push(sender);
        Ok(receiver.boxed())
    }

    async fn close(&self, key: &EntityKey) -> Result<()> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Keeps every notification for later inspection.
#[derive(Default)]
pub struct RecordingNotificationSink {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    /// Creates a sink with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notification received so far, in delivery order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn notify(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// Writes notifications to the log.
#[derive(Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notification: Notification) {
        let Notification {
            title,
            body,
            severity,
        } = notification;
        match severity {
            Severity::Error => error!(%title, %body, "notification"),
            Severity::Warning => warn!(%title, %body, "notification"),
            Severity::Info | Severity::Success => info!(%title, %body, "notification"),
        }
    }
}

/// Checkout provider backed by an [`InMemoryLedgerStore`].
///
/// `initiate_checkout` records a pending transaction under a `cs_<n>` reference.
/// Settlement happens only when [`complete`](Self::complete) is called (a delayed webhook),
/// or on `reconcile_session` when `settle_on_reconcile` is enabled.
pub struct SimulatedPaymentCollaborator {
    ledger: Arc<InMemoryLedgerStore>,
    next_session: AtomicU64,
    settle_on_reconcile: bool,
    reconcile_calls: Mutex<Vec<SessionRef>>,
    reconcile_failures: FailureInjector,
}

impl SimulatedPaymentCollaborator {
    /// Creates a provider that records its sessions in `ledger`.
    ///
    /// Sessions stay pending until [`complete`](Self::complete) or [`fail`](Self::fail) is called.
    pub fn new(ledger: Arc<InMemoryLedgerStore>) -> Self {
        Self {
            ledger,
            next_session: AtomicU64::new(0),
            settle_on_reconcile: false,
            reconcile_calls: Mutex::new(Vec::new()),
            reconcile_failures: FailureInjector::default(),
        }
    }

    /// When enabled, a manual reconciliation request completes the session.
    pub fn settle_on_reconcile(mut self, enabled: bool) -> Self {
        self.settle_on_reconcile = enabled;
        self
    }

    /// Makes the next `calls` reconcile requests fail.
    pub fn fail_next_reconciles(&self, calls: u32) {
        self.reconcile_failures.arm(calls);
    }

    /// Sessions for which manual reconciliation was requested, in call order.
    pub fn reconcile_calls(&self) -> Vec<SessionRef> {
        self.reconcile_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivers the provider's completion for `session_ref`.
    pub async fn complete(&self, session_ref: &SessionRef) -> Result<()> {
        self.ledger
            .settle(session_ref, TransactionStatus::Completed)
            .await
    }

    /// Delivers the provider's failure for `session_ref`.
    pub async fn fail(&self, session_ref: &SessionRef) -> Result<()> {
        self.ledger.settle(session_ref, TransactionStatus::Failed).await
    }
}

#[async_trait]
impl PaymentCollaborator for SimulatedPaymentCollaborator {
    async fn initiate_checkout(&self, user_id: &UserId, plan: &CreditPlan) -> Result<SessionRef> {
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session_ref = SessionRef(format!("cs_{n}"));
        let tx = CreditTransaction::pending(user_id.clone(), plan, session_ref.clone(), Utc::now());
        self.ledger.insert_transaction(tx).await?;
        debug!(%session_ref, %user_id, plan = %plan.id, "checkout session created");
        Ok(session_ref)
    }

    async fn reconcile_session(&self, session_ref: &SessionRef) -> Result<()> {
        self.reconcile_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session_ref.clone());
        self.reconcile_failures
            .check("reconcile")
            .map_err(|err| SyncError::Payment(err.to_string()))?;
        if self.settle_on_reconcile {
            let current = self.ledger.transaction_by_reference(session_ref).await?;
            if current.is_some_and(|tx| tx.status == TransactionStatus::Pending) {
                self.complete(session_ref).await?;
            }
        }
        Ok(())
    }
}
