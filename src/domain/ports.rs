use super::event::{ChangeEvent, EntityKey, Notification};
use super::ids::{ProjectId, SessionRef, UserId};
use super::ledger::{CreditAccount, CreditPlan, CreditTransaction};
use super::quote::{ProfileProjection, Quote, QuoteStatus};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Row predicate for the quotes table. `None` fields are not filtered on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteQuery {
    pub project_id: Option<ProjectId>,
    pub client_id: Option<UserId>,
    pub freelancer_id: Option<UserId>,
    pub status: Option<QuoteStatus>,
}

impl QuoteQuery {
    /// True when the query constrains who owns or submitted the rows.
    pub fn has_ownership_predicate(&self) -> bool {
        self.client_id.is_some() || self.freelancer_id.is_some()
    }

    /// True when `quote` satisfies every set field.
    pub fn matches(&self, quote: &Quote) -> bool {
        self.project_id.as_ref().is_none_or(|p| *p == quote.project_id)
            && self.client_id.as_ref().is_none_or(|c| *c == quote.client_id)
            && self
                .freelancer_id
                .as_ref()
                .is_none_or(|f| *f == quote.freelancer_id)
            && self.status.is_none_or(|s| s == quote.status)
    }
}

/// Read access to the credit ledger. Only the payment collaborator writes to it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The account of `user_id`; `None` before its first purchase.
    async fn account(&self, user_id: &UserId) -> Result<Option<CreditAccount>>;
    /// Transactions of `user_id`, most recent first.
    async fn transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>>;
    /// The transaction settled by checkout session `reference`.
    async fn transaction_by_reference(
        &self,
        reference: &SessionRef,
    ) -> Result<Option<CreditTransaction>>;
}

/// Read access to the quotes table.
#[async_trait]
pub trait QuoteStore: Send + Sync {
    /// Rows matching `query`, most recent first.
    async fn select(&self, query: &QuoteQuery) -> Result<Vec<Quote>>;
}

/// Batched lookup of public profile projections.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Profiles for the given ids. Unknown ids are simply absent from the result.
    async fn profiles(&self, user_ids: &[UserId]) -> Result<Vec<ProfileProjection>>;
}

/// Delivers mutation events for subscribed `(table, filter)` pairs.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, key: &EntityKey) -> Result<BoxStream<'static, ChangeEvent>>;
    async fn close(&self, key: &EntityKey) -> Result<()>;
}

/// The external checkout provider. `reconcile_session` must be idempotent on its side.
#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    async fn initiate_checkout(&self, user_id: &UserId, plan: &CreditPlan) -> Result<SessionRef>;
    async fn reconcile_session(&self, session_ref: &SessionRef) -> Result<()>;
}

/// Fire-and-forget user notices.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Shared handles to the ports.
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type QuoteStoreRef = Arc<dyn QuoteStore>;
pub type ProfileStoreRef = Arc<dyn ProfileStore>;
pub type PushTransportRef = Arc<dyn PushTransport>;
pub type PaymentCollaboratorRef = Arc<dyn PaymentCollaborator>;
pub type NotificationSinkRef = Arc<dyn NotificationSink>;
