use super::convergence::{Convergence, ConvergenceScheduler};
use super::quotes::{QuoteFetch, QuoteFilters, QuoteQueryEngine};
use super::subscriptions::{SubscriptionHandle, SubscriptionHub};
use crate::config::ConvergencePolicy;
use crate::domain::event::EntityKey;
use crate::domain::ids::ConsumerId;
use crate::domain::quote::{Viewer, ViewerRole};
use crate::error::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler shared by live views; `None` marks a refetch whose read failed transiently.
pub type QuoteRefetchScheduler = ConvergenceScheduler<Option<QuoteFetch>>;

const QUOTES_TABLE: &str = "quotes";

struct ViewState {
    engine: Arc<QuoteQueryEngine>,
    scheduler: QuoteRefetchScheduler,
    viewer: Viewer,
    filters: QuoteFilters,
    policy: ConvergencePolicy,
    target_key: String,
    cancel: CancellationToken,
    latest: watch::Sender<Option<QuoteFetch>>,
}

impl ViewState {
    async fn refetch(&self) -> Result<Option<QuoteFetch>> {
        let engine = Arc::clone(&self.engine);
        let viewer = self.viewer.clone();
        let filters = self.filters.clone();
        let check = move || {
            let engine = Arc::clone(&engine);
            let viewer = viewer.clone();
            let filters = filters.clone();
            async move {
                match engine.fetch_quotes(&viewer, &filters).await {
                    Ok(fetch) => Ok(Some(fetch)),
                    Err(SyncError::QueryFailed(reason)) => {
                        warn!(viewer = %viewer.id, %reason, "quote refetch failed");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
        };

        let report = self
            .scheduler
            .converge(
                self.target_key.clone(),
                self.policy,
                check,
                Option::is_some,
                None,
                &self.cancel,
            )
            .await?;

        match report.outcome {
            Convergence::Converged(fetch) => {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                if let Some(fetch) = &fetch {
                    debug!(target_key = %self.target_key, rows = fetch.quotes.len(), "quote view refreshed");
                    self.latest.send_replace(Some(fetch.clone()));
                }
                Ok(fetch)
            }
            Convergence::GaveUp { .. } => Err(SyncError::Exhausted {
                target: self.target_key.clone(),
                attempts: report.attempt.attempt_count,
            }),
            Convergence::Cancelled => Ok(None),
        }
    }
}

/// A quote listing kept current by push signals.
///
/// Every change signal on the viewer's scope and every [`refresh`](Self::refresh) call
/// refetch through one scheduler key, so overlapping triggers share a single read loop.
pub struct LiveQuoteView {
    hub: Arc<SubscriptionHub>,
    state: Arc<ViewState>,
    key: EntityKey,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl LiveQuoteView {
    /// Subscribes to the viewer's quotes and publishes the first listing.
    pub async fn attach(
        hub: Arc<SubscriptionHub>,
        engine: Arc<QuoteQueryEngine>,
        scheduler: QuoteRefetchScheduler,
        viewer: Viewer,
        filters: QuoteFilters,
        policy: ConvergencePolicy,
    ) -> Result<Self> {
        let consumer = ConsumerId::generate();
        let key = subscription_key(&viewer, &filters);
        let (latest, _) = watch::channel(None);
        let state = Arc::new(ViewState {
            engine,
            scheduler,
            viewer,
            filters,
            policy,
            target_key: format!("quotes:{consumer}"),
            cancel: CancellationToken::new(),
            latest,
        });

        let listener = Arc::clone(&state);
        let handle = hub
            .subscribe(&consumer, key.clone(), state.viewer.role, move || {
                let state = Arc::clone(&listener);
                async move {
                    if let Err(err) = state.refetch().await {
                        warn!(target_key = %state.target_key, error = %err, "refetch after change signal failed");
                    }
                }
            })
            .await?;

        let view = Self {
            hub,
            state,
            key,
            handle: Mutex::new(Some(handle)),
        };
        if let Err(err) = view.refresh().await {
            view.detach().await?;
            return Err(err);
        }
        info!(%consumer, key = %view.key, "live quote view attached");
        Ok(view)
    }

    /// The push key the view listens on.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Receives every listing published after a successful refetch.
    pub fn updates(&self) -> watch::Receiver<Option<QuoteFetch>> {
        self.state.latest.subscribe()
    }

    /// The last published listing, if any refetch has succeeded.
    pub fn latest(&self) -> Option<QuoteFetch> {
        self.state.latest.borrow().clone()
    }

    /// Manual refetch. Returns `Ok(None)` once the view is detached.
    ///
    /// `Err(Exhausted)` leaves the last published listing in place; calling again starts
    /// a new attempt budget.
    pub async fn refresh(&self) -> Result<Option<QuoteFetch>> {
        self.state.refetch().await
    }

    /// Unsubscribes and stops any refetch in flight. Idempotent.
    pub async fn detach(&self) -> Result<()> {
        self.state.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            self.hub.unsubscribe(handle).await?;
            debug!(key = %self.key, "live quote view detached");
        }
        Ok(())
    }
}

/// Counterparts follow the quotes they submitted; owners follow the project when one is
/// given, otherwise every quote they own.
fn subscription_key(viewer: &Viewer, filters: &QuoteFilters) -> EntityKey {
    match (viewer.role, &filters.project_id) {
        (ViewerRole::Counterpart, _) => EntityKey::eq(QUOTES_TABLE, "freelancer_id", &viewer.id),
        (ViewerRole::Owner, Some(project_id)) => EntityKey::eq(QUOTES_TABLE, "project_id", project_id),
        (ViewerRole::Owner, None) => EntityKey::eq(QUOTES_TABLE, "client_id", &viewer.id),
    }
}
