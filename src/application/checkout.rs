use super::convergence::{Convergence, ConvergenceScheduler, CorrectiveAction, CorrectiveStatus};
use super::latch::IdempotencyLatch;
use super::ledger_client::TransactionLedgerClient;
use crate::config::ConvergencePolicy;
use crate::domain::ids::{SessionRef, UserId};
use crate::domain::ledger::{CreditPlan, CreditTransaction, TransactionStatus};
use crate::domain::ports::PaymentCollaboratorRef;
use crate::error::{Result, SyncError};
use futures::future::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Phase of a checkout session as seen from this side of the payment collaborator.
///
/// `Completed` and `Failed` are terminal for the session. `GaveUp` only ends one
/// `reconcile` invocation; the next invocation resumes through [`on_retry`](Self::on_retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    #[default]
    Pending,
    CorrectiveSent,
    Completed,
    Failed,
    GaveUp,
}

impl ReconcileState {
    /// True for `Completed` and `Failed`, which no later observation can change.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconcileState::Completed | ReconcileState::Failed)
    }

    /// Applies the transaction status seen by one poll.
    pub fn on_poll(self, status: TransactionStatus) -> Self {
        if self.is_terminal() {
            return self;
        }
        match status {
            TransactionStatus::Completed => ReconcileState::Completed,
            TransactionStatus::Failed => ReconcileState::Failed,
            TransactionStatus::Pending => self,
        }
    }

    /// Applies a successfully dispatched manual reconciliation request.
    pub fn on_corrective_sent(self) -> Self {
        match self {
            ReconcileState::Pending => ReconcileState::CorrectiveSent,
            other => other,
        }
    }

    /// Applies the end of an attempt budget without a settled transaction.
    pub fn on_exhausted(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            ReconcileState::GaveUp
        }
    }

    /// Applies the start of a new `reconcile` invocation.
    ///
    /// A session that gave up resumes as `CorrectiveSent` when the manual request already
    /// went out, otherwise as `Pending`.
    pub fn on_retry(self, corrective_sent: bool) -> Self {
        match self {
            ReconcileState::GaveUp if corrective_sent => ReconcileState::CorrectiveSent,
            ReconcileState::GaveUp => ReconcileState::Pending,
            other => other,
        }
    }
}

/// What one poll of the ledger saw for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    /// `None` until the collaborator has recorded the transaction.
    pub transaction: Option<CreditTransaction>,
    pub balance: Option<i64>,
}

impl LedgerSnapshot {
    fn is_settled(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|tx| tx.status.is_terminal())
    }
}

/// A checkout opened with the payment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSession {
    pub session_ref: SessionRef,
    pub user_id: UserId,
    pub plan: CreditPlan,
}

/// Result of one `reconcile` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Completed {
        transaction: CreditTransaction,
        balance: i64,
    },
    Failed {
        transaction: CreditTransaction,
    },
    /// The attempt budget ran out; calling `reconcile` again starts a new one.
    GaveUp {
        session_ref: SessionRef,
        attempts: u32,
        corrective_action_sent: bool,
    },
    Cancelled {
        session_ref: SessionRef,
    },
}

impl ReconcileOutcome {
    /// True when a manual retry can still change the result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::GaveUp { .. } | ReconcileOutcome::Cancelled { .. }
        )
    }

    /// Turns a give-up into [`SyncError::Exhausted`] for callers that propagate with `?`.
    pub fn into_result(self) -> Result<Self> {
        match self {
            ReconcileOutcome::GaveUp {
                session_ref,
                attempts,
                ..
            } => Err(SyncError::Exhausted {
                target: session_ref.to_string(),
                attempts,
            }),
            other => Ok(other),
        }
    }
}

/// Latest phase of every session this reconciler has driven.
#[derive(Default)]
struct SessionPhases {
    phases: Mutex<HashMap<SessionRef, ReconcileState>>,
}

impl SessionPhases {
    fn get(&self, session_ref: &SessionRef) -> ReconcileState {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_ref)
            .copied()
            .unwrap_or_default()
    }

    fn advance(&self, session_ref: &SessionRef, step: impl FnOnce(ReconcileState) -> ReconcileState) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        let current = phases.get(session_ref).copied().unwrap_or_default();
        let next = step(current);
        if next != current {
            debug!(%session_ref, from = ?current, to = ?next, "checkout state changed");
            phases.insert(session_ref.clone(), next);
        }
    }
}

/// Rejects status regressions between the polls of one loop.
#[derive(Default)]
struct StatusGuard {
    last: Option<TransactionStatus>,
}

impl StatusGuard {
    fn observe(&mut self, session_ref: &SessionRef, status: TransactionStatus) -> Result<()> {
        if let Some(previous) = self.last
            && !previous.can_transition_to(status)
        {
            return Err(SyncError::InvariantViolation(format!(
                "transaction {session_ref} regressed from {previous} to {status}"
            )));
        }
        self.last = Some(status);
        Ok(())
    }
}

/// Drives a checkout session to a terminal ledger state.
///
/// Polls the ledger on the checkout policy; after the configured number of unconverged
/// polls it asks the payment collaborator to reconcile the session manually. That request
/// is latched per session reference for the reconciler's lifetime, however many
/// `reconcile` calls are made.
pub struct CheckoutReconciler {
    ledger: Arc<TransactionLedgerClient>,
    payments: PaymentCollaboratorRef,
    scheduler: ConvergenceScheduler<LedgerSnapshot>,
    latch: Arc<IdempotencyLatch>,
    phases: Arc<SessionPhases>,
    policy: ConvergencePolicy,
    collaborator_timeout: Duration,
}

impl CheckoutReconciler {
    /// Creates a reconciler.
    ///
    /// # Arguments
    ///
    /// * `ledger` - Ledger reads; every poll uses its uncached reads.
    /// * `payments` - The payment collaborator that opens and reconciles sessions.
    /// * `policy` - Polling schedule, normally [`ConvergencePolicy::CHECKOUT`].
    /// * `collaborator_timeout` - Upper bound on each payment collaborator call.
    pub fn new(
        ledger: Arc<TransactionLedgerClient>,
        payments: PaymentCollaboratorRef,
        policy: ConvergencePolicy,
        collaborator_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            payments,
            scheduler: ConvergenceScheduler::new(),
            latch: Arc::new(IdempotencyLatch::new()),
            phases: Arc::default(),
            policy,
            collaborator_timeout,
        }
    }

    /// Whether the manual reconciliation request was ever sent for `session_ref`.
    pub fn corrective_dispatched(&self, session_ref: &SessionRef) -> bool {
        self.latch.is_claimed(session_ref.as_str())
    }

    /// Current phase of `session_ref`; `Pending` for sessions never reconciled.
    pub fn session_state(&self, session_ref: &SessionRef) -> ReconcileState {
        self.phases.get(session_ref)
    }

    /// Opens a checkout session for `plan` with the payment collaborator.
    ///
    /// The collaborator records a pending transaction under the returned session reference.
    /// A call that exceeds the collaborator timeout fails with [`SyncError::Payment`].
    pub async fn start_checkout(&self, user_id: &UserId, plan: &CreditPlan) -> Result<CheckoutSession> {
        let session_ref = tokio::time::timeout(
            self.collaborator_timeout,
            self.payments.initiate_checkout(user_id, plan),
        )
        .await
        .map_err(|_| {
            SyncError::Payment(format!(
                "initiate_checkout timed out after {:?}",
                self.collaborator_timeout
            ))
        })??;
        info!(%session_ref, %user_id, plan = %plan.id, credits = plan.credits, "checkout started");
        Ok(CheckoutSession {
            session_ref,
            user_id: user_id.clone(),
            plan: plan.clone(),
        })
    }

    /// Waits for the session's transaction to settle.
    ///
    /// Returns immediately when the transaction is already settled. Concurrent calls for
    /// the same session share one polling loop.
    pub async fn reconcile(
        &self,
        session_ref: &SessionRef,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let corrective_sent = self.corrective_dispatched(session_ref);
        self.phases
            .advance(session_ref, |state| state.on_retry(corrective_sent));

        match self.ledger.transaction_by_reference(session_ref).await {
            Ok(Some(tx)) if tx.status.is_terminal() => {
                debug!(%session_ref, status = %tx.status, "session already settled");
                self.phases.advance(session_ref, |state| state.on_poll(tx.status));
                return self.settled(tx).await;
            }
            Ok(_) => {}
            Err(err) if err.is_retryable() => {
                warn!(%session_ref, error = %err, "fast-path read failed, falling back to polling");
            }
            Err(err) => return Err(err),
        }

        let report = self
            .scheduler
            .converge(
                format!("checkout:{session_ref}"),
                self.policy,
                self.poll(session_ref),
                LedgerSnapshot::is_settled,
                Some(self.corrective(session_ref)),
                cancel,
            )
            .await?;

        match report.outcome {
            Convergence::Converged(LedgerSnapshot {
                transaction: Some(transaction),
                balance,
            }) => {
                if transaction.status == TransactionStatus::Completed {
                    self.ledger.invalidate(&transaction.user_id).await;
                    let balance = balance.unwrap_or_default();
                    info!(%session_ref, balance, attempts = report.attempt.attempt_count, "checkout completed");
                    Ok(ReconcileOutcome::Completed { transaction, balance })
                } else {
                    warn!(%session_ref, "checkout failed");
                    Ok(ReconcileOutcome::Failed { transaction })
                }
            }
            Convergence::Converged(LedgerSnapshot {
                transaction: None, ..
            }) => Err(SyncError::InvariantViolation(format!(
                "session {session_ref} converged without a transaction"
            ))),
            Convergence::GaveUp { .. } => {
                self.phases.advance(session_ref, ReconcileState::on_exhausted);
                Ok(ReconcileOutcome::GaveUp {
                    session_ref: session_ref.clone(),
                    attempts: report.attempt.attempt_count,
                    corrective_action_sent: report.attempt.corrective_action_sent,
                })
            }
            Convergence::Cancelled => Ok(ReconcileOutcome::Cancelled {
                session_ref: session_ref.clone(),
            }),
        }
    }

    async fn settled(&self, transaction: CreditTransaction) -> Result<ReconcileOutcome> {
        match transaction.status {
            TransactionStatus::Completed => {
                let balance = self.ledger.fresh_balance(&transaction.user_id).await?;
                Ok(ReconcileOutcome::Completed { transaction, balance })
            }
            _ => Ok(ReconcileOutcome::Failed { transaction }),
        }
    }

    fn poll(
        &self,
        session_ref: &SessionRef,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<LedgerSnapshot>> + Send + Sync + 'static
    {
        let ledger = Arc::clone(&self.ledger);
        let phases = Arc::clone(&self.phases);
        let session_ref = session_ref.clone();
        let guard = Arc::new(Mutex::new(StatusGuard::default()));
        move || {
            let ledger = Arc::clone(&ledger);
            let phases = Arc::clone(&phases);
            let session_ref = session_ref.clone();
            let guard = Arc::clone(&guard);
            async move {
                let transaction = ledger.transaction_by_reference(&session_ref).await?;
                let Some(tx) = transaction else {
                    debug!(%session_ref, "transaction not recorded yet");
                    return Ok(LedgerSnapshot {
                        transaction: None,
                        balance: None,
                    });
                };
                guard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .observe(&session_ref, tx.status)?;
                phases.advance(&session_ref, |state| state.on_poll(tx.status));
                let balance = ledger.fresh_balance(&tx.user_id).await?;
                Ok(LedgerSnapshot {
                    transaction: Some(tx),
                    balance: Some(balance),
                })
            }
            .boxed()
        }
    }

    fn corrective(&self, session_ref: &SessionRef) -> CorrectiveAction {
        let payments = Arc::clone(&self.payments);
        let latch = Arc::clone(&self.latch);
        let phases = Arc::clone(&self.phases);
        let session_ref = session_ref.clone();
        let timeout = self.collaborator_timeout;
        Box::new(move || {
            async move {
                let status = latch
                    .run_once(session_ref.as_str(), || {
                        request_reconciliation(&payments, &session_ref, timeout)
                    })
                    .await?;
                if status == CorrectiveStatus::Dispatched {
                    phases.advance(&session_ref, ReconcileState::on_corrective_sent);
                }
                Ok(status)
            }
            .boxed()
        })
    }
}

async fn request_reconciliation(
    payments: &PaymentCollaboratorRef,
    session_ref: &SessionRef,
    timeout: Duration,
) -> Result<()> {
    info!(%session_ref, "requesting manual reconciliation");
    let failed = |reason: String| SyncError::CorrectiveActionFailed {
        target: session_ref.to_string(),
        reason,
    };
    match tokio::time::timeout(timeout, payments.reconcile_session(session_ref)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(failed(err.to_string())),
        Err(_) => Err(failed(format!("timed out after {timeout:?}"))),
    }
}
