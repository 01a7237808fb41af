use crate::config::ConvergencePolicy;
use crate::error::{Result, SyncError};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of running a one-shot corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectiveStatus {
    Dispatched,
    /// The action's own latch was already claimed; nothing was sent.
    AlreadyDispatched,
}

/// Side effect fired once when a target is slow to converge.
pub type CorrectiveAction =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<CorrectiveStatus>> + Send>;

/// Book-keeping for one convergence loop.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReconciliationAttempt {
    pub target_key: String,
    pub attempt_count: u32,
    pub corrective_action_sent: bool,
    pub terminal: bool,
}

impl ReconciliationAttempt {
    fn new(target_key: &str) -> Self {
        Self {
            target_key: target_key.to_string(),
            ..Default::default()
        }
    }
}

/// How one convergence loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Convergence<S> {
    Converged(S),
    /// The attempt budget ran out; `last_observed` is the latest successful read.
    GaveUp { last_observed: Option<S> },
    /// The caller detached before the loop resolved.
    Cancelled,
}

/// Outcome of a loop plus the bookkeeping of the attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport<S> {
    pub outcome: Convergence<S>,
    pub attempt: ReconciliationAttempt,
}

impl<S> ConvergenceReport<S> {
    fn cancelled(target_key: &str) -> Self {
        Self {
            outcome: Convergence::Cancelled,
            attempt: ReconciliationAttempt {
                terminal: true,
                ..ReconciliationAttempt::new(target_key)
            },
        }
    }

    /// True when the loop observed the target state.
    pub fn is_converged(&self) -> bool {
        matches!(self.outcome, Convergence::Converged(_))
    }

    /// Non-converged outcomes can always be retried with a fresh call.
    pub fn is_retryable(&self) -> bool {
        !self.is_converged()
    }
}

type SharedRun<S> = Shared<BoxFuture<'static, Result<ConvergenceReport<S>>>>;

struct InFlight<S> {
    generation: u64,
    consumers: usize,
    token: CancellationToken,
    run: SharedRun<S>,
}

struct Registry<S> {
    in_flight: Mutex<HashMap<String, InFlight<S>>>,
    next_generation: AtomicU64,
}

impl<S> Registry<S> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight<S>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the entry for `key` if it still belongs to `generation`.
    fn release(&self, key: &str, generation: u64) {
        let released = {
            let mut in_flight = self.lock();
            let current = in_flight
                .get(key)
                .is_some_and(|entry| entry.generation == generation);
            if current { in_flight.remove(key) } else { None }
        };
        drop(released);
    }
}

/// Detaches one consumer on drop; the last one out cancels the loop.
struct ConsumerGuard<'a, S> {
    registry: &'a Registry<S>,
    key: &'a str,
    generation: u64,
}

impl<S> Drop for ConsumerGuard<'_, S> {
    fn drop(&mut self) {
        let orphaned = {
            let mut in_flight = self.registry.lock();
            let last_out = match in_flight.get_mut(self.key) {
                Some(entry) if entry.generation == self.generation => {
                    entry.consumers = entry.consumers.saturating_sub(1);
                    entry.consumers == 0
                }
                _ => false,
            };
            if last_out {
                in_flight.remove(self.key)
            } else {
                None
            }
        };
        if let Some(entry) = orphaned {
            debug!(target_key = %self.key, "last consumer detached, cancelling convergence");
            entry.token.cancel();
        }
    }
}

/// Bounded polling loop with a per-target reentrancy guard.
///
/// At most one loop runs per target key. A second `converge` call for a key that is
/// already in flight attaches to the running loop and resolves with its result instead
/// of starting another one, so the corrective action can only fire once per loop.
pub struct ConvergenceScheduler<S> {
    registry: Arc<Registry<S>>,
}

impl<S> Clone for ConvergenceScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S> Default for ConvergenceScheduler<S> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

impl<S> ConvergenceScheduler<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Creates a scheduler with no loops in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a loop for `key` has at least one attached caller.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.registry.lock().contains_key(key)
    }

    /// Polls `check` every `policy.interval` until `is_converged` holds.
    ///
    /// After `policy.corrective_after_attempt` unconverged attempts the corrective action
    /// runs once; after `policy.max_attempts` the loop gives up. Transient read failures
    /// count as unconverged attempts, any other error ends the loop immediately.
    ///
    /// Cancelling `cancel` detaches this caller: it resolves with
    /// [`Convergence::Cancelled`], and once every attached caller has detached the loop
    /// stops without firing any further callback.
    pub async fn converge<C, Fut, P>(
        &self,
        key: impl Into<String>,
        policy: ConvergencePolicy,
        check: C,
        is_converged: P,
        corrective: Option<CorrectiveAction>,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceReport<S>>
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        P: Fn(&S) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        if cancel.is_cancelled() {
            return Ok(ConvergenceReport::cancelled(&key));
        }

        let (run, generation) = {
            let mut in_flight = self.registry.lock();
            match in_flight.get_mut(&key) {
                Some(entry) => {
                    entry.consumers += 1;
                    debug!(target_key = %key, consumers = entry.consumers, "attaching to in-flight convergence");
                    (entry.run.clone(), entry.generation)
                }
                None => {
                    let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
                    let token = CancellationToken::new();
                    let run = drive(
                        Arc::clone(&self.registry),
                        key.clone(),
                        generation,
                        policy,
                        check,
                        is_converged,
                        corrective,
                        token.clone(),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            generation,
                            consumers: 1,
                            token,
                            run: run.clone(),
                        },
                    );
                    (run, generation)
                }
            }
        };

        let _consumer = ConsumerGuard {
            registry: &self.registry,
            key: &key,
            generation,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target_key = %key, "consumer cancelled convergence");
                Ok(ConvergenceReport::cancelled(&key))
            }
            report = run => report,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<S, C, Fut, P>(
    registry: Arc<Registry<S>>,
    key: String,
    generation: u64,
    policy: ConvergencePolicy,
    check: C,
    is_converged: P,
    corrective: Option<CorrectiveAction>,
    token: CancellationToken,
) -> Result<ConvergenceReport<S>>
where
    S: Clone + Send + Sync + 'static,
    C: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
    P: Fn(&S) -> bool + Send + Sync + 'static,
{
    let mut attempt = ReconciliationAttempt::new(&key);
    let result = poll_until_converged(
        &key,
        &policy,
        &check,
        &is_converged,
        corrective,
        &token,
        &mut attempt,
    )
    .await;
    registry.release(&key, generation);
    attempt.terminal = true;

    let outcome = result?;
    match &outcome {
        Convergence::Converged(_) => {
            info!(target_key = %key, attempts = attempt.attempt_count, "converged")
        }
        Convergence::GaveUp { .. } => warn!(
            target_key = %key,
            attempts = attempt.attempt_count,
            corrective_action_sent = attempt.corrective_action_sent,
            "gave up waiting for convergence"
        ),
        Convergence::Cancelled => debug!(target_key = %key, "convergence cancelled"),
    }
    Ok(ConvergenceReport { outcome, attempt })
}

async fn poll_until_converged<S, C, Fut, P>(
    key: &str,
    policy: &ConvergencePolicy,
    check: &C,
    is_converged: &P,
    mut corrective: Option<CorrectiveAction>,
    token: &CancellationToken,
    attempt: &mut ReconciliationAttempt,
) -> Result<Convergence<S>>
where
    C: Fn() -> Fut,
    Fut: Future<Output = Result<S>>,
    P: Fn(&S) -> bool,
{
    let mut last_observed = None;
    loop {
        if token.is_cancelled() {
            return Ok(Convergence::Cancelled);
        }
        attempt.attempt_count += 1;
        let n = attempt.attempt_count;

        let observed = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Convergence::Cancelled),
            observed = tokio::time::timeout(policy.attempt_timeout, check()) => {
                observed.unwrap_or_else(|_| {
                    Err(SyncError::TransientFetch(format!(
                        "check for {key} timed out after {:?}",
                        policy.attempt_timeout
                    )))
                })
            }
        };
        match observed {
            Ok(state) if is_converged(&state) => return Ok(Convergence::Converged(state)),
            Ok(state) => {
                debug!(target_key = %key, attempt = n, "not converged yet");
                last_observed = Some(state);
            }
            Err(err) if err.is_retryable() => {
                warn!(target_key = %key, attempt = n, error = %err, "transient failure while polling");
            }
            Err(err) => {
                error!(target_key = %key, attempt = n, error = %err, "non-retryable failure, aborting convergence");
                return Err(err);
            }
        }

        if policy.corrective_after_attempt == Some(n)
            && let Some(action) = corrective.take()
        {
            let status = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(Convergence::Cancelled),
                status = action() => status,
            };
            match status {
                Ok(CorrectiveStatus::Dispatched) => {
                    info!(target_key = %key, attempt = n, "corrective action dispatched");
                    attempt.corrective_action_sent = true;
                }
                Ok(CorrectiveStatus::AlreadyDispatched) => {
                    debug!(target_key = %key, "corrective action already dispatched earlier");
                }
                Err(err) => {
                    warn!(target_key = %key, attempt = n, error = %err, "corrective action failed, continuing to poll");
                }
            }
        }

        if n >= policy.max_attempts {
            return Ok(Convergence::GaveUp { last_observed });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Convergence::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
