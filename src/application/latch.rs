use super::convergence::CorrectiveStatus;
use crate::error::Result;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

/// One-shot guard: the first claim of a key wins, every later claim is refused.
///
/// Claims are never released, so an action guarded by the latch runs at most once per
/// key for the lifetime of the latch, whether or not it succeeded.
#[derive(Debug, Default)]
pub struct IdempotencyLatch {
    claimed: Mutex<HashSet<String>>,
}

impl IdempotencyLatch {
    /// Creates a latch with no claims.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first caller only.
    pub fn try_claim(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    /// True once any caller has claimed `key`.
    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Runs `action` if this call wins the claim for `key`.
    pub async fn run_once<F, Fut>(&self, key: &str, action: F) -> Result<CorrectiveStatus>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.try_claim(key) {
            return Ok(CorrectiveStatus::AlreadyDispatched);
        }
        action().await?;
        Ok(CorrectiveStatus::Dispatched)
    }
}
