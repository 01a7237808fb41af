use miette::Diagnostic;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures surfaced by the sync core.
///
/// The enum is `Clone` because a single convergence loop may resolve several attached
/// callers with the same result.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transient fetch error: {0}")]
    #[diagnostic(code(ledgersync::transient_fetch))]
    TransientFetch(String),

    #[error("Query failed: {0}")]
    #[diagnostic(code(ledgersync::query_failed))]
    QueryFailed(String),

    #[error("Corrective action for {target} failed: {reason}")]
    #[diagnostic(code(ledgersync::corrective_action_failed))]
    CorrectiveActionFailed { target: String, reason: String },

    #[error("Gave up on {target} after {attempts} attempts")]
    #[diagnostic(
        code(ledgersync::exhausted),
        help("retry manually; a fresh call starts a new attempt budget")
    )]
    Exhausted { target: String, attempts: u32 },

    #[error("Invariant violation: {0}")]
    #[diagnostic(code(ledgersync::invariant_violation))]
    InvariantViolation(String),

    #[error("Payment collaborator error: {0}")]
    #[diagnostic(code(ledgersync::payment))]
    Payment(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(ledgersync::config))]
    Config(String),
}

impl SyncError {
    /// Only transient fetch failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientFetch(_))
    }

    /// Re-labels store failures for the query surface; other variants pass through.
    pub fn into_query_failed(self) -> Self {
        match self {
            SyncError::TransientFetch(reason) => SyncError::QueryFailed(reason),
            other => other,
        }
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
