//! Layered configuration for the sync core.
//!
//! Precedence, lowest to highest:
//! 1. Programmatic defaults
//! 2. An optional YAML file
//! 3. Environment variables prefixed `LEDGERSYNC_`, `__` separating nested keys
//!    (e.g. `LEDGERSYNC_CHECKOUT__MAX_ATTEMPTS=8`)

use crate::error::{Result, SyncError};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How patiently a convergence loop polls before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergencePolicy {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub max_attempts: u32,
    /// Failed attempts after which the one-shot corrective action fires.
    #[serde(default)]
    pub corrective_after_attempt: Option<u32>,
    /// Upper bound on a single check; a check that overruns counts as a transient failure.
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ConvergencePolicy {
    /// Policy for driving a checkout session to a terminal ledger state.
    pub const CHECKOUT: Self = Self {
        interval: Duration::from_secs(3),
        max_attempts: 6,
        corrective_after_attempt: Some(3),
        attempt_timeout: Duration::from_secs(10),
    };

    /// Policy for refetching a view after a change signal.
    pub const REFETCH: Self = Self {
        interval: Duration::from_secs(2),
        max_attempts: 3,
        corrective_after_attempt: None,
        attempt_timeout: Duration::from_secs(10),
    };

    /// Rejects a policy that could never run; `name` prefixes the error message.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config(format!(
                "{name}.max_attempts must be at least 1"
            )));
        }
        if self.interval.is_zero() {
            return Err(SyncError::Config(format!(
                "{name}.interval must be greater than zero"
            )));
        }
        if self.attempt_timeout.is_zero() {
            return Err(SyncError::Config(format!(
                "{name}.attempt_timeout must be greater than zero"
            )));
        }
        if let Some(after) = self.corrective_after_attempt
            && (after == 0 || after >= self.max_attempts)
        {
            return Err(SyncError::Config(format!(
                "{name}.corrective_after_attempt ({after}) must be between 1 and max_attempts - 1 ({})",
                self.max_attempts - 1
            )));
        }
        Ok(())
    }
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging settings consumed by [`crate::telemetry::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Settings of the quote query engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteQueryConfig {
    /// Issue the project-only fallback query when the strict query is empty.
    pub fallback_widening: bool,
}

impl Default for QuoteQueryConfig {
    fn default() -> Self {
        Self {
            fallback_widening: true,
        }
    }
}

/// Top-level configuration of the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub checkout: ConvergencePolicy,
    pub refetch: ConvergencePolicy,
    /// Upper bound on a single payment collaborator call.
    #[serde(with = "humantime_serde")]
    pub collaborator_timeout: Duration,
    /// Maximum age of a cached ledger read.
    #[serde(with = "humantime_serde")]
    pub ledger_staleness: Duration,
    pub quotes: QuoteQueryConfig,
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkout: ConvergencePolicy::CHECKOUT,
            refetch: ConvergencePolicy::REFETCH,
            collaborator_timeout: Duration::from_secs(10),
            ledger_staleness: Duration::from_secs(5),
            quotes: QuoteQueryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `LEDGERSYNC_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `path`, then environment variables.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(SyncConfig::default()))
                .merge(Yaml::file(path.as_ref()))
                .merge(Env::prefixed("LEDGERSYNC_").split("__")),
        )
    }

    /// The provider stack behind [`load`](Self::load), for callers that merge their own layers.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(SyncConfig::default()))
            .merge(Env::prefixed("LEDGERSYNC_").split("__"))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: SyncConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks both policies and the collaborator timeout.
    pub fn validate(&self) -> Result<()> {
        self.checkout.validate("checkout")?;
        self.refetch.validate("refetch")?;
        if self.collaborator_timeout.is_zero() {
            return Err(SyncError::Config(
                "collaborator_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
