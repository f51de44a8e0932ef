//! Engine and sync-loop configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::resolve::ResolverStrategy;

/// Configuration for opening a [`crate::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Display name used when the device identity is first created.
    pub device_name: Option<String>,
    /// Resolver applied to conflicts detected during import.
    pub resolver: ResolverStrategy,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
}

impl EngineConfig {
    /// Creates a configuration with defaults (manual resolution).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            device_name: None,
            resolver: ResolverStrategy::Manual,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the device display name for first initialisation.
    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Sets the conflict resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ResolverStrategy) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the SQLite busy timeout.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Timing knobs for the background sync loop.
#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    /// Pause between successful cycles.
    pub interval: Duration,
    /// First retry delay after a transient failure.
    pub retry_base: Duration,
    /// Upper bound on the backoff delay.
    pub retry_max: Duration,
    /// Transient failures tolerated before the loop parks in `Error`.
    pub max_retries: u32,
}

impl SyncLoopConfig {
    /// Backoff delay before retry `attempt` (1-based): `base · 2^(n-1)`,
    /// capped at `retry_max`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base
            .saturating_mul(factor)
            .min(self.retry_max)
    }
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
            max_retries: 10,
        }
    }
}
