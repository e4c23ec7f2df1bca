//! Aggregate tunables for the engine and its components.
//!
//! Follows the teacher's `CacheConfig` builder shape (see
//! `examples/Heyoub-caliber/caliber-storage/src/cache/read_through.rs`):
//! chained `with_*` setters over a `Default` base, and a `validate` step
//! that construction always calls so bad values are rejected eagerly
//! rather than discovered mid-operation.

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for one [`crate::engine::Engine`] instance.
///
/// All durations are wall-clock; the engine never interprets them as
/// deadlines relative to a monotonic clock because staleness is compared
/// against timestamps that may have been produced by a remote source of
/// truth.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of entries held in the in-memory tier.
    pub memory_capacity: usize,
    /// Entries older than this are treated as absent by the memory tier.
    pub memory_ttl: Duration,
    /// Maximum number of distinct keys with a live per-key mutex at once.
    pub key_mutex_capacity: usize,
    /// Default `MinAge` threshold used when a read call does not specify
    /// its own freshness policy.
    pub default_freshness_threshold: Duration,
    /// Whether conditional requests (If-None-Match / If-Modified-Since) are
    /// attempted when bookkeeping has a prior etag or timestamp.
    pub conditional_requests_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            memory_ttl: Duration::from_secs(300),
            key_mutex_capacity: 1_000,
            default_freshness_threshold: Duration::from_secs(60),
            conditional_requests_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = ttl;
        self
    }

    pub fn with_key_mutex_capacity(mut self, capacity: usize) -> Self {
        self.key_mutex_capacity = capacity;
        self
    }

    pub fn with_default_freshness_threshold(mut self, threshold: Duration) -> Self {
        self.default_freshness_threshold = threshold;
        self
    }

    pub fn with_conditional_requests_enabled(mut self, enabled: bool) -> Self {
        self.conditional_requests_enabled = enabled;
        self
    }

    /// Eagerly reject configuration that would otherwise fail lazily.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_capacity == 0 {
            return Err(ConfigError::ZeroMemoryCapacity(self.memory_capacity));
        }
        if self.memory_ttl.is_zero() {
            return Err(ConfigError::NonPositiveMemoryTtl);
        }
        if self.key_mutex_capacity == 0 {
            return Err(ConfigError::ZeroKeyMutexCapacity(self.key_mutex_capacity));
        }
        Ok(())
    }
}
