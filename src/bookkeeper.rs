//! Per-key bookkeeping: last success/failure timestamps, conditional
//! request state, and an optional backoff deadline.
//!
//! Grounded on the teacher's `InMemoryChangeJournal`
//! (`examples/Heyoub-caliber/caliber-storage/src/cache/watermark.rs`): a
//! `DashMap`-backed async trait implementation used both in production and
//! as its own test double, rather than a separate mock type.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::key::CacheKey;

/// Bookkeeping state tracked per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStatus {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Etag or equivalent validator from the most recent successful fetch,
    /// used to build conditional requests.
    pub last_etag: Option<String>,
    /// If set and in the future, [`crate::freshness::plan`] treats this key
    /// as unfetchable regardless of policy (other than `MustBeFresh`,
    /// see SPEC_FULL.md §9 "backoffUntil" decision).
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Collaborator contract for per-key bookkeeping.
///
/// The core depends only on this trait, never on a specific backoff
/// policy: [`InMemoryBookkeeper`] never populates `backoff_until` itself,
/// leaving that decision to whichever implementation wants to enforce one.
#[async_trait]
pub trait Bookkeeper<K: CacheKey>: Send + Sync {
    async fn status(&self, key: &K) -> KeyStatus;
    async fn record_success(&self, key: &K, etag: Option<String>, at: DateTime<Utc>);
    async fn record_failure(&self, key: &K, at: DateTime<Utc>);
    async fn set_backoff_until(&self, key: &K, until: Option<DateTime<Utc>>);
}

/// Default, in-memory bookkeeper.
pub struct InMemoryBookkeeper<K: CacheKey> {
    state: DashMap<K, KeyStatus>,
}

impl<K: CacheKey> Default for InMemoryBookkeeper<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey> InMemoryBookkeeper<K> {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
        }
    }
}

#[async_trait]
impl<K: CacheKey> Bookkeeper<K> for InMemoryBookkeeper<K> {
    async fn status(&self, key: &K) -> KeyStatus {
        self.state.get(key).map(|e| e.clone()).unwrap_or_default()
    }

    async fn record_success(&self, key: &K, etag: Option<String>, at: DateTime<Utc>) {
        let mut entry = self.state.entry(key.clone()).or_default();
        entry.last_success_at = Some(at);
        entry.last_failure_at = None;
        if etag.is_some() {
            entry.last_etag = etag;
        }
    }

    async fn record_failure(&self, key: &K, at: DateTime<Utc>) {
        tracing::warn!(namespace = key.namespace(), key_hash = key.stable_hash(), "fetch or mutation failure recorded");
        let mut entry = self.state.entry(key.clone()).or_default();
        entry.last_failure_at = Some(at);
    }

    async fn set_backoff_until(&self, key: &K, until: Option<DateTime<Utc>>) {
        let mut entry = self.state.entry(key.clone()).or_default();
        entry.backoff_until = until;
    }
}

pub type SharedBookkeeper<K> = Arc<dyn Bookkeeper<K>>;
