//! Freshness policy evaluation.
//!
//! [`plan`] is the pure function the design notes call for (spec §4.5,
//! §9): given a policy, the current time, what the source of truth last
//! reported, and per-key bookkeeping, it decides whether and how to fetch.
//! It owns no state and performs no I/O, mirroring the teacher's
//! `Freshness`/`CacheRead` pair in
//! `examples/Heyoub-caliber/caliber-storage/src/cache/freshness.rs`, which
//! keeps staleness math separate from the cache that uses it.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bookkeeper::KeyStatus;

/// How fresh a read must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
    /// Serve whatever is cached; fetch only if nothing is cached at all.
    CachedOrFetch,
    /// Serve cached data younger than `Duration`; otherwise fetch.
    MinAge(Duration),
    /// Always fetch before returning, regardless of what is cached.
    MustBeFresh,
    /// Like `CachedOrFetch`, but on a fetch error prefer serving the last
    /// known value (marked stale) over propagating the error.
    StaleIfError,
}

/// Metadata the source of truth attaches to its last known value, used to
/// decide staleness and to build conditional requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbMeta {
    pub updated_at: Option<DateTime<Utc>>,
}

/// What the coordinator should do about the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// Cached data satisfies the policy; no network call.
    Skip,
    /// Fetch without conditional headers.
    Unconditional,
    /// Fetch with a conditional request built from prior bookkeeping.
    Conditional {
        if_none_match: Option<String>,
        if_modified_since: Option<DateTime<Utc>>,
    },
}

/// Decide the fetch plan for one read.
///
/// `now` is passed in rather than read internally so the function stays
/// pure and trivially testable with fixed clocks.
pub fn plan(
    now: DateTime<Utc>,
    policy: FreshnessPolicy,
    db_meta: Option<&DbMeta>,
    key_status: &KeyStatus,
    default_min_age: Duration,
    conditional_requests_enabled: bool,
) -> FetchPlan {
    if policy != FreshnessPolicy::MustBeFresh {
        if let Some(until) = key_status.backoff_until {
            if until > now {
                return FetchPlan::Skip;
            }
        }
    }

    // "Fresh" is `now - updatedAt <= threshold` for every non-`MustBeFresh`
    // policy; the threshold is the policy's own `d` for `MinAge`, else the
    // engine-default TTL (spec §4.5). `CachedOrFetch` and `StaleIfError`
    // share this freshness math — they differ only in what the coordinator
    // does with a fetch error, not in whether one is scheduled.
    let threshold = match policy {
        FreshnessPolicy::MinAge(d) => d,
        FreshnessPolicy::MustBeFresh => Duration::ZERO,
        FreshnessPolicy::CachedOrFetch | FreshnessPolicy::StaleIfError => default_min_age,
    };

    let have_value = db_meta.is_some();
    let age = db_meta
        .and_then(|m| m.updated_at)
        .map(|updated_at| (now - updated_at).to_std().unwrap_or(Duration::ZERO));

    let satisfied = match (policy, have_value, age) {
        (FreshnessPolicy::MustBeFresh, _, _) => false,
        (_, true, Some(age)) => age <= threshold,
        (_, true, None) => false,
        (_, false, _) => false,
    };

    if satisfied {
        return FetchPlan::Skip;
    }

    if conditional_requests_enabled && (key_status.last_etag.is_some() || db_meta.and_then(|m| m.updated_at).is_some())
    {
        FetchPlan::Conditional {
            if_none_match: key_status.last_etag.clone(),
            if_modified_since: db_meta.and_then(|m| m.updated_at),
        }
    } else {
        FetchPlan::Unconditional
    }
}
