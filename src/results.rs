//! Typed results for the five mutation operations (spec §4.7, §6).
//!
//! Every variant here is a normal return value; the mutation pipeline
//! never throws except for cancellation and programmer errors (spec §7).

use crate::error::EngineError;
use crate::key::CacheKey;

#[derive(Debug, Clone)]
pub enum UpdateResult {
    /// The remote accepted the update and reconciliation completed.
    Synced,
    /// No online client was required/available; the optimistic local
    /// write stands and nothing further is scheduled.
    Enqueued,
    Failed { cause: EngineError },
}

#[derive(Debug, Clone)]
pub enum CreateResult<K: CacheKey> {
    /// The server assigned `canonical_key`; if a provisional key was used
    /// locally it is carried here for the caller to reconcile routing.
    Synced {
        canonical_key: K,
        provisional: Option<K>,
    },
    Failed {
        provisional: Option<K>,
        cause: EngineError,
    },
}

#[derive(Debug, Clone)]
pub enum DeleteResult {
    Synced { already_deleted: bool },
    Enqueued,
    /// `restored` is currently always `false`: there is no generic
    /// `Read -> Write` path to reconstruct what was deleted, so a failed
    /// remote delete is never rolled back locally (spec §9 "no rollback
    /// on mutation failure"). The field is kept so a future `SourceOfTruth`
    /// that can snapshot a prior value has somewhere to report it.
    Failed { cause: EngineError, restored: bool },
}

#[derive(Debug, Clone)]
pub enum UpsertResult<K: CacheKey> {
    Synced { key: K, created: bool },
    /// `requireOnline` was false and no mutation client was configured;
    /// the optimistic local write stands (spec §9 open-question decision).
    Local { key: K },
    Failed { key: K, cause: EngineError },
}

#[derive(Debug, Clone)]
pub enum ReplaceResult {
    Synced,
    Enqueued,
    Failed { cause: EngineError },
}
