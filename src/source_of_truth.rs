//! The `SourceOfTruth` collaborator contract: the local, durable backing
//! store the engine reads through and writes fetched/mutated data into.
//!
//! Shaped like the teacher's `AsyncStorageTrait`
//! (`examples/Heyoub-caliber/caliber-storage/src/async_trait.rs`) but
//! generic over key/read/write types instead of one fixed entity, since
//! this engine is a generic coordination core rather than a
//! domain-specific store.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{Stream, StreamExt};

use crate::error::{EngineError, StorexResult};
use crate::key::CacheKey;

/// A unit of work run atomically against the source of truth.
pub type TransactionBlock<'a> = Box<dyn FnOnce() -> BoxFuture<'a, StorexResult<()>> + Send + 'a>;

/// Decides the write (if any) to apply under a record's new key during
/// [`SourceOfTruth::rekey`], given whatever was already stored there.
pub type RekeyReconcile<Read, Write> = Box<dyn FnOnce(Option<Read>) -> Option<Write> + Send>;

/// A durable, subscribable local store.
///
/// `reader` must replay the key's current value (or `None`) to a new
/// subscriber immediately, then continue emitting on every write — callers
/// rely on this to avoid a race between "read current state" and
/// "subscribe to future changes".
#[async_trait]
pub trait SourceOfTruth: Send + Sync {
    type Key: CacheKey;
    type Read: Clone + Send + Sync + 'static;
    type Write: Send + Sync + 'static;
    type Stream: Stream<Item = Option<Self::Read>> + Send + Unpin;

    /// Subscribe to a key's value, replaying the current value first.
    fn reader(&self, key: &Self::Key) -> Self::Stream;

    /// A single non-blocking read of the current projection, used by the
    /// read path's validator preflight (spec §4.6 step 1). The default
    /// implementation takes the first element of [`reader`].
    async fn peek(&self, key: &Self::Key) -> StorexResult<Option<Self::Read>> {
        Ok(self.reader(key).next().await.flatten())
    }

    /// Write (insert or replace) a value for `key`.
    async fn write(&self, key: &Self::Key, value: Self::Write) -> StorexResult<()>;

    /// Delete the value for `key`, if any.
    async fn delete(&self, key: &Self::Key) -> StorexResult<()>;

    /// Run `block` atomically. Used for multi-write reconciliation (e.g. an
    /// optimistic write followed by a remote echo) so concurrent readers
    /// never observe a torn intermediate state (spec §5).
    async fn with_transaction<'a>(&'a self, block: TransactionBlock<'a>) -> StorexResult<()> {
        block().await
    }

    /// Re-key a record, e.g. after the server assigns a canonical id to a
    /// client-generated draft. `reconcile` decides the final value stored
    /// under `new` given whatever (if anything) already lives there.
    ///
    /// Optional: collaborators that never create drafts under a
    /// provisional key may leave this unsupported.
    async fn rekey(
        &self,
        _old: &Self::Key,
        _new: &Self::Key,
        _reconcile: RekeyReconcile<Self::Read, Self::Write>,
    ) -> StorexResult<()> {
        Err(EngineError::Unsupported("rekey"))
    }

    /// Clear any cached read-side state the source of truth itself holds
    /// for `key` (distinct from the engine's own memory tier). Optional;
    /// most collaborators have nothing of their own to clear.
    async fn clear_cache(&self, _key: &Self::Key) -> StorexResult<()> {
        Ok(())
    }
}
