//! Per-key fetch coalescing.
//!
//! A key with an in-flight fetch is represented as a [`futures_util::future::Shared`]
//! future fed by a task spawned onto the engine's background scope — the
//! "promise-like shared future" the design notes call for (spec §9). Because
//! the work is spawned independently of any particular joiner awaiting it,
//! a joiner dropping its await (cancelling) never stops the underlying
//! fetch; it keeps running for whichever other joiners (or no one) are
//! still watching. The fetch itself is only cancelled when the engine's
//! shutdown signal fires (spec §5), raced against the supplied runnable
//! the same way `Engine::close`'s background tasks race it.
//!
//! Coalescing itself is done with `DashMap`'s entry API, which gives an
//! atomic get-or-create per key without holding an await point inside the
//! critical section — the same shape as the teacher's
//! `RateLimitState::entry(key).or_insert_with(...)`
//! (`examples/Heyoub-caliber/caliber-api/src/middleware/auth.rs`).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{oneshot, watch};

use crate::background::{self, BackgroundScope};
use crate::error::EngineError;
use crate::key::CacheKey;

type Outcome<T> = Result<T, EngineError>;
type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct InFlightEntry<T> {
    /// Guards against an ABA race: a slot can be removed and a new one
    /// installed for the same key between a reader's lookup and a
    /// cleanup task's removal; only the cleanup task matching this id may
    /// remove the slot it was spawned for.
    id: u64,
    shared: SharedOutcome<T>,
}

impl<T> Clone for InFlightEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

/// Registry of in-flight, single-flighted operations keyed by `K`.
pub struct SingleFlight<K: CacheKey, T: Clone + Send + 'static> {
    inflight: Arc<DashMap<K, InFlightEntry<T>>>,
    next_id: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
    background: BackgroundScope,
}

impl<K: CacheKey, T: Clone + Send + 'static> SingleFlight<K, T> {
    /// `shutdown_rx` is raced against every fetch this registry starts;
    /// `background` is the scope those tasks (and the per-key cleanup
    /// task that follows each one) are spawned onto, shared with the
    /// owning [`crate::engine::Engine`] so [`crate::engine::Engine::close`]
    /// awaits them too.
    pub fn new(shutdown_rx: watch::Receiver<bool>, background: BackgroundScope) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown_rx,
            background,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Join an in-flight operation for `key`, or start one by spawning
    /// `make_runnable()` if none exists.
    ///
    /// `make_runnable` is only invoked by the caller that wins the race to
    /// install the slot, so it is safe for it to be expensive to construct.
    /// The spawned task races `make_runnable()` against the shutdown
    /// signal; whichever resolves first wins, and losing drops the other
    /// (cancelling an in-progress fetch is exactly dropping its future).
    pub fn join<F, Fut>(&self, key: K, make_runnable: F) -> SharedOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
        T: Send,
    {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                tracing::debug!(namespace = key.namespace(), key_hash = key.stable_hash(), "single-flight join coalesced onto in-flight task");
                occupied.get().shared.clone()
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(namespace = key.namespace(), key_hash = key.stable_hash(), "single-flight join started new task");
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);

                let (result_tx, result_rx) = oneshot::channel::<Outcome<T>>();
                let mut shutdown_rx = self.shutdown_rx.clone();
                let runnable = make_runnable();
                background::spawn_tracked(&self.background, async move {
                    if *shutdown_rx.borrow() {
                        let _ = result_tx.send(Err(EngineError::Closed));
                        return;
                    }
                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => Err(EngineError::Closed),
                        result = runnable => result,
                    };
                    let _ = result_tx.send(outcome);
                });

                let joined: BoxFuture<'static, Outcome<T>> = async move {
                    match result_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(EngineError::Closed),
                    }
                }
                .boxed();
                let shared = joined.shared();
                vacant.insert(InFlightEntry {
                    id,
                    shared: shared.clone(),
                });

                let map = Arc::clone(&self.inflight);
                let cleanup_key = key;
                let cleanup_shared = shared.clone();
                background::spawn_tracked(&self.background, async move {
                    let _ = cleanup_shared.await;
                    tracing::debug!(namespace = cleanup_key.namespace(), key_hash = cleanup_key.stable_hash(), "single-flight task reached terminal state");
                    map.remove_if(&cleanup_key, |_, entry| entry.id == id);
                });

                shared
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use std::sync::atomic::{AtomicUsize, Ordering as MemOrdering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn sf<T: Clone + Send + 'static>() -> (SingleFlight<Key, T>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (SingleFlight::new(rx, background::new_scope()), tx)
    }

    #[tokio::test]
    async fn concurrent_joins_run_the_task_once() {
        let (sf, _shutdown) = sf::<u32>();
        let key = Key::by_id("ns", "T", "1");
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..100 {
            let invocations = Arc::clone(&invocations);
            let shared = sf.join(key.clone(), move || async move {
                invocations.fetch_add(1, MemOrdering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                Ok(42u32)
            });
            joins.push(tokio::spawn(shared));
        }

        for j in joins {
            assert_eq!(j.await.unwrap().unwrap(), 42);
        }
        assert_eq!(invocations.load(MemOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_one_joiner_does_not_stop_the_task() {
        let (sf, _shutdown) = sf::<u32>();
        let key = Key::by_id("ns", "T", "1");
        let completed = Arc::new(AtomicUsize::new(0));

        let completed2 = Arc::clone(&completed);
        let shared = sf.join(key.clone(), move || async move {
            sleep(Duration::from_millis(30)).await;
            completed2.fetch_add(1, MemOrdering::SeqCst);
            Ok(7u32)
        });

        let dropped = shared.clone();
        drop(dropped); // "cancel" by simply never polling this clone further

        // A second joiner still observes the one real outcome.
        let joined = shared.clone();
        assert_eq!(joined.await.unwrap(), 7);
        assert_eq!(completed.load(MemOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slot_is_removed_after_completion_so_a_new_fetch_can_start() {
        let (sf, _shutdown) = sf::<u32>();
        let key = Key::by_id("ns", "T", "1");

        sf.join(key.clone(), || async { Ok(1u32) }).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sf.in_flight_count(), 0);

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations2 = Arc::clone(&invocations);
        sf.join(key, move || async move {
            invocations2.fetch_add(1, MemOrdering::SeqCst);
            Ok(2u32)
        })
        .await
        .unwrap();
        assert_eq!(invocations.load(MemOrdering::SeqCst), 1);
    }

    /// Flipping the shutdown signal cancels an in-flight fetch: the
    /// runnable's own future is dropped rather than run to completion.
    #[tokio::test]
    async fn shutdown_signal_cancels_the_running_fetch() {
        let (sf, shutdown_tx) = sf::<u32>();
        let key = Key::by_id("ns", "T", "1");
        let ran_to_completion = Arc::new(AtomicUsize::new(0));

        let ran2 = Arc::clone(&ran_to_completion);
        let shared = sf.join(key, move || async move {
            sleep(Duration::from_secs(60)).await;
            ran2.fetch_add(1, MemOrdering::SeqCst);
            Ok(1u32)
        });

        shutdown_tx.send(true).unwrap();
        let result = shared.await;
        assert!(matches!(result, Err(EngineError::Closed)));
        assert_eq!(ran_to_completion.load(MemOrdering::SeqCst), 0);
    }

    /// A fetch started after the shutdown signal already fired never runs
    /// at all.
    #[tokio::test]
    async fn join_after_shutdown_fails_without_running() {
        let (sf, shutdown_tx) = sf::<u32>();
        shutdown_tx.send(true).unwrap();
        let key = Key::by_id("ns", "T", "1");
        let invoked = Arc::new(AtomicUsize::new(0));

        let invoked2 = Arc::clone(&invoked);
        let result = sf
            .join(key, move || async move {
                invoked2.fetch_add(1, MemOrdering::SeqCst);
                Ok(1u32)
            })
            .await;

        assert!(matches!(result, Err(EngineError::Closed)));
        assert_eq!(invoked.load(MemOrdering::SeqCst), 0);
    }
}
