//! Read path: `stream()` and `get()`.
//!
//! `stream()` wires a `tokio::sync::watch` channel between a background
//! driver task and the caller. `watch` is the natural fit for spec §5's
//! conflation requirement ("preserving only the most recent value per
//! key") — a slow subscriber simply misses intermediate sends and always
//! observes the latest one, with no unbounded buffering to reason about.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::background::BackgroundScope;
use crate::converter::Converter;
use crate::error::{EngineError, StorexResult};
use crate::fetcher::{ConditionalRequest, FetchOutcome, Fetcher};
use crate::freshness::{self, FetchPlan, FreshnessPolicy};
use crate::key::CacheKey;
use crate::mutation::{MutationClient, MutationEncoder};
use crate::source_of_truth::SourceOfTruth;
use crate::stream_result::{Origin, StreamResult};

use super::StreamTick;
use crate::engine::Engine;

impl<S, F, C, Enc, M> Engine<S, F, C, Enc, M>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net> + 'static,
    M: MutationClient<Key = S::Key, Net = F::Net> + 'static,
{
    /// Subscribe to a key's value under a freshness policy.
    ///
    /// Emits `Loading` while nothing is cached, `Data` for every value
    /// observed from the memory tier or the source of truth, and `Error`
    /// if a background fetch fails — without ending the stream, so callers
    /// can keep receiving subsequent source-of-truth updates.
    pub fn stream(&self, key: S::Key, policy: FreshnessPolicy) -> StorexResult<impl Stream<Item = StreamResult<C::Domain>>> {
        self.ensure_open()?;

        let (tx, rx) = tokio::sync::watch::channel(StreamTick::None);

        let sot = std::sync::Arc::clone(&self.sot);
        let fetcher = std::sync::Arc::clone(&self.fetcher);
        let converter = std::sync::Arc::clone(&self.converter);
        let bookkeeper = std::sync::Arc::clone(&self.bookkeeper);
        let single_flight = std::sync::Arc::clone(&self.single_flight);
        let key_mutex = std::sync::Arc::clone(&self.key_mutex);
        let memory = std::sync::Arc::clone(&self.memory);
        let default_min_age = self.config.default_freshness_threshold;
        let conditional_enabled = self.config.conditional_requests_enabled;
        let drive_key = key.clone();
        let shutdown_rx = self.shutdown_signal();
        let background = Arc::clone(&self.background);

        self.spawn_background(async move {
            drive_stream(
                drive_key,
                policy,
                tx,
                sot,
                fetcher,
                converter,
                bookkeeper,
                single_flight,
                key_mutex,
                memory,
                default_min_age,
                conditional_enabled,
                shutdown_rx,
                background,
            )
            .await;
        });

        Ok(WatchStream::new(rx).filter_map(|tick| async move { tick.into_result() }))
    }

    /// Resolve a single value for `key` under `policy`.
    ///
    /// Under `CachedOrFetch`, a memory-tier hit is returned immediately
    /// without starting a stream or a fetch (spec §4.6). Otherwise waits
    /// for the first `Data` tick; a `MustBeFresh` fetch failure (or any
    /// failure observed before any data has ever been produced) propagates
    /// as an `Err` rather than as a stream tick, since there is no stale
    /// value to fall back to.
    pub async fn get(&self, key: S::Key, policy: FreshnessPolicy) -> StorexResult<C::Domain> {
        self.ensure_open()?;
        if policy == FreshnessPolicy::CachedOrFetch {
            if let Some((value, _age)) = self.memory.get(&key) {
                return Ok(value);
            }
        }

        let mut stream = Box::pin(self.stream(key, policy)?);
        while let Some(tick) = stream.next().await {
            match tick {
                StreamResult::Data { value, .. } => return Ok(value),
                StreamResult::Error { cause, served_stale: false } => return Err(cause),
                StreamResult::Error { served_stale: true, .. } | StreamResult::Loading { .. } => continue,
            }
        }
        Err(EngineError::Closed)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_stream<S, F, C>(
    key: S::Key,
    policy: FreshnessPolicy,
    tx: tokio::sync::watch::Sender<StreamTick<C::Domain>>,
    sot: std::sync::Arc<S>,
    fetcher: std::sync::Arc<F>,
    converter: std::sync::Arc<C>,
    bookkeeper: std::sync::Arc<dyn crate::bookkeeper::Bookkeeper<S::Key>>,
    single_flight: std::sync::Arc<crate::single_flight::SingleFlight<S::Key, ()>>,
    key_mutex: std::sync::Arc<crate::key_mutex::KeyMutex<S::Key>>,
    memory: std::sync::Arc<crate::memory_cache::MemoryCache<S::Key, C::Domain>>,
    default_min_age: Duration,
    conditional_enabled: bool,
    mut shutdown_rx: watch::Receiver<bool>,
    background: BackgroundScope,
) where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
{
    if *shutdown_rx.borrow() {
        return;
    }

    let ever_emitted = Arc::new(AtomicBool::new(false));

    if let Some((value, age)) = memory.get(&key) {
        ever_emitted.store(true, Ordering::Release);
        let _ = tx.send(StreamTick::Data {
            value,
            origin: Origin::Memory,
            age,
        });
    }

    let now = Utc::now();
    let key_status = bookkeeper.status(&key).await;
    let peeked = match sot.peek(&key).await {
        Ok(v) => v,
        Err(cause) => {
            let _ = tx.send(StreamTick::Error {
                cause,
                served_stale: ever_emitted.load(Ordering::Acquire),
            });
            return;
        }
    };
    let db_meta = peeked.as_ref().map(|r| converter.read_to_db_meta(r));

    if !ever_emitted.load(Ordering::Acquire) && peeked.is_none() {
        let _ = tx.send(StreamTick::Loading { from_cache: false });
    }

    let plan = freshness::plan(
        now,
        policy,
        db_meta.as_ref(),
        &key_status,
        default_min_age,
        conditional_enabled,
    );

    debug!(namespace = key.namespace(), key_hash = key.stable_hash(), ?plan, "freshness plan decided");

    if !matches!(plan, FetchPlan::Skip) {
        let conditional = match &plan {
            FetchPlan::Conditional {
                if_none_match,
                if_modified_since,
            } => Some(ConditionalRequest {
                if_none_match: if_none_match.clone(),
                if_modified_since: *if_modified_since,
            }),
            _ => None,
        };

        // Every policy joins the same single-flight slot for `key` — the
        // "at most one fetcher invocation per key" invariant (spec §8) does
        // not carve out an exception for `MustBeFresh`; only how the
        // coordinator *waits* on the shared outcome differs.
        let fetch_key = key.clone();
        let sot2 = std::sync::Arc::clone(&sot);
        let fetcher2 = std::sync::Arc::clone(&fetcher);
        let converter2 = std::sync::Arc::clone(&converter);
        let bookkeeper2 = std::sync::Arc::clone(&bookkeeper);
        let key_mutex2 = std::sync::Arc::clone(&key_mutex);
        let shared = single_flight.join(key.clone(), move || {
            run_fetch(fetch_key, conditional, sot2, fetcher2, converter2, bookkeeper2, key_mutex2)
        });

        if policy == FreshnessPolicy::MustBeFresh {
            if let Err(cause) = shared.await {
                let _ = tx.send(StreamTick::Error {
                    cause,
                    served_stale: false,
                });
                return;
            }
        } else {
            let watch_tx = tx.clone();
            let ever_emitted_for_watcher = Arc::clone(&ever_emitted);
            crate::background::spawn_tracked(&background, async move {
                if let Err(cause) = shared.await {
                    if cause.is_closed() {
                        return;
                    }
                    let served_stale = ever_emitted_for_watcher.load(Ordering::Acquire);
                    let _ = watch_tx.send(StreamTick::Error { cause, served_stale });
                }
            });
        }
    }

    let mut reader = sot.reader(&key);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = reader.next() => {
                let Some(next) = next else { break };
                let Some(read) = next else { continue };

                let domain = converter.read_to_domain(&key, &read);
                let meta = converter.read_to_db_meta(&read);
                let age = meta
                    .updated_at
                    .map(|t| (Utc::now() - t).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::ZERO);
                memory.put(key.clone(), domain.clone());
                ever_emitted.store(true, Ordering::Release);
                if tx
                    .send(StreamTick::Data {
                        value: domain,
                        origin: Origin::SourceOfTruth,
                        age,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Runs one fetch to completion against the source of truth, applying
/// each successful outcome under the key's mutex inside a transaction and
/// updating bookkeeping. Returns the last error seen, if any.
async fn run_fetch<S, F, C>(
    key: S::Key,
    conditional: Option<ConditionalRequest>,
    sot: std::sync::Arc<S>,
    fetcher: std::sync::Arc<F>,
    converter: std::sync::Arc<C>,
    bookkeeper: std::sync::Arc<dyn crate::bookkeeper::Bookkeeper<S::Key>>,
    key_mutex: std::sync::Arc<crate::key_mutex::KeyMutex<S::Key>>,
) -> StorexResult<()>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
{
    let mut outcomes = fetcher.fetch(&key, conditional);
    let mut last_error = None;

    while let Some(outcome) = outcomes.next().await {
        match outcome {
            FetchOutcome::Success {
                body,
                etag,
                last_modified: _,
            } => {
                let write = converter.net_to_write(&key, &body);
                let _guard = key_mutex.lock(&key).await;
                if let Err(err) = sot.write(&key, write).await {
                    warn!(namespace = key.namespace(), key_hash = key.stable_hash(), %err, "source of truth write failed after fetch");
                    last_error = Some(err);
                    continue;
                }
                bookkeeper.record_success(&key, etag, Utc::now()).await;
            }
            FetchOutcome::NotModified { etag } => {
                bookkeeper.record_success(&key, etag, Utc::now()).await;
            }
            FetchOutcome::Error(cause) => {
                bookkeeper.record_failure(&key, Utc::now()).await;
                last_error = Some(EngineError::Cause(cause));
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as MemOrdering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;

    use crate::bookkeeper::Bookkeeper;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::error::CauseError;
    use crate::fetcher::FetchOutcome;
    use crate::key::Key;
    use crate::stream_result::{Origin, StreamResult};
    use crate::testing::{
        IdentityConverter, IdentityEncoder, InMemorySourceOfTruth, ScriptedFetcher, ScriptedMutationClient,
    };

    use super::*;

    type TestEngine = Engine<
        InMemorySourceOfTruth<Key, String, String>,
        ScriptedFetcher<Key, String>,
        IdentityConverter<Key, String>,
        IdentityEncoder<Key, String>,
        ScriptedMutationClient<Key, String>,
    >;

    fn build() -> TestEngine {
        Engine::builder(
            InMemorySourceOfTruth::identity(),
            ScriptedFetcher::new(Duration::ZERO),
            IdentityConverter::default(),
            IdentityEncoder::default(),
        )
        .with_config(EngineConfig::default().with_memory_ttl(Duration::from_secs(60)))
        .build()
        .unwrap()
    }

    /// Scenario 1: cache miss, successful fetch.
    #[tokio::test]
    async fn cache_miss_then_successful_fetch_emits_loading_then_data() {
        let engine = build();
        let key = Key::by_id("users", "User", "1");
        engine.fetcher.push_outcome(
            key.clone(),
            FetchOutcome::Success {
                body: "A".to_string(),
                etag: Some("v1".to_string()),
                last_modified: None,
            },
        );

        let mut stream = Box::pin(engine.stream(key.clone(), FreshnessPolicy::CachedOrFetch).unwrap());

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamResult::Loading { from_cache: false }));

        let second = stream.next().await.unwrap();
        match second {
            StreamResult::Data { value, origin, .. } => {
                assert_eq!(value, "A");
                assert_eq!(origin, Origin::SourceOfTruth);
            }
            other => panic!("expected Data, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = engine.bookkeeper.status(&key).await;
        assert!(status.last_success_at.is_some());
        assert_eq!(status.last_etag.as_deref(), Some("v1"));
        assert!(engine.memory.get(&key).is_some());
    }

    /// Scenario 2: stale-if-error serves cached value on fetch failure.
    #[tokio::test]
    async fn stale_if_error_serves_cached_value_then_reports_error() {
        let engine = build();
        let key = Key::by_id("users", "User", "1");
        use crate::source_of_truth::SourceOfTruth;
        engine.sot.write(&key, "A".to_string()).await.unwrap();
        engine
            .fetcher
            .push_outcome(key.clone(), FetchOutcome::Error(CauseError::msg("io error")));

        let mut stream = Box::pin(engine.stream(key.clone(), FreshnessPolicy::StaleIfError).unwrap());

        let first = stream.next().await.unwrap();
        match first {
            StreamResult::Data { value, origin, .. } => {
                assert_eq!(value, "A");
                assert_eq!(origin, Origin::SourceOfTruth);
            }
            other => panic!("expected cached Data first, got {other:?}"),
        }

        let second = stream.next().await.unwrap();
        match second {
            StreamResult::Error { served_stale, .. } => assert!(served_stale),
            other => panic!("expected Error{{served_stale: true}}, got {other:?}"),
        }

        let status = engine.bookkeeper.status(&key).await;
        assert!(status.last_failure_at.is_some());
    }

    /// Scenario 3: MustBeFresh throws on fetch failure in point read.
    #[tokio::test]
    async fn must_be_fresh_propagates_fetch_failure_from_get() {
        let engine = build();
        let key = Key::by_id("users", "User", "1");
        engine
            .fetcher
            .push_outcome(key.clone(), FetchOutcome::Error(CauseError::msg("boom")));

        let result = engine.get(key, FreshnessPolicy::MustBeFresh).await;
        assert!(result.is_err());
    }

    /// CachedOrFetch point read returns a memory hit immediately without
    /// starting any fetch (spec §4.6).
    #[tokio::test]
    async fn cached_or_fetch_get_short_circuits_on_memory_hit() {
        let engine = build();
        let key = Key::by_id("users", "User", "1");
        engine.memory.put(key.clone(), "cached".to_string());

        let value = engine.get(key.clone(), FreshnessPolicy::CachedOrFetch).await.unwrap();
        assert_eq!(value, "cached");
        assert_eq!(engine.fetcher.invocation_count(), 0);
    }

    /// Scenario 6: single-flight coalesces 100 concurrent cache-miss reads.
    #[tokio::test]
    async fn single_flight_coalesces_concurrent_cache_miss_reads() {
        let engine = Arc::new(build());
        let key = Key::by_id("users", "User", "1");
        engine.fetcher.push_outcome(
            key.clone(),
            FetchOutcome::Success {
                body: "A".to_string(),
                etag: Some("v1".to_string()),
                last_modified: None,
            },
        );

        let completed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let engine = Arc::clone(&engine);
            let key = key.clone();
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                let value = engine.get(key, FreshnessPolicy::CachedOrFetch).await.unwrap();
                completed.fetch_add(1, MemOrdering::SeqCst);
                value
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), "A");
        }
        assert_eq!(completed.load(MemOrdering::SeqCst), 100);
        assert_eq!(engine.fetcher.invocation_count(), 1);
    }

    /// The "at most one fetcher invocation per key" invariant (spec §8)
    /// holds for `MustBeFresh` too: concurrent `MustBeFresh` callers on the
    /// same key coalesce onto one fetch rather than each starting their own.
    #[tokio::test]
    async fn must_be_fresh_callers_also_coalesce_onto_one_fetch() {
        let engine = Arc::new(build());
        let key = Key::by_id("users", "User", "1");
        engine.fetcher.push_outcome(
            key.clone(),
            FetchOutcome::Success {
                body: "A".to_string(),
                etag: Some("v1".to_string()),
                last_modified: None,
            },
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = Arc::clone(&engine);
            let key = key.clone();
            handles.push(tokio::spawn(async move { engine.get(key, FreshnessPolicy::MustBeFresh).await }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "A");
        }
        assert_eq!(engine.fetcher.invocation_count(), 1);
    }

}
