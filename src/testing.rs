//! In-process test doubles for the three collaborator contracts, gated
//! behind the `test-util` feature.
//!
//! Grounded on the teacher's `InMemoryChangeJournal`
//! (`examples/Heyoub-caliber/caliber-storage/src/cache/watermark.rs`) and
//! `MockCacheBackend`/`MockStorageFetcher`
//! (`examples/Heyoub-caliber/caliber-storage/src/cache/read_through.rs`):
//! shared in-memory maps with injectable latency and scripted outcomes,
//! used both by this crate's own test suite and available to downstream
//! consumers writing tests against their own `Converter`/`MutationEncoder`.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::converter::Converter;
use crate::error::{CauseError, EngineError, StorexResult};
use crate::fetcher::{ConditionalRequest, FetchOutcome, Fetcher};
use crate::freshness::DbMeta;
use crate::key::CacheKey;
use crate::mutation::{MutationClient, MutationEncoder, MutationResponse, Precondition};
use crate::source_of_truth::{RekeyReconcile, SourceOfTruth};

/// In-memory, multi-subscriber source of truth.
///
/// `apply` decides the new read-model value given whatever was previously
/// stored (or `None`) and an incoming write payload — the merge strategy
/// a real backing store would normally own.
pub struct InMemorySourceOfTruth<K, Read, Write>
where
    K: CacheKey,
    Read: Clone + Send + Sync + 'static,
    Write: Send + Sync + 'static,
{
    channels: DashMap<K, watch::Sender<Option<Read>>>,
    apply: Arc<dyn Fn(Option<Read>, Write) -> Read + Send + Sync>,
}

impl<K, Read, Write> InMemorySourceOfTruth<K, Read, Write>
where
    K: CacheKey,
    Read: Clone + Send + Sync + 'static,
    Write: Send + Sync + 'static,
{
    pub fn new(apply: impl Fn(Option<Read>, Write) -> Read + Send + Sync + 'static) -> Self {
        Self {
            channels: DashMap::new(),
            apply: Arc::new(apply),
        }
    }

    fn channel_for(&self, key: &K) -> watch::Sender<Option<Read>> {
        self.channels
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

/// Convenience constructor when the read and write models are the same
/// type: the new write simply replaces whatever was there.
impl<K, T> InMemorySourceOfTruth<K, T, T>
where
    K: CacheKey,
    T: Clone + Send + Sync + 'static,
{
    pub fn identity() -> Self {
        Self::new(|_previous, write| write)
    }
}

#[async_trait]
impl<K, Read, Write> SourceOfTruth for InMemorySourceOfTruth<K, Read, Write>
where
    K: CacheKey,
    Read: Clone + Send + Sync + 'static,
    Write: Send + Sync + 'static,
{
    type Key = K;
    type Read = Read;
    type Write = Write;
    type Stream = WatchStream<Option<Read>>;

    fn reader(&self, key: &Self::Key) -> Self::Stream {
        let sender = self.channel_for(key);
        WatchStream::new(sender.subscribe())
    }

    async fn write(&self, key: &Self::Key, value: Self::Write) -> StorexResult<()> {
        let sender = self.channel_for(key);
        let previous = sender.borrow().clone();
        let next = (self.apply)(previous, value);
        let _ = sender.send(Some(next));
        Ok(())
    }

    async fn delete(&self, key: &Self::Key) -> StorexResult<()> {
        if let Some(sender) = self.channels.get(key) {
            let _ = sender.send(None);
        }
        Ok(())
    }

    async fn rekey(&self, old: &Self::Key, new: &Self::Key, reconcile: RekeyReconcile<Self::Read, Self::Write>) -> StorexResult<()> {
        let existing_at_new = self.peek(new).await?;
        if let Some(write) = reconcile(existing_at_new) {
            self.write(new, write).await?;
        }
        if let Some(sender) = self.channels.get(old) {
            let _ = sender.send(None);
        }
        Ok(())
    }
}

/// A `Fetcher` whose outcomes are scripted per key ahead of time.
///
/// Each call to [`ScriptedFetcher::fetch`] pops the next queued outcome
/// for that key after sleeping `latency`; a key with no queued outcome
/// yields an `Error`, which surfaces test bugs (an unscripted fetch) as
/// loudly as a real unexpected failure would.
pub struct ScriptedFetcher<K: CacheKey, Net> {
    scripts: DashMap<K, VecDeque<FetchOutcome<Net>>>,
    latency: Duration,
    invocations: Arc<AtomicUsize>,
}

impl<K: CacheKey, Net: Send + 'static> Default for ScriptedFetcher<K, Net> {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl<K: CacheKey, Net: Send + 'static> ScriptedFetcher<K, Net> {
    pub fn new(latency: Duration) -> Self {
        Self {
            scripts: DashMap::new(),
            latency,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push_outcome(&self, key: K, outcome: FetchOutcome<Net>) {
        self.scripts.entry(key).or_default().push_back(outcome);
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, Net> Fetcher for ScriptedFetcher<K, Net>
where
    K: CacheKey,
    Net: Send + Sync + 'static,
{
    type Key = K;
    type Net = Net;
    type Stream = Pin<Box<dyn Stream<Item = FetchOutcome<Net>> + Send>>;

    fn fetch(&self, key: &Self::Key, _conditional: Option<ConditionalRequest>) -> Self::Stream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let outcome = self.scripts.get_mut(key).and_then(|mut q| q.pop_front());
        let latency = self.latency;
        Box::pin(async_stream::stream! {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Some(outcome) => yield outcome,
                None => yield FetchOutcome::Error(CauseError::msg("no scripted outcome queued for key")),
            }
        })
    }
}

/// A `MutationClient` whose responses are scripted per key ahead of time.
pub struct ScriptedMutationClient<K: CacheKey, Net> {
    responses: DashMap<K, VecDeque<StorexResult<MutationResponse<Net>>>>,
    create_responses: DashMap<K, VecDeque<StorexResult<(K, MutationResponse<Net>)>>>,
}

impl<K: CacheKey, Net> Default for ScriptedMutationClient<K, Net> {
    fn default() -> Self {
        Self {
            responses: DashMap::new(),
            create_responses: DashMap::new(),
        }
    }
}

impl<K: CacheKey, Net> ScriptedMutationClient<K, Net> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, key: K, response: StorexResult<MutationResponse<Net>>) {
        self.responses.entry(key).or_default().push_back(response);
    }

    pub fn push_create_response(&self, draft_key: K, response: StorexResult<(K, MutationResponse<Net>)>) {
        self.create_responses.entry(draft_key).or_default().push_back(response);
    }

    fn pop_response(&self, key: &K) -> StorexResult<MutationResponse<Net>> {
        self.responses
            .get_mut(key)
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(EngineError::Cause(CauseError::msg("no scripted mutation response queued"))))
    }
}

#[async_trait]
impl<K, Net> MutationClient for ScriptedMutationClient<K, Net>
where
    K: CacheKey,
    Net: Send + Sync + 'static,
{
    type Key = K;
    type Net = Net;

    async fn patch(&self, key: &Self::Key, _payload: Self::Net, _pre: Precondition) -> StorexResult<MutationResponse<Self::Net>> {
        self.pop_response(key)
    }

    async fn post(&self, draft_key: &Self::Key, _payload: Self::Net) -> StorexResult<(Self::Key, MutationResponse<Self::Net>)> {
        self.create_responses
            .get_mut(draft_key)
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(EngineError::Cause(CauseError::msg("no scripted create response queued"))))
    }

    async fn delete(&self, key: &Self::Key, _pre: Precondition) -> StorexResult<MutationResponse<Self::Net>> {
        self.pop_response(key)
    }

    async fn put(&self, key: &Self::Key, _payload: Self::Net, _pre: Precondition) -> StorexResult<MutationResponse<Self::Net>> {
        self.pop_response(key)
    }
}

/// A `Converter`/`MutationEncoder` pair for tests where domain, read,
/// write, and network payloads are all the same type `T`.
pub struct IdentityConverter<K, T> {
    _marker: PhantomData<(K, T)>,
}

impl<K, T> Default for IdentityConverter<K, T> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<K, T> Converter for IdentityConverter<K, T>
where
    K: CacheKey,
    T: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Domain = T;
    type Read = T;
    type Write = T;
    type Net = T;

    fn read_to_domain(&self, _key: &Self::Key, read: &Self::Read) -> Self::Domain {
        read.clone()
    }

    fn read_to_db_meta(&self, _read: &Self::Read) -> DbMeta {
        DbMeta::default()
    }

    fn net_to_write(&self, _key: &Self::Key, net: &Self::Net) -> Self::Write {
        net.clone()
    }

    fn domain_to_write(&self, _key: &Self::Key, domain: &Self::Domain) -> Option<Self::Write> {
        Some(domain.clone())
    }
}

pub struct IdentityEncoder<K, T> {
    _marker: PhantomData<(K, T)>,
}

impl<K, T> Default for IdentityEncoder<K, T> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<K, T> MutationEncoder for IdentityEncoder<K, T>
where
    K: CacheKey,
    T: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Domain = T;
    type Patch = T;
    type Net = T;

    fn encode_patch(&self, _key: &Self::Key, patch: &Self::Patch) -> Option<Self::Net> {
        Some(patch.clone())
    }

    fn encode_create(&self, draft: &Self::Domain) -> Option<Self::Net> {
        Some(draft.clone())
    }

    fn encode_upsert(&self, _key: &Self::Key, value: &Self::Domain) -> Option<Self::Net> {
        Some(value.clone())
    }

    fn encode_replace(&self, _key: &Self::Key, value: &Self::Domain) -> Option<Self::Net> {
        Some(value.clone())
    }
}
