//! Wiring for one engine instance: the collaborators plus the shared
//! internal state the coordinator (`crate::coordinator`) operates on.

use std::sync::Arc;

use tokio::sync::watch;

use crate::background::{self, BackgroundScope};
use crate::bookkeeper::{Bookkeeper, InMemoryBookkeeper};
use crate::config::EngineConfig;
use crate::converter::Converter;
use crate::error::{EngineError, StorexResult};
use crate::fetcher::Fetcher;
use crate::key_mutex::KeyMutex;
use crate::memory_cache::MemoryCache;
use crate::mutation::{MutationClient, MutationEncoder};
use crate::single_flight::SingleFlight;
use crate::source_of_truth::SourceOfTruth;

/// A fully wired reactive cache/sync engine.
///
/// `S`, `F`, `C`, `Enc`, `M` are the five collaborator slots from the
/// design notes: source of truth, fetcher, converter, mutation encoder,
/// and mutation client. `M` is always required as a type (so the engine's
/// shape is known at compile time) but the instance may be absent at
/// runtime — see [`EngineBuilder::mutation_client`].
pub struct Engine<S, F, C, Enc, M>
where
    S: SourceOfTruth,
    F: Fetcher<Key = S::Key>,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net>,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net>,
    M: MutationClient<Key = S::Key, Net = F::Net>,
{
    pub(crate) sot: Arc<S>,
    pub(crate) fetcher: Arc<F>,
    pub(crate) converter: Arc<C>,
    pub(crate) encoder: Arc<Enc>,
    pub(crate) mutation_client: Option<Arc<M>>,
    pub(crate) memory: Arc<MemoryCache<S::Key, C::Domain>>,
    pub(crate) bookkeeper: Arc<dyn Bookkeeper<S::Key>>,
    pub(crate) single_flight: Arc<SingleFlight<S::Key, ()>>,
    pub(crate) key_mutex: Arc<KeyMutex<S::Key>>,
    pub(crate) config: EngineConfig,
    /// Flips to `true` when [`Engine::close`] fires. `shutdown_rx` is the
    /// template every background task (stream drivers, single-flight
    /// fetches) clones so it can race its own work against cancellation,
    /// the same shape as the teacher's `saga_cleanup_task` racing its loop
    /// against a shutdown `watch::Receiver`
    /// (`examples/Heyoub-caliber/caliber-api/src/jobs/saga_cleanup.rs`).
    pub(crate) shutdown_tx: Arc<watch::Sender<bool>>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) background: BackgroundScope,
}

impl<S, F, C, Enc, M> Engine<S, F, C, Enc, M>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net> + 'static,
    M: MutationClient<Key = S::Key, Net = F::Net> + 'static,
{
    pub fn builder(sot: S, fetcher: F, converter: C, encoder: Enc) -> EngineBuilder<S, F, C, Enc, M> {
        EngineBuilder {
            sot,
            fetcher,
            converter,
            encoder,
            mutation_client: None,
            bookkeeper: None,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn `fut` on the engine's background scope, tracked so [`Engine::close`]
    /// can await every outstanding task rather than abandoning it.
    pub(crate) fn spawn_background<Fut>(&self, fut: Fut)
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        background::spawn_tracked(&self.background, fut);
    }

    /// A clone of the shutdown receiver, for background tasks (stream
    /// drivers, single-flight fetches) to race their work against.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub(crate) fn ensure_open(&self) -> StorexResult<()> {
        if *self.shutdown_rx.borrow() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    /// Stop accepting new operations, cancel every live fetch and stream
    /// subscription, and await the background scope until all of it has
    /// actually unwound (spec §5: "closing the engine cancels the scope,
    /// which cancels any live fetches and stream subscriptions").
    ///
    /// Cancellation is cooperative: flipping `shutdown_tx` wakes every
    /// task racing it in a `tokio::select!`, which drops its in-progress
    /// work rather than waiting for it to finish on its own.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut joinset = self.background.lock().await;
        while joinset.join_next().await.is_some() {}
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Builder for [`Engine`], following the teacher's config-builder
/// convention: chained setters, explicit validation at `build()`.
pub struct EngineBuilder<S, F, C, Enc, M>
where
    S: SourceOfTruth,
    F: Fetcher<Key = S::Key>,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net>,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net>,
    M: MutationClient<Key = S::Key, Net = F::Net>,
{
    sot: S,
    fetcher: F,
    converter: C,
    encoder: Enc,
    mutation_client: Option<M>,
    bookkeeper: Option<Arc<dyn Bookkeeper<S::Key>>>,
    config: EngineConfig,
}

impl<S, F, C, Enc, M> EngineBuilder<S, F, C, Enc, M>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net> + 'static,
    M: MutationClient<Key = S::Key, Net = F::Net> + 'static,
{
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mutation_client(mut self, client: M) -> Self {
        self.mutation_client = Some(client);
        self
    }

    pub fn with_bookkeeper(mut self, bookkeeper: Arc<dyn Bookkeeper<S::Key>>) -> Self {
        self.bookkeeper = Some(bookkeeper);
        self
    }

    pub fn build(self) -> StorexResult<Engine<S, F, C, Enc, M>> {
        self.config.validate()?;
        let memory = MemoryCache::new(self.config.memory_capacity, self.config.memory_ttl)?;
        let key_mutex = KeyMutex::new(self.config.key_mutex_capacity)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = background::new_scope();
        Ok(Engine {
            sot: Arc::new(self.sot),
            fetcher: Arc::new(self.fetcher),
            converter: Arc::new(self.converter),
            encoder: Arc::new(self.encoder),
            mutation_client: self.mutation_client.map(Arc::new),
            memory: Arc::new(memory),
            bookkeeper: self
                .bookkeeper
                .unwrap_or_else(|| Arc::new(InMemoryBookkeeper::new())),
            single_flight: Arc::new(SingleFlight::new(shutdown_rx.clone(), Arc::clone(&background))),
            key_mutex: Arc::new(key_mutex),
            config: self.config,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            background,
        })
    }
}
