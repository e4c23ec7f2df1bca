//! storex: a reactive, multi-tier caching and synchronization engine for
//! keyed records.
//!
//! An [`Engine`] wires together a [`SourceOfTruth`] (the local durable
//! store), a [`Fetcher`] (the remote read path), a [`Converter`] (pure
//! conversions between a key's domain/read/write/network shapes), a
//! [`MutationEncoder`], and an optional [`MutationClient`] (the remote
//! write path) into a single coordination core. See `DESIGN.md` in the
//! repository root for how each piece is grounded.

pub(crate) mod background;
pub mod bookkeeper;
pub mod config;
pub mod converter;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod freshness;
pub mod key;
pub mod key_mutex;
pub mod memory_cache;
pub mod mutation;
pub mod results;
pub mod single_flight;
pub mod source_of_truth;
pub mod stream_result;

#[cfg(feature = "test-util")]
pub mod testing;

pub use bookkeeper::{Bookkeeper, InMemoryBookkeeper, KeyStatus};
pub use config::EngineConfig;
pub use converter::Converter;
pub use engine::{Engine, EngineBuilder};
pub use error::{CauseError, ConfigError, EngineError, StorexResult};
pub use fetcher::{ConditionalRequest, FetchOutcome, Fetcher};
pub use freshness::{DbMeta, FetchPlan, FreshnessPolicy};
pub use key::{CacheKey, Key, Namespace};
pub use memory_cache::{MemoryCache, MemoryCacheStats};
pub use mutation::{MutationClient, MutationEncoder, MutationResponse, Precondition};
pub use results::{CreateResult, DeleteResult, ReplaceResult, UpdateResult, UpsertResult};
pub use source_of_truth::{RekeyReconcile, SourceOfTruth, TransactionBlock};
pub use stream_result::{Origin, StreamResult};
