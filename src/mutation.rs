//! The `MutationClient` collaborator contract and the mutation encoder
//! that turns a domain-level patch/value into a network payload.

use async_trait::async_trait;

use crate::error::StorexResult;
use crate::key::CacheKey;

/// An `If-Match`-style precondition for a conditional mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Precondition {
    pub if_match: Option<String>,
}

/// Outcome of one remote mutation call.
#[derive(Debug, Clone)]
pub enum MutationResponse<Net> {
    /// The server accepted the mutation. `echo`, if present, is the
    /// server's canonical representation of the written value and is
    /// written back into the source of truth during reconciliation.
    Success { echo: Option<Net>, etag: Option<String> },
    /// The precondition no longer matched server state.
    Conflict { server_etag: Option<String> },
    /// The call failed for a reason unrelated to the precondition.
    Failure(crate::error::CauseError),
}

/// Collaborator contract for the remote mutation path.
#[async_trait]
pub trait MutationClient: Send + Sync {
    type Key: CacheKey;
    type Net: Send + Sync + 'static;

    async fn patch(&self, key: &Self::Key, payload: Self::Net, pre: Precondition) -> StorexResult<MutationResponse<Self::Net>>;

    /// Create a new record. Returns the server-assigned canonical key
    /// alongside the response.
    async fn post(&self, draft_key: &Self::Key, payload: Self::Net) -> StorexResult<(Self::Key, MutationResponse<Self::Net>)>;

    async fn delete(&self, key: &Self::Key, pre: Precondition) -> StorexResult<MutationResponse<Self::Net>>;

    async fn put(&self, key: &Self::Key, payload: Self::Net, pre: Precondition) -> StorexResult<MutationResponse<Self::Net>>;
}

/// Encodes domain-level mutation inputs into network payloads.
///
/// Returning `None` from any method here means "this operation cannot be
/// represented on the wire"; the mutation pipeline turns that into
/// `Failed { cause: EngineError::EncodingUnsupported }` without making a
/// network call (spec §4.7).
pub trait MutationEncoder: Send + Sync {
    type Key: CacheKey;
    type Domain;
    type Patch;
    type Net;

    fn encode_patch(&self, key: &Self::Key, patch: &Self::Patch) -> Option<Self::Net>;
    fn encode_create(&self, draft: &Self::Domain) -> Option<Self::Net>;
    fn encode_upsert(&self, key: &Self::Key, value: &Self::Domain) -> Option<Self::Net>;
    fn encode_replace(&self, key: &Self::Key, value: &Self::Domain) -> Option<Self::Net>;
}
