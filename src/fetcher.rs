//! The `Fetcher` collaborator contract: the remote read path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;

use crate::error::CauseError;
use crate::key::CacheKey;

/// A conditional-request precondition built from prior bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalRequest {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

/// One element of a fetch's outcome sequence.
///
/// Most fetchers emit exactly one `Success` or `Error`; the sequence shape
/// exists so collaborators that stream partial results (pagination
/// continuation, retried sub-requests) can still speak the same contract.
#[derive(Debug, Clone)]
pub enum FetchOutcome<Net> {
    Success {
        body: Net,
        etag: Option<String>,
        last_modified: Option<DateTime<Utc>>,
    },
    /// The conditional precondition matched; nothing changed remotely.
    NotModified { etag: Option<String> },
    Error(CauseError),
}

/// Collaborator contract for the remote read path.
#[async_trait]
pub trait Fetcher: Send + Sync {
    type Key: CacheKey;
    type Net: Send + Sync + 'static;
    type Stream: Stream<Item = FetchOutcome<Self::Net>> + Send + Unpin;

    /// Begin fetching `key`, optionally with a conditional precondition.
    /// Returns a lazy sequence of outcomes rather than a single future so
    /// the caller controls how much of it to drain.
    fn fetch(&self, key: &Self::Key, conditional: Option<ConditionalRequest>) -> Self::Stream;
}
