//! Pure conversions between a key's five type slots (spec §3, §9):
//! `Key`, `Domain`, `ReadEntity`, `WriteEntity`, `NetworkResponse`.
//!
//! None of these are erased behind `dyn Any`; a `Converter` implementation
//! names all four payload types as associated types and supplies the
//! conversions between them. This is the generic-programming seam the
//! design notes call for: "do not eliminate by erasure".

use crate::freshness::DbMeta;
use crate::key::CacheKey;

/// Pure, synchronous conversions between a key's payload shapes.
///
/// No method here performs I/O; everything that touches the network or
/// disk lives on [`crate::fetcher::Fetcher`] or
/// [`crate::source_of_truth::SourceOfTruth`].
pub trait Converter: Send + Sync {
    type Key: CacheKey;
    type Domain: Clone + Send + Sync + 'static;
    type Read: Clone + Send + Sync + 'static;
    type Write: Send + Sync + 'static;
    type Net: Send + Sync + 'static;

    /// Project the durable read model into the shape callers see.
    fn read_to_domain(&self, key: &Self::Key, read: &Self::Read) -> Self::Domain;

    /// Extract the staleness metadata the freshness validator needs from
    /// a read-model value.
    fn read_to_db_meta(&self, read: &Self::Read) -> DbMeta;

    /// Translate a successful network response into the durable write
    /// model, to be applied to the source of truth.
    fn net_to_write(&self, key: &Self::Key, net: &Self::Net) -> Self::Write;

    /// Derive an optimistic local write from a caller-supplied domain
    /// value, applied before a mutation's remote call completes. Returning
    /// `None` means "no optimistic local write for this conversion" — the
    /// mutation still proceeds, just without a local preview.
    fn domain_to_write(&self, _key: &Self::Key, _domain: &Self::Domain) -> Option<Self::Write> {
        None
    }
}
