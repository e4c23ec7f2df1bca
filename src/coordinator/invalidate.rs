//! Invalidation: `invalidate`, `invalidate_namespace`, `invalidate_all`
//! (spec §4.8).
//!
//! All three evict from the memory tier only. The source of truth is
//! never touched and no in-flight fetch is ever cancelled; a caller that
//! wants a guaranteed refresh must follow up with its own `get`/`stream`
//! call under a policy that forces one.

use crate::converter::Converter;
use crate::fetcher::Fetcher;
use crate::mutation::{MutationClient, MutationEncoder};
use crate::source_of_truth::SourceOfTruth;

use crate::engine::Engine;

impl<S, F, C, Enc, M> Engine<S, F, C, Enc, M>
where
    S: SourceOfTruth + 'static,
    F: Fetcher<Key = S::Key> + 'static,
    C: Converter<Key = S::Key, Read = S::Read, Write = S::Write, Net = F::Net> + 'static,
    Enc: MutationEncoder<Key = S::Key, Domain = C::Domain, Net = F::Net> + 'static,
    M: MutationClient<Key = S::Key, Net = F::Net> + 'static,
{
    /// Evict `key` from the memory tier. The source of truth is untouched
    /// and any fetch already in flight for `key` keeps running.
    pub fn invalidate(&self, key: &S::Key) {
        self.memory.remove(key);
    }

    /// Evict every memory entry whose key belongs to `namespace`.
    pub fn invalidate_namespace(&self, namespace: &str) {
        self.memory.remove_namespace(namespace);
    }

    /// Evict the entire memory tier.
    pub fn invalidate_all(&self) {
        self.memory.clear();
    }
}
