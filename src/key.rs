//! Identity of a cached record.
//!
//! A [`Key`] is either a pointer to one record (`ById`) or the description
//! of an ordered collection (`Query`). Both variants must hash and compare
//! deterministically regardless of the order parameters were supplied in,
//! which is why `Query` sorts its params before feeding them to
//! [`Key::stable_hash`].

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Namespace a key lives in, e.g. `"users"` or `"users.posts"`.
pub type Namespace = String;

/// Identity of a single record or a named query over records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    /// A pointer to exactly one record.
    ById {
        namespace: Namespace,
        entity_type: String,
        entity_id: String,
    },
    /// A named, parameterized query over a collection of records.
    Query {
        namespace: Namespace,
        params: Vec<(String, String)>,
    },
}

impl Key {
    pub fn by_id(
        namespace: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Key::ById {
            namespace: namespace.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn query(
        namespace: impl Into<String>,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut params: Vec<(String, String)> = params.into_iter().collect();
        params.sort();
        Key::Query {
            namespace: namespace.into(),
            params,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Key::ById { namespace, .. } => namespace,
            Key::Query { namespace, .. } => namespace,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::ById {
                namespace,
                entity_type,
                entity_id,
            } => write!(f, "{namespace}/{entity_type}/{entity_id}"),
            Key::Query { namespace, params } => {
                write!(f, "{namespace}?")?;
                for (i, (k, v)) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str("&")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                Ok(())
            }
        }
    }
}

/// FNV-1a, the same constant-time non-cryptographic hash the teacher's lock
/// key derivation uses, applied here to produce a deterministic identity
/// hash independent of field insertion order.
fn fnv1a(bytes: &[u8], mut hash: u64) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A key type usable throughout the coordination core.
///
/// Implemented for [`Key`]; downstream consumers that need a different key
/// shape (e.g. wrapping `Key` with extra routing metadata) can implement it
/// themselves as long as `stable_hash` stays order-independent for any
/// multi-valued fields.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn namespace(&self) -> &str;

    /// A deterministic hash stable across process restarts and independent
    /// of construction order, used for logging and for sharding per-key
    /// registries without leaking full key contents into log lines.
    fn stable_hash(&self) -> u64;
}

impl CacheKey for Key {
    fn namespace(&self) -> &str {
        Key::namespace(self)
    }

    fn stable_hash(&self) -> u64 {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        match self {
            Key::ById {
                namespace,
                entity_type,
                entity_id,
            } => {
                let mut h = fnv1a(b"id\0", OFFSET_BASIS);
                h = fnv1a(namespace.as_bytes(), h);
                h = fnv1a(b"\0", h);
                h = fnv1a(entity_type.as_bytes(), h);
                h = fnv1a(b"\0", h);
                fnv1a(entity_id.as_bytes(), h)
            }
            Key::Query { namespace, params } => {
                let mut sorted = params.clone();
                sorted.sort();
                let mut h = fnv1a(b"query\0", OFFSET_BASIS);
                h = fnv1a(namespace.as_bytes(), h);
                for (k, v) in &sorted {
                    h = fnv1a(b"\0", h);
                    h = fnv1a(k.as_bytes(), h);
                    h = fnv1a(b"=", h);
                    h = fnv1a(v.as_bytes(), h);
                }
                h
            }
        }
    }
}
