//! Error types for the storex coordination core.
//!
//! Transient I/O failures are carried as values wherever the spec calls for
//! it (stream ticks, mutation results); only cancellation and programmer
//! errors are allowed to propagate as panics/unwinds. See [`EngineError`]
//! for the taxonomy and `CauseError` for how a single fetch failure is
//! shared, by identity, with every single-flight joiner.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A type-erased, cheaply cloneable error.
///
/// Single-flight joiners must observe "the identical failure instance (or a
/// semantically equivalent reference)" (spec §4.2). Wrapping the original
/// error in an `Arc` gives every joiner a clone that points at the same
/// allocation, rather than re-stringifying the cause per joiner.
#[derive(Clone)]
pub struct CauseError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl CauseError {
    /// Wrap a concrete error as a cause.
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Arc::new(err))
    }

    /// Wrap a message-only cause when no underlying `std::error::Error` exists.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }
}

impl fmt::Debug for CauseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for CauseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for CauseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl PartialEq for CauseError {
    /// Two causes are equal iff they share the same underlying allocation.
    ///
    /// This is the "identical failure instance" check from spec §4.2 rather
    /// than a structural comparison of error messages.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

/// Errors raised validating an [`crate::config::EngineConfig`] or component
/// config at construction time, never discovered lazily mid-operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("memory cache capacity must be positive, got {0}")]
    ZeroMemoryCapacity(usize),

    #[error("memory cache ttl must be positive")]
    NonPositiveMemoryTtl,

    #[error("key mutex capacity must be positive, got {0}")]
    ZeroKeyMutexCapacity(usize),
}

/// Master error type for engine operations.
///
/// Read operations surface this only inside `Error` stream ticks or as the
/// thrown cause of `MustBeFresh`; mutations surface it inside their
/// `Failed` variant. Cancellation is never represented here — it propagates
/// out of suspension points unchanged (spec §7).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine's background scope has been closed; no further operations
    /// may be started.
    #[error("engine is closed")]
    Closed,

    /// A mutation configured as `requireOnline` has no mutation client.
    #[error("operation requires an online mutation client, but none is configured")]
    NoClient,

    /// The mutation encoder returned `None` for this payload.
    #[error("mutation payload could not be encoded")]
    EncodingUnsupported,

    /// The remote rejected a conditional mutation because the precondition
    /// no longer matches current server state.
    #[error("precondition conflict (server etag: {server_etag:?})")]
    Conflict { server_etag: Option<String> },

    /// A collaborator does not implement an optional operation (e.g. rekey).
    #[error("collaborator does not support operation: {0}")]
    Unsupported(&'static str),

    /// A fetch, SoT, or mutation-client call failed.
    #[error("{0}")]
    Cause(#[from] CauseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Returns the underlying cause, if this variant wraps one.
    pub fn cause(&self) -> Option<&CauseError> {
        match self {
            EngineError::Cause(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::Closed)
    }
}

/// Result alias used throughout the crate.
pub type StorexResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_error_identity_equality() {
        let cause = CauseError::msg("boom");
        let cloned = cause.clone();
        let different = CauseError::msg("boom");

        assert_eq!(cause, cloned);
        assert_ne!(cause, different, "structurally-equal but distinct causes are not the same instance");
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::Conflict {
            server_etag: Some("v2".to_string()),
        };
        assert!(err.is_conflict());
        assert!(format!("{err}").contains("v2"));
    }

    #[test]
    fn config_error_from_conversion() {
        let err: EngineError = ConfigError::ZeroMemoryCapacity(0).into();
        assert!(matches!(err, EngineError::Config(ConfigError::ZeroMemoryCapacity(0))));
    }
}
