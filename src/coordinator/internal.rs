//! Internal tick type carried over the `watch` channel that backs
//! [`crate::coordinator::read`]'s conflation (spec §5 suspension point f).

use std::time::Duration;

use crate::error::EngineError;
use crate::stream_result::{Origin, StreamResult};

/// Internal variant of [`StreamResult`] with an extra `None` placeholder
/// for "nothing emitted yet", used only as the `watch` channel's initial
/// value so it never reaches a subscriber.
#[derive(Debug, Clone)]
pub(crate) enum StreamTick<D> {
    None,
    Loading { from_cache: bool },
    Data { value: D, origin: Origin, age: Duration },
    Error { cause: EngineError, served_stale: bool },
}

impl<D> StreamTick<D> {
    pub(crate) fn into_result(self) -> Option<StreamResult<D>> {
        match self {
            StreamTick::None => None,
            StreamTick::Loading { from_cache } => Some(StreamResult::Loading { from_cache }),
            StreamTick::Data { value, origin, age } => Some(StreamResult::Data { value, origin, age }),
            StreamTick::Error { cause, served_stale } => Some(StreamResult::Error { cause, served_stale }),
        }
    }
}
