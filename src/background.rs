//! The engine's shared background scope: a `JoinSet` guarded by an async
//! mutex so whatever drains it (`Engine::close`) can await every task
//! spawned onto it rather than abandon it. Shared between `Engine` itself
//! and `SingleFlight`, which spawns its own fetch-coalescing tasks onto
//! the same scope so closing the engine waits for those too.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

pub(crate) type BackgroundScope = Arc<AsyncMutex<JoinSet<()>>>;

pub(crate) fn new_scope() -> BackgroundScope {
    Arc::new(AsyncMutex::new(JoinSet::new()))
}

/// Spawn `fut` onto `background`, tracked. The indirection through an
/// outer `tokio::spawn` is what lets this be called from sync contexts:
/// acquiring the async mutex needs an `.await`, but `JoinSet::spawn`
/// itself does not, so the outer task's only job is to grab the lock and
/// hand `fut` to the `JoinSet`.
pub(crate) fn spawn_tracked<Fut>(background: &BackgroundScope, fut: Fut)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let background = Arc::clone(background);
    tokio::spawn(async move {
        background.lock().await.spawn(fut);
    });
}
