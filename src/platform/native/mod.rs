//! Native (tokio) bindings of the platform surface.

mod transport;

use std::{future::Future, time::Duration};

pub use self::transport::WebSocketRpcTransport;

/// Spawns the given future on the current thread.
///
/// # Panics
///
/// When called outside a [`tokio::task::LocalSet`] context.
pub fn spawn<F>(task: F)
where
    F: Future<Output = ()> + 'static,
{
    drop(tokio::task::spawn_local(task));
}

/// Returns a [`Future`] resolving after the provided [`Duration`].
///
/// [`Future`]: std::future::Future
pub async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await;
}
