use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Sleeps `initial_delay`, then runs the runnable repeatedly, each time waiting
/// the delay it returns. Stops when it returns `None` or `shutdown` fires; a
/// shutdown arriving mid-run abandons that run.
pub(crate) async fn run_with_dynamic_delay<T: PeriodicRunnable>(
    runnable: Arc<T>,
    initial_delay: Duration,
    shutdown: CancellationToken,
) {
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = runnable.run_once() => next,
        };

        match next {
            Some(next_delay) => delay = next_delay,
            None => break,
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    /// Does one unit of work and returns how long to wait before the next.
    async fn run_once(&self) -> Option<Duration>;
    async fn before_shutdown_complete(&self) {}
}
