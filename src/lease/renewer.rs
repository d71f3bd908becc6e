use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::{coordinator::QuorumCoordinator, signal::LeaseSignal, Lease};
use crate::util::runnable::PeriodicRunnable;

/// Keeps one lease alive for as long as its critical section runs.
///
/// Each tick extends the lease and schedules the next tick at a fraction of the
/// newly confirmed validity. Misses are tolerated up to `grace_attempts` times while
/// the last confirmed window is still open; after that the lease is declared lost.
pub(crate) struct LeaseRenewer {
    coordinator: Arc<QuorumCoordinator>,
    lease: Mutex<Lease>,
    ttl: Duration,
    threshold: f64,
    grace_attempts: u32,
    misses: AtomicU32,
    signal: LeaseSignal,
}

impl LeaseRenewer {
    pub(crate) fn new(
        coordinator: Arc<QuorumCoordinator>,
        lease: Lease,
        threshold: f64,
        grace_attempts: u32,
        signal: LeaseSignal,
    ) -> Self {
        Self {
            coordinator,
            ttl: lease.ttl(),
            lease: Mutex::new(lease),
            threshold,
            grace_attempts,
            misses: AtomicU32::new(0),
            signal,
        }
    }

    /// Delay before the first tick, measured from when the lease was confirmed.
    pub(crate) async fn initial_delay(&self) -> Duration {
        let lease = self.lease.lock().await;
        self.scaled(lease.remaining())
    }

    pub(crate) async fn current(&self) -> Lease {
        self.lease.lock().await.clone()
    }

    fn scaled(&self, window: Duration) -> Duration {
        window.mul_f64(self.threshold)
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseRenewer {
    async fn run_once(&self) -> Option<Duration> {
        if self.signal.is_cancelled() {
            return None;
        }

        let mut lease = self.lease.lock().await;
        match self.coordinator.extend(&lease, self.ttl).await {
            Ok(extended) => {
                self.misses.store(0, Ordering::SeqCst);
                let next = self.scaled(extended.validity());
                debug!(
                    keys = %extended.keys(),
                    validity_ms = extended.validity().as_millis() as u64,
                    next_tick_ms = next.as_millis() as u64,
                    "lease renewed"
                );
                *lease = extended;
                Some(next)
            }
            Err(err) => {
                let misses = self.misses.fetch_add(1, Ordering::SeqCst) + 1;
                let remaining = lease.remaining();
                if misses <= self.grace_attempts && !remaining.is_zero() {
                    warn!(
                        keys = %lease.keys(),
                        misses,
                        remaining_ms = remaining.as_millis() as u64,
                        error = %err,
                        "lease extension missed, retrying before expiry"
                    );
                    Some(self.scaled(remaining))
                } else {
                    error!(
                        keys = %lease.keys(),
                        misses,
                        error = %err,
                        "lease lost, signalling critical section"
                    );
                    self.signal.mark_lost();
                    None
                }
            }
        }
    }
}
