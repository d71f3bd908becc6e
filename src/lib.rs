//! Redlock-style distributed mutual exclusion over a quorum of independent stores.
//!
//! [`LockManager::with_lock`] acquires a lease on a majority of stores, keeps it
//! alive with a background watchdog while the callback runs, and releases it on
//! every exit path.

use std::{future::Future, sync::Arc, time::Duration};

use tracing::{debug, warn};

use lease::{coordinator::QuorumCoordinator, renewer::LeaseRenewer};
use util::runnable::run_with_dynamic_delay;

pub mod error;
pub mod lease;
pub mod settings;
pub mod store;
pub mod util;

pub use error::{AttemptError, ConfigError, KeyError, LockError, StoreError};
pub use lease::{signal::LeaseSignal, Lease, LockState, LockToken, ResourceKeys};
pub use settings::{LockManagerConfig, LockOptions, StoreConfig};
pub use store::{DynamoLockStore, LockStore, MemoryLockStore};
pub use tokio_util::sync::CancellationToken;
pub use util::retry::RetryPolicy;

/// Entry point for running critical sections under a distributed lock.
pub struct LockManager {
    coordinator: Arc<QuorumCoordinator>,
    options: LockOptions,
}

impl LockManager {
    pub fn new(stores: Vec<Arc<dyn LockStore>>, options: LockOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            coordinator: Arc::new(QuorumCoordinator::new(stores, &options)?),
            options,
        })
    }

    pub fn from_config(config: &LockManagerConfig) -> Result<Self, ConfigError> {
        Self::new(config.build_stores()?, config.options()?)
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn coordinator(&self) -> &QuorumCoordinator {
        &self.coordinator
    }

    /// Runs `callback` while holding the lock on `keys`.
    ///
    /// `ttl` and `retry` fall back to the configured defaults. The callback gets a
    /// [`LeaseSignal`] it should watch; if the lease is lost while it runs, the call
    /// fails with [`LockError::LockLost`] unless the callback itself failed first.
    pub async fn with_lock<K, F, Fut, T, E>(
        &self,
        keys: K,
        ttl: Option<Duration>,
        retry: Option<RetryPolicy>,
        callback: F,
    ) -> Result<T, LockError<E>>
    where
        K: IntoIterator,
        K::Item: Into<String>,
        F: FnOnce(LeaseSignal) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_lock_cancellable(keys, ttl, retry, CancellationToken::new(), callback)
            .await
    }

    /// Like [`LockManager::with_lock`], but `cancel` aborts acquisition retries and,
    /// once the lock is held, stops the watchdog and fires the callback's signal.
    ///
    /// A callback that keeps running after cancellation is no longer protected: if
    /// the lease window has elapsed by the time it returns, the call fails with
    /// [`LockError::LockLost`].
    pub async fn with_lock_cancellable<K, F, Fut, T, E>(
        &self,
        keys: K,
        ttl: Option<Duration>,
        retry: Option<RetryPolicy>,
        cancel: CancellationToken,
        callback: F,
    ) -> Result<T, LockError<E>>
    where
        K: IntoIterator,
        K::Item: Into<String>,
        F: FnOnce(LeaseSignal) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let keys = ResourceKeys::new(keys)?;
        let ttl = ttl.unwrap_or(self.options.default_ttl);
        settings::check_ttl("ttl", ttl).map_err(LockError::InvalidRequest)?;
        let retry = retry.unwrap_or_else(|| self.options.retry.clone());
        retry.validate().map_err(LockError::InvalidRequest)?;
        let mut state = Transitions::new(&keys);

        state.enter(LockState::Acquiring);
        let lease = match util::retry::acquire_with_retry(
            &self.coordinator,
            &keys,
            ttl,
            &retry,
            &cancel,
        )
        .await
        {
            Ok(lease) => lease,
            Err(err) => {
                // Failed and abandoned rounds release their own partial grants
                state.enter(LockState::Failed);
                state.enter(LockState::Releasing);
                state.enter(LockState::Done);
                return Err(err);
            }
        };
        state.enter(LockState::Held);

        let signal = LeaseSignal::new(cancel.child_token());
        let stop = signal.child_token();
        let mut guard = ReleaseGuard::new(self.coordinator.clone(), lease.clone(), stop.clone());

        let renewer = Arc::new(LeaseRenewer::new(
            self.coordinator.clone(),
            lease,
            self.options.extension_threshold,
            self.options.extension_grace_attempts,
            signal.clone(),
        ));
        let watchdog = tokio::spawn(run_with_dynamic_delay(
            renewer.clone(),
            renewer.initial_delay().await,
            stop.clone(),
        ));

        let outcome = callback(signal.clone()).await;

        stop.cancel();
        if let Err(err) = watchdog.await {
            warn!(%keys, error = %err, "lease watchdog ended abnormally");
        }

        // Once the watchdog stops early, the last confirmed window is all the
        // protection the callback had
        let latest = renewer.current().await;
        let lost = signal.is_lost() || latest.is_expired();
        if lost && !signal.is_lost() {
            warn!(%keys, "lease window elapsed before the callback returned");
        }

        let result = match outcome {
            Err(e) => Err(LockError::Callback(e)),
            Ok(_) if lost => Err(LockError::LockLost { keys: keys.clone() }),
            Ok(value) => Ok(value),
        };
        if result.is_err() {
            state.enter(LockState::Failed);
        }

        state.enter(LockState::Releasing);
        guard.release(&latest).await;
        state.enter(LockState::Done);

        result
    }
}

/// Releases the lease if the surrounding future is dropped or unwinds before
/// reaching its own release step.
struct ReleaseGuard {
    coordinator: Arc<QuorumCoordinator>,
    lease: Option<Lease>,
    stop: CancellationToken,
}

impl ReleaseGuard {
    fn new(coordinator: Arc<QuorumCoordinator>, lease: Lease, stop: CancellationToken) -> Self {
        Self {
            coordinator,
            lease: Some(lease),
            stop,
        }
    }

    async fn release(&mut self, latest: &Lease) {
        if self.lease.is_some() {
            self.coordinator.release(latest).await;
            self.lease = None;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return,
        };

        self.stop.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    coordinator.release(&lease).await;
                });
            }
            Err(_) => warn!(
                keys = %lease.keys(),
                "no runtime to release lease on; it will expire on its own"
            ),
        }
    }
}

/// Tracks the per-invocation state machine for diagnostics.
struct Transitions<'a> {
    keys: &'a ResourceKeys,
    current: LockState,
}

impl<'a> Transitions<'a> {
    fn new(keys: &'a ResourceKeys) -> Self {
        Self {
            keys,
            current: LockState::Idle,
        }
    }

    fn enter(&mut self, next: LockState) {
        if self.current.can_transition_to(next) {
            debug!(keys = %self.keys, from = ?self.current, to = ?next, "lock state");
        } else {
            warn!(keys = %self.keys, from = ?self.current, to = ?next, "unexpected lock state transition");
        }
        self.current = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn manager(stores: &[Arc<MemoryLockStore>]) -> LockManager {
        LockManager::new(
            stores.iter().map(|s| s.clone() as Arc<dyn LockStore>).collect(),
            LockOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn returns_callback_value_and_releases() {
        let stores = MemoryLockStore::cluster(3);
        let manager = manager(&stores);

        let value = manager
            .with_lock(vec!["order:42"], None, None, |signal| async move {
                assert!(!signal.is_cancelled());
                Ok::<_, String>(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        for store in &stores {
            assert_eq!(store.holder("order:42").await, None);
        }
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected_before_acquiring() {
        let stores = MemoryLockStore::cluster(3);
        let manager = manager(&stores);
        let ran = AtomicBool::new(false);
        let ran_ref = &ran;

        let err = manager
            .with_lock(vec!["a", "a"], None, None, |_| async move {
                ran_ref.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::InvalidKeys(KeyError::Duplicate(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn callback_error_wins_over_lock_loss() {
        let stores = MemoryLockStore::cluster(3);
        let manager = LockManager::new(
            stores.iter().map(|s| s.clone() as Arc<dyn LockStore>).collect(),
            LockOptions {
                extension_grace_attempts: 0,
                ..LockOptions::default()
            },
        )
        .unwrap();

        let err = manager
            .with_lock(vec!["k"], Some(Duration::from_millis(200)), None, |signal| {
                let stores = stores.clone();
                async move {
                    stores[0].set_available(false);
                    stores[1].set_available(false);
                    signal.cancelled().await;
                    assert!(signal.is_lost());
                    Err::<(), _>("gave up".to_string())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.into_callback_error(), Some("gave up".to_string()));
    }

    #[tokio::test]
    async fn bad_per_call_arguments_are_rejected_before_acquiring() {
        let stores = MemoryLockStore::cluster(3);
        let manager = manager(&stores);

        let shrinking = RetryPolicy {
            backoff_factor: -2.0,
            ..RetryPolicy::default()
        };
        let err = manager
            .with_lock(vec!["k"], None, Some(shrinking), |_| async { Ok::<_, String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::InvalidRequest(ConfigError::Invalid { field: "retry.backoff_factor", .. })
        ));

        for ttl in [Duration::MAX, Duration::ZERO] {
            let err = manager
                .with_lock(vec!["k"], Some(ttl), None, |_| async { Ok::<_, String>(()) })
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                LockError::InvalidRequest(ConfigError::Invalid { field: "ttl", .. })
            ));
        }

        for store in &stores {
            assert_eq!(store.holder("k").await, None);
        }
    }

    #[tokio::test]
    async fn invalid_retry_policy_is_reported_even_while_contended() {
        let stores = MemoryLockStore::cluster(3);
        let manager = Arc::new(manager(&stores));

        let inner = manager.clone();
        manager
            .with_lock(vec!["k"], None, None, |_| async move {
                let err = inner
                    .with_lock(
                        vec!["k"],
                        None,
                        Some(RetryPolicy {
                            backoff_factor: -2.0,
                            ..RetryPolicy::default()
                        }),
                        |_| async { Ok::<_, String>(()) },
                    )
                    .await
                    .unwrap_err();
                assert!(matches!(err, LockError::InvalidRequest(_)));
                Ok::<_, String>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_while_acquiring_leaves_nothing_behind() {
        let stores = MemoryLockStore::cluster(3);
        let manager = manager(&stores);
        stores[2].set_latency(Duration::from_millis(300));

        let call = manager.with_lock(vec!["k"], Some(Duration::from_secs(10)), None, |_| async {
            Ok::<_, String>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        for store in &stores {
            assert_eq!(store.holder("k").await, None);
        }
    }

    #[tokio::test]
    async fn dropped_call_still_releases() {
        let stores = MemoryLockStore::cluster(3);
        let manager = manager(&stores);
        let entered = CancellationToken::new();

        let call = manager.with_lock(vec!["k"], None, None, |_| {
            let entered = entered.clone();
            async move {
                entered.cancel();
                futures::future::pending::<Result<(), String>>().await
            }
        });
        let _ = tokio::time::timeout(Duration::from_millis(100), call).await;
        assert!(entered.is_cancelled());

        // The guard released on a spawned task; give it a moment
        tokio::time::sleep(Duration::from_millis(50)).await;
        for store in &stores {
            assert_eq!(store.holder("k").await, None);
        }
    }
}
