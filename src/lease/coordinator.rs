use std::{future::Future, sync::Arc, time::Duration};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::{runtime::Handle, time::Instant};
use tracing::{debug, warn};

use super::{Lease, LockToken, ResourceKeys};
use crate::{
    error::{AttemptError, ConfigError},
    settings::LockOptions,
    store::{LockStore, LockStoreClient},
};

/// Running count of store votes for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    granted: usize,
    refused: usize,
    total: usize,
}

impl Tally {
    pub fn new(total: usize) -> Self {
        Self {
            granted: 0,
            refused: 0,
            total,
        }
    }

    pub fn record(&mut self, granted: bool) {
        if granted {
            self.granted += 1;
        } else {
            self.refused += 1;
        }
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    pub fn required(&self) -> usize {
        majority(self.total)
    }

    pub fn has_quorum(&self) -> bool {
        self.granted >= self.required()
    }

    pub fn refused(&self) -> usize {
        self.refused
    }
}

pub fn majority(total: usize) -> usize {
    total / 2 + 1
}

/// Runs the acquire, extend and release rounds over every configured store.
pub struct QuorumCoordinator {
    clients: Vec<LockStoreClient>,
    drift_factor: f64,
    drift_floor: Duration,
    store_timeout: Option<Duration>,
}

impl QuorumCoordinator {
    pub fn new(stores: Vec<Arc<dyn LockStore>>, options: &LockOptions) -> Result<Self, ConfigError> {
        match stores.len() {
            0 => return Err(ConfigError::NoStores),
            1 if !options.allow_single_store => return Err(ConfigError::SingleStore),
            1 => warn!("running with a single lock store; there is no fault tolerance"),
            n if n % 2 == 0 => warn!(
                stores = n,
                "even number of lock stores tolerates no more failures than {}",
                n - 1
            ),
            _ => {}
        }

        Ok(Self {
            clients: stores.into_iter().map(LockStoreClient::new).collect(),
            drift_factor: options.clock_drift_factor,
            drift_floor: options.clock_drift_floor,
            store_timeout: options.store_timeout,
        })
    }

    pub fn store_count(&self) -> usize {
        self.clients.len()
    }

    pub fn quorum(&self) -> usize {
        majority(self.clients.len())
    }

    /// Safety deduction for clock skew between this process and the stores.
    pub fn drift(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + self.drift_floor
    }

    /// Per-call bound, kept to a tenth of the TTL so a slow store cannot eat the lease.
    pub fn store_timeout(&self, ttl: Duration) -> Duration {
        let cap = ttl / 10;
        self.store_timeout
            .map_or(cap, |configured| configured.min(cap))
            .max(Duration::from_millis(1))
    }

    /// One acquisition round with a fresh token.
    ///
    /// Any partial acquisition is released before an error is returned. If the
    /// round is dropped part way through, the release runs on a spawned task.
    pub async fn acquire(&self, keys: &ResourceKeys, ttl: Duration) -> Result<Lease, AttemptError> {
        let token = LockToken::generate();
        let limit = self.store_timeout(ttl);
        let started = Instant::now();
        let mut cleanup = RoundCleanup::new(self.clients.clone(), keys.clone(), token.clone(), limit);

        let tally = self
            .poll(
                self.clients
                    .iter()
                    .map(|client| client.try_acquire(keys, &token, ttl, limit)),
            )
            .await;

        match self.confirm(tally, started, ttl) {
            Ok(validity) => {
                cleanup.disarm();
                debug!(%keys, granted = tally.granted(), validity_ms = validity.as_millis() as u64, "lease acquired");
                Ok(Lease::new(keys.clone(), token, ttl, validity, started))
            }
            Err(err) => {
                debug!(%keys, granted = tally.granted(), refused = tally.refused(), error = %err, "acquisition round failed");
                release_all(&self.clients, keys, &token, limit).await;
                cleanup.disarm();
                Err(err)
            }
        }
    }

    /// Resets every store's expiry to `ttl` for a lease this process holds.
    ///
    /// A failed round leaves the previous lease untouched; its window still applies.
    pub async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<Lease, AttemptError> {
        let keys = lease.keys();
        let token = lease.token();
        let limit = self.store_timeout(ttl);
        let started = Instant::now();

        let tally = self
            .poll(
                self.clients
                    .iter()
                    .map(|client| client.try_extend(keys, token, ttl, limit)),
            )
            .await;

        let validity = self.confirm(tally, started, ttl).map_err(|err| {
            debug!(%keys, granted = tally.granted(), refused = tally.refused(), error = %err, "extension round failed");
            err
        })?;
        debug!(%keys, granted = tally.granted(), validity_ms = validity.as_millis() as u64, "lease extended");
        Ok(Lease::new(keys.clone(), token.clone(), ttl, validity, started))
    }

    /// Best-effort release on every store. Returns how many stores released.
    pub async fn release(&self, lease: &Lease) -> usize {
        let released = release_all(
            &self.clients,
            lease.keys(),
            lease.token(),
            self.store_timeout(lease.ttl()),
        )
        .await;
        debug!(keys = %lease.keys(), released, "lease released");
        released
    }

    /// Issues every call at once and counts answers as they arrive.
    ///
    /// Calls are never abandoned: a late grant must be counted so a failed round
    /// can clean it up. Each call is already bounded by the store timeout.
    async fn poll<I, F>(&self, calls: I) -> Tally
    where
        I: Iterator<Item = F>,
        F: Future<Output = bool>,
    {
        let mut calls: FuturesUnordered<F> = calls.collect();
        let mut tally = Tally::new(self.clients.len());
        while let Some(granted) = calls.next().await {
            tally.record(granted);
        }
        tally
    }

    fn confirm(&self, tally: Tally, started: Instant, ttl: Duration) -> Result<Duration, AttemptError> {
        if !tally.has_quorum() {
            return Err(AttemptError::NoQuorum {
                granted: tally.granted(),
                required: tally.required(),
            });
        }

        let elapsed = started.elapsed();
        match ttl.checked_sub(elapsed + self.drift(ttl)) {
            Some(validity) if !validity.is_zero() => Ok(validity),
            _ => Err(AttemptError::ValidityExhausted { elapsed }),
        }
    }
}

async fn release_all(
    clients: &[LockStoreClient],
    keys: &ResourceKeys,
    token: &LockToken,
    limit: Duration,
) -> usize {
    let mut calls: FuturesUnordered<_> = clients
        .iter()
        .map(|client| client.try_release(keys, token, limit))
        .collect();

    let mut released = 0;
    while let Some(ok) = calls.next().await {
        if ok {
            released += 1;
        }
    }
    released
}

/// Releases a round's token on every store unless disarmed before drop.
struct RoundCleanup {
    pending: Option<(Vec<LockStoreClient>, ResourceKeys, LockToken, Duration)>,
}

impl RoundCleanup {
    fn new(clients: Vec<LockStoreClient>, keys: ResourceKeys, token: LockToken, limit: Duration) -> Self {
        Self {
            pending: Some((clients, keys, token, limit)),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for RoundCleanup {
    fn drop(&mut self) {
        let (clients, keys, token, limit) = match self.pending.take() {
            Some(pending) => pending,
            None => return,
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let released = release_all(&clients, &keys, &token, limit).await;
                    debug!(%keys, released, "released abandoned acquisition round");
                });
            }
            Err(_) => warn!(%keys, "no runtime to clean up abandoned acquisition round"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLockStore;

    const TTL: Duration = Duration::from_secs(2);

    fn coordinator(stores: &[Arc<MemoryLockStore>]) -> QuorumCoordinator {
        let stores = stores
            .iter()
            .map(|s| s.clone() as Arc<dyn LockStore>)
            .collect();
        QuorumCoordinator::new(stores, &LockOptions::default()).unwrap()
    }

    fn keys() -> ResourceKeys {
        ResourceKeys::new(vec!["order:42"]).unwrap()
    }

    #[test]
    fn tally_counts_majority() {
        let mut tally = Tally::new(5);
        assert_eq!(tally.required(), 3);
        tally.record(true);
        tally.record(false);
        tally.record(true);
        assert!(!tally.has_quorum());
        tally.record(true);
        assert!(tally.has_quorum());
        assert_eq!((tally.granted(), tally.refused()), (3, 1));

        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
    }

    #[test]
    fn single_store_must_be_opted_into() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new("only"));
        let result = QuorumCoordinator::new(vec![store.clone()], &LockOptions::default());
        assert!(matches!(result, Err(ConfigError::SingleStore)));

        let options = LockOptions {
            allow_single_store: true,
            ..LockOptions::default()
        };
        assert!(QuorumCoordinator::new(vec![store], &options).is_ok());
        assert!(matches!(
            QuorumCoordinator::new(Vec::new(), &options),
            Err(ConfigError::NoStores)
        ));
    }

    #[test]
    fn timeouts_and_drift_scale_with_ttl() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);
        assert_eq!(coordinator.store_timeout(Duration::from_secs(1)), Duration::from_millis(100));
        assert_eq!(coordinator.drift(Duration::from_secs(1)), Duration::from_millis(12));
    }

    #[tokio::test]
    async fn acquires_with_one_store_down() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);
        stores[1].set_available(false);

        let lease = coordinator.acquire(&keys(), TTL).await.unwrap();
        assert!(lease.validity() < TTL);
        assert!(lease.validity() > Duration::ZERO);

        let extended = coordinator.extend(&lease, TTL).await.unwrap();
        assert_eq!(extended.token(), lease.token());

        coordinator.release(&lease).await;
        assert_eq!(stores[0].holder("order:42").await, None);
        assert_eq!(stores[2].holder("order:42").await, None);
    }

    #[tokio::test]
    async fn minority_acquisition_is_cleaned_up() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);
        stores[0].set_available(false);
        stores[1].set_available(false);

        let err = coordinator.acquire(&keys(), TTL).await.unwrap_err();
        assert_eq!(err, AttemptError::NoQuorum { granted: 1, required: 2 });
        assert_eq!(stores[2].holder("order:42").await, None);
    }

    #[tokio::test]
    async fn contended_keys_are_refused() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);

        let held = coordinator.acquire(&keys(), TTL).await.unwrap();
        assert!(coordinator.acquire(&keys(), TTL).await.is_err());

        // The failed attempt must not disturb the holder
        for store in &stores {
            assert_eq!(store.holder("order:42").await.as_ref(), Some(held.token()));
        }
    }

    #[tokio::test]
    async fn quorum_without_validity_is_not_acquired() {
        let stores = MemoryLockStore::cluster(3);
        let options = LockOptions {
            clock_drift_floor: Duration::from_millis(100),
            ..LockOptions::default()
        };
        let coordinator = QuorumCoordinator::new(
            stores.iter().map(|s| s.clone() as Arc<dyn LockStore>).collect(),
            &options,
        )
        .unwrap();

        // Every store agrees, but the drift margin alone consumes the whole TTL
        let err = coordinator
            .acquire(&keys(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::ValidityExhausted { .. }));
        for store in &stores {
            assert_eq!(store.holder("order:42").await, None);
        }
    }

    #[tokio::test]
    async fn abandoned_round_is_released_in_background() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);
        stores[2].set_latency(Duration::from_millis(300));

        let lock_keys = keys();
        let round = coordinator.acquire(&lock_keys, Duration::from_secs(10));
        assert!(tokio::time::timeout(Duration::from_millis(50), round).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        for store in &stores {
            assert_eq!(store.holder("order:42").await, None);
        }
    }

    #[tokio::test]
    async fn stores_are_asked_concurrently_and_late_grants_count() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);
        for (i, store) in stores.iter().enumerate() {
            store.set_latency(Duration::from_millis(40 + 10 * i as u64));
        }

        let started = Instant::now();
        let lease = coordinator.acquire(&keys(), TTL).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(120));

        // The slowest store answered within its timeout and holds the lease too
        for store in &stores {
            assert_eq!(store.holder("order:42").await.as_ref(), Some(lease.token()));
        }
    }

    #[tokio::test]
    async fn stale_token_cannot_extend() {
        let stores = MemoryLockStore::cluster(3);
        let coordinator = coordinator(&stores);

        let lease = coordinator.acquire(&keys(), TTL).await.unwrap();
        coordinator.release(&lease).await;
        let other = coordinator.acquire(&keys(), TTL).await.unwrap();

        assert!(coordinator.extend(&lease, TTL).await.is_err());
        assert_eq!(stores[0].holder("order:42").await.as_ref(), Some(other.token()));
    }
}
