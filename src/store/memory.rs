use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::LockStore;
use crate::{
    error::StoreError,
    lease::{LockToken, ResourceKeys},
};

struct Entry {
    token: LockToken,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process lease store.
///
/// Each operation runs under one mutex, which gives the same all-or-nothing
/// behaviour a scripted transaction gives on a networked store. Outages, transient
/// errors and latency can be injected to exercise quorum behaviour.
pub struct MemoryLockStore {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    failures_pending: AtomicUsize,
    latency_ms: AtomicU64,
}

impl MemoryLockStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failures_pending: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Builds `count` independent stores named `store-0`, `store-1`, ...
    pub fn cluster(count: usize) -> Vec<Arc<MemoryLockStore>> {
        (0..count)
            .map(|i| Arc::new(MemoryLockStore::new(format!("store-{}", i))))
            .collect()
    }

    /// Takes the store down (every call errors) or brings it back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `calls` operations fail as if the store were unreachable.
    pub fn fail_next(&self, calls: usize) {
        self.failures_pending.store(calls, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Token currently holding `key`, ignoring expired entries.
    pub async fn holder(&self, key: &str) -> Option<LockToken> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: self.name.clone(),
            });
        }
        Ok(())
    }

    fn expiry(&self, now: Instant, ttl: Duration) -> Result<Instant, StoreError> {
        now.checked_add(ttl).ok_or_else(|| StoreError::TtlOutOfRange {
            store: self.name.clone(),
            ttl,
        })
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.enter().await?;

        let now = Instant::now();
        let expires_at = self.expiry(now, ttl)?;
        let mut entries = self.entries.lock().await;
        let contended = keys.iter().any(|key| {
            entries
                .get(key)
                .map_or(false, |entry| entry.is_live(now) && &entry.token != token)
        });
        if contended {
            return Ok(false);
        }

        for key in keys.iter() {
            entries.insert(
                key.to_string(),
                Entry {
                    token: token.clone(),
                    expires_at,
                },
            );
        }
        Ok(true)
    }

    async fn try_extend(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.enter().await?;

        let now = Instant::now();
        let expires_at = self.expiry(now, ttl)?;
        let mut entries = self.entries.lock().await;
        let owned = keys.iter().all(|key| {
            entries
                .get(key)
                .map_or(false, |entry| entry.is_live(now) && &entry.token == token)
        });
        if !owned {
            return Ok(false);
        }

        for key in keys.iter() {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = expires_at;
            }
        }
        Ok(true)
    }

    async fn try_release(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
    ) -> Result<bool, StoreError> {
        self.enter().await?;

        let mut entries = self.entries.lock().await;
        let mut released = false;
        for key in keys.iter() {
            let matches = entries
                .get(key)
                .map_or(false, |entry| &entry.token == token);
            if matches {
                entries.remove(key);
                released = true;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> ResourceKeys {
        ResourceKeys::new(names.iter().copied()).unwrap()
    }

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn acquire_is_all_or_nothing() {
        let store = MemoryLockStore::new("s");
        let first = LockToken::generate();
        let second = LockToken::generate();

        assert!(store.try_acquire(&keys(&["b"]), &first, TTL).await.unwrap());
        assert!(!store
            .try_acquire(&keys(&["a", "b"]), &second, TTL)
            .await
            .unwrap());
        assert_eq!(store.holder("a").await, None);
        assert_eq!(store.holder("b").await, Some(first));
    }

    #[tokio::test]
    async fn expired_entries_can_be_taken() {
        let store = MemoryLockStore::new("s");
        let first = LockToken::generate();
        let second = LockToken::generate();

        assert!(store
            .try_acquire(&keys(&["a"]), &first, Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_acquire(&keys(&["a"]), &second, TTL).await.unwrap());
        assert!(!store.try_extend(&keys(&["a"]), &first, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = MemoryLockStore::new("s");
        let owner = LockToken::generate();
        let forged = LockToken::generate();

        assert!(store.try_acquire(&keys(&["a"]), &owner, TTL).await.unwrap());
        assert!(!store.try_release(&keys(&["a"]), &forged).await.unwrap());
        assert_eq!(store.holder("a").await, Some(owner.clone()));

        assert!(store.try_release(&keys(&["a"]), &owner).await.unwrap());
        assert!(!store.try_release(&keys(&["a"]), &owner).await.unwrap());
        assert_eq!(store.holder("a").await, None);
    }

    #[tokio::test]
    async fn release_skips_keys_taken_by_someone_else() {
        let store = MemoryLockStore::new("s");
        let ours = LockToken::generate();
        let theirs = LockToken::generate();

        assert!(store
            .try_acquire(&keys(&["a", "b"]), &ours, Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_acquire(&keys(&["a"]), &theirs, TTL).await.unwrap());

        assert!(store.try_release(&keys(&["a", "b"]), &ours).await.unwrap());
        assert_eq!(store.holder("a").await, Some(theirs.clone()));
        assert!(store.entries.lock().await.get("b").is_none());
        assert!(!store.try_release(&keys(&["a", "b"]), &ours).await.unwrap());
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_an_error() {
        let store = MemoryLockStore::new("s");
        let owner = LockToken::generate();

        let err = store
            .try_acquire(&keys(&["a"]), &owner, Duration::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TtlOutOfRange { .. }));
        assert_eq!(store.holder("a").await, None);

        assert!(store.try_acquire(&keys(&["a"]), &owner, TTL).await.unwrap());
        assert!(store
            .try_extend(&keys(&["a"]), &owner, Duration::MAX)
            .await
            .is_err());
        assert_eq!(store.holder("a").await, Some(owner));
    }

    #[tokio::test]
    async fn extend_requires_every_key() {
        let store = MemoryLockStore::new("s");
        let owner = LockToken::generate();

        assert!(store.try_acquire(&keys(&["a"]), &owner, TTL).await.unwrap());
        assert!(!store
            .try_extend(&keys(&["a", "b"]), &owner, TTL)
            .await
            .unwrap());
        assert!(store.try_extend(&keys(&["a"]), &owner, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryLockStore::new("s");
        let owner = LockToken::generate();

        store.fail_next(1);
        assert!(store.try_acquire(&keys(&["a"]), &owner, TTL).await.is_err());
        assert!(store.try_acquire(&keys(&["a"]), &owner, TTL).await.unwrap());
    }
}
