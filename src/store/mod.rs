use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    lease::{LockToken, ResourceKeys},
};

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoLockStore;
pub use memory::MemoryLockStore;

/// One independent key-value store able to hold leases.
///
/// Every operation must be atomic across the whole key set within a single
/// round-trip. `Ok(false)` means the store refused; `Err` means it could not answer.
#[async_trait]
pub trait LockStore: Send + Sync {
    fn name(&self) -> &str;

    /// Sets every key to `token` with expiry `ttl`, unless any key holds a different live value.
    async fn try_acquire(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Resets expiry to `ttl` on every key, only if every key currently holds `token`.
    async fn try_extend(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes every key that holds `token`. Absent keys are not an error.
    async fn try_release(&self, keys: &ResourceKeys, token: &LockToken)
        -> Result<bool, StoreError>;
}

/// Bounds every call to a store with a timeout and turns any failure into a refusal.
#[derive(Clone)]
pub(crate) struct LockStoreClient {
    store: Arc<dyn LockStore>,
}

impl LockStoreClient {
    pub(crate) fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub(crate) fn name(&self) -> &str {
        self.store.name()
    }

    pub(crate) async fn try_acquire(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
        limit: Duration,
    ) -> bool {
        self.vote(
            "acquire",
            keys,
            limit,
            self.store.try_acquire(keys, token, ttl),
        )
        .await
    }

    pub(crate) async fn try_extend(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        ttl: Duration,
        limit: Duration,
    ) -> bool {
        self.vote("extend", keys, limit, self.store.try_extend(keys, token, ttl))
            .await
    }

    pub(crate) async fn try_release(
        &self,
        keys: &ResourceKeys,
        token: &LockToken,
        limit: Duration,
    ) -> bool {
        self.vote("release", keys, limit, self.store.try_release(keys, token))
            .await
    }

    async fn vote<F>(&self, op: &'static str, keys: &ResourceKeys, limit: Duration, call: F) -> bool
    where
        F: std::future::Future<Output = Result<bool, StoreError>>,
    {
        match timeout(limit, call).await {
            Ok(Ok(granted)) => {
                debug!(store = self.name(), op, %keys, granted, "store answered");
                granted
            }
            Ok(Err(err)) => {
                warn!(store = self.name(), op, %keys, error = %err, "store call failed");
                false
            }
            Err(_) => {
                warn!(store = self.name(), op, %keys, timeout_ms = limit.as_millis() as u64, "store call timed out");
                false
            }
        }
    }
}
