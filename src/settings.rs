use std::{sync::Arc, time::Duration};

use config::{Config, Environment, File};
use rusoto_core::Region;
use serde::Deserialize;

use crate::{
    error::ConfigError,
    store::{DynamoLockStore, LockStore, MemoryLockStore},
    util::retry::RetryPolicy,
};

const ENV_PREFIX: &str = "QUORUM_LOCK";

/// Longest lease TTL accepted, from configuration or per call.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One lease store, as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory {
        name: String,
    },
    Dynamodb {
        name: String,
        table: String,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
}

impl StoreConfig {
    pub fn build(&self) -> Result<Arc<dyn LockStore>, ConfigError> {
        match self {
            StoreConfig::Memory { name } => Ok(Arc::new(MemoryLockStore::new(name.clone()))),
            StoreConfig::Dynamodb {
                name,
                table,
                region,
                endpoint,
            } => {
                let region = match endpoint {
                    Some(endpoint) => Region::Custom {
                        name: region.clone(),
                        endpoint: endpoint.clone(),
                    },
                    None => region
                        .parse::<Region>()
                        .map_err(|_| ConfigError::UnknownRegion(region.clone()))?,
                };
                Ok(Arc::new(DynamoLockStore::new(name.clone(), table.clone(), region)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
            backoff_factor: policy.backoff_factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// Lock manager configuration as read from a file or the environment.
///
/// Environment variables use the `QUORUM_LOCK` prefix and `__` between levels,
/// e.g. `QUORUM_LOCK__DEFAULT_TTL_MS=5000`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    pub stores: Vec<StoreConfig>,
    pub default_ttl_ms: u64,
    pub clock_drift_factor: f64,
    pub clock_drift_floor_ms: u64,
    pub store_timeout_ms: Option<u64>,
    pub extension_threshold: f64,
    pub extension_grace_attempts: u32,
    pub allow_single_store: bool,
    pub retry: RetryConfig,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        let options = LockOptions::default();
        Self {
            stores: Vec::new(),
            default_ttl_ms: options.default_ttl.as_millis() as u64,
            clock_drift_factor: options.clock_drift_factor,
            clock_drift_floor_ms: options.clock_drift_floor.as_millis() as u64,
            store_timeout_ms: None,
            extension_threshold: options.extension_threshold,
            extension_grace_attempts: options.extension_grace_attempts,
            allow_single_store: options.allow_single_store,
            retry: RetryConfig::default(),
        }
    }
}

impl LockManagerConfig {
    /// Reads the optional file at `path`, then applies environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Validates the configuration and converts it to typed options.
    pub fn options(&self) -> Result<LockOptions, ConfigError> {
        let options = LockOptions {
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            clock_drift_factor: self.clock_drift_factor,
            clock_drift_floor: Duration::from_millis(self.clock_drift_floor_ms),
            store_timeout: self.store_timeout_ms.map(Duration::from_millis),
            extension_threshold: self.extension_threshold,
            extension_grace_attempts: self.extension_grace_attempts,
            allow_single_store: self.allow_single_store,
            retry: RetryPolicy::from(&self.retry),
        };
        options.validate()?;
        Ok(options)
    }

    pub fn build_stores(&self) -> Result<Vec<Arc<dyn LockStore>>, ConfigError> {
        if self.stores.is_empty() {
            return Err(ConfigError::NoStores);
        }
        self.stores.iter().map(StoreConfig::build).collect()
    }
}

/// Typed tuning for the lock manager.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    pub default_ttl: Duration,
    /// Fraction of the TTL deducted for clock drift.
    pub clock_drift_factor: f64,
    /// Fixed drift deduction on top of the proportional one.
    pub clock_drift_floor: Duration,
    /// Upper bound for one store call; never more than a tenth of the TTL.
    pub store_timeout: Option<Duration>,
    /// Fraction of the validity window after which the watchdog extends.
    pub extension_threshold: f64,
    /// Consecutive missed extensions tolerated before the lease counts as lost.
    pub extension_grace_attempts: u32,
    pub allow_single_store: bool,
    pub retry: RetryPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(10),
            clock_drift_factor: 0.01,
            clock_drift_floor: Duration::from_millis(2),
            store_timeout: None,
            extension_threshold: 0.5,
            extension_grace_attempts: 1,
            allow_single_store: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl LockOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ttl("default_ttl_ms", self.default_ttl)?;
        if !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err(invalid("clock_drift_factor", "must be in [0, 1)"));
        }
        if !(self.extension_threshold > 0.0 && self.extension_threshold < 1.0) {
            return Err(invalid("extension_threshold", "must be in (0, 1)"));
        }
        self.retry.validate()
    }
}

pub(crate) fn check_ttl(field: &'static str, ttl: Duration) -> Result<(), ConfigError> {
    if ttl.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    if ttl > MAX_TTL {
        return Err(invalid(field, "must not exceed 24 hours"));
    }
    Ok(())
}

pub(crate) fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
