use std::time::Duration;

use thiserror::Error;

use crate::lease::ResourceKeys;

/// Problems with a caller-supplied resource key set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("resource key set is empty")]
    Empty,

    #[error("resource keys must not be blank")]
    Blank,

    #[error("resource key '{0}' appears more than once")]
    Duplicate(String),
}

/// Failures reported by a single store backend.
///
/// The store client folds all of these into a refused vote; they only surface in logs.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store '{store}' is unavailable")]
    Unavailable { store: String },

    #[error("{count} keys exceed the per-request limit of {limit}")]
    TooManyKeys { count: usize, limit: usize },

    #[error("store '{store}' failed: {message}")]
    Backend { store: String, message: String },

    #[error("store '{store}' cannot represent an expiry {ttl:?} from now")]
    TtlOutOfRange { store: String, ttl: Duration },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no lock stores configured")]
    NoStores,

    #[error("a single lock store is a single point of failure; set allow_single_store to accept it")]
    SingleStore,

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown region '{0}'")]
    UnknownRegion(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Why one acquisition or extension round did not produce a usable lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("only {granted} of the {required} required stores granted the lease")]
    NoQuorum { granted: usize, required: usize },

    #[error("quorum reached but the round took {elapsed:?}, leaving no validity")]
    ValidityExhausted { elapsed: Duration },
}

/// Errors surfaced by [`crate::LockManager::with_lock`].
#[derive(Error, Debug)]
pub enum LockError<E> {
    #[error("invalid resource keys: {0}")]
    InvalidKeys(#[from] KeyError),

    #[error("invalid lock request: {0}")]
    InvalidRequest(#[source] ConfigError),

    #[error("failed to acquire lock on [{keys}] after {attempts} attempt(s)")]
    AcquisitionFailed { keys: ResourceKeys, attempts: usize },

    #[error("lock on [{keys}] was lost during execution")]
    LockLost { keys: ResourceKeys },

    #[error("{0}")]
    Callback(E),
}

impl<E> LockError<E> {
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, LockError::AcquisitionFailed { .. })
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, LockError::LockLost { .. })
    }

    /// Returns the callback's own error, if that is what this is.
    pub fn into_callback_error(self) -> Option<E> {
        match self {
            LockError::Callback(e) => Some(e),
            _ => None,
        }
    }
}
