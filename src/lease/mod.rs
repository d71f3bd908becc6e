use std::{collections::HashSet, fmt, time::Duration};

use rand::{rngs::OsRng, RngCore};
use tokio::time::Instant;

use crate::error::KeyError;

pub mod coordinator;
pub(crate) mod renewer;
pub mod signal;

const TOKEN_BYTES: usize = 20;

/// The non-empty set of resource names locked together as one logical lock.
///
/// Keys are kept sorted so two sets naming the same resources compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKeys {
    keys: Vec<String>,
}

impl ResourceKeys {
    pub fn new<I>(keys: I) -> Result<Self, KeyError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if key.trim().is_empty() {
                return Err(KeyError::Blank);
            }
            if !seen.insert(key.as_str()) {
                return Err(KeyError::Duplicate(key.clone()));
            }
        }

        let mut keys = keys;
        keys.sort();
        Ok(Self { keys })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

impl fmt::Display for ResourceKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keys.join(","))
    }
}

/// Random ownership credential, generated fresh for every acquisition attempt.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// 160 bits from the OS generator, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "LockToken({}..)", prefix)
    }
}

/// A lease confirmed by a quorum of stores.
#[derive(Debug, Clone)]
pub struct Lease {
    keys: ResourceKeys,
    token: LockToken,
    ttl: Duration,
    validity: Duration,
    valid_until: Instant,
}

impl Lease {
    pub(crate) fn new(
        keys: ResourceKeys,
        token: LockToken,
        ttl: Duration,
        validity: Duration,
        round_started: Instant,
    ) -> Self {
        Self {
            keys,
            token,
            ttl,
            validity,
            valid_until: round_started + validity,
        }
    }

    pub fn keys(&self) -> &ResourceKeys {
        &self.keys
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// TTL requested from the stores for the round that confirmed this lease.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Safe window granted by the last confirmed round, after drift and elapsed time.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    pub fn remaining(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.valid_until
    }
}

/// Per-invocation lifecycle of a scoped lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Extending,
    Releasing,
    Failed,
    Done,
}

impl LockState {
    pub fn can_transition_to(self, next: LockState) -> bool {
        use LockState::*;

        match (self, next) {
            (Idle, Acquiring)
            | (Acquiring, Held)
            | (Held, Extending)
            | (Extending, Held)
            | (Held, Releasing)
            | (Failed, Releasing)
            | (Releasing, Done) => true,
            (Done, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}
