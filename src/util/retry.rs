use std::{
    convert::TryFrom,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy as Next};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    error::{AttemptError, ConfigError, LockError},
    lease::{coordinator::QuorumCoordinator, Lease, ResourceKeys},
    settings::invalid,
};

/// How many times to try acquiring a lock and how long to wait between tries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Upper bound of the uniform random delay added to every wait.
    pub jitter: Duration,
    /// Growth of the base delay per attempt; 1.0 keeps it constant.
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Constant `delay` plus up to `jitter` between `max_attempts` attempts.
    pub fn fixed(max_attempts: usize, delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            jitter,
            backoff_factor: 1.0,
            max_delay: delay,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(invalid("retry.backoff_factor", "must be a finite value >= 1"));
        }
        Ok(())
    }

    /// Wait after the given failed attempt (1-based), before jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..=bound))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(200),
            jitter: Duration::from_millis(200),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

pub(crate) struct BackoffWithJitterStrategy {
    policy: RetryPolicy,
    keys: ResourceKeys,
}

impl BackoffWithJitterStrategy {
    pub(crate) fn new(policy: RetryPolicy, keys: ResourceKeys) -> Self {
        Self { policy, keys }
    }
}

impl ErrorHandler<AttemptError> for BackoffWithJitterStrategy {
    type OutError = AttemptError;

    fn handle(&mut self, attempt: usize, e: AttemptError) -> Next<AttemptError> {
        if attempt >= self.policy.max_attempts {
            return Next::ForwardError(e);
        }

        let delay = self.policy.backoff(attempt) + self.policy.jitter();
        warn!(
            keys = %self.keys,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "lock attempt failed, retrying"
        );
        Next::WaitRetry(delay)
    }
}

/// Retries acquisition under `policy` until it succeeds, attempts run out, or `cancel` fires.
///
/// A round interrupted by `cancel` is abandoned; the coordinator releases its
/// partial grants in the background.
pub(crate) async fn acquire_with_retry<E>(
    coordinator: &Arc<QuorumCoordinator>,
    keys: &ResourceKeys,
    ttl: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Lease, LockError<E>> {
    let attempts = AtomicUsize::new(0);
    let factory = || {
        attempts.fetch_add(1, Ordering::SeqCst);
        let coordinator = coordinator.clone();
        let keys = keys.clone();
        async move { coordinator.acquire(&keys, ttl).await }
    };
    let handler = BackoffWithJitterStrategy::new(policy.clone(), keys.clone());

    tokio::select! {
        _ = cancel.cancelled() => {
            let attempts = attempts.load(Ordering::SeqCst);
            warn!(%keys, attempts, "lock acquisition cancelled");
            Err(LockError::AcquisitionFailed { keys: keys.clone(), attempts })
        }
        outcome = FutureRetry::new(factory, handler) => match outcome {
            Ok((lease, _)) => Ok(lease),
            Err((err, attempts)) => {
                warn!(%keys, attempts, error = %err, "lock acquisition exhausted its attempts");
                Err(LockError::AcquisitionFailed { keys: keys.clone(), attempts })
            }
        },
    }
}
