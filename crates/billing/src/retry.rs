//! Bounded retry with exponential backoff and full jitter.
//!
//! After failure `n` (1-indexed) of a retryable error, the executor sleeps for
//! a value drawn uniformly from `[0, base_delay * 2^(n-1)]` and tries again,
//! for at most `max_retries` retries (`max_retries + 1` attempts in total).
//! Both the sleep primitive and the random source are injectable.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry budget and backoff base.
///
/// Plain data so it can be loaded from configuration. The retryability
/// predicate that completes a retry policy lives on [`RetryExecutor`], which
/// pairs it with a `RetryPolicy` at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = exactly one attempt).
    pub max_retries: u32,
    /// Backoff ceiling for the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Upper bound of the jittered delay after failure `failures` (1-indexed).
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn backoff_ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(failures - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// Suspends the current attempt between retries.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the calling worker thread. Other chunk threads keep running.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Source of jitter: a value in `[0, ceiling]`.
pub trait JitterSource: Send + Sync {
    fn sample(&self, ceiling: Duration) -> Duration;
}

/// Uniform full jitter backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self, ceiling: Duration) -> Duration {
        let max_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=max_nanos))
    }
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Runs a fallible action under a [`RetryPolicy`].
///
/// Never retries after a success and never swallows an error the predicate
/// rejects: such errors surface on the attempt that produced them, with no
/// sleep beforehand.
pub struct RetryExecutor<E> {
    policy: RetryPolicy,
    is_retryable: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            is_retryable: Arc::clone(&self.is_retryable),
            sleeper: Arc::clone(&self.sleeper),
            jitter: Arc::clone(&self.jitter),
        }
    }
}

impl<E> core::fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<E> RetryExecutor<E> {
    /// Create an executor that sleeps on the calling thread with random jitter.
    pub fn new<P>(policy: RetryPolicy, is_retryable: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            policy,
            is_retryable: Arc::new(is_retryable),
            sleeper: Arc::new(ThreadSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `action` immediately, retrying retryable failures with backoff.
    ///
    /// Returns the first success, or the error that ended the loop (either
    /// non-retryable or the last one once the budget is spent).
    pub fn execute<T, F>(&self, mut action: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut failures: u32 = 0;
        loop {
            let error = match action() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            failures += 1;

            if !(self.is_retryable)(&error) || !self.policy.allows_retry(failures) {
                return Err(error);
            }

            let ceiling = self.policy.backoff_ceiling(failures);
            let delay = self.jitter.sample(ceiling).min(ceiling);
            debug!(
                retry = failures,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                ceiling_ms = ceiling.as_millis() as u64,
                "retrying after backoff"
            );
            self.sleeper.sleep(delay);
        }
    }
}
