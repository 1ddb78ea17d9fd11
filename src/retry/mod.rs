//! Retry executor with pluggable backoff.
//!
//! Each attempt is gated by the circuit breaker when one is supplied, and each
//! attempt's result is recorded back into it, so a breaker that opens mid-retry
//! stops the remaining attempts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::BackoffStrategy;
use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::OperationFailure;
use crate::outcome::{ErrorCode, Failure, Outcome};
use crate::sleep::{Sleeper, TokioSleeper};

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&OperationFailure) -> bool + Send + Sync>;

/// Retry configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    /// Report exhausted retries as `MAX_RETRIES_EXCEEDED` instead of the last
    /// operation error code.
    pub reclassify_exhaustion: bool,
    #[serde(skip)]
    predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            strategy: BackoffStrategy::default(),
            reclassify_exhaustion: true,
            predicate: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("strategy", &self.strategy)
            .field("reclassify_exhaustion", &self.reclassify_exhaustion)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
            ..Default::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::Fixed { delay_ms: 0 })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_reclassify_exhaustion(mut self, reclassify: bool) -> Self {
        self.reclassify_exhaustion = reclassify;
        self
    }

    /// Replaces the default classification, which retries transient failures.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&OperationFailure) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, failure: &OperationFailure) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(failure),
            None => failure.transient,
        }
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.strategy.calculate_delay(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

/// Frees the half-open trial slot if the attempt is dropped before reporting.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    resource: &'a str,
    admission: Admission,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial(self.resource);
        }
    }
}

#[derive(Clone)]
pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::with_sleeper(TokioSleeper)
    }

    pub fn with_sleeper<S>(sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        Self {
            sleeper: Arc::new(sleeper),
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, exhausts
    /// `policy.max_attempts`, or the breaker refuses an attempt.
    ///
    /// `breaker` pairs the breaker registry with the resource key to gate on.
    /// The returned outcome's `retry_count` is the number of attempts after the first.
    pub async fn execute<T, E, F, Fut>(
        &self,
        mut operation: F,
        policy: &RetryPolicy,
        breaker: Option<(&CircuitBreaker, &str)>,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationFailure>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let retries = attempt - 1;

            let mut guard = match breaker {
                Some((circuit, resource)) => match circuit.admit(resource) {
                    Admission::Rejected => {
                        warn!(resource, attempt, "Attempt rejected by open circuit");
                        return Outcome::from_failure(CircuitBreaker::rejection(resource))
                            .with_retry_count(retries);
                    }
                    admission => Some(TrialGuard {
                        breaker: circuit,
                        resource,
                        admission,
                        armed: admission == Admission::Trial,
                    }),
                },
                None => None,
            };

            let result = operation().await;

            if let Some(guard) = guard.as_mut() {
                guard.disarm();
                guard
                    .breaker
                    .record_outcome(guard.resource, guard.admission, result.is_ok());
            }

            let failure: OperationFailure = match result {
                Ok(value) => {
                    if retries > 0 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Outcome::ok(value).with_retry_count(retries);
                }
                Err(err) => err.into(),
            };

            if !policy.is_retryable(&failure) {
                debug!(attempt, code = %failure.code, "Operation failed with non-retryable error");
                let mut failure = Failure::from(failure);
                failure.retryable = false;
                return Outcome::from_failure(failure).with_retry_count(retries);
            }

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    code = %failure.code,
                    error = %failure.message,
                    "Retries exhausted"
                );
                let failure = if policy.reclassify_exhaustion {
                    Failure::new(
                        format!("gave up after {attempt} attempts: {}", failure.message),
                        ErrorCode::MaxRetriesExceeded,
                        false,
                    )
                } else {
                    Failure::new(failure.message, failure.code, false)
                };
                return Outcome::from_failure(failure).with_retry_count(retries);
            }

            let delay_ms = policy.delay_ms(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms,
                error = %failure,
                "Retrying after error"
            );
            self.sleeper.sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests;
