//! Orchestrates the reliability stages around one operation.
//!
//! Stage order is fixed: rate limit, then bulkhead, then breaker-gated retry.
//! An earlier stage rejecting means later stages are never touched, so a
//! rate-limited call leaves breaker state and bulkhead permits alone.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{PolicyTable, ReliabilityPolicy};
use crate::error::OperationFailure;
use crate::outcome::{ErrorCode, Failure, Outcome};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryExecutor;

/// Cumulative counters for one resource key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub calls: u64,
    pub successes: u64,
    /// Calls whose operation ran and ultimately failed.
    pub failures: u64,
    pub rate_limited: u64,
    pub circuit_opened: u64,
    pub bulkhead_timeouts: u64,
    /// Attempts beyond the first, summed over all calls.
    pub retries: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct StatsCell {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    circuit_opened: AtomicU64,
    bulkhead_timeouts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
}

impl StatsCell {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
            bulkhead_timeouts: self.bulkhead_timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        for counter in [
            &self.calls,
            &self.successes,
            &self.failures,
            &self.rate_limited,
            &self.circuit_opened,
            &self.bulkhead_timeouts,
            &self.retries,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct ReliabilityPipeline {
    rate_limiter: RateLimiter,
    bulkhead: Bulkhead,
    circuit_breaker: CircuitBreaker,
    executor: RetryExecutor,
    policies: PolicyTable,
    stats: DashMap<String, Arc<StatsCell>>,
}

impl Default for ReliabilityPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityPipeline {
    pub fn new() -> Self {
        Self::with_policies(PolicyTable::default())
    }

    /// Pipeline whose `execute_with_table` resolves policies from `policies`.
    pub fn with_policies(policies: PolicyTable) -> Self {
        Self {
            rate_limiter: RateLimiter::new(policies.default.rate_limit),
            bulkhead: Bulkhead::new(policies.default.bulkhead),
            circuit_breaker: CircuitBreaker::new(policies.default.circuit_breaker),
            executor: RetryExecutor::new(),
            policies,
            stats: DashMap::new(),
        }
    }

    /// Swaps the retry executor, e.g. for one with a recording sleeper.
    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    fn stats_cell(&self, resource: &str) -> Arc<StatsCell> {
        if let Some(cell) = self.stats.get(resource) {
            return Arc::clone(cell.value());
        }
        Arc::clone(
            self.stats
                .entry(resource.to_string())
                .or_default()
                .value(),
        )
    }

    /// Runs `operation` for `resource` under `policy`.
    ///
    /// Per-resource limits are fixed by the policy seen on the first call for
    /// that key; the retry policy always comes from the current call.
    pub async fn execute<T, E, F, Fut>(
        &self,
        resource: &str,
        operation: F,
        policy: &ReliabilityPolicy,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationFailure>,
    {
        let stats = self.stats_cell(resource);
        StatsCell::bump(&stats.calls);

        if let Err(err) = policy.validate() {
            warn!(resource, error = %err, "Rejecting call with invalid policy");
            StatsCell::bump(&stats.failures);
            return Outcome::err(err.to_string(), ErrorCode::InvalidPolicy, false);
        }

        let Some(limit) = policy.call_timeout() else {
            return self.run_stages(resource, operation, policy, &stats).await;
        };

        let staged = self.run_stages(resource, operation, policy, &stats);
        match tokio::time::timeout(limit, staged).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    resource,
                    timeout_ms = limit.as_millis() as u64,
                    "Pipeline call timed out"
                );
                StatsCell::bump(&stats.timeouts);
                Outcome::from_failure(Failure::new(
                    format!("call to {resource} timed out after {}ms", limit.as_millis()),
                    ErrorCode::CallTimeout,
                    true,
                ))
            }
        }
    }

    /// [`ReliabilityPipeline::execute`] with the policy the table holds for `resource`.
    pub async fn execute_with_table<T, E, F, Fut>(&self, resource: &str, operation: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationFailure>,
    {
        let policy = self.policies.policy_for(resource);
        self.execute(resource, operation, policy).await
    }

    async fn run_stages<T, E, F, Fut>(
        &self,
        resource: &str,
        operation: F,
        policy: &ReliabilityPolicy,
        stats: &StatsCell,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationFailure>,
    {
        // Stage 1: rate limit.
        let admission = self
            .rate_limiter
            .acquire_with(resource, policy.tokens_per_call, policy.rate_limit);
        if let Outcome::Err(failure) = admission {
            StatsCell::bump(&stats.rate_limited);
            return Outcome::from_failure(failure);
        }

        // Stage 2: bulkhead.
        self.bulkhead.register(resource, policy.bulkhead);
        let permit = match self
            .bulkhead
            .acquire(resource, policy.bulkhead.acquire_timeout_ms)
            .await
        {
            Outcome::Ok { value, .. } => value,
            Outcome::Err(failure) => {
                StatsCell::bump(&stats.bulkhead_timeouts);
                return Outcome::from_failure(failure);
            }
            Outcome::Pass { message } => return Outcome::pass(message),
        };

        // Stage 3: breaker-gated retry, inside the permit's scope.
        self.circuit_breaker.register(resource, policy.circuit_breaker);
        let outcome = self
            .executor
            .execute(
                operation,
                &policy.retry,
                Some((&self.circuit_breaker, resource)),
            )
            .await;
        drop(permit);

        stats
            .retries
            .fetch_add(u64::from(outcome.retry_count()), Ordering::Relaxed);
        match &outcome {
            Outcome::Ok { .. } => StatsCell::bump(&stats.successes),
            Outcome::Err(failure) if failure.code == ErrorCode::CircuitOpen => {
                StatsCell::bump(&stats.circuit_opened)
            }
            Outcome::Err(_) => StatsCell::bump(&stats.failures),
            Outcome::Pass { .. } => {}
        }
        debug!(
            resource,
            ok = outcome.is_ok(),
            retries = outcome.retry_count(),
            "Pipeline call finished"
        );
        outcome
    }

    /// Cumulative counters for `resource`; zeroed for keys never called.
    pub fn statistics(&self, resource: &str) -> PipelineStats {
        self.stats
            .get(resource)
            .map(|cell| cell.snapshot())
            .unwrap_or_default()
    }

    /// Zeroes statistics, refills the bucket and closes the breaker for `resource`.
    pub fn reset(&self, resource: &str) {
        if let Some(cell) = self.stats.get(resource) {
            cell.clear();
        }
        self.rate_limiter.reset(resource);
        self.circuit_breaker.reset(resource);
    }
}
