//! Per-resource reliability policies and their JSON representation.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryPolicy;

/// Everything the pipeline needs to guard one resource key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityPolicy {
    pub rate_limit: RateLimitConfig,
    /// Tokens taken from the bucket per pipeline call.
    pub tokens_per_call: f64,
    pub bulkhead: BulkheadConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    /// Upper bound on the whole call, admission waits included. None means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            tokens_per_call: 1.0,
            bulkhead: BulkheadConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout_ms: None,
        }
    }
}

impl ReliabilityPolicy {
    pub fn with_rate_limit(mut self, capacity: f64, refill_per_second: f64) -> Self {
        self.rate_limit = RateLimitConfig {
            capacity,
            refill_per_second,
        };
        self
    }

    pub fn with_bulkhead(mut self, max_concurrent: u32, acquire_timeout_ms: u64) -> Self {
        self.bulkhead = BulkheadConfig {
            max_concurrent,
            acquire_timeout_ms,
        };
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, open_timeout_ms: u64) -> Self {
        self.circuit_breaker = CircuitBreakerConfig {
            failure_threshold,
            open_timeout_ms,
        };
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout_ms(mut self, call_timeout_ms: u64) -> Self {
        self.call_timeout_ms = Some(call_timeout_ms);
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = &self.rate_limit;
        if !(rate.capacity.is_finite() && rate.capacity > 0.0) {
            return Err(ConfigError::InvalidCapacity(rate.capacity));
        }
        if !(rate.refill_per_second.is_finite() && rate.refill_per_second > 0.0) {
            return Err(ConfigError::InvalidRefillRate(rate.refill_per_second));
        }
        if !(self.tokens_per_call > 0.0 && self.tokens_per_call <= rate.capacity) {
            return Err(ConfigError::InvalidTokensPerCall(self.tokens_per_call));
        }
        if self.bulkhead.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::DelayBounds {
                base_ms: self.retry.base_delay_ms,
                max_ms: self.retry.max_delay_ms,
            });
        }
        Ok(())
    }
}

/// Default policy plus per-resource overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub default: ReliabilityPolicy,
    pub resources: HashMap<String, ReliabilityPolicy>,
}

impl PolicyTable {
    /// Parses and validates a JSON policy document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate()?;
        for policy in self.resources.values() {
            policy.validate()?;
        }
        Ok(())
    }

    pub fn with_resource(mut self, resource: impl Into<String>, policy: ReliabilityPolicy) -> Self {
        self.resources.insert(resource.into(), policy);
        self
    }

    pub fn policy_for(&self, resource: &str) -> &ReliabilityPolicy {
        self.resources.get(resource).unwrap_or(&self.default)
    }
}
