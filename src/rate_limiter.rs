//! Token-bucket admission control, keyed by resource.
//!
//! Each resource key owns one bucket behind its own mutex. Refill and
//! subtraction happen under that lock as a single step, so two callers can
//! never both take the last token.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::outcome::{ErrorCode, Failure, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket holds, also the burst size.
    pub capacity: f64,
    /// Tokens added per second of elapsed time.
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_second: 1.0,
        }
    }
}

/// Point-in-time view of one bucket, taken after refilling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_second: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Refills, then takes `requested` tokens or reports how long until they exist.
    fn try_consume(&mut self, requested: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= requested {
            self.tokens -= requested;
            return Ok(());
        }

        let missing = requested - self.tokens;
        if self.refill_per_second <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX))
    }

    fn snapshot(&mut self, now: Instant) -> BucketSnapshot {
        self.refill(now);
        BucketSnapshot {
            tokens: self.tokens,
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
        }
    }
}

pub struct RateLimiter {
    default_config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// `default_config` sizes buckets for keys first seen through [`RateLimiter::acquire`].
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, resource: &str, config: RateLimitConfig) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(resource) {
            return Arc::clone(bucket.value());
        }
        let entry = self.buckets.entry(resource.to_string()).or_insert_with(|| {
            debug!(
                resource,
                capacity = config.capacity,
                refill_per_second = config.refill_per_second,
                "Creating token bucket"
            );
            Arc::new(Mutex::new(TokenBucket::new(config, Instant::now())))
        });
        Arc::clone(entry.value())
    }

    pub fn acquire(&self, resource: &str, tokens: f64) -> Outcome<()> {
        self.acquire_with(resource, tokens, self.default_config)
    }

    /// Like [`RateLimiter::acquire`], creating the bucket from `config` if the key is new.
    pub fn acquire_with(
        &self,
        resource: &str,
        tokens: f64,
        config: RateLimitConfig,
    ) -> Outcome<()> {
        if tokens <= 0.0 {
            return Outcome::pass(Some("no tokens requested".to_string()));
        }

        let bucket = self.bucket(resource, config);
        let mut bucket = bucket.lock();
        let capacity = bucket.capacity;

        match bucket.try_consume(tokens, Instant::now()) {
            Ok(()) => {
                debug!(resource, remaining = bucket.tokens, "Rate limit tokens acquired");
                Outcome::ok(())
            }
            Err(_) if tokens > capacity => {
                warn!(resource, tokens, capacity, "Requested tokens exceed bucket capacity");
                Outcome::from_failure(Failure::new(
                    format!("requested {tokens} tokens but capacity is {capacity}"),
                    ErrorCode::RateLimitExceeded,
                    false,
                ))
            }
            Err(wait) => {
                let wait_ms = (wait.as_secs_f64() * 1000.0).ceil() as u64;
                warn!(
                    resource,
                    tokens,
                    available = bucket.tokens,
                    retry_after_ms = wait_ms,
                    "Rate limit exceeded"
                );
                Outcome::from_failure(
                    Failure::new(
                        format!("rate limit exceeded for {resource}, retry in {wait_ms}ms"),
                        ErrorCode::RateLimitExceeded,
                        true,
                    )
                    .with_retry_after_ms(wait_ms),
                )
            }
        }
    }

    /// Refills the bucket to capacity immediately. Unknown keys are left alone.
    pub fn reset(&self, resource: &str) {
        if let Some(bucket) = self.buckets.get(resource) {
            let mut bucket = bucket.lock();
            bucket.tokens = bucket.capacity;
            bucket.last_refill = Instant::now();
            info!(resource, "Rate limiter reset");
        }
    }

    pub fn snapshot(&self, resource: &str) -> Option<BucketSnapshot> {
        let bucket = self.buckets.get(resource).map(|b| Arc::clone(b.value()))?;
        let snapshot = bucket.lock().snapshot(Instant::now());
        Some(snapshot)
    }
}
