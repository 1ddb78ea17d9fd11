//! Bulkhead pattern for resource isolation.
//!
//! Limits concurrent in-flight calls per resource key. Waiters suspend on a
//! tokio semaphore instead of spinning, and a permit goes back to the pool
//! when it is dropped, whichever way the guarded call ends.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::outcome::{ErrorCode, Failure, Outcome};

/// Bulkhead configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum concurrent calls
    pub max_concurrent: u32,
    /// How long a caller waits for a permit before giving up
    pub acquire_timeout_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

struct Compartment {
    max_concurrent: u32,
    semaphore: Arc<Semaphore>,
}

impl Compartment {
    fn in_flight(&self) -> u32 {
        let available = u32::try_from(self.semaphore.available_permits()).unwrap_or(u32::MAX);
        self.max_concurrent.saturating_sub(available)
    }
}

/// Bulkhead for limiting concurrent calls, one pool per resource key
pub struct Bulkhead {
    default_config: BulkheadConfig,
    compartments: DashMap<String, Arc<Compartment>>,
}

impl Default for Bulkhead {
    fn default() -> Self {
        Self::new(BulkheadConfig::default())
    }
}

impl Bulkhead {
    pub fn new(default_config: BulkheadConfig) -> Self {
        Self {
            default_config,
            compartments: DashMap::new(),
        }
    }

    fn compartment(&self, resource: &str, config: BulkheadConfig) -> Arc<Compartment> {
        if let Some(compartment) = self.compartments.get(resource) {
            return Arc::clone(compartment.value());
        }
        let entry = self
            .compartments
            .entry(resource.to_string())
            .or_insert_with(|| {
                debug!(
                    resource,
                    max_concurrent = config.max_concurrent,
                    "Creating bulkhead compartment"
                );
                Arc::new(Compartment {
                    max_concurrent: config.max_concurrent,
                    semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
                })
            });
        Arc::clone(entry.value())
    }

    /// Creates the pool for `resource` from `config` unless it already exists.
    pub fn register(&self, resource: &str, config: BulkheadConfig) {
        self.compartment(resource, config);
    }

    /// Waits up to `timeout_ms` for a permit. A zero timeout never waits.
    pub async fn acquire(&self, resource: &str, timeout_ms: u64) -> Outcome<BulkheadPermit> {
        let compartment = self.compartment(resource, self.default_config);

        if timeout_ms == 0 {
            return self.try_acquire(resource);
        }

        if compartment.semaphore.available_permits() == 0 {
            debug!(
                resource,
                max_concurrent = compartment.max_concurrent,
                "Waiting for bulkhead permit"
            );
        }

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            Arc::clone(&compartment.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => {
                debug!(resource, in_flight = compartment.in_flight(), "Bulkhead permit acquired");
                Outcome::ok(BulkheadPermit {
                    _permit: permit,
                    resource: resource.to_string(),
                })
            }
            // The semaphore is never closed while the compartment lives.
            Ok(Err(_)) => Outcome::from_failure(Failure::new(
                format!("bulkhead for {resource} is closed"),
                ErrorCode::BulkheadTimeout,
                false,
            )),
            Err(_) => {
                warn!(resource, timeout_ms, "Bulkhead acquire timed out");
                Outcome::from_failure(Failure::new(
                    format!("no bulkhead permit for {resource} within {timeout_ms}ms"),
                    ErrorCode::BulkheadTimeout,
                    true,
                ))
            }
        }
    }

    pub fn try_acquire(&self, resource: &str) -> Outcome<BulkheadPermit> {
        let compartment = self.compartment(resource, self.default_config);
        match Arc::clone(&compartment.semaphore).try_acquire_owned() {
            Ok(permit) => Outcome::ok(BulkheadPermit {
                _permit: permit,
                resource: resource.to_string(),
            }),
            Err(_) => {
                warn!(resource, "Bulkhead full");
                Outcome::from_failure(Failure::new(
                    format!("bulkhead for {resource} is full"),
                    ErrorCode::BulkheadTimeout,
                    true,
                ))
            }
        }
    }

    /// Returns a permit to its pool. Dropping the permit does the same.
    pub fn release(&self, permit: BulkheadPermit) {
        drop(permit);
    }

    pub fn in_flight(&self, resource: &str) -> u32 {
        self.compartments
            .get(resource)
            .map(|compartment| compartment.in_flight())
            .unwrap_or(0)
    }

    pub fn available(&self, resource: &str) -> Option<u32> {
        self.compartments.get(resource).map(|compartment| {
            compartment
                .max_concurrent
                .saturating_sub(compartment.in_flight())
        })
    }
}

/// A permit from a bulkhead, released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    resource: String,
}

impl BulkheadPermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        debug!(resource = %self.resource, "Bulkhead permit released");
    }
}
