//! Circuit breaker keyed by resource.
//!
//! The breaker stops calls to a failing resource after `failure_threshold`
//! consecutive failures, waits `open_timeout_ms` since the last failure, then
//! lets exactly one trial call through to decide whether to close again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::outcome::{ErrorCode, Failure, Outcome};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without reaching the resource
    Open,
    /// A single trial call decides between Closed and Open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Inputs to the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    Failure {
        consecutive_failures: u32,
        threshold: u32,
    },
    OpenTimeoutElapsed,
}

impl CircuitState {
    /// Pure transition function; edges not listed leave the state unchanged.
    pub fn on_event(self, event: BreakerEvent) -> CircuitState {
        match (self, event) {
            (
                CircuitState::Closed,
                BreakerEvent::Failure {
                    consecutive_failures,
                    threshold,
                },
            ) if consecutive_failures >= threshold => CircuitState::Open,
            (CircuitState::Open, BreakerEvent::OpenTimeoutElapsed) => CircuitState::HalfOpen,
            (CircuitState::HalfOpen, BreakerEvent::Success) => CircuitState::Closed,
            (CircuitState::HalfOpen, BreakerEvent::Failure { .. }) => CircuitState::Open,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is allowed
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Allowed,
    /// The caller holds the single half-open trial slot.
    Trial,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub trial_in_flight: bool,
}

#[derive(Debug)]
struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    fn apply(&mut self, resource: &str, event: BreakerEvent) {
        let next = self.state.on_event(event);
        if next == self.state {
            return;
        }
        match next {
            CircuitState::Open => warn!(
                resource,
                consecutive_failures = self.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(resource, "Circuit breaker half-open, testing"),
            CircuitState::Closed => info!(resource, "Circuit breaker closed"),
        }
        self.state = next;
    }

    fn open_timeout_elapsed(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= self.config.open_timeout(),
            None => true,
        }
    }

    fn admit(&mut self, resource: &str, now: Instant) -> Admission {
        if self.state == CircuitState::Open && self.open_timeout_elapsed(now) {
            self.apply(resource, BreakerEvent::OpenTimeoutElapsed);
        }

        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen if self.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    /// `trial` is true only for the call holding the half-open trial slot.
    fn record_success(&mut self, resource: &str, trial: bool) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                self.consecutive_failures = 0;
                self.trial_in_flight = false;
                self.apply(resource, BreakerEvent::Success);
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(resource, state = %self.state, "Ignoring late success");
            }
        }
    }

    fn record_failure(&mut self, resource: &str, now: Instant, trial: bool) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen {
            if !trial {
                debug!(resource, "Late failure left the half-open trial pending");
                return;
            }
            self.trial_in_flight = false;
        }
        self.last_failure = Some(now);
        self.apply(
            resource,
            BreakerEvent::Failure {
                consecutive_failures: self.consecutive_failures,
                threshold: self.config.failure_threshold,
            },
        );
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_timeout_ms: self.config.open_timeout_ms,
            trial_in_flight: self.trial_in_flight,
        }
    }
}

/// Thread-safe breaker registry; each resource key has an independent state machine.
pub struct CircuitBreaker {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, resource: &str, config: CircuitBreakerConfig) -> Arc<Mutex<BreakerState>> {
        if let Some(breaker) = self.breakers.get(resource) {
            return Arc::clone(breaker.value());
        }
        let entry = self.breakers.entry(resource.to_string()).or_insert_with(|| {
            debug!(
                resource,
                failure_threshold = config.failure_threshold,
                open_timeout_ms = config.open_timeout_ms,
                "Creating circuit breaker"
            );
            Arc::new(Mutex::new(BreakerState::new(config)))
        });
        Arc::clone(entry.value())
    }

    /// Creates the breaker for `resource` from `config` unless it already exists.
    pub fn register(&self, resource: &str, config: CircuitBreakerConfig) {
        self.breaker(resource, config);
    }

    pub(crate) fn admit(&self, resource: &str) -> Admission {
        self.breaker(resource, self.default_config)
            .lock()
            .admit(resource, Instant::now())
    }

    /// Checks whether a call may proceed, moving Open to HalfOpen once the
    /// open timeout has elapsed. A `true` answer in HalfOpen claims the trial slot.
    pub fn is_call_permitted(&self, resource: &str) -> bool {
        self.admit(resource) != Admission::Rejected
    }

    /// [`CircuitBreaker::is_call_permitted`] as an outcome carrying `CIRCUIT_OPEN`.
    pub fn check(&self, resource: &str) -> Outcome<()> {
        if self.is_call_permitted(resource) {
            Outcome::ok(())
        } else {
            Outcome::from_failure(Self::rejection(resource))
        }
    }

    pub(crate) fn rejection(resource: &str) -> Failure {
        Failure::new(
            format!("circuit open for {resource}"),
            ErrorCode::CircuitOpen,
            false,
        )
    }

    /// Reports a success for a call admitted by [`CircuitBreaker::is_call_permitted`].
    /// In HalfOpen the report settles the pending trial.
    pub fn record_success(&self, resource: &str) {
        let breaker = self.breaker(resource, self.default_config);
        let mut breaker = breaker.lock();
        let trial = breaker.trial_in_flight;
        breaker.record_success(resource, trial);
    }

    /// Reports a failure for a call admitted by [`CircuitBreaker::is_call_permitted`].
    /// In HalfOpen the report settles the pending trial.
    pub fn record_failure(&self, resource: &str) {
        let breaker = self.breaker(resource, self.default_config);
        let mut breaker = breaker.lock();
        let trial = breaker.trial_in_flight;
        breaker.record_failure(resource, Instant::now(), trial);
    }

    /// Records the result of a call, given how [`CircuitBreaker::admit`] let it through.
    /// Only the holder of the trial slot can move a half-open breaker.
    pub(crate) fn record_outcome(&self, resource: &str, admission: Admission, succeeded: bool) {
        let breaker = self.breaker(resource, self.default_config);
        let mut breaker = breaker.lock();
        let trial = admission == Admission::Trial;
        if succeeded {
            breaker.record_success(resource, trial);
        } else {
            breaker.record_failure(resource, Instant::now(), trial);
        }
    }

    /// Frees a half-open trial slot whose call ended without an outcome.
    pub fn release_trial(&self, resource: &str) {
        if let Some(breaker) = self.breakers.get(resource) {
            let mut breaker = breaker.lock();
            if breaker.state == CircuitState::HalfOpen && breaker.trial_in_flight {
                debug!(resource, "Half-open trial abandoned");
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Current state without evaluating the open timeout. Unknown keys are Closed.
    pub fn state(&self, resource: &str) -> CircuitState {
        self.breakers
            .get(resource)
            .map(|breaker| breaker.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, resource: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .get(resource)
            .map(|breaker| breaker.lock().snapshot())
    }

    /// Returns the breaker to Closed with a clean failure count.
    pub fn reset(&self, resource: &str) {
        if let Some(breaker) = self.breakers.get(resource) {
            let mut breaker = breaker.lock();
            breaker.state = CircuitState::Closed;
            breaker.consecutive_failures = 0;
            breaker.last_failure = None;
            breaker.trial_in_flight = false;
            info!(resource, "Circuit breaker reset");
        }
    }

    /// Opens the circuit now, as if the last failure just happened.
    pub fn force_open(&self, resource: &str) {
        let breaker = self.breaker(resource, self.default_config);
        let mut breaker = breaker.lock();
        breaker.state = CircuitState::Open;
        breaker.last_failure = Some(Instant::now());
        breaker.trial_in_flight = false;
        warn!(resource, "Circuit breaker forced open");
    }
}
