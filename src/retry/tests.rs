use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};

#[derive(Default)]
struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().expect("lock poisoned").push(delay);
    }
}

fn recording_executor() -> (RetryExecutor, Arc<Mutex<Vec<Duration>>>) {
    let sleeper = RecordingSleeper::default();
    let delays = Arc::clone(&sleeper.delays);
    (RetryExecutor::with_sleeper(sleeper), delays)
}

/// Operation replaying a fixed script of results, counting invocations.
struct Scripted {
    results: Mutex<VecDeque<Result<u32, OperationFailure>>>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(results: Vec<Result<u32, OperationFailure>>) -> Self {
        Self {
            results: Mutex::new(VecDeque::from(results)),
            calls: AtomicU32::new(0),
        }
    }

    async fn call(&self) -> Result<u32, OperationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.results.lock().expect("lock poisoned");
        guard
            .pop_front()
            .unwrap_or_else(|| Err(OperationFailure::fatal("SCRIPT_EMPTY", "no more results")))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn transient() -> Result<u32, OperationFailure> {
    Err(OperationFailure::transient("HTTP_503", "unavailable"))
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, BackoffStrategy::Exponential { jitter: false })
        .with_delays(10, 1_000)
}

#[tokio::test]
async fn succeeds_on_first_attempt_without_sleeping() {
    let (executor, delays) = recording_executor();
    let op = Scripted::new(vec![Ok(42)]);

    let outcome = executor.execute(|| op.call(), &policy(3), None).await;

    assert_eq!(outcome, Outcome::ok(42));
    assert_eq!(outcome.retry_count(), 0);
    assert_eq!(op.calls(), 1);
    assert!(delays.lock().expect("lock poisoned").is_empty());
}

#[tokio::test]
async fn fails_twice_then_succeeds_with_retry_count_two() {
    let (executor, delays) = recording_executor();
    let op = Scripted::new(vec![transient(), transient(), Ok(7)]);

    let outcome = executor.execute(|| op.call(), &policy(3), None).await;

    assert!(outcome.is_ok());
    assert_eq!(outcome.retry_count(), 2);
    assert_eq!(outcome.unwrap(), 7);
    assert_eq!(op.calls(), 3);
    assert_eq!(
        *delays.lock().expect("lock poisoned"),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[tokio::test]
async fn always_retryable_failure_exhausts_after_max_attempts() {
    let (executor, delays) = recording_executor();
    let op = Scripted::new(vec![transient(), transient(), transient(), Ok(1)]);

    let outcome = executor.execute(|| op.call(), &policy(3), None).await;

    let failure = outcome.failure().expect("exhausted");
    assert_eq!(failure.code, ErrorCode::MaxRetriesExceeded);
    assert!(!failure.retryable);
    assert_eq!(failure.retry_count, 2);
    assert!(failure.error.contains("unavailable"));
    assert_eq!(op.calls(), 3);
    assert_eq!(delays.lock().expect("lock poisoned").len(), 2);
}

#[tokio::test]
async fn exhaustion_can_pass_original_code_through() {
    let (executor, _) = recording_executor();
    let op = Scripted::new(vec![transient(), transient()]);

    let outcome = executor
        .execute(
            || op.call(),
            &policy(2).with_reclassify_exhaustion(false),
            None,
        )
        .await;

    let failure = outcome.failure().expect("exhausted");
    assert_eq!(failure.code, ErrorCode::Operation("HTTP_503".to_string()));
    assert!(!failure.retryable);
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let (executor, delays) = recording_executor();
    let op = Scripted::new(vec![
        Err(OperationFailure::from_status(400, "bad request")),
        Ok(1),
    ]);

    let outcome = executor.execute(|| op.call(), &policy(5), None).await;

    let failure = outcome.failure().expect("fatal");
    assert_eq!(failure.code, ErrorCode::Operation("HTTP_400".to_string()));
    assert!(!failure.retryable);
    assert_eq!(op.calls(), 1);
    assert!(delays.lock().expect("lock poisoned").is_empty());
}

#[tokio::test]
async fn custom_predicate_overrides_transience() {
    let (executor, _) = recording_executor();
    let op = Scripted::new(vec![
        Err(OperationFailure::fatal("VALIDATION", "flaky validator")),
        Ok(3),
    ]);
    let policy = policy(3).with_predicate(|failure| failure.code == "VALIDATION");

    let outcome = executor.execute(|| op.call(), &policy, None).await;

    assert_eq!(outcome.unwrap(), 3);
    assert_eq!(op.calls(), 2);
}

#[tokio::test]
async fn zero_max_attempts_still_runs_once() {
    let (executor, _) = recording_executor();
    let op = Scripted::new(vec![Ok(9)]);

    let outcome = executor.execute(|| op.call(), &policy(0), None).await;

    assert_eq!(outcome.unwrap(), 9);
    assert_eq!(op.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_without_invoking() {
    let (executor, _) = recording_executor();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        open_timeout_ms: 1_000,
    });
    breaker.force_open("provider");
    let op = Scripted::new(vec![Ok(1)]);

    let outcome = executor
        .execute(|| op.call(), &policy(3), Some((&breaker, "provider")))
        .await;

    assert_eq!(outcome.code(), Some(&ErrorCode::CircuitOpen));
    assert!(!outcome.failure().expect("err").retryable);
    assert_eq!(op.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_attempt_is_recorded_and_open_breaker_stops_retries() {
    let (executor, _) = recording_executor();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        open_timeout_ms: 1_000,
    });
    let op = Scripted::new(vec![transient(), transient(), transient(), Ok(1)]);

    let outcome = executor
        .execute(|| op.call(), &policy(5), Some((&breaker, "provider")))
        .await;

    assert_eq!(outcome.code(), Some(&ErrorCode::CircuitOpen));
    assert_eq!(outcome.retry_count(), 2);
    assert_eq!(op.calls(), 2);
    assert_eq!(breaker.state("provider"), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn success_is_recorded_on_breaker() {
    let (executor, _) = recording_executor();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        open_timeout_ms: 1_000,
    });
    breaker.record_failure("provider");
    breaker.record_failure("provider");
    let op = Scripted::new(vec![Ok(1)]);

    executor
        .execute(|| op.call(), &policy(1), Some((&breaker, "provider")))
        .await
        .unwrap();

    let snapshot = breaker.snapshot("provider").expect("exists");
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn backoff_sleeps_follow_the_tokio_clock() {
    let executor = RetryExecutor::new();
    let op = Scripted::new(vec![transient(), transient(), Ok(5)]);
    let started = tokio::time::Instant::now();

    let outcome = executor.execute(|| op.call(), &policy(3), None).await;

    assert_eq!(outcome.unwrap(), 5);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(30) && elapsed < Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn cancelled_trial_releases_half_open_slot() {
    let executor = RetryExecutor::new();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        open_timeout_ms: 100,
    });
    breaker.record_failure("provider");
    tokio::time::advance(Duration::from_millis(100)).await;

    let single = policy(1);
    let pending = executor.execute(
        || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<u32, OperationFailure>(1)
        },
        &single,
        Some((&breaker, "provider")),
    );
    let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
    assert!(timed_out.is_err());

    assert_eq!(breaker.state("provider"), CircuitState::HalfOpen);
    assert!(breaker.is_call_permitted("provider"));
}

#[tokio::test(start_paused = true)]
async fn late_result_from_closed_admission_leaves_trial_pending() {
    let executor = RetryExecutor::new();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        open_timeout_ms: 100,
    }));
    let single = Arc::new(policy(1));

    let slow = {
        let (executor, breaker, single) =
            (executor.clone(), Arc::clone(&breaker), Arc::clone(&single));
        tokio::spawn(async move {
            executor
                .execute(
                    || async {
                        tokio::time::sleep(Duration::from_millis(1_000)).await;
                        Err::<u32, _>(OperationFailure::transient("HTTP_503", "slow"))
                    },
                    &single,
                    Some((&*breaker, "provider")),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    executor
        .execute(|| async { transient() }, &single, Some((&*breaker, "provider")))
        .await;
    assert_eq!(breaker.state("provider"), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let trial = {
        let (executor, breaker, single) =
            (executor.clone(), Arc::clone(&breaker), Arc::clone(&single));
        tokio::spawn(async move {
            executor
                .execute(
                    || async {
                        tokio::time::sleep(Duration::from_millis(2_000)).await;
                        Ok::<u32, OperationFailure>(1)
                    },
                    &single,
                    Some((&*breaker, "provider")),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(breaker.snapshot("provider").expect("exists").trial_in_flight);

    let late = slow.await.expect("join");
    assert!(late.is_err());
    let snapshot = breaker.snapshot("provider").expect("exists");
    assert_eq!(snapshot.state, CircuitState::HalfOpen);
    assert!(snapshot.trial_in_flight);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = Scripted::new(vec![Ok(2)]);
    let rejected = executor
        .execute(|| second.call(), &single, Some((&*breaker, "provider")))
        .await;
    assert_eq!(rejected.code(), Some(&ErrorCode::CircuitOpen));
    assert_eq!(second.calls(), 0);

    assert_eq!(trial.await.expect("join").unwrap(), 1);
    assert_eq!(breaker.state("provider"), CircuitState::Closed);
}
