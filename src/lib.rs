//! Reliability pipeline for agent SDK provider calls.
//!
//! Every call for a resource key passes, in order, through:
//! - a token-bucket `RateLimiter`
//! - a semaphore `Bulkhead` capping concurrent calls
//! - a `CircuitBreaker` gating each attempt of the `RetryExecutor`
//!
//! Results come back as an [`Outcome`]: a value with its retry count, a
//! structured [`Failure`] with a machine-readable [`ErrorCode`], or a pass.
//! `ReliableChatModel` applies the pipeline to any [`ChatModel`].

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod llm;
pub mod outcome;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod sleep;

pub use backoff::BackoffStrategy;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit};
pub use circuit_breaker::{
    BreakerEvent, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use config::{PolicyTable, ReliabilityPolicy};
pub use error::{ConfigError, OperationFailure, ProviderError, UnwrapError};
pub use llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolChoice,
    ModelToolDefinition, ModelUsage, ReliableChatModel,
};
pub use outcome::{ErrorCode, Failure, Outcome};
pub use pipeline::{PipelineStats, ReliabilityPipeline};
pub use rate_limiter::{BucketSnapshot, RateLimitConfig, RateLimiter};
pub use retry::{RetryExecutor, RetryPolicy, RetryPredicate};
pub use sleep::{Sleeper, TokioSleeper};
