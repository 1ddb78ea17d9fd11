use std::fmt;

use thiserror::Error;

use crate::outcome::ErrorCode;

/// Failure reported by a provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("provider call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("provider call rejected ({code}): {message}")]
    Rejected {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rate limit capacity must be positive, got {0}")]
    InvalidCapacity(f64),
    #[error("rate limit refill rate must be positive, got {0}")]
    InvalidRefillRate(f64),
    #[error("tokens per call must be positive and at most the capacity, got {0}")]
    InvalidTokensPerCall(f64),
    #[error("bulkhead max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("circuit breaker failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    #[error("retry max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("retry base delay {base_ms}ms exceeds max delay {max_ms}ms")]
    DelayBounds { base_ms: u64, max_ms: u64 },
    #[error("invalid policy document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Returned by [`Outcome::try_unwrap`](crate::Outcome::try_unwrap) when the outcome holds no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwrapError {
    #[error("unwrapped an error outcome ({code}): {message}")]
    Err { code: ErrorCode, message: String },
    #[error("unwrapped a pass outcome{}", pass_suffix(.message))]
    Pass { message: Option<String> },
}

fn pass_suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

/// Uniform view of an operation's error, as seen by the retry predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub message: String,
    pub code: String,
    pub transient: bool,
    pub status: Option<u16>,
}

impl OperationFailure {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            transient: true,
            status: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            transient: false,
            status: None,
        }
    }

    /// Classifies an HTTP status: 429 and 5xx are transient, everything else is fatal.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: format!("HTTP_{status}"),
            transient: status == 429 || (500..600).contains(&status),
            status: Some(status),
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<ProviderError> for OperationFailure {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::Request(_) => Self::transient("PROVIDER_REQUEST", message),
            ProviderError::Response(_) => Self::fatal("PROVIDER_RESPONSE", message),
            ProviderError::Status { status, .. } => Self::from_status(status, message),
            ProviderError::Timeout { .. } => Self::transient("PROVIDER_TIMEOUT", message),
            ProviderError::Rejected { code, retryable, .. } => Self {
                message,
                code: code.to_string(),
                transient: retryable,
                status: None,
            },
        }
    }
}

impl From<String> for OperationFailure {
    fn from(message: String) -> Self {
        Self::fatal("OPERATION_FAILED", message)
    }
}

impl From<&str> for OperationFailure {
    fn from(message: &str) -> Self {
        Self::fatal("OPERATION_FAILED", message)
    }
}
