//! Three-way outcome returned by every public reliability operation.
//!
//! An [`Outcome`] is exactly one of a value (`Ok`), a classified failure (`Err`)
//! or a neutral "nothing to do" (`Pass`). Nothing in the pipeline raises errors
//! across its public surface; callers inspect the outcome instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OperationFailure, UnwrapError};

/// Stable error codes surfaced to callers.
///
/// Codes produced by the operation itself are carried through as
/// [`ErrorCode::Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    RateLimitExceeded,
    CircuitOpen,
    BulkheadTimeout,
    MaxRetriesExceeded,
    CallTimeout,
    InvalidPolicy,
    Operation(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::BulkheadTimeout => "BULKHEAD_TIMEOUT",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::CallTimeout => "CALL_TIMEOUT",
            Self::InvalidPolicy => "INVALID_POLICY",
            Self::Operation(code) => code,
        }
    }

    /// True for codes meaning the operation was never invoked.
    pub fn is_admission_denied(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::CircuitOpen | Self::BulkheadTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "RATE_LIMIT_EXCEEDED" => Self::RateLimitExceeded,
            "CIRCUIT_OPEN" => Self::CircuitOpen,
            "BULKHEAD_TIMEOUT" => Self::BulkheadTimeout,
            "MAX_RETRIES_EXCEEDED" => Self::MaxRetriesExceeded,
            "CALL_TIMEOUT" => Self::CallTimeout,
            "INVALID_POLICY" => Self::InvalidPolicy,
            other => Self::Operation(other.to_string()),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match Self::from(code.as_str()) {
            Self::Operation(_) => Self::Operation(code),
            known => known,
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Operation(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

/// Payload of an `Err` outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    pub code: ErrorCode,
    pub retryable: bool,
    /// Hint for caller-side backoff, set on rate-limit rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
}

impl Failure {
    pub fn new(error: impl Into<String>, code: impl Into<ErrorCode>, retryable: bool) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            retryable,
            retry_after_ms: None,
            retry_count: 0,
        }
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.error)
    }
}

impl From<OperationFailure> for Failure {
    fn from(failure: OperationFailure) -> Self {
        Self::new(failure.message, failure.code, failure.transient)
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome<T> {
    Ok {
        value: T,
        /// Attempts beyond the first that were needed to produce the value.
        #[serde(default, skip_serializing_if = "is_zero")]
        retry_count: u32,
    },
    Err(Failure),
    Pass { message: Option<String> },
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self {
        Self::Ok {
            value,
            retry_count: 0,
        }
    }

    pub fn err(error: impl Into<String>, code: impl Into<ErrorCode>, retryable: bool) -> Self {
        Self::Err(Failure::new(error, code, retryable))
    }

    pub fn pass(message: Option<String>) -> Self {
        Self::Pass { message }
    }

    pub fn from_failure(failure: Failure) -> Self {
        Self::Err(failure)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Err(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&ErrorCode> {
        self.failure().map(|failure| &failure.code)
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Ok { retry_count, .. } => *retry_count,
            Self::Err(failure) => failure.retry_count,
            Self::Pass { .. } => 0,
        }
    }

    pub fn with_retry_count(self, count: u32) -> Self {
        match self {
            Self::Ok { value, .. } => Self::Ok {
                value,
                retry_count: count,
            },
            Self::Err(mut failure) => {
                failure.retry_count = count;
                Self::Err(failure)
            }
            pass => pass,
        }
    }

    pub fn try_unwrap(self) -> Result<T, UnwrapError> {
        match self {
            Self::Ok { value, .. } => Ok(value),
            Self::Err(failure) => Err(UnwrapError::Err {
                code: failure.code,
                message: failure.error,
            }),
            Self::Pass { message } => Err(UnwrapError::Pass { message }),
        }
    }

    /// Returns the value, panicking on `Err` and `Pass`.
    ///
    /// Use [`Outcome::try_unwrap`] where a panic is not acceptable.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self.try_unwrap() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Ok { value, .. } => value,
            _ => default,
        }
    }

    pub fn unwrap_or_else(self, f: impl FnOnce() -> T) -> T {
        match self {
            Self::Ok { value, .. } => value,
            _ => f(),
        }
    }

    /// Chains `f` onto an `Ok` value; `Err` and `Pass` short-circuit unchanged.
    pub fn bind<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Ok { value, .. } => f(value),
            Self::Err(failure) => Outcome::Err(failure),
            Self::Pass { message } => Outcome::Pass { message },
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        self.bind(f)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ok { value, retry_count } => Outcome::Ok {
                value: f(value),
                retry_count,
            },
            Self::Err(failure) => Outcome::Err(failure),
            Self::Pass { message } => Outcome::Pass { message },
        }
    }

    pub fn map_failure(self, f: impl FnOnce(Failure) -> Failure) -> Self {
        match self {
            Self::Err(failure) => Self::Err(f(failure)),
            other => other,
        }
    }

    /// Reduces to a single value. `Pass` is folded as `on_ok(None)`.
    pub fn fold<U>(
        self,
        on_ok: impl FnOnce(Option<T>) -> U,
        on_err: impl FnOnce(Failure) -> U,
    ) -> U {
        match self {
            Self::Ok { value, .. } => on_ok(Some(value)),
            Self::Err(failure) => on_err(failure),
            Self::Pass { .. } => on_ok(None),
        }
    }

    pub fn fold_with_pass<U>(
        self,
        on_ok: impl FnOnce(T) -> U,
        on_err: impl FnOnce(Failure) -> U,
        on_pass: impl FnOnce(Option<String>) -> U,
    ) -> U {
        match self {
            Self::Ok { value, .. } => on_ok(value),
            Self::Err(failure) => on_err(failure),
            Self::Pass { message } => on_pass(message),
        }
    }

    /// `Pass` becomes `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, Failure> {
        match self {
            Self::Ok { value, .. } => Ok(Some(value)),
            Self::Err(failure) => Err(failure),
            Self::Pass { .. } => Ok(None),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T>
where
    E: Into<OperationFailure>,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => Self::Err(Failure::from(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn exactly_one_variant_reports_true() {
        let ok = Outcome::ok(1);
        let err: Outcome<i32> = Outcome::err("boom", "E", false);
        let pass: Outcome<i32> = Outcome::pass(None);

        assert!(ok.is_ok() && !ok.is_err() && !ok.is_pass());
        assert!(!err.is_ok() && err.is_err() && !err.is_pass());
        assert!(!pass.is_ok() && !pass.is_err() && pass.is_pass());
    }

    #[test]
    fn bind_short_circuits_err_and_pass() {
        let doubled = Outcome::ok(4).bind(|v| Outcome::ok(v * 2));
        assert_eq!(doubled, Outcome::ok(8));

        let err: Outcome<i32> = Outcome::err("boom", "E", true);
        let mut called = false;
        let chained = err.clone().bind(|v| {
            called = true;
            Outcome::ok(v)
        });
        assert!(!called);
        assert_eq!(chained, err);

        let pass: Outcome<i32> = Outcome::pass(Some("idle".to_string()));
        assert_eq!(pass.bind(|v| Outcome::ok(v + 1)), Outcome::pass(Some("idle".to_string())));
    }

    #[test]
    fn map_preserves_retry_count() {
        let mapped = Outcome::ok(2).with_retry_count(3).map(|v| v.to_string());
        assert_eq!(mapped.retry_count(), 3);
        assert_eq!(mapped.unwrap(), "2");
    }

    #[test]
    fn fold_defaults_pass_to_on_ok_none() {
        let pass: Outcome<i32> = Outcome::pass(None);
        let folded = pass.fold(|v| v.unwrap_or(-1), |_| -2);
        assert_eq!(folded, -1);

        let err: Outcome<i32> = Outcome::err("boom", "E", false);
        assert_eq!(err.fold(|v| v.unwrap_or(-1), |_| -2), -2);

        let pass: Outcome<i32> = Outcome::pass(Some("skip".to_string()));
        let label = pass.fold_with_pass(
            |v| v.to_string(),
            |f| f.error,
            |m| m.unwrap_or_default(),
        );
        assert_eq!(label, "skip");
    }

    #[test]
    fn try_unwrap_returns_domain_error() {
        let err: Outcome<i32> = Outcome::err("limited", ErrorCode::RateLimitExceeded, true);
        assert_eq!(
            err.try_unwrap(),
            Err(UnwrapError::Err {
                code: ErrorCode::RateLimitExceeded,
                message: "limited".to_string(),
            })
        );
        assert_eq!(Outcome::<i32>::pass(None).unwrap_or(7), 7);
    }

    #[test]
    #[should_panic(expected = "CIRCUIT_OPEN")]
    fn unwrap_panics_on_err() {
        let err: Outcome<i32> = Outcome::err("open", ErrorCode::CircuitOpen, false);
        err.unwrap();
    }

    #[test]
    fn serialized_forms_round_trip() {
        let ok = Outcome::ok(5);
        let encoded = serde_json::to_value(&ok).expect("serialize ok");
        assert_eq!(encoded, json!({"type": "ok", "value": 5}));
        assert_eq!(serde_json::from_value::<Outcome<i32>>(encoded).expect("ok"), ok);

        let err: Outcome<i32> = Outcome::err("x", "E", true);
        let encoded = serde_json::to_value(&err).expect("serialize err");
        assert_eq!(
            encoded,
            json!({"type": "err", "error": "x", "code": "E", "retryable": true})
        );
        assert_eq!(serde_json::from_value::<Outcome<i32>>(encoded).expect("err"), err);

        let pass: Outcome<i32> = Outcome::pass(None);
        let encoded = serde_json::to_value(&pass).expect("serialize pass");
        assert_eq!(encoded, json!({"type": "pass", "message": null}));
        assert_eq!(serde_json::from_value::<Outcome<i32>>(encoded).expect("pass"), pass);
    }

    #[test]
    fn known_codes_deserialize_to_named_variants() {
        let decoded: Outcome<()> = serde_json::from_value(json!({
            "type": "err",
            "error": "wait",
            "code": "RATE_LIMIT_EXCEEDED",
            "retryable": true,
            "retry_after_ms": 250
        }))
        .expect("decode");
        let failure = decoded.failure().expect("err variant");
        assert_eq!(failure.code, ErrorCode::RateLimitExceeded);
        assert_eq!(failure.retry_after_ms, Some(250));
        assert!(failure.code.is_admission_denied());
    }

    #[test]
    fn result_conversion_classifies_failures() {
        let converted: Outcome<u8> =
            Err::<u8, _>(OperationFailure::from_status(503, "unavailable")).into();
        let failure = converted.failure().expect("err");
        assert_eq!(failure.code, ErrorCode::Operation("HTTP_503".to_string()));
        assert!(failure.retryable);
    }
}
