//! Error taxonomy for the resilience pipeline.
//!
//! Two error families exist: construction-time failures and
//! execution-time failures:
//!
//! - [`ConfigError`] is returned by fallible builders (`BreakerConfig::new`,
//!   `RateLimitConfig::new`, `BulkheadConfig::new`, `RetryConfig::new`) and
//!   never appears mid-execution.
//! - [`ResilienceError<E>`] is the outcome of a pipeline execution: success,
//!   the caller's own error wrapped in `Operation`, or one of the rejection
//!   reasons a strategy can produce.

use std::fmt;
use std::time::Duration;

/// A configuration value failed validation at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A key-identified resource (breaker, bucket, bulkhead) was given an
    /// empty key.
    EmptyKey,
    /// A numeric field that must be strictly positive was zero.
    NonPositive(&'static str),
    /// The sampling window is smaller than the failure threshold it is
    /// meant to accumulate against.
    WindowTooSmall {
        sampling_window: usize,
        failure_threshold: usize,
    },
    /// Burst capacity is smaller than the sustained rate, which would make
    /// the bucket unable to sustain `max_rate` even when full.
    BurstBelowRate { burst: u64, max_rate: u64 },
    /// `max_retries` exceeds the sane retry ceiling.
    InvalidMaxRetries(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyKey => write!(f, "resource key must not be empty"),
            ConfigError::NonPositive(field) => write!(f, "{field} must be greater than zero"),
            ConfigError::WindowTooSmall {
                sampling_window,
                failure_threshold,
            } => write!(
                f,
                "sampling_window ({sampling_window}) must be >= failure_threshold ({failure_threshold})"
            ),
            ConfigError::BurstBelowRate { burst, max_rate } => write!(
                f,
                "burst ({burst}) must be >= max_rate ({max_rate})"
            ),
            ConfigError::InvalidMaxRetries(n) => {
                write!(f, "max_retries ({n}) exceeds the supported ceiling")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// The outcome of executing an operation through one or more resilience
/// strategies.
///
/// `E` is the caller's own error type, preserved verbatim in
/// [`ResilienceError::Operation`] so callers can downcast or match on it
/// without the pipeline needing to understand it.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// A `Timeout` strategy (or a `RetryDriver`'s own configured deadline)
    /// elapsed before the operation completed.
    Timeout { duration: Duration },
    /// The call was cancelled by an externally supplied [`crate::cancel::CancelToken`]
    /// before it completed.
    Cancelled,
    /// A `Breaker` rejected the call because its circuit is open.
    CircuitOpen {
        service_key: String,
        /// The failure that most recently caused this rejection, when one
        /// was observed in the same call stack. Usually `None`: a breaker
        /// in the `Open` phase rejects without ever invoking the operation,
        /// so there is nothing to attach.
        cause: Option<Box<ResilienceError<E>>>,
    },
    /// A `Bulkhead` rejected the call because its concurrency limit (or a
    /// wait budget for one) was exhausted.
    BulkheadFull {
        resource_key: String,
        max_concurrency: usize,
    },
    /// A `RateLimit` rejected the call because its token bucket was empty.
    Throttled {
        service_key: String,
        rate: u64,
        window: Duration,
    },
    /// A keyed resource was looked up with a configuration that does not
    /// match the configuration it was first created with, for resource
    /// kinds where that mismatch is treated as an error rather than
    /// silently reused (see [`crate::store::KeyedState::STRICT_CONFIG`]).
    InvalidConfigChange { service_key: String },
    /// The wrapped operation itself returned `Err`.
    Operation(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Timeout { duration } => {
                write!(f, "operation timed out after {duration:?}")
            }
            ResilienceError::Cancelled => write!(f, "operation was cancelled"),
            ResilienceError::CircuitOpen { service_key, .. } => {
                write!(f, "circuit '{service_key}' is open")
            }
            ResilienceError::BulkheadFull {
                resource_key,
                max_concurrency,
            } => write!(
                f,
                "bulkhead '{resource_key}' is full (max_concurrency={max_concurrency})"
            ),
            ResilienceError::Throttled {
                service_key,
                rate,
                window,
            } => write!(
                f,
                "'{service_key}' is throttled (rate={rate}/{window:?})"
            ),
            ResilienceError::InvalidConfigChange { service_key } => write!(
                f,
                "'{service_key}' was reused with a different configuration"
            ),
            ResilienceError::Operation(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl<E> ResilienceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, ResilienceError::BulkheadFull { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, ResilienceError::Throttled { .. })
    }

    pub fn is_operation(&self) -> bool {
        matches!(self, ResilienceError::Operation(_))
    }

    pub fn as_operation(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
