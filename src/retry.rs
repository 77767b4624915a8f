//! Retry with decorrelated-jitter backoff and cancellation linking (C7).
//!
//! The attempt loop, failure accumulation, and builder pattern follow a
//! `RetryPolicy<E>`/`RetryPolicyBuilder<E>` shape, extended with
//! `result_predicate` support (a successful-looking value the caller still
//! wants retried), the hard default short-circuit for
//! `CircuitOpen`/`BulkheadFull`/`Throttled`/`Cancelled`, and cancellation
//! and timeout linking: a single `CancelToken` (and, if a timeout is
//! configured, a single deadline) governs the *whole* `execute` call, not
//! each attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::clock::JitterClock;
use crate::error::{ConfigError, ResilienceError};
use crate::sleeper::{Sleeper, SleepOutcome, TokioSleeper};

type ErrorPredicate<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

fn default_error_predicate<E>(err: &ResilienceError<E>) -> bool {
    !matches!(
        err,
        ResilienceError::Cancelled
            | ResilienceError::CircuitOpen { .. }
            | ResilienceError::BulkheadFull { .. }
            | ResilienceError::Throttled { .. }
    )
}

/// Configuration for a [`RetryDriver`].
pub struct RetryConfig<T, E> {
    max_retries: usize,
    base_delay: Duration,
    max_delay_cap: Duration,
    timeout: Option<Duration>,
    disable_jitter: bool,
    error_predicate: ErrorPredicate<E>,
    result_predicate: Option<ResultPredicate<T>>,
}

impl<T, E> RetryConfig<T, E> {
    pub fn builder() -> RetryConfigBuilder<T, E> {
        RetryConfigBuilder::new()
    }
}

/// Builds a [`RetryConfig`], returning `Err` on invalid input rather than
/// panicking (mirrors `TimeoutPolicy::new`/`RetryPolicyBuilder`).
pub struct RetryConfigBuilder<T, E> {
    max_retries: usize,
    base_delay: Duration,
    max_delay_cap: Duration,
    timeout: Option<Duration>,
    disable_jitter: bool,
    error_predicate: ErrorPredicate<E>,
    result_predicate: Option<ResultPredicate<T>>,
}

const MAX_SANE_RETRIES: usize = 1000;

impl<T, E> RetryConfigBuilder<T, E> {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay_cap: Duration::from_secs(30),
            timeout: None,
            disable_jitter: false,
            error_predicate: Arc::new(default_error_predicate),
            result_predicate: None,
        }
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Result<Self, ConfigError> {
        if max_retries > MAX_SANE_RETRIES {
            return Err(ConfigError::InvalidMaxRetries(max_retries));
        }
        self.max_retries = max_retries;
        Ok(self)
    }

    #[must_use]
    pub fn base_delay(mut self, base_delay: Duration) -> Result<Self, ConfigError> {
        if base_delay.is_zero() {
            return Err(ConfigError::NonPositive("base_delay"));
        }
        self.base_delay = base_delay;
        Ok(self)
    }

    #[must_use]
    pub fn max_delay_cap(mut self, cap: Duration) -> Self {
        self.max_delay_cap = cap;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn disable_jitter(mut self, disable: bool) -> Self {
        self.disable_jitter = disable;
        self
    }

    /// Overrides which errors are retriable. `Cancelled` is always
    /// non-retriable regardless of what this predicate returns.
    #[must_use]
    pub fn error_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.error_predicate = Arc::new(predicate);
        self
    }

    /// Treats a successful value as retriable when `predicate` returns
    /// `true` for it (e.g. a 200 response carrying an application-level
    /// error body).
    #[must_use]
    pub fn result_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.result_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> RetryConfig<T, E> {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay_cap: self.max_delay_cap,
            timeout: self.timeout,
            disable_jitter: self.disable_jitter,
            error_predicate: self.error_predicate,
            result_predicate: self.result_predicate,
        }
    }
}

impl<T, E> Default for RetryConfigBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the attempt loop described in §4.7: computes delays via a
/// [`JitterClock`], sleeps via a [`Sleeper`], and links cancellation across
/// the whole call.
pub struct RetryDriver<T, E> {
    config: RetryConfig<T, E>,
    clock: JitterClock,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> RetryDriver<T, E> {
    pub fn new(config: RetryConfig<T, E>) -> Self {
        Self {
            config,
            clock: JitterClock::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: JitterClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Runs `op` to completion, retrying per the configured policy.
    ///
    /// `op` receives the per-attempt cancellation token to pass down to
    /// the rest of the pipeline: when neither a timeout nor an outer
    /// token is in play, no child token or `select!` machinery is built
    /// at all, matching §4.7's "don't construct cancellation-dependent
    /// helpers you don't need".
    pub async fn execute<Op, Fut>(
        &self,
        mut op: Op,
        outer: Option<CancelToken>,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        T: Clone,
    {
        let deadline = self.config.timeout.map(|d| tokio::time::Instant::now() + d);
        let linked = match (&deadline, &outer) {
            (None, None) => None,
            _ => Some(outer.clone().unwrap_or_default().child_token()),
        };

        let mut previous = self.config.base_delay;
        let mut last_err: Option<ResilienceError<E>> = None;
        let mut last_retriable_value: Option<T> = None;

        for attempt in 0..=self.config.max_retries {
            if let Some(token) = &linked {
                if token.is_cancelled() {
                    return Err(ResilienceError::Cancelled);
                }
            }

            let call_token = linked.clone().unwrap_or_default();
            let outcome = match (&linked, deadline) {
                (Some(token), Some(dl)) => {
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(dl) => {
                            token.cancel();
                            return Err(ResilienceError::Timeout { duration: self.config.timeout.unwrap() });
                        }
                        _ = token.cancelled() => return Err(ResilienceError::Cancelled),
                        r = op(call_token) => r,
                    }
                }
                (Some(token), None) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(ResilienceError::Cancelled),
                        r = op(call_token) => r,
                    }
                }
                (None, _) => op(call_token).await,
            };

            match outcome {
                Ok(value) => match &self.config.result_predicate {
                    Some(pred) if pred(&value) => {
                        last_retriable_value = Some(value);
                        last_err = None;
                    }
                    _ => return Ok(value),
                },
                Err(e) => {
                    if matches!(e, ResilienceError::Cancelled) {
                        return Err(e);
                    }
                    if !(self.config.error_predicate)(&e) {
                        return Err(e);
                    }
                    last_retriable_value = None;
                    last_err = Some(e);
                }
            }

            if attempt == self.config.max_retries {
                break;
            }

            let delay = self.clock.next_delay(
                self.config.base_delay,
                previous,
                (attempt + 1) as u32,
                self.config.disable_jitter,
                self.config.max_delay_cap,
            );
            previous = delay;

            let sleep_token = linked.clone().unwrap_or_default();
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retry: sleeping before next attempt");
            match (&linked, deadline) {
                (_, Some(dl)) => {
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(dl) => {
                            if let Some(token) = &linked { token.cancel(); }
                            return Err(ResilienceError::Timeout { duration: self.config.timeout.unwrap() });
                        }
                        outcome = self.sleeper.sleep(delay, &sleep_token) => {
                            if outcome == SleepOutcome::Cancelled {
                                return Err(ResilienceError::Cancelled);
                            }
                        }
                    }
                }
                (Some(_), None) => {
                    if self.sleeper.sleep(delay, &sleep_token).await == SleepOutcome::Cancelled {
                        return Err(ResilienceError::Cancelled);
                    }
                }
                (None, None) => {
                    self.sleeper.sleep(delay, &sleep_token).await;
                }
            }
        }

        if let Some(value) = last_retriable_value {
            Ok(value)
        } else {
            Err(last_err.expect("retry loop exits only after recording a failure"))
        }
    }
}
