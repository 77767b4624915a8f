//! Ordered composition of resilience strategies around an operation (C8).
//!
//! Stages form an ordered list, each able to call through to the remainder
//! of the chain — the same "middleware wraps the next handler" idea as a
//! `tower::Layer` stack, but as a small, dynamic-dispatch chain instead of
//! statically nested layers, since a `Pipeline`'s stages are chosen at
//! runtime from a builder rather than fixed at the type level.
//!
//! # Example
//!
//! A typical outer service boundary: give up entirely on a sensible
//! fallback only as a last resort, retry transient failures with jitter,
//! bound total latency, trip a circuit when a downstream is unhealthy,
//! cap concurrency, and shed load once a rate limit is hit.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bulwark::prelude::*;
//!
//! # async fn call_downstream() -> Result<String, std::io::Error> {
//! #     Ok("ok".to_string())
//! # }
//! # async fn run() -> Result<String, ResilienceError<std::io::Error>> {
//! let registry = Registry::new();
//! let retry = RetryConfig::builder()
//!     .max_retries(3).expect("valid max_retries")
//!     .base_delay(Duration::from_millis(50)).expect("valid base_delay")
//!     .build();
//! let breaker = BreakerConfig::new("downstream", 5, 10, Duration::from_secs(30))
//!     .expect("valid breaker config");
//! let bulkhead = BulkheadConfig::new("downstream", 64, 16).expect("valid bulkhead config");
//!
//! let pipeline = Pipeline::builder()
//!     .fallback(|_err| "fallback response".to_string())
//!     .retry(retry)
//!     .timeout(Duration::from_secs(2))
//!     .circuit_breaker(&registry, breaker)
//!     .bulkhead(&registry, bulkhead, Some(Duration::from_millis(100)))
//!     .build();
//!
//! let result = pipeline.execute(|_token| call_downstream()).await?;
//! # Ok(result)
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::breaker::{BreakerConfig, BreakerState};
use crate::bucket::{BucketState, RateLimitConfig};
use crate::bulkhead::{BulkheadConfig, SemaphoreCell};
use crate::cancel::CancelToken;
use crate::error::ResilienceError;
use crate::registry::Registry;
use crate::retry::{RetryConfig, RetryDriver};
use crate::store::KeyedStore;

type TerminalOp<T, E> =
    Arc<dyn Fn(CancelToken) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + Sync>;

/// The remainder of a pipeline's chain from a given stage's point of view.
pub struct Next<'a, T, E> {
    stages: &'a [Box<dyn Stage<T, E>>],
    op: &'a TerminalOp<T, E>,
}

impl<'a, T, E> Clone for Next<'a, T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T, E> Copy for Next<'a, T, E> {}

impl<'a, T: Send + 'static, E: Send + 'static> Next<'a, T, E> {
    /// Invokes the next stage in the chain, or the terminal operation once
    /// every stage has run.
    pub async fn call(&self, token: CancelToken) -> Result<T, ResilienceError<E>> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    op: self.op,
                };
                stage.call(next, token).await
            }
            None => (self.op)(token).await.map_err(ResilienceError::Operation),
        }
    }
}

#[async_trait]
trait Stage<T, E>: Send + Sync {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>>;
}

struct RetryStage<T, E> {
    driver: RetryDriver<T, E>,
}

#[async_trait]
impl<T: Send + Clone + 'static, E: Send + 'static> Stage<T, E> for RetryStage<T, E> {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        self.driver.execute(|tok| async move { next.call(tok).await }, Some(token)).await
    }
}

struct TimeoutStage {
    duration: Duration,
}

#[async_trait]
impl<T: Send + 'static, E: Send + 'static> Stage<T, E> for TimeoutStage {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        let linked = token.child_token();
        let deadline = tokio::time::Instant::now() + self.duration;
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                linked.cancel();
                Err(ResilienceError::Timeout { duration: self.duration })
            }
            _ = token.cancelled() => Err(ResilienceError::Cancelled),
            r = next.call(linked.clone()) => r,
        }
    }
}

struct BreakerStage {
    registry: Arc<KeyedStore<BreakerState>>,
    config: BreakerConfig,
}

#[async_trait]
impl<T: Send + 'static, E: Clone + Send + 'static> Stage<T, E> for BreakerStage {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        let state = self
            .registry
            .get_or_create(&self.config.service_key, self.config.clone())?;
        state.guard(|| async move { next.call(token).await }).await
    }
}

struct BulkheadStage {
    registry: Arc<KeyedStore<SemaphoreCell>>,
    config: BulkheadConfig,
    wait_budget: Option<Duration>,
}

#[async_trait]
impl<T: Send + 'static, E: Send + 'static> Stage<T, E> for BulkheadStage {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        let cell = self
            .registry
            .get_or_create(&self.config.resource_key, self.config.clone())?;
        let _permit = match self.wait_budget {
            Some(d) => cell.try_enter_timed(d, &token).await?,
            None => cell.try_enter()?,
        };
        next.call(token).await
    }
}

struct RateLimitStage {
    registry: Arc<KeyedStore<BucketState>>,
    config: RateLimitConfig,
}

#[async_trait]
impl<T: Send + 'static, E: Send + 'static> Stage<T, E> for RateLimitStage {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        let bucket = self
            .registry
            .get_or_create(&self.config.service_key, self.config.clone())?;
        if !bucket.try_acquire() {
            return Err(ResilienceError::Throttled {
                service_key: self.config.service_key.clone(),
                rate: self.config.max_rate,
                window: self.config.window,
            });
        }
        next.call(token).await
    }
}

struct FallbackStage<T, E> {
    f: Arc<dyn Fn(&ResilienceError<E>) -> T + Send + Sync>,
}

#[async_trait]
impl<T: Send + 'static, E: Send + 'static> Stage<T, E> for FallbackStage<T, E> {
    async fn call(&self, next: Next<'_, T, E>, token: CancelToken) -> Result<T, ResilienceError<E>> {
        match next.call(token).await {
            Ok(v) => Ok(v),
            Err(ResilienceError::Cancelled) => Err(ResilienceError::Cancelled),
            Err(e) => Ok((self.f)(&e)),
        }
    }
}

/// An ordered chain of resilience strategies wrapping an operation.
///
/// Built via [`Pipeline::builder`]; stages run outer-to-inner in the order
/// they were added, with the operation passed to [`Pipeline::execute`] at
/// the center.
pub struct Pipeline<T, E> {
    stages: Vec<Box<dyn Stage<T, E>>>,
}

impl<T: Send + 'static, E: Send + 'static> Pipeline<T, E> {
    pub fn builder() -> PipelineBuilder<T, E> {
        PipelineBuilder::new()
    }

    /// Runs `op` through the pipeline with a fresh, unlinked cancellation
    /// token.
    pub async fn execute<Op, Fut>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_cancellable(op, CancelToken::new()).await
    }

    /// Runs `op` through the pipeline, linking cancellation to a
    /// caller-supplied token.
    pub async fn execute_cancellable<Op, Fut>(
        &self,
        op: Op,
        token: CancelToken,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let boxed_op: TerminalOp<T, E> = Arc::new(move |tok| Box::pin(op(tok)));
        let next = Next {
            stages: &self.stages,
            op: &boxed_op,
        };
        next.call(token).await
    }
}

/// Builds a [`Pipeline`] by appending stages outer-to-inner.
pub struct PipelineBuilder<T, E> {
    stages: Vec<Box<dyn Stage<T, E>>>,
}

impl<T: Send + 'static, E: Send + 'static> PipelineBuilder<T, E> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Catches any rejection from the rest of the chain (except an
    /// outstanding external `Cancelled`) and substitutes `f`'s return
    /// value instead of propagating the error.
    #[must_use]
    pub fn fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> T + Send + Sync + 'static,
    {
        self.stages.push(Box::new(FallbackStage { f: Arc::new(f) }));
        self
    }

    #[must_use]
    pub fn retry(self, config: RetryConfig<T, E>) -> Self
    where
        T: Clone,
    {
        self.retry_with(RetryDriver::new(config))
    }

    #[must_use]
    pub fn retry_with(mut self, driver: RetryDriver<T, E>) -> Self
    where
        T: Clone,
    {
        self.stages.push(Box::new(RetryStage { driver }));
        self
    }

    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.stages.push(Box::new(TimeoutStage { duration }));
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, registry: &Registry, config: BreakerConfig) -> Self {
        self.stages.push(Box::new(BreakerStage {
            registry: registry.breakers().clone(),
            config,
        }));
        self
    }

    /// `wait_budget`, when set, lets the call wait up to that long for a
    /// free slot (subject to the bulkhead's own `queue_depth` gate);
    /// `None` behaves like a plain non-waiting bulkhead.
    #[must_use]
    pub fn bulkhead(
        mut self,
        registry: &Registry,
        config: BulkheadConfig,
        wait_budget: Option<Duration>,
    ) -> Self {
        self.stages.push(Box::new(BulkheadStage {
            registry: registry.bulkheads().clone(),
            config,
            wait_budget,
        }));
        self
    }

    #[must_use]
    pub fn rate_limit(mut self, registry: &Registry, config: RateLimitConfig) -> Self {
        self.stages.push(Box::new(RateLimitStage {
            registry: registry.buckets().clone(),
            config,
        }));
        self
    }

    pub fn build(self) -> Pipeline<T, E> {
        Pipeline { stages: self.stages }
    }
}

impl<T: Send + 'static, E: Send + 'static> Default for PipelineBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn empty_pipeline_just_runs_the_operation() {
        let pipeline: Pipeline<u32, &'static str> = Pipeline::builder().build();
        let result = pipeline.execute(|_tok| async { Ok::<_, &'static str>(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test]
    async fn retry_then_op_retries_transient_failures() {
        let retry = RetryConfig::<u32, &'static str>::builder()
            .max_retries(3)
            .unwrap()
            .base_delay(Duration::from_millis(1))
            .unwrap()
            .build();
        let pipeline: Pipeline<u32, &'static str> = Pipeline::builder().retry(retry).build();
        let attempts = AtomicUsize::new(0);
        let result = pipeline
            .execute(move |_tok| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(9u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 9);
    }

    #[tokio::test]
    async fn breaker_rejects_once_open_independent_of_retry() {
        let registry = Registry::new();
        let breaker = BreakerConfig::new("svc", 1, 1, Duration::from_secs(30)).unwrap();
        let pipeline: Pipeline<u32, &'static str> = Pipeline::builder()
            .circuit_breaker(&registry, breaker)
            .build();
        let _ = pipeline
            .execute(|_tok| async { Err::<u32, _>("boom") })
            .await;
        let result = pipeline.execute(|_tok| async { Ok::<u32, &'static str>(1) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn rate_limit_throttles_once_exhausted() {
        let registry = Registry::new();
        let rate = RateLimitConfig::new("svc", 1, Duration::from_secs(60), None).unwrap();
        let pipeline: Pipeline<u32, &'static str> =
            Pipeline::builder().rate_limit(&registry, rate).build();
        assert!(pipeline.execute(|_tok| async { Ok::<u32, &'static str>(1) }).await.is_ok());
        let result = pipeline.execute(|_tok| async { Ok::<u32, &'static str>(1) }).await;
        assert!(result.unwrap_err().is_throttled());
    }

    #[tokio::test]
    async fn bulkhead_rejects_beyond_capacity() {
        let registry = Registry::new();
        let bulkhead = BulkheadConfig::new("svc", 1, 0).unwrap();
        let pipeline: Arc<Pipeline<u32, &'static str>> = Arc::new(
            Pipeline::builder().bulkhead(&registry, bulkhead, None).build(),
        );
        let p1 = pipeline.clone();
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate1 = gate.clone();
        let holder = tokio::spawn(async move {
            p1.execute(move |_tok| {
                let gate1 = gate1.clone();
                async move {
                    gate1.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<u32, &'static str>(1)
                }
            })
            .await
        });
        gate.notified().await;
        let result = pipeline.execute(|_tok| async { Ok::<u32, &'static str>(2) }).await;
        assert!(result.unwrap_err().is_bulkhead_full());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fallback_substitutes_a_value_on_error() {
        let pipeline: Pipeline<&'static str, &'static str> = Pipeline::builder()
            .fallback(|_e| "fallback")
            .build();
        let result = pipeline.execute(|_tok| async { Err::<&'static str, _>("boom") }).await;
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn fallback_does_not_swallow_outstanding_cancellation() {
        let pipeline: Pipeline<&'static str, &'static str> = Pipeline::builder()
            .fallback(|_e| "fallback")
            .timeout(Duration::from_secs(30))
            .build();
        let token = CancelToken::new();
        token.cancel();
        let result = pipeline
            .execute_cancellable(|_tok| async { Ok::<_, &'static str>("ok") }, token)
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stage_bounds_the_inner_call() {
        let pipeline: Pipeline<u32, &'static str> =
            Pipeline::builder().timeout(Duration::from_millis(50)).build();
        let result = pipeline
            .execute(|_tok| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<u32, &'static str>(1)
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
