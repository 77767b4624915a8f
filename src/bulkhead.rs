//! Bulkhead / bounded concurrency (C5): `BulkheadConfig`, `SemaphoreCell`,
//! and the `Bulkhead` pipeline strategy.
//!
//! Wraps `Arc<tokio::sync::Semaphore>`, mapping `try_acquire` to a
//! rejection error, extended with a bounded wait (`try_enter_timed`) and an
//! idempotent `dispose()` so an evicted `KeyedStore` entry can be retired
//! without leaving in-flight callers confused: once disposed, every new
//! entry attempt is rejected as full, while permits already held continue
//! to release normally on drop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::clock::JitterClock;
use crate::error::{ConfigError, ResilienceError};
use crate::store::{validate_key, KeyedState};

/// Immutable configuration for one keyed bulkhead.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadConfig {
    pub resource_key: String,
    pub max_concurrency: usize,
    /// Whether `try_enter_timed` is permitted to wait at all. `0` means
    /// every entry attempt behaves like `try_enter` (no waiting).
    pub queue_depth: usize,
}

impl BulkheadConfig {
    pub fn new(
        resource_key: impl Into<String>,
        max_concurrency: usize,
        queue_depth: usize,
    ) -> Result<Self, ConfigError> {
        let resource_key = resource_key.into();
        validate_key(&resource_key)?;
        if max_concurrency == 0 {
            return Err(ConfigError::NonPositive("max_concurrency"));
        }
        Ok(Self {
            resource_key,
            max_concurrency,
            queue_depth,
        })
    }
}

/// A keyed bulkhead's live state.
pub struct SemaphoreCell {
    semaphore: Arc<Semaphore>,
    active: AtomicU32,
    disposed: AtomicBool,
    last_access: AtomicU64,
    config: BulkheadConfig,
}

impl SemaphoreCell {
    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    fn rejected<E>(&self) -> ResilienceError<E> {
        ResilienceError::BulkheadFull {
            resource_key: self.config.resource_key.clone(),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Enters without waiting: succeeds immediately if a permit is free,
    /// otherwise rejects.
    pub fn try_enter<E>(self: &Arc<Self>) -> Result<BulkheadPermit, ResilienceError<E>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(self.rejected());
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.active.fetch_add(1, Ordering::AcqRel);
                Ok(BulkheadPermit {
                    cell: self.clone(),
                    _permit: permit,
                })
            }
            Err(_) => Err(self.rejected()),
        }
    }

    /// Enters, willing to wait up to `d` for a free permit if
    /// `queue_depth > 0`; otherwise behaves exactly like `try_enter`.
    ///
    /// Races the wait against `token`, so a caller-initiated cancellation
    /// aborts an in-flight wait immediately rather than blocking until the
    /// wait budget elapses or a permit frees up.
    pub async fn try_enter_timed<E>(
        self: &Arc<Self>,
        d: Duration,
        token: &CancelToken,
    ) -> Result<BulkheadPermit, ResilienceError<E>> {
        if self.config.queue_depth == 0 || d.is_zero() {
            return self.try_enter();
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(self.rejected());
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ResilienceError::Cancelled),
            outcome = tokio::time::timeout(d, self.semaphore.clone().acquire_owned()) => {
                match outcome {
                    Ok(Ok(permit)) => {
                        self.active.fetch_add(1, Ordering::AcqRel);
                        Ok(BulkheadPermit {
                            cell: self.clone(),
                            _permit: permit,
                        })
                    }
                    _ => Err(self.rejected()),
                }
            }
        }
    }
}

impl KeyedState for SemaphoreCell {
    type Config = BulkheadConfig;

    fn build(_key: &str, config: Self::Config, clock: JitterClock) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            active: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            last_access: AtomicU64::new(clock.now_nanos()),
            config,
        }
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }

    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }

    fn dispose(&self) {
        // Idempotent: evicting the same entry twice (or a creation-race
        // loser that never admitted anyone) must not panic or double-free.
        self.disposed.store(true, Ordering::Release);
        debug!(resource_key = %self.config.resource_key, "bulkhead: disposed");
    }
}

/// A held permit. Decrements the active-count exactly once on drop,
/// regardless of which exit path (return, `?`, panic unwind) releases it.
pub struct BulkheadPermit {
    cell: Arc<SemaphoreCell>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.cell.active.fetch_sub(1, Ordering::AcqRel);
    }
}
