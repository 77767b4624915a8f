//! Circuit breaker (C3): `BreakerConfig`, `BreakerState`, and the `Breaker`
//! pipeline strategy.
//!
//! Phase transitions are an atomic CAS state machine
//! (`STATE_CLOSED`/`OPEN`/`HALF_OPEN` as an `AtomicU8`, winner-take-all
//! transition into `HalfOpen`). The failure test tracks a sliding window of
//! the last `sampling_window` outcomes (`RingBuffer<bool>`) rather than a
//! bare failure counter that resets to zero on any success, so a single
//! success inside an otherwise-failing window does not erase the window's
//! history, only slides it forward.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::JitterClock;
use crate::error::{ConfigError, ResilienceError};
use crate::ring::RingBuffer;
use crate::store::{validate_key, KeyedState};

const PHASE_CLOSED: u8 = 0;
const PHASE_OPEN: u8 = 1;
const PHASE_HALF_OPEN: u8 = 2;

/// A circuit breaker's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Open,
    HalfOpen,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            PHASE_OPEN => Phase::Open,
            PHASE_HALF_OPEN => Phase::HalfOpen,
            _ => Phase::Closed,
        }
    }
}

/// Immutable configuration for one keyed breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub service_key: String,
    pub failure_threshold: usize,
    pub sampling_window: usize,
    pub half_open_delay: Duration,
}

impl BreakerConfig {
    pub fn new(
        service_key: impl Into<String>,
        failure_threshold: usize,
        sampling_window: usize,
        half_open_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let service_key = service_key.into();
        validate_key(&service_key)?;
        if failure_threshold == 0 {
            return Err(ConfigError::NonPositive("failure_threshold"));
        }
        if sampling_window < failure_threshold {
            return Err(ConfigError::WindowTooSmall {
                sampling_window,
                failure_threshold,
            });
        }
        if half_open_delay.is_zero() {
            return Err(ConfigError::NonPositive("half_open_delay"));
        }
        Ok(Self {
            service_key,
            failure_threshold,
            sampling_window,
            half_open_delay,
        })
    }
}

/// A keyed breaker's live state: phase, the time it last opened, and its
/// sliding window of recent outcomes.
pub struct BreakerState {
    phase: AtomicU8,
    opened_at_nanos: AtomicU64,
    last_access: AtomicU64,
    window: RingBuffer<bool>,
    config: BreakerConfig,
    clock: JitterClock,
    // Type-erased because `BreakerState` itself isn't generic over the
    // operation's error type (the same keyed cell is shared by every
    // `guard::<T, E, _>` call for this key). Populated by `trip` with
    // whatever failure caused the open transition; `cause_for::<E>` hands
    // it back out to a later rejection on the same key when `E` matches.
    last_trip_cause: Mutex<Option<Box<dyn Any + Send>>>,
}

impl BreakerState {
    fn record(&self, success: bool) {
        self.window.add(success);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Forces the breaker back to `Closed` with an empty window, for
    /// operator-triggered resets.
    pub fn reset(&self) {
        self.window.reset();
        self.opened_at_nanos.store(0, Ordering::Release);
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        *self.last_trip_cause.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Runs `op` through the breaker: rejects immediately while `Open` (and
    /// the recovery timer hasn't elapsed), admits exactly one probe while
    /// transitioning `Open -> HalfOpen`, and rejects any further caller
    /// that merely observes `HalfOpen` without having won that transition.
    pub async fn guard<T, E, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: std::future::Future<Output = Result<T, ResilienceError<E>>>,
        E: Clone + Send + 'static,
    {
        loop {
            match self.phase() {
                Phase::Closed => break,
                Phase::HalfOpen => {
                    debug!(service_key = %self.config.service_key, "breaker: rejecting, half-open probe already in flight");
                    return Err(ResilienceError::CircuitOpen {
                        service_key: self.config.service_key.clone(),
                        cause: self.cause_for::<E>(),
                    });
                }
                Phase::Open => {
                    let opened_at = self.opened_at_nanos.load(Ordering::Acquire);
                    let elapsed = Duration::from_nanos(self.clock.now_nanos().saturating_sub(opened_at));
                    if elapsed < self.config.half_open_delay {
                        return Err(ResilienceError::CircuitOpen {
                            service_key: self.config.service_key.clone(),
                            cause: self.cause_for::<E>(),
                        });
                    }
                    match self.phase.compare_exchange(
                        PHASE_OPEN,
                        PHASE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            info!(service_key = %self.config.service_key, "breaker: half-open, admitting one probe");
                            break;
                        }
                        Err(_) => continue,
                    }
                }
            }
        }

        match op().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    /// Retrieves the error that most recently tripped the breaker, if one
    /// was recorded and it was produced by the same `E` this caller is
    /// instantiated with. Mismatched `E` (a different pipeline sharing the
    /// same key) downcasts to `None`, matching the "usually `None`"
    /// documented default.
    fn cause_for<E: Clone + 'static>(&self) -> Option<Box<ResilienceError<E>>> {
        self.last_trip_cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|boxed| boxed.downcast_ref::<ResilienceError<E>>())
            .cloned()
            .map(Box::new)
    }

    fn on_success(&self) {
        self.record(true);
        if self.phase() == Phase::HalfOpen {
            self.window.reset();
            self.opened_at_nanos.store(0, Ordering::Release);
            self.phase.store(PHASE_CLOSED, Ordering::Release);
            *self.last_trip_cause.lock().unwrap_or_else(|e| e.into_inner()) = None;
            info!(service_key = %self.config.service_key, "breaker: probe succeeded, closing");
        }
    }

    fn on_failure<E: Clone + Send + 'static>(&self, err: &ResilienceError<E>) {
        self.record(false);
        match self.phase() {
            Phase::HalfOpen => {
                self.trip(err);
                warn!(service_key = %self.config.service_key, "breaker: probe failed, reopening");
            }
            Phase::Closed => {
                let failures = self.window.count_where(|ok| !*ok);
                if failures >= self.config.failure_threshold
                    && self.window.count() >= self.config.sampling_window
                {
                    self.trip(err);
                    warn!(
                        service_key = %self.config.service_key,
                        failures,
                        threshold = self.config.failure_threshold,
                        "breaker: failure threshold reached, opening"
                    );
                }
            }
            Phase::Open => {}
        }
    }

    fn trip<E: Clone + Send + 'static>(&self, cause: &ResilienceError<E>) {
        self.opened_at_nanos.store(self.clock.now_nanos(), Ordering::Release);
        self.phase.store(PHASE_OPEN, Ordering::Release);
        *self.last_trip_cause.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Box::new(cause.clone()) as Box<dyn Any + Send>);
    }
}

impl KeyedState for BreakerState {
    type Config = BreakerConfig;

    fn build(_key: &str, config: Self::Config, clock: JitterClock) -> Self {
        let window = RingBuffer::new(config.sampling_window);
        Self {
            phase: AtomicU8::new(PHASE_CLOSED),
            opened_at_nanos: AtomicU64::new(0),
            last_access: AtomicU64::new(clock.now_nanos()),
            window,
            config,
            clock,
        }
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }

    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}
