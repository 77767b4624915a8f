//! Token-bucket rate limiting (C4): `RateLimitConfig`, `BucketState`, and
//! the `RateLimit` pipeline strategy.
//!
//! Refill-then-consume over pure atomics: tokens are tracked as a
//! fixed-point `u64` in units of 1/1000 of a token, so a CAS loop can move
//! them without ever touching a float or taking a lock. The "wrap a plain
//! atomic integer to store a non-integer-shaped value" idiom mirrors how
//! `aws-smithy-runtime`'s `token_bucket.rs` stores fractional reward tokens
//! in an `AtomicU32` via bit-casts; fixed-point here serves the same
//! purpose without needing a bit-cast at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::clock::JitterClock;
use crate::error::ConfigError;
use crate::store::{validate_key, KeyedState};

/// One token, expressed in the fixed-point unit `BucketState` tracks
/// internally.
const MILLI_TOKENS_PER_TOKEN: u64 = 1000;

const REFILL_RETRIES: u32 = 10;
const ACQUIRE_RETRIES: u32 = 10;

/// Immutable configuration for one keyed token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub service_key: String,
    pub max_rate: u64,
    pub window: Duration,
    pub burst: u64,
}

impl RateLimitConfig {
    /// `burst` defaults to `max_rate` (no extra burst allowance) when
    /// `None`.
    pub fn new(
        service_key: impl Into<String>,
        max_rate: u64,
        window: Duration,
        burst: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let service_key = service_key.into();
        validate_key(&service_key)?;
        if max_rate == 0 {
            return Err(ConfigError::NonPositive("max_rate"));
        }
        if window.is_zero() {
            return Err(ConfigError::NonPositive("window"));
        }
        let burst = burst.unwrap_or(max_rate);
        if burst < max_rate {
            return Err(ConfigError::BurstBelowRate { burst, max_rate });
        }
        Ok(Self {
            service_key,
            max_rate,
            window,
            burst,
        })
    }

    fn refill_interval_nanos(&self) -> u64 {
        (self.window.as_nanos() as u64 / self.max_rate).max(1)
    }

    fn burst_milli_tokens(&self) -> u64 {
        self.burst.saturating_mul(MILLI_TOKENS_PER_TOKEN)
    }
}

/// A keyed bucket's live state: current token count (fixed-point) and the
/// last time it was refilled.
pub struct BucketState {
    tokens_milli: AtomicU64,
    last_refill_nanos: AtomicU64,
    last_access: AtomicU64,
    config: RateLimitConfig,
    clock: JitterClock,
}

impl BucketState {
    /// Refills based on elapsed time since the last refill, clamped to
    /// burst capacity. A bounded CAS loop on `last_refill_nanos` avoids a
    /// lock; losing a race just means re-reading and retrying, since a
    /// concurrent refill only ever moves time forward.
    fn refill(&self) {
        let interval = self.config.refill_interval_nanos();
        for attempt in 0..REFILL_RETRIES {
            let last = self.last_refill_nanos.load(Ordering::Acquire);
            let now = self.clock.now_nanos();
            let elapsed = now.saturating_sub(last);
            let intervals = elapsed / interval;
            if intervals == 0 {
                return;
            }
            let advanced_to = last + intervals * interval;
            if self
                .last_refill_nanos
                .compare_exchange_weak(last, advanced_to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let added = intervals.saturating_mul(MILLI_TOKENS_PER_TOKEN);
                let cap = self.config.burst_milli_tokens();
                loop {
                    let cur = self.tokens_milli.load(Ordering::Acquire);
                    let next = cur.saturating_add(added).min(cap);
                    if self
                        .tokens_milli
                        .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
                return;
            }
            if attempt < REFILL_RETRIES / 2 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Attempts to consume exactly one token. Returns `true` if a token was
    /// available and consumed, `false` if the bucket is empty (the caller
    /// should surface `Throttled`).
    pub fn try_acquire(&self) -> bool {
        self.refill();
        for attempt in 0..ACQUIRE_RETRIES {
            let cur = self.tokens_milli.load(Ordering::Acquire);
            if cur < MILLI_TOKENS_PER_TOKEN {
                return false;
            }
            if self
                .tokens_milli
                .compare_exchange_weak(
                    cur,
                    cur - MILLI_TOKENS_PER_TOKEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
            if attempt < ACQUIRE_RETRIES / 2 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        debug!(service_key = %self.config.service_key, "bucket: exhausted CAS retries, treating as throttled");
        false
    }
}

impl KeyedState for BucketState {
    type Config = RateLimitConfig;
    // A rate limit reused under a different rate/window/burst would silently
    // change the caller's effective quota, so treat it as an explicit error.
    const STRICT_CONFIG: bool = true;

    fn build(_key: &str, config: Self::Config, clock: JitterClock) -> Self {
        let tokens_milli = config.burst_milli_tokens();
        let now = clock.now_nanos();
        Self {
            tokens_milli: AtomicU64::new(tokens_milli),
            last_refill_nanos: AtomicU64::new(now),
            last_access: AtomicU64::new(now),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug, Default)]
    struct FakeClock(StdAtomicU64);

    impl Clock for FakeClock {
        fn now_nanos(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    impl FakeClock {
        fn advance(&self, d: Duration) {
            self.0.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    fn bucket(max_rate: u64, window: Duration, burst: Option<u64>) -> BucketState {
        let config = RateLimitConfig::new("svc", max_rate, window, burst).unwrap();
        BucketState::build("svc", config, JitterClock::new())
    }

    #[test]
    fn starts_full_at_burst_capacity() {
        let b = bucket(5, Duration::from_secs(1), None);
        for _ in 0..5 {
            assert!(b.try_acquire());
        }
        assert!(!b.try_acquire());
    }

    #[test]
    fn exhaustion_then_refill_over_time() {
        let b = bucket(2, Duration::from_secs(1), None);
        assert!(b.try_acquire());
        assert!(b.try_acquire());
        assert!(!b.try_acquire());
    }

    #[test]
    fn refills_deterministically_as_fake_clock_advances() {
        let clock = std::sync::Arc::new(FakeClock::default());
        let config = RateLimitConfig::new("svc", 2, Duration::from_secs(1), None).unwrap();
        let jitter_clock = JitterClock::with_clock(clock.clone());
        let b = BucketState::build("svc", config, jitter_clock);
        assert!(b.try_acquire());
        assert!(b.try_acquire());
        assert!(!b.try_acquire());

        clock.advance(Duration::from_millis(500));
        assert!(b.try_acquire());
        assert!(!b.try_acquire());

        clock.advance(Duration::from_millis(500));
        assert!(b.try_acquire());
    }

    #[test]
    fn burst_allows_more_than_sustained_rate() {
        let b = bucket(1, Duration::from_secs(1), Some(5));
        for _ in 0..5 {
            assert!(b.try_acquire());
        }
        assert!(!b.try_acquire());
    }

    #[test]
    fn rejects_burst_below_rate() {
        let err = RateLimitConfig::new("svc", 10, Duration::from_secs(1), Some(1)).unwrap_err();
        assert!(matches!(err, ConfigError::BurstBelowRate { .. }));
    }

    #[test]
    fn rejects_zero_rate_and_zero_window() {
        assert!(RateLimitConfig::new("svc", 0, Duration::from_secs(1), None).is_err());
        assert!(RateLimitConfig::new("svc", 1, Duration::ZERO, None).is_err());
    }
}
