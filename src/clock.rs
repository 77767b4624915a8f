//! Monotonic time and decorrelated-jitter delay computation (C1).
//!
//! A `Clock` trait / `MonotonicClock` pair and a decorrelated-jitter
//! sampler, generalized into a single `JitterClock` that both the
//! breaker's recovery timer and the retry driver's backoff computation
//! share.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

/// A source of monotonically increasing nanosecond ticks.
///
/// Abstracted so tests can substitute a controllable clock rather than
/// calling `Instant::now()` directly.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_nanos(&self) -> u64;
}

/// The default `Clock`, backed by `std::time::Instant`.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_nanos(&self) -> u64 {
        (**self).now_nanos()
    }
}

/// A shared, cloneable clock plus decorrelated-jitter delay computation.
///
/// Cloning is cheap (an `Arc` bump); every strategy that needs "now" or a
/// backoff delay holds its own `JitterClock` pointing at the same
/// underlying [`Clock`].
#[derive(Clone, Debug)]
pub struct JitterClock {
    clock: Arc<dyn Clock>,
}

impl JitterClock {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    pub fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    /// Computes the delay before the next attempt.
    ///
    /// `attempt` is 1-indexed (the delay before the first retry is
    /// `attempt == 1`). When `disable_jitter` is set, this is plain
    /// exponential backoff: `base * 2^(attempt-1)`, capped at
    /// `max_delay_cap`. Otherwise it is AWS-style decorrelated jitter:
    /// `uniform(base, min(previous * 3, max_delay_cap))`, falling back to
    /// `base` when that range is empty.
    pub fn next_delay(
        &self,
        base: Duration,
        previous: Duration,
        attempt: u32,
        disable_jitter: bool,
        max_delay_cap: Duration,
    ) -> Duration {
        if disable_jitter {
            let exponent = attempt.saturating_sub(1);
            let multiplier = 2u32.saturating_pow(exponent);
            base.checked_mul(multiplier)
                .unwrap_or(max_delay_cap)
                .min(max_delay_cap)
        } else {
            let mut rng = rand::rng();
            self.next_delay_with_rng(base, previous, max_delay_cap, &mut rng)
        }
    }

    /// Same as [`Self::next_delay`]'s jittered branch, but with an injected
    /// RNG for deterministic tests.
    pub fn next_delay_with_rng<R: Rng>(
        &self,
        base: Duration,
        previous: Duration,
        max_delay_cap: Duration,
        rng: &mut R,
    ) -> Duration {
        let upper = previous.saturating_mul(3).min(max_delay_cap);
        if base >= upper {
            return base.min(max_delay_cap);
        }
        let lo = base.as_nanos() as u64;
        let hi = upper.as_nanos() as u64;
        Duration::from_nanos(rng.random_range(lo..=hi))
    }
}

impl Default for JitterClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn disabled_jitter_doubles_each_attempt() {
        let clock = JitterClock::new();
        let base = Duration::from_millis(10);
        let cap = Duration::from_secs(10);
        assert_eq!(
            clock.next_delay(base, base, 1, true, cap),
            Duration::from_millis(10)
        );
        assert_eq!(
            clock.next_delay(base, base, 2, true, cap),
            Duration::from_millis(20)
        );
        assert_eq!(
            clock.next_delay(base, base, 3, true, cap),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn disabled_jitter_respects_cap() {
        let clock = JitterClock::new();
        let base = Duration::from_millis(10);
        let cap = Duration::from_millis(25);
        assert_eq!(clock.next_delay(base, base, 5, true, cap), cap);
    }

    #[test]
    fn decorrelated_jitter_stays_within_bounds() {
        let clock = JitterClock::new();
        let base = Duration::from_millis(10);
        let previous = Duration::from_millis(10);
        let cap = Duration::from_secs(10);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = clock.next_delay_with_rng(base, previous, cap, &mut rng);
            assert!(delay >= base);
            assert!(delay <= previous.saturating_mul(3).min(cap));
        }
    }

    #[test]
    fn decorrelated_jitter_caps_at_max_delay() {
        let clock = JitterClock::new();
        let base = Duration::from_millis(10);
        let previous = Duration::from_secs(100);
        let cap = Duration::from_secs(5);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let delay = clock.next_delay_with_rng(base, previous, cap, &mut rng);
            assert!(delay <= cap);
            assert!(delay >= base);
        }
    }

    #[test]
    fn decorrelated_jitter_falls_back_to_base_when_range_is_empty() {
        let clock = JitterClock::new();
        let base = Duration::from_secs(1);
        let previous = Duration::from_millis(1);
        let cap = Duration::from_secs(10);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(clock.next_delay_with_rng(base, previous, cap, &mut rng), base);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }
}
