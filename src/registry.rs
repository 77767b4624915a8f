//! Shared registries of keyed resilience state (applying `KeyedStore` to
//! each of the three keyed strategies).
//!
//! A small, cloneable handle type (`Registry`) owns the `Arc`-backed stores
//! and can be shared across multiple [`crate::pipeline::Pipeline`]s that
//! target the same keyed resources (two `Pipeline`s built with the same
//! `Registry` and the same breaker key share one circuit).

use std::sync::Arc;

use crate::breaker::BreakerState;
use crate::bucket::BucketState;
use crate::bulkhead::SemaphoreCell;
use crate::clock::JitterClock;
use crate::store::KeyedStore;

/// Default cap on the number of distinct keys any one store holds before
/// its LRU eviction pass starts trimming least-recently-used entries.
pub const DEFAULT_MAX_KEYS: usize = 10_000;

/// A shared home for every keyed breaker, bucket, and bulkhead a set of
/// pipelines references by key.
#[derive(Clone)]
pub struct Registry {
    breakers: Arc<KeyedStore<BreakerState>>,
    buckets: Arc<KeyedStore<BucketState>>,
    bulkheads: Arc<KeyedStore<SemaphoreCell>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock_and_capacity(JitterClock::new(), DEFAULT_MAX_KEYS)
    }

    pub fn with_clock(clock: JitterClock) -> Self {
        Self::with_clock_and_capacity(clock, DEFAULT_MAX_KEYS)
    }

    pub fn with_clock_and_capacity(clock: JitterClock, max_keys: usize) -> Self {
        Self {
            breakers: Arc::new(KeyedStore::new(max_keys, clock.clone())),
            buckets: Arc::new(KeyedStore::new(max_keys, clock.clone())),
            bulkheads: Arc::new(KeyedStore::new(max_keys, clock)),
        }
    }

    pub fn breakers(&self) -> &Arc<KeyedStore<BreakerState>> {
        &self.breakers
    }

    pub fn buckets(&self) -> &Arc<KeyedStore<BucketState>> {
        &self.buckets
    }

    pub fn bulkheads(&self) -> &Arc<KeyedStore<SemaphoreCell>> {
        &self.bulkheads
    }

    /// Drops every keyed entry across all three stores. Intended for test
    /// teardown between cases that reuse a shared registry.
    pub fn clear(&self) {
        self.breakers.clear();
        self.buckets.clear();
        self.bulkheads.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::time::Duration;

    #[test]
    fn pipelines_sharing_a_registry_share_the_same_breaker() {
        let registry = Registry::new();
        let config = BreakerConfig::new("svc", 1, 1, Duration::from_millis(50)).unwrap();
        let a = registry.breakers().get_or_create::<()>("svc", config.clone()).unwrap();
        let b = registry.breakers().get_or_create::<()>("svc", config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn clear_empties_every_store() {
        let registry = Registry::new();
        let config = BreakerConfig::new("svc", 1, 1, Duration::from_millis(50)).unwrap();
        registry.breakers().get_or_create::<()>("svc", config).unwrap();
        registry.clear();
        assert_eq!(registry.breakers().count(), 0);
    }
}
