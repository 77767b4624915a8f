//! Concurrent keyed map with LRU eviction (C6).
//!
//! A plain `Mutex<HashMap<..>>` is the right tool here because the map
//! itself is not the hot path — the lock-free work lives inside each
//! `BreakerState`/`BucketState`/`SemaphoreCell` entry, not in the map that
//! finds them. `get_or_create` builds a candidate entry *outside* the lock
//! (construction may touch the clock) and only takes the lock to install or
//! discard it; the loser of a creation race disposes its own candidate
//! rather than leaking it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::clock::JitterClock;
use crate::error::{ConfigError, ResilienceError};

/// A value a [`KeyedStore`] can hold.
///
/// `Config` is the immutable configuration the state was built from;
/// `STRICT_CONFIG` decides what happens when `get_or_create` is called
/// again for the same key with a *different* config: `false` (the default,
/// used by breakers and bulkheads) means the first caller's configuration
/// wins and later callers silently reuse it; `true` (used by the rate
/// limiter) means a mismatch is reported as
/// [`ResilienceError::InvalidConfigChange`].
pub trait KeyedState: Send + Sync + Sized + 'static {
    type Config: Clone + PartialEq + Send + Sync;

    fn build(key: &str, config: Self::Config, clock: JitterClock) -> Self;
    fn config(&self) -> &Self::Config;
    fn last_access(&self) -> &AtomicU64;

    /// Whether a config mismatch on reuse is an error rather than a
    /// silent first-writer-wins.
    const STRICT_CONFIG: bool = false;

    /// Called on an entry that is being evicted or was the losing side of
    /// a creation race, so it can release any resource it owns (a
    /// bulkhead's semaphore permits, for instance) before being dropped.
    fn dispose(&self) {}

    fn touch(&self, now_nanos: u64) {
        self.last_access().store(now_nanos, Ordering::Release);
    }
}

/// The minimum number of entries evicted once `max_size` is exceeded, as a
/// fraction of `max_size`, on top of the raw overflow.
const EVICTION_HEADROOM_DIVISOR: usize = 10;

thread_local! {
    static EVICTION_BUFFER: std::cell::RefCell<Vec<(u64, String)>> =
        std::cell::RefCell::new(Vec::new());
}

pub struct KeyedStore<S: KeyedState> {
    entries: Mutex<HashMap<String, Arc<S>>>,
    eviction_gate: Mutex<()>,
    max_size: usize,
    clock: JitterClock,
}

impl<S: KeyedState> KeyedStore<S> {
    pub fn new(max_size: usize, clock: JitterClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            eviction_gate: Mutex::new(()),
            max_size,
            clock,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns the entry for `key`, creating it with `config` if absent.
    ///
    /// If `S::STRICT_CONFIG` is set and an existing entry's config differs
    /// from `config`, returns `InvalidConfigChange` instead of silently
    /// reusing the existing entry.
    pub fn get_or_create<E>(
        &self,
        key: &str,
        config: S::Config,
    ) -> Result<Arc<S>, ResilienceError<E>> {
        {
            let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = guard.get(key) {
                if S::STRICT_CONFIG && existing.config() != &config {
                    return Err(ResilienceError::InvalidConfigChange {
                        service_key: key.to_string(),
                    });
                }
                existing.touch(self.clock.now_nanos());
                return Ok(existing.clone());
            }
        }

        // Build outside the lock: construction may call the clock, and we
        // don't want to hold the map lock across arbitrary state setup.
        let candidate = Arc::new(S::build(key, config.clone(), self.clock.clone()));

        let installed = {
            let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match guard.get(key) {
                Some(existing) => {
                    if S::STRICT_CONFIG && existing.config() != &config {
                        return Err(ResilienceError::InvalidConfigChange {
                            service_key: key.to_string(),
                        });
                    }
                    existing.touch(self.clock.now_nanos());
                    existing.clone()
                }
                None => {
                    guard.insert(key.to_string(), candidate.clone());
                    candidate.clone()
                }
            }
        };

        // Lost the race: another caller's entry is the one installed.
        // Dispose of our own candidate rather than let it linger unused.
        if !Arc::ptr_eq(&installed, &candidate) {
            candidate.dispose();
        } else {
            self.maybe_evict();
        }

        Ok(installed)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<S>> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if let Some(entry) = &removed {
            entry.dispose();
        }
        removed
    }

    pub fn clear(&self) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in guard.drain() {
            entry.dispose();
        }
    }

    /// Runs at most one LRU eviction pass, skipping entirely if another
    /// thread is already running one. Insertion never blocks on eviction.
    fn maybe_evict(&self) {
        let Ok(_gate) = self.eviction_gate.try_lock() else {
            return;
        };
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() <= self.max_size {
            return;
        }
        let overflow = guard.len() - self.max_size;
        let headroom = (self.max_size / EVICTION_HEADROOM_DIVISOR).max(1);
        let batch = overflow + headroom;

        EVICTION_BUFFER.with(|cell| {
            let mut buf = cell.borrow_mut();
            buf.clear();
            buf.reserve(batch);

            for (key, entry) in guard.iter() {
                let ts = entry.last_access().load(Ordering::Acquire);
                if buf.len() < batch {
                    buf.push((ts, key.clone()));
                    buf.sort_unstable_by_key(|(t, _)| *t);
                } else if ts < buf[batch - 1].0 {
                    buf[batch - 1] = (ts, key.clone());
                    buf.sort_unstable_by_key(|(t, _)| *t);
                }
            }

            debug!(
                evicting = buf.len(),
                count = guard.len(),
                max_size = self.max_size,
                "keyed store: running LRU eviction pass"
            );
            for (_, key) in buf.iter() {
                if let Some(entry) = guard.remove(key) {
                    entry.dispose();
                }
            }
        });
    }
}

/// Shared validation for keyed configs: the resource key must be non-empty.
pub(crate) fn validate_key(key: &str) -> Result<(), ConfigError> {
    if key.is_empty() {
        Err(ConfigError::EmptyKey)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug, PartialEq, Clone)]
    struct DummyConfig(u32);

    struct DummyState {
        config: DummyConfig,
        last_access: StdAtomicU64,
        disposed: std::sync::atomic::AtomicBool,
    }

    impl KeyedState for DummyState {
        type Config = DummyConfig;
        const STRICT_CONFIG: bool = false;

        fn build(_key: &str, config: Self::Config, clock: JitterClock) -> Self {
            Self {
                config,
                last_access: StdAtomicU64::new(clock.now_nanos()),
                disposed: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn config(&self) -> &Self::Config {
            &self.config
        }

        fn last_access(&self) -> &AtomicU64 {
            &self.last_access
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::Release);
        }
    }

    struct StrictState {
        config: DummyConfig,
        last_access: StdAtomicU64,
    }

    impl KeyedState for StrictState {
        type Config = DummyConfig;
        const STRICT_CONFIG: bool = true;

        fn build(_key: &str, config: Self::Config, clock: JitterClock) -> Self {
            Self {
                config,
                last_access: StdAtomicU64::new(clock.now_nanos()),
            }
        }

        fn config(&self) -> &Self::Config {
            &self.config
        }

        fn last_access(&self) -> &AtomicU64 {
            &self.last_access
        }
    }

    #[test]
    fn creates_and_reuses_entries() {
        let store: KeyedStore<DummyState> = KeyedStore::new(16, JitterClock::new());
        let a = store
            .get_or_create::<String>("svc", DummyConfig(1))
            .unwrap();
        let b = store
            .get_or_create::<String>("svc", DummyConfig(99))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().0, 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn strict_config_rejects_mismatched_reuse() {
        let store: KeyedStore<StrictState> = KeyedStore::new(16, JitterClock::new());
        store.get_or_create::<String>("svc", DummyConfig(1)).unwrap();
        let err = store
            .get_or_create::<String>("svc", DummyConfig(2))
            .unwrap_err();
        assert!(matches!(err, ResilienceError::InvalidConfigChange { .. }));
    }

    #[test]
    fn remove_disposes_the_entry() {
        let store: KeyedStore<DummyState> = KeyedStore::new(16, JitterClock::new());
        let entry = store
            .get_or_create::<String>("svc", DummyConfig(1))
            .unwrap();
        store.remove("svc");
        assert!(entry.disposed.load(Ordering::Acquire));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn eviction_keeps_most_recently_touched_entries() {
        let store: KeyedStore<DummyState> = KeyedStore::new(4, JitterClock::new());
        for i in 0..10 {
            store
                .get_or_create::<String>(&format!("svc-{i}"), DummyConfig(i))
                .unwrap();
        }
        assert!(store.count() <= 4 + 1, "eviction should keep roughly max_size entries");
        // the most recently created key must have survived
        assert!(store
            .get_or_create::<String>("svc-9", DummyConfig(9))
            .is_ok());
    }

    #[test]
    fn clear_disposes_every_entry() {
        let store: KeyedStore<DummyState> = KeyedStore::new(16, JitterClock::new());
        let a = store.get_or_create::<String>("a", DummyConfig(1)).unwrap();
        let b = store.get_or_create::<String>("b", DummyConfig(2)).unwrap();
        store.clear();
        assert!(a.disposed.load(Ordering::Acquire));
        assert!(b.disposed.load(Ordering::Acquire));
        assert_eq!(store.count(), 0);
    }
}
