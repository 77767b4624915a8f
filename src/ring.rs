//! Fixed-capacity, lock-free sliding window (C2).
//!
//! The breaker's sampling window needs a bounded history of recent outcomes
//! that many threads can append to and summarize concurrently without a
//! lock on the hot path. `#![forbid(unsafe_code)]` rules out a raw
//! `UnsafeCell`/`MaybeUninit` ring; instead this backs each slot with
//! `crossbeam_utils::atomic::AtomicCell<T>`, which gives the same
//! lock-free word-sized slot without leaving safe Rust.
//!
//! Reads use a seqlock: a version counter is odd while a write is in
//! progress and even otherwise, so a reader that observes the same even
//! version before and after scanning the slots knows it saw a consistent
//! snapshot. Writers serialize through a small mutex (appends are not the
//! contended path; summarizing the window is).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_utils::atomic::AtomicCell;

const SEQLOCK_RETRIES: u32 = 8;

/// A fixed-capacity ring of the last `capacity` items written to it.
///
/// `count()` and `count_where()` report over "the last `capacity` items
/// written so far", which is fewer than `capacity` until the ring has been
/// filled at least once.
pub struct RingBuffer<T> {
    slots: Box<[AtomicCell<T>]>,
    capacity: usize,
    write_index: AtomicU64,
    version: AtomicU64,
    write_lock: Mutex<()>,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be positive");
        let slots = (0..capacity)
            .map(|_| AtomicCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity,
            write_index: AtomicU64::new(0),
            version: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an item, evicting the oldest if the ring is full.
    pub fn add(&self, item: T) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.version.fetch_add(1, Ordering::AcqRel);
        let idx = (self.write_index.load(Ordering::Relaxed) as usize) % self.capacity;
        self.slots[idx].store(item);
        self.write_index.fetch_add(1, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Number of items currently held (`<= capacity`).
    pub fn count(&self) -> usize {
        (self.write_index.load(Ordering::Acquire) as usize).min(self.capacity)
    }

    /// Counts the items in the window matching `pred`.
    ///
    /// Attempts a lock-free seqlock read first; if a writer keeps
    /// interrupting the scan for `SEQLOCK_RETRIES` attempts, falls back to
    /// taking the write lock for one consistent pass.
    pub fn count_where<F: Fn(&T) -> bool>(&self, pred: F) -> usize {
        for _ in 0..SEQLOCK_RETRIES {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let matches = self.scan(&pred);
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return matches;
            }
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.scan(&pred)
    }

    fn scan<F: Fn(&T) -> bool>(&self, pred: &F) -> usize {
        let write_index = self.write_index.load(Ordering::Acquire);
        let count = (write_index as usize).min(self.capacity) as u64;
        let start = write_index - count;
        (0..count)
            .filter(|i| {
                let idx = ((start + i) % self.capacity as u64) as usize;
                pred(&self.slots[idx].load())
            })
            .count()
    }

    /// Clears the window back to empty.
    pub fn reset(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.version.fetch_add(1, Ordering::AcqRel);
        for slot in self.slots.iter() {
            slot.store(T::default());
        }
        self.write_index.store(0, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_buffer_counts_zero() {
        let ring: RingBuffer<bool> = RingBuffer::new(4);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.count_where(|b| *b), 0);
    }

    #[test]
    fn partially_filled_window_reports_actual_count() {
        let ring: RingBuffer<bool> = RingBuffer::new(4);
        ring.add(true);
        ring.add(false);
        assert_eq!(ring.count(), 2);
        assert_eq!(ring.count_where(|b| !*b), 1);
        assert_eq!(ring.count_where(|b| *b), 1);
    }

    #[test]
    fn full_window_evicts_oldest() {
        let ring: RingBuffer<bool> = RingBuffer::new(3);
        ring.add(false);
        ring.add(false);
        ring.add(false);
        ring.add(true);
        ring.add(true);
        // window now holds the last 3 writes: [false, true, true]
        assert_eq!(ring.count(), 3);
        assert_eq!(ring.count_where(|b| *b), 2);
        assert_eq!(ring.count_where(|b| !*b), 1);
    }

    #[test]
    fn reset_clears_the_window() {
        let ring: RingBuffer<bool> = RingBuffer::new(3);
        ring.add(true);
        ring.add(true);
        ring.reset();
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.count_where(|b| *b), 0);
    }

    #[test]
    fn concurrent_writers_and_readers_never_panic_or_diverge() {
        let ring = Arc::new(RingBuffer::<bool>::new(16));
        let mut handles = Vec::new();
        for i in 0..8 {
            let ring = ring.clone();
            handles.push(thread::spawn(move || {
                for j in 0..200 {
                    ring.add((i + j) % 2 == 0);
                    let _ = ring.count_where(|b| *b);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.count(), 16);
        assert!(ring.count_where(|b| *b) <= 16);
    }
}
