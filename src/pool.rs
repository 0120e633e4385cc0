//! Elastic resource pool.
//!
//! A bounded, lazily-growing pool of expensive reusable objects. The pool never blocks:
//! when every slot up to the hard maximum is in use, [`ElasticPool::acquire`] calls the
//! depletion callback and returns `None`. Callers throttle by skipping work, not by
//! waiting.
//!
//! The pool is not synchronized on its own. It is driven by whoever owns it, and shared
//! holders wrap it in a mutex that is held only for the acquire/release itself.
use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::session::Session;

/// Session pool of one shared-resources group.
pub type SessionPool = Arc<Mutex<ElasticPool<Session>>>;

/// Lazily-growing, capped, non-blocking pool.
///
/// Invariant: `used() <= capacity() <= max_capacity()`.
pub struct ElasticPool<T> {
    free: Vec<T>,
    created: usize,
    max: usize,
    factory: Box<dyn FnMut() -> T + Send>,
    on_depleted: Box<dyn FnMut() + Send>,
    min_used: usize,
    max_used: usize,
}

impl<T> ElasticPool<T> {
    /// Creates an empty pool. Resources are created by `factory` on demand, at most
    /// `max` of them. `on_depleted` runs every time an acquire finds nothing available.
    pub fn new<F, D>(max: usize, factory: F, on_depleted: D) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        D: FnMut() + Send + 'static,
    {
        Self {
            free: Vec::new(),
            created: 0,
            max,
            factory: Box::new(factory),
            on_depleted: Box::new(on_depleted),
            min_used: 0,
            max_used: 0,
        }
    }

    pub fn acquire(&mut self) -> Option<T> {
        let item = match self.free.pop() {
            Some(item) => item,
            None if self.created < self.max => {
                self.created += 1;
                (self.factory)()
            }
            None => {
                (self.on_depleted)();
                return None;
            }
        };
        self.max_used = self.max_used.max(self.used());
        Some(item)
    }

    pub fn release(&mut self, item: T) {
        debug_assert!(
            self.free.len() < self.created,
            "released more items than the pool ever handed out"
        );
        self.free.push(item);
        self.min_used = self.min_used.min(self.used());
    }

    /// Resources currently handed out.
    pub fn used(&self) -> usize {
        self.created - self.free.len()
    }

    /// Resources created so far.
    pub fn capacity(&self) -> usize {
        self.created
    }

    pub fn max_capacity(&self) -> usize {
        self.max
    }

    /// Lowest `used()` observed since the last [`reset_stats`](Self::reset_stats).
    pub fn min_used(&self) -> usize {
        self.min_used
    }

    /// Highest `used()` observed since the last [`reset_stats`](Self::reset_stats).
    pub fn max_used(&self) -> usize {
        self.max_used
    }

    pub fn reset_stats(&mut self) {
        let used = self.used();
        self.min_used = used;
        self.max_used = used;
    }
}

impl<T> fmt::Debug for ElasticPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticPool")
            .field("used", &self.used())
            .field("capacity", &self.created)
            .field("max", &self.max)
            .field("min_used", &self.min_used)
            .field("max_used", &self.max_used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(max: usize) -> (ElasticPool<usize>, Arc<AtomicUsize>) {
        let depleted = Arc::new(AtomicUsize::new(0));
        let counter = depleted.clone();
        let mut next = 0;
        let pool = ElasticPool::new(
            max,
            move || {
                next += 1;
                next
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        (pool, depleted)
    }

    #[test]
    fn grows_lazily_up_to_max() {
        let (mut pool, depleted) = counting_pool(3);
        assert_eq!(pool.capacity(), 0);
        let a = pool.acquire().unwrap();
        assert_eq!((pool.capacity(), pool.used()), (1, 1));
        pool.release(a);
        // released item is reused, nothing new is created
        assert_eq!(pool.acquire(), Some(a));
        assert_eq!(pool.capacity(), 1);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.used(), 3);
        assert_eq!(depleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn used_never_exceeds_max_and_acquire_fails_only_when_full() {
        let (mut pool, depleted) = counting_pool(5);
        let mut held = Vec::new();
        // Deterministic pseudo-random acquire/release mix.
        let mut seed: u32 = 0x9E37_79B9;
        let mut expected_failures = 0;
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 != 0 {
                let full = pool.used() == pool.max_capacity();
                match pool.acquire() {
                    Some(item) => {
                        assert!(!full);
                        held.push(item);
                    }
                    None => {
                        assert!(full);
                        expected_failures += 1;
                    }
                }
            } else if let Some(item) = held.pop() {
                pool.release(item);
            }
            assert!(pool.used() <= pool.capacity());
            assert!(pool.capacity() <= pool.max_capacity());
            assert_eq!(pool.used(), held.len());
        }
        assert_eq!(depleted.load(Ordering::SeqCst), expected_failures);
    }

    #[test]
    fn zero_sized_pool_is_always_depleted() {
        let (mut pool, depleted) = counting_pool(0);
        assert!(pool.acquire().is_none());
        assert!(pool.acquire().is_none());
        assert_eq!(depleted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watermarks_track_and_reset() {
        let (mut pool, _) = counting_pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.max_used(), 3);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.min_used(), 0);
        pool.reset_stats();
        assert_eq!((pool.min_used(), pool.max_used()), (1, 1));
        pool.release(c);
        assert_eq!((pool.min_used(), pool.max_used()), (0, 1));
    }
}
