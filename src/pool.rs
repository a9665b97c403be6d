//! Bounded free-list object pool.
//!
//! Used by the UDP engine to recycle session objects and ephemeral datagram
//! sockets under connection churn. Not thread-safe by design: a pool is owned
//! by a single engine loop, and `release` is an ownership transfer back to it.

use std::collections::VecDeque;

type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type CleanupFn<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct Pool<T> {
    free: VecDeque<T>,
    max_size: usize,
    acquire_count: u64,
    hard_acquire_count: u64,
    /// Run when an object re-enters the free list.
    reset: Option<ResetFn<T>>,
    /// Run when the free list is full and the object is discarded.
    cleanup: Option<CleanupFn<T>>,
}

impl<T> Pool<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            free: VecDeque::new(),
            max_size,
            acquire_count: 0,
            hard_acquire_count: 0,
            reset: None,
            cleanup: None,
        }
    }

    pub fn with_reset(mut self, f: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.reset = Some(Box::new(f));
        self
    }

    pub fn with_cleanup(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }

    /// Pop a pooled object, or build a fresh one with `supplier`.
    pub fn acquire_with(&mut self, supplier: impl FnOnce() -> T) -> T {
        self.acquire_count += 1;
        match self.free.pop_front() {
            Some(v) => v,
            None => {
                self.hard_acquire_count += 1;
                supplier()
            }
        }
    }

    /// Pop a pooled object if one is available.
    ///
    /// A miss is counted as a hard acquire: the caller is expected to
    /// construct the object itself. This is the entry point used where
    /// construction is async (binding a datagram socket).
    pub fn try_acquire(&mut self) -> Option<T> {
        self.acquire_count += 1;
        let v = self.free.pop_front();
        if v.is_none() {
            self.hard_acquire_count += 1;
        }
        v
    }

    /// Return an object to the pool, or discard it if the free list is full.
    pub fn release(&mut self, mut value: T) {
        if self.free.len() < self.max_size {
            if let Some(reset) = &self.reset {
                reset(&mut value);
            }
            self.free.push_back(value);
        } else if let Some(cleanup) = &self.cleanup {
            cleanup(value);
        }
    }

    /// Adjust the capacity. Already-pooled items are untouched; an oversized
    /// free list drains through subsequent `release` calls.
    pub fn resize(&mut self, new_max: usize) {
        self.max_size = new_max;
    }

    pub fn size(&self) -> usize {
        self.free.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn hard_acquire_count(&self) -> u64 {
        self.hard_acquire_count
    }

    /// Fraction of acquires served from the free list. Observability only.
    pub fn hit_rate(&self) -> f64 {
        if self.acquire_count == 0 {
            return 0.0;
        }
        (self.acquire_count - self.hard_acquire_count) as f64 / self.acquire_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_empty_pool_uses_supplier() {
        let mut pool: Pool<Vec<u8>> = Pool::new(4);
        let v = pool.acquire_with(|| vec![1, 2, 3]);
        assert_eq!(v, vec![1, 2, 3]);
        assert_eq!(pool.hard_acquire_count(), 1);
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let mut pool: Pool<Vec<u8>> = Pool::new(4);
        pool.release(vec![9]);
        let v = pool.acquire_with(Vec::new);
        assert_eq!(v, vec![9]);
        assert_eq!(pool.hard_acquire_count(), 0);
    }

    #[test]
    fn test_free_list_never_exceeds_max() {
        let mut pool: Pool<u32> = Pool::new(3);
        for i in 0..10 {
            pool.release(i);
        }
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_soft_reset_runs_on_pooled_release() {
        let mut pool: Pool<Vec<u8>> = Pool::new(2).with_reset(|v: &mut Vec<u8>| v.clear());
        pool.release(vec![1, 2, 3]);
        let v = pool.acquire_with(Vec::new);
        assert!(v.is_empty());
    }

    #[test]
    fn test_hard_cleanup_runs_on_overflow() {
        let discarded = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&discarded);
        let mut pool: Pool<u32> = Pool::new(1).with_cleanup(move |v| {
            sink.lock().unwrap().push(v);
        });
        pool.release(1);
        pool.release(2);
        pool.release(3);
        assert_eq!(*discarded.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_try_acquire_counts_misses() {
        let mut pool: Pool<u32> = Pool::new(2);
        assert!(pool.try_acquire().is_none());
        pool.release(7);
        assert_eq!(pool.try_acquire(), Some(7));
        assert_eq!(pool.hard_acquire_count(), 1);
        assert!((pool.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_with_hooks_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}
        let pool: Pool<Vec<u8>> = Pool::new(2)
            .with_reset(|v: &mut Vec<u8>| v.clear())
            .with_cleanup(drop);
        assert_send_sync(&pool);
    }

    #[test]
    fn test_hit_rate_zero_without_acquires() {
        let pool: Pool<u32> = Pool::new(2);
        assert_eq!(pool.hit_rate(), 0.0);
    }

    #[test]
    fn test_resize_does_not_touch_pooled_items() {
        let mut pool: Pool<u32> = Pool::new(4);
        for i in 0..4 {
            pool.release(i);
        }
        pool.resize(2);
        assert_eq!(pool.size(), 4);
        // New releases are rejected until the list drains below the new max.
        pool.release(99);
        assert_eq!(pool.size(), 4);
        pool.try_acquire();
        pool.try_acquire();
        pool.try_acquire();
        assert_eq!(pool.size(), 1);
        pool.release(100);
        assert_eq!(pool.size(), 2);
    }
}
