//! Size-class buffer pool.
//!
//! Requests are rounded up to the next power of two (minimum 64 bytes) and
//! served from a per-class free list. Released buffers go back on the free
//! list of the largest class their capacity still covers.
//!
//! # Design
//!
//! - One short `parking_lot::Mutex` per size class; callers never hold it
//! - Each class keeps at most `max_retained_per_class` idle buffers
//! - Buffers above `max_pooled_size` are allocated and freed normally
//! - Contents are NOT cleared beyond resetting the length

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{allocate, BufferProvider, BufferRecycler, PooledBuffer, DEFAULT_MAX_BUFFER_SIZE};
use crate::error::Result;

/// Smallest size class.
pub const MIN_CLASS_SIZE: usize = 64;

/// Default idle buffers kept per class.
pub const DEFAULT_MAX_RETAINED_PER_CLASS: usize = 16;

/// Default largest pooled class (4 MiB).
pub const DEFAULT_MAX_POOLED_SIZE: usize = 4 * 1024 * 1024;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Largest class served from free lists. Rounded up to a power of two.
    pub max_pooled_size: usize,
    /// Idle buffers kept per class.
    pub max_retained_per_class: usize,
    /// Requests above this size fail with `Allocation`.
    pub max_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pooled_size: DEFAULT_MAX_POOLED_SIZE,
            max_retained_per_class: DEFAULT_MAX_RETAINED_PER_CLASS,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Requests served from a free list.
    pub hits: usize,
    /// Requests that needed a fresh allocation.
    pub misses: usize,
    /// Buffers put back on a free list.
    pub recycled: usize,
    /// Buffers dropped on return (class full or unpooled size).
    pub discarded: usize,
}

struct PoolShared {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    config: PoolConfig,
    hits: AtomicUsize,
    misses: AtomicUsize,
    recycled: AtomicUsize,
    discarded: AtomicUsize,
}

impl PoolShared {
    /// Class index for a request of `size` bytes, `None` if unpooled.
    fn class_for_request(&self, size: usize) -> Option<usize> {
        let rounded = size.max(MIN_CLASS_SIZE).checked_next_power_of_two()?;
        let index = (rounded.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize;
        (index < self.classes.len()).then_some(index)
    }

    /// Largest class fully covered by `capacity`, `None` if unpooled.
    fn class_for_capacity(&self, capacity: usize) -> Option<usize> {
        if capacity < MIN_CLASS_SIZE {
            return None;
        }
        let floor_bits = usize::BITS - 1 - capacity.leading_zeros();
        let index = (floor_bits - MIN_CLASS_SIZE.trailing_zeros()) as usize;
        Some(index.min(self.classes.len() - 1))
    }

    fn class_size(index: usize) -> usize {
        MIN_CLASS_SIZE << index
    }
}

impl BufferRecycler for PoolShared {
    fn recycle(&self, mut buf: Vec<u8>) {
        let Some(index) = self.class_for_capacity(buf.capacity()) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if buf.capacity() > 2 * self.config.max_pooled_size {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        buf.clear();
        let mut free = self.classes[index].lock();
        if free.len() < self.config.max_retained_per_class {
            free.push(buf);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pool of reusable buffers, shareable across connections.
///
/// Cloning is cheap and clones share the same free lists.
#[derive(Clone)]
pub struct PowerOfTwoBufferPool {
    shared: Arc<PoolShared>,
}

impl PowerOfTwoBufferPool {
    /// Create a pool with default configuration.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with custom configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let max_class = config
            .max_pooled_size
            .max(MIN_CLASS_SIZE)
            .next_power_of_two();
        let class_count =
            (max_class.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize + 1;
        let classes = (0..class_count).map(|_| Mutex::new(Vec::new())).collect();

        Self {
            shared: Arc::new(PoolShared {
                classes,
                config,
                hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Number of idle buffers across all classes.
    pub fn idle_count(&self) -> usize {
        self.shared.classes.iter().map(|c| c.lock().len()).sum()
    }
}

impl Default for PowerOfTwoBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PowerOfTwoBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerOfTwoBufferPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferProvider for PowerOfTwoBufferPool {
    fn get_buffer(&self, min_size: usize) -> Result<PooledBuffer> {
        let shared = &self.shared;

        let Some(index) = shared.class_for_request(min_size) else {
            shared.misses.fetch_add(1, Ordering::Relaxed);
            let data = allocate(min_size, shared.config.max_buffer_size)?;
            return Ok(PooledBuffer::unpooled(data));
        };

        let reused = shared.classes[index].lock().pop();
        let data = match reused {
            Some(data) => {
                shared.hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                let size = PoolShared::class_size(index).min(shared.config.max_buffer_size);
                allocate(size.max(min_size), shared.config.max_buffer_size)?
            }
        };

        let home: Arc<dyn BufferRecycler> = shared.clone();
        Ok(PooledBuffer::pooled(data, home))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;

    fn small_pool() -> PowerOfTwoBufferPool {
        PowerOfTwoBufferPool::with_config(PoolConfig {
            max_pooled_size: 1024,
            max_retained_per_class: 2,
            max_buffer_size: 1 << 20,
        })
    }

    #[test]
    fn test_rounds_up_to_class() {
        let pool = small_pool();
        assert_eq!(pool.get_buffer(1).unwrap().capacity(), 64);
        assert_eq!(pool.get_buffer(65).unwrap().capacity(), 128);
        assert_eq!(pool.get_buffer(1024).unwrap().capacity(), 1024);
    }

    #[test]
    fn test_reuses_released_buffer() {
        let pool = small_pool();

        let mut buf = pool.get_buffer(100).unwrap();
        buf.extend_from_slice(b"previous contents");
        let ptr = buf.as_ptr();
        buf.release();

        let again = pool.get_buffer(120).unwrap();
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_retention_limit() {
        let pool = small_pool();
        let bufs: Vec<_> = (0..3).map(|_| pool.get_buffer(64).unwrap()).collect();
        drop(bufs);

        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_large_requests_are_unpooled() {
        let pool = small_pool();
        let buf = pool.get_buffer(4096).unwrap();
        assert!(buf.capacity() >= 4096);
        drop(buf);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_oversized_request_fails() {
        let pool = small_pool();
        let err = pool.get_buffer((1 << 20) + 1).unwrap_err();
        assert!(matches!(err, WireError::Allocation { .. }));
    }

    #[test]
    fn test_grown_buffer_goes_to_covered_class() {
        let pool = small_pool();
        let mut buf = pool.get_buffer(64).unwrap();
        buf.extend_from_slice(&[0u8; 200]); // grows past its class
        buf.release();

        // 200+ byte capacity covers the 128 class, so a 128 request is a hit
        let again = pool.get_buffer(128).unwrap();
        assert!(again.capacity() >= 128);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_concurrent_get_buffer() {
        let pool = PowerOfTwoBufferPool::new();

        std::thread::scope(|s| {
            for t in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for i in 0..200 {
                        let mut buf = pool.get_buffer(64 + (i * t) % 2048).unwrap();
                        buf.extend_from_slice(&[t as u8; 16]);
                        assert_eq!(buf[0], t as u8);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 8 * 200);
    }
}
