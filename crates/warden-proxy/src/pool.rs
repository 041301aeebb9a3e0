//! Pooled byte buffers.
//!
//! Relay buffers and rewind buffers are checked out of a bounded free-list
//! and handed back when the guard drops, so connection churn does not turn
//! into allocator churn.
//!
//! ```text
//! BufferPool::get() --> PooledBuffer (single owner)
//!                              |
//!                              v
//!                       drop / error path
//!                              |
//!                              v
//!                 returned to ArrayQueue (or freed if full)
//! ```

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of one relay buffer (per direction, per connection).
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Initial capacity of a rewind record buffer.
pub const REWIND_BUFFER_SIZE: usize = 4 * 1024;

/// Rewind buffers that grew beyond this are freed instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Default number of idle buffers a pool keeps around.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// How a pool hands out its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Buffer length is always `size` (read target for a copy loop).
    Fixed,
    /// Buffer starts empty with `size` capacity and grows on demand.
    Growable,
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl PoolStats {
    /// Buffers allocated because the pool was empty.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Buffers served from the pool.
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Buffers handed back to the pool.
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers freed because the pool was full or they grew too large.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Bounded, lock-free pool of byte vectors.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    size: usize,
    kind: BufferKind,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool keeping at most `capacity` idle buffers of `size` bytes.
    pub fn new(capacity: usize, size: usize, kind: BufferKind) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            size,
            kind,
            stats: PoolStats::default(),
        })
    }

    /// Pool of fixed 32 KiB relay buffers.
    pub fn relay() -> Arc<Self> {
        Self::new(DEFAULT_POOL_CAPACITY, RELAY_BUFFER_SIZE, BufferKind::Fixed)
    }

    /// Pool of growable rewind buffers.
    pub fn rewind() -> Arc<Self> {
        Self::new(DEFAULT_POOL_CAPACITY, REWIND_BUFFER_SIZE, BufferKind::Growable)
    }

    /// Check a buffer out of the pool, allocating if none is idle.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = match self.buffers.pop() {
            Some(buf) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.size)
            }
        };

        match self.kind {
            BufferKind::Fixed => buf.resize(self.size, 0),
            BufferKind::Growable => buf.clear(),
        }

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY.max(self.size) {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        match self.buffers.push(buf) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A buffer checked out of a [`BufferPool`]; goes back on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Mutable access to the backing vector (for growable buffers).
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_buffer_has_full_length() {
        let pool = BufferPool::new(4, 128, BufferKind::Fixed);
        let buf = pool.get();
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn test_growable_buffer_starts_empty() {
        let pool = BufferPool::new(4, 128, BufferKind::Growable);
        let mut buf = pool.get();
        assert!(buf.is_empty());
        buf.as_vec_mut().extend_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = BufferPool::new(4, 128, BufferKind::Fixed);
        {
            let _buf = pool.get();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);
    }

    #[test]
    fn test_buffer_reused() {
        let pool = BufferPool::new(4, 128, BufferKind::Fixed);
        drop(pool.get());
        drop(pool.get());
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 1);
    }

    #[test]
    fn test_reused_growable_buffer_is_cleared() {
        let pool = BufferPool::new(4, 16, BufferKind::Growable);
        {
            let mut buf = pool.get();
            buf.as_vec_mut().extend_from_slice(b"stale");
        }
        let buf = pool.get();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_full_pool_drops_buffer() {
        let pool = BufferPool::new(1, 16, BufferKind::Fixed);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_oversized_growable_buffer_not_retained() {
        let pool = BufferPool::new(4, 16, BufferKind::Growable);
        {
            let mut buf = pool.get();
            buf.as_vec_mut().resize(MAX_RETAINED_CAPACITY + 1, 0);
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.stats().drops(), 1);
    }
}
