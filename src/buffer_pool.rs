//! Lock-free buffer pools for packet and message scratch space.
//!
//! Hot paths reuse `BytesMut` allocations through tiered `ArrayQueue` pools
//! instead of allocating per packet. Misses fall back to a fresh allocation,
//! so the pools are an optimization, never a correctness dependency.

use bytes::BytesMut;
use std::sync::LazyLock;

/// Fixed-capacity lock-free pool of equally-sized buffers.
pub struct BufferPool {
    pool: crossbeam_queue::ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: std::sync::atomic::AtomicUsize,
}

impl BufferPool {
    pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
        Self {
            pool: crossbeam_queue::ArrayQueue::new(max_buffers),
            buffer_size,
            hits: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Pop a pooled buffer or allocate a fresh one.
    pub fn try_get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Return a buffer; silently dropped when the pool is full or the
    /// capacity drifted too far from this tier.
    pub fn try_put(&self, mut buf: BytesMut) {
        if buf.capacity() >= self.buffer_size / 2 && buf.capacity() <= self.buffer_size * 2 {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }

    /// (hits, buffers currently pooled)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(std::sync::atomic::Ordering::Relaxed),
            self.pool.len(),
        )
    }
}

// Tier boundaries track the traffic shapes this crate actually produces:
//   SMALL:  512    → ack-only and control datagrams
//   PACKET: 2048   → one MTU-sized datagram with headroom
//   MESSAGE: 16384 → reassembled multi-fragment messages
//   SCRATCH: 65536 → socket receive scratch

static SMALL_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(4096, 512));
static PACKET_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(2048, 2048));
static MESSAGE_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(512, 16384));
static SCRATCH_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(128, 65536));

/// Get a buffer sized for `size_hint` from the global pools.
pub fn try_get_buffer(size_hint: usize) -> BytesMut {
    if size_hint <= 512 {
        SMALL_POOL.try_get()
    } else if size_hint <= 2048 {
        PACKET_POOL.try_get()
    } else if size_hint <= 16384 {
        MESSAGE_POOL.try_get()
    } else {
        SCRATCH_POOL.try_get()
    }
}

/// Return a buffer to the tier matching its capacity.
pub fn try_put_buffer(buf: BytesMut) {
    let capacity = buf.capacity();
    if capacity <= 1024 {
        SMALL_POOL.try_put(buf);
    } else if capacity <= 4096 {
        PACKET_POOL.try_put(buf);
    } else if capacity <= 32768 {
        MESSAGE_POOL.try_put(buf);
    } else {
        SCRATCH_POOL.try_put(buf);
    }
}

/// Per-tier (name, hits, pooled) counts for diagnostics.
pub fn buffer_pool_stats() -> Vec<(&'static str, usize, usize)> {
    vec![
        ("small", SMALL_POOL.stats().0, SMALL_POOL.stats().1),
        ("packet", PACKET_POOL.stats().0, PACKET_POOL.stats().1),
        ("message", MESSAGE_POOL.stats().0, MESSAGE_POOL.stats().1),
        ("scratch", SCRATCH_POOL.stats().0, SCRATCH_POOL.stats().1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_tier() {
        let pool = BufferPool::new(4, 2048);
        let mut buf = pool.try_get();
        buf.extend_from_slice(&[1, 2, 3]);
        pool.try_put(buf);

        let again = pool.try_get();
        assert!(again.is_empty(), "pooled buffers come back cleared");
        assert_eq!(pool.stats().0, 1, "second get was a pool hit");
    }

    #[test]
    fn oversized_returns_are_dropped() {
        let pool = BufferPool::new(4, 1024);
        pool.try_put(BytesMut::with_capacity(65536));
        assert_eq!(pool.stats().1, 0);
    }
}
