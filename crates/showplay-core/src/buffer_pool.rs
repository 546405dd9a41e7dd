//! Size-bucketed byte buffer recycler
//!
//! Decode and I/O buffers are resized constantly while a show plays. Instead of
//! handing every buffer back to the allocator, released buffers are parked in a
//! free list keyed by power-of-two capacity and reused by the next request that
//! fits the same bucket.
//!
//! Each bucket has its own lock, so fetch completions running on worker threads
//! and disposals on the player task never contend on a single pool-wide mutex.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest bucket (4 KiB). Requests below this share the first bucket.
pub const MIN_BUCKET_SHIFT: u32 = 12;
/// Largest bucket (1 GiB). Bigger buffers are allocated and dropped directly.
pub const MAX_BUCKET_SHIFT: u32 = 30;

const BUCKET_COUNT: usize = (MAX_BUCKET_SHIFT - MIN_BUCKET_SHIFT + 1) as usize;

/// Configuration for [`BufferPool`]
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum buffers kept per size bucket
    pub max_per_bucket: usize,
    /// Upper bound on bytes parked across all buckets
    pub max_retained_bytes: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_per_bucket: 8,
            max_retained_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub releases: u64,
    pub discards: u64,
    pub retained_bytes: u64,
}

/// Recycles `Vec<u8>` allocations by capacity bucket.
#[derive(Debug)]
pub struct BufferPool {
    config: BufferPoolConfig,
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
    retained_bytes: AtomicU64,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            retained_bytes: AtomicU64::new(0),
        }
    }

    /// Bucket a request of `len` bytes is served from (rounds up).
    fn bucket_for_request(len: usize) -> Option<usize> {
        let shift = len
            .max(1)
            .checked_next_power_of_two()?
            .trailing_zeros()
            .max(MIN_BUCKET_SHIFT);
        (shift <= MAX_BUCKET_SHIFT).then(|| (shift - MIN_BUCKET_SHIFT) as usize)
    }

    /// Bucket a released buffer of `capacity` belongs to (rounds down, so every
    /// buffer in a bucket is at least as large as the bucket size).
    fn bucket_for_capacity(capacity: usize) -> Option<usize> {
        if capacity < (1 << MIN_BUCKET_SHIFT) {
            return None;
        }
        let shift = usize::BITS - 1 - capacity.leading_zeros();
        Some((shift.min(MAX_BUCKET_SHIFT) - MIN_BUCKET_SHIFT) as usize)
    }

    /// Get an empty buffer whose capacity is at least `capacity`.
    pub fn acquire_with_capacity(&self, capacity: usize) -> Vec<u8> {
        let Some(bucket) = Self::bucket_for_request(capacity) else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            return Vec::with_capacity(capacity);
        };

        if let Some(mut buf) = self.buckets[bucket].lock().pop() {
            self.retained_bytes
                .fetch_sub(buf.capacity() as u64, Ordering::Relaxed);
            self.reuses.fetch_add(1, Ordering::Relaxed);
            buf.clear();
            return buf;
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(1usize << (bucket as u32 + MIN_BUCKET_SHIFT))
    }

    /// Get a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        let mut buf = self.acquire_with_capacity(len);
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to the pool. Buffers that do not fit a bucket, or would
    /// push the pool past its limits, are dropped.
    pub fn release(&self, buf: Vec<u8>) {
        self.releases.fetch_add(1, Ordering::Relaxed);

        let capacity = buf.capacity();
        let Some(bucket) = Self::bucket_for_capacity(capacity) else {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let retained = self.retained_bytes.load(Ordering::Relaxed) as usize;
        if retained + capacity > self.config.max_retained_bytes {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut free = self.buckets[bucket].lock();
        if free.len() >= self.config.max_per_bucket {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.retained_bytes
            .fetch_add(capacity as u64, Ordering::Relaxed);
        free.push(buf);
    }

    /// Drop every parked buffer.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
        self.retained_bytes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            retained_bytes: self.retained_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}
