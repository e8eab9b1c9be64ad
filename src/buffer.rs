use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slog::info;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Consecutive reads that exactly fill a direction's buffer before it doubles.
pub const GROW_AFTER_FULL_READS: u32 = 3;

/// A fixed-capacity byte region with a filled prefix.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    filled: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.filled
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.filled]
    }

    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Marks `n` more bytes of the unfilled region as filled.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past capacity");
        self.filled += n;
    }

    /// Drops the first `n` filled bytes and moves the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.filled);
        self.data.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }

    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.data[self.filled..self.filled + src.len()].copy_from_slice(src);
        self.filled += src.len();
    }

    /// Doubles capacity until `additional` more bytes fit.
    pub fn reserve(&mut self, additional: usize) {
        while self.remaining() < additional {
            self.grow();
        }
    }

    /// Reallocates at twice the capacity, carrying the filled bytes forward.
    pub fn grow(&mut self) {
        let capacity = (self.capacity() * 2).max(1);
        let mut data = vec![0u8; capacity];
        data[..self.filled].copy_from_slice(self.filled());
        self.data = data;
    }
}

struct PoolInner {
    logger: slog::Logger,
    buffer_size: usize,
    queue: Mutex<VecDeque<Vec<u8>>>,
    extra_allocations: AtomicUsize,
    releases: AtomicUsize,
}

/// Reusable fixed-size buffers shared by every session.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(logger: slog::Logger, buffer_size: usize, pool_size: usize) -> Self {
        let queue = (0..pool_size).map(|_| vec![0u8; buffer_size]).collect();
        BufferPool {
            inner: Arc::new(PoolInner {
                logger,
                buffer_size,
                queue: Mutex::new(queue),
                extra_allocations: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }),
        }
    }

    /// Hands out an idle buffer, or a new one when the pool is drained.
    pub fn get(&self) -> PooledBuffer {
        let data = self.inner.queue.lock().pop_front();
        let data = match data {
            Some(data) => data,
            None => {
                self.inner.extra_allocations.fetch_add(1, Ordering::Relaxed);
                info!(self.inner.logger, "buffer pool is drained, allocating a new buffer";
                    "size" => self.inner.buffer_size);
                vec![0u8; self.inner.buffer_size]
            }
        };
        PooledBuffer {
            buf: Buffer { data, filled: 0 },
            pool: Some(self.clone()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers waiting in the pool.
    pub fn available(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn extra_allocations(&self) -> usize {
        self.inner.extra_allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::Relaxed)
    }

    fn put_back(&self, mut data: Vec<u8>) {
        // grown buffers leave the pool; a standard one takes their slot
        if data.len() != self.inner.buffer_size {
            data = vec![0u8; self.inner.buffer_size];
        }
        self.inner.releases.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push_back(data);
    }
}

/// A buffer borrowed from a [`BufferPool`]. Goes back to the pool on
/// [`release`](PooledBuffer::release) or on drop, whichever comes first.
pub struct PooledBuffer {
    buf: Buffer,
    pool: Option<BufferPool>,
}

impl PooledBuffer {
    pub fn release(&mut self) {
        if let Some(pool) = self.pool.take() {
            let data = std::mem::take(&mut self.buf.data);
            self.buf.filled = 0;
            pool.put_back(data);
        }
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.pool.is_none()
    }
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// The source and destination buffers of one relay direction, with the
/// bookkeeping that decides when they should grow.
pub struct Lane {
    pub src: PooledBuffer,
    pub dst: PooledBuffer,
    full_reads: u32,
}

impl Lane {
    pub fn new(src: PooledBuffer, dst: PooledBuffer) -> Self {
        Lane {
            src,
            dst,
            full_reads: 0,
        }
    }

    /// Records a read of `n` bytes into an initially empty `src`.
    /// Returns `true` when this read made both buffers double.
    pub fn record_read(&mut self, n: usize) -> bool {
        if n < self.src.capacity() {
            self.full_reads = 0;
            return false;
        }
        self.full_reads += 1;
        if self.full_reads < GROW_AFTER_FULL_READS {
            return false;
        }
        self.full_reads = 0;
        self.src.grow();
        let capacity = self.src.capacity();
        while self.dst.capacity() < capacity {
            self.dst.grow();
        }
        true
    }

    pub fn capacity(&self) -> usize {
        self.src.capacity()
    }
}
