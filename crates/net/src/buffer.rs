//! Recycled byte buffers for socket I/O.
//!
//! Receive buffers are pool-sized and recycled aggressively; send buffers at
//! or below the pool threshold come from the same free list, while oversized
//! sends get a one-off allocation that is dropped on release instead of being
//! recycled.

use bytes::BytesMut;

/// Capacity of every pooled buffer, and the threshold above which an
/// allocation bypasses the pool.
pub const POOL_BUFFER_CAPACITY: usize = 16 * 1024;

/// How many buffers are added to the free list when it runs dry.
const POOL_GROWTH_CHUNK: usize = 16;

/// A byte region plus read/write cursors, owned by exactly one party at a
/// time: the pool, a link's queue, or the caller it was delivered to.
///
/// The backing storage is a [`BytesMut`]; writing advances the write cursor,
/// transmission consumes from the front. A pooled buffer returns its storage
/// to the free list on release, an oversized one is simply dropped.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    pooled: bool,
}

impl Buffer {
    /// The readable bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no readable bytes remain.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends `src`, growing the backing storage if it does not fit.
    pub fn put_slice(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Whether release returns this buffer to the free list.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

/// Free list of fixed-capacity buffers, grown on demand in bounded chunks.
///
/// The pool is not independently thread-safe: it lives inside the owning
/// transport's lock, which guards every allocate/release.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<BytesMut>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Returns a buffer whose capacity is at least `min_size`.
    ///
    /// Sizes at or below [`POOL_BUFFER_CAPACITY`] are served from the free
    /// list; larger sizes bypass the pool entirely. Exhaustion is not an
    /// error, the free list grows by [`POOL_GROWTH_CHUNK`] buffers instead.
    pub fn allocate(&mut self, min_size: usize) -> Buffer {
        if min_size > POOL_BUFFER_CAPACITY {
            return Buffer { data: BytesMut::with_capacity(min_size), pooled: false };
        }

        let data = match self.free.pop() {
            Some(data) => data,
            None => {
                self.grow();
                // grow() always pushes at least one buffer
                self.free.pop().unwrap_or_else(|| BytesMut::with_capacity(POOL_BUFFER_CAPACITY))
            }
        };

        Buffer { data, pooled: true }
    }

    /// Takes the buffer back: pooled storage rejoins the free list cleared,
    /// oversized storage is released to the allocator.
    pub fn release(&mut self, mut buffer: Buffer) {
        if buffer.pooled {
            buffer.data.clear();
            self.free.push(buffer.data);
        }
    }

    /// Buffers currently sitting on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn grow(&mut self) {
        self.free.reserve(POOL_GROWTH_CHUNK);
        for _ in 0..POOL_GROWTH_CHUNK {
            self.free.push(BytesMut::with_capacity(POOL_BUFFER_CAPACITY));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_allocation_recycles_storage() {
        let mut pool = BufferPool::new();

        let mut buffer = pool.allocate(1024);
        assert!(buffer.is_pooled());
        assert!(buffer.capacity() >= 1024);
        buffer.put_slice(b"hello");

        let ptr = buffer.bytes().as_ptr();
        pool.release(buffer);
        assert_eq!(pool.free_count(), POOL_GROWTH_CHUNK);

        let reused = pool.allocate(64);
        assert!(reused.is_pooled());
        assert!(reused.is_empty());
        assert_eq!(reused.data.as_ptr(), ptr);
    }

    #[test]
    fn oversized_allocation_bypasses_pool() {
        let mut pool = BufferPool::new();

        let buffer = pool.allocate(POOL_BUFFER_CAPACITY + 1);
        assert!(!buffer.is_pooled());
        assert!(buffer.capacity() > POOL_BUFFER_CAPACITY);

        pool.release(buffer);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn threshold_allocation_is_pooled() {
        let mut pool = BufferPool::new();
        let buffer = pool.allocate(POOL_BUFFER_CAPACITY);
        assert!(buffer.is_pooled());
    }

    #[test]
    fn pool_grows_in_chunks() {
        let mut pool = BufferPool::new();

        let buffers: Vec<_> = (0..POOL_GROWTH_CHUNK + 1).map(|_| pool.allocate(16)).collect();
        assert_eq!(pool.free_count(), POOL_GROWTH_CHUNK - 1);

        for buffer in buffers {
            pool.release(buffer);
        }
        assert_eq!(pool.free_count(), 2 * POOL_GROWTH_CHUNK);
    }
}
