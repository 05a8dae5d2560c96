//! Payload buffer pooling.
//!
//! Every link reads payloads into buffers drawn from a shared pool and hands
//! ownership along with the decoded packet; whoever finishes delivery
//! releases the buffer back. Buffers above the frame cap are never pooled,
//! and the pool keeps at most a fixed number of spares.

use std::sync::Mutex;

use bytes::BytesMut;

use crate::frame::MAX_FRAME_SIZE;

/// Maximum number of spare buffers kept by a pool.
const MAX_POOLED: usize = 64;

/// Initial capacity for a fresh pooled buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A shared pool of reusable payload buffers.
#[derive(Debug)]
pub struct BufferPool {
    spares: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            spares: Mutex::new(Vec::new()),
        }
    }

    /// Takes a cleared buffer with at least `len` capacity.
    pub fn acquire(&self, len: usize) -> BytesMut {
        let mut spares = self.spares.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = spares.pop().unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY.max(len)));
        drop(spares);
        buf.clear();
        if buf.capacity() < len {
            buf.reserve(len - buf.capacity());
        }
        buf
    }

    /// Returns a buffer to the pool once its packet has been delivered.
    ///
    /// Oversize or surplus buffers are simply dropped.
    pub fn release(&self, buf: BytesMut) {
        if buf.capacity() > MAX_FRAME_SIZE {
            return;
        }
        let mut spares = self.spares.lock().unwrap_or_else(|e| e.into_inner());
        if spares.len() < MAX_POOLED {
            spares.push(buf);
        }
    }

    #[cfg(test)]
    fn spare_count(&self) -> usize {
        self.spares.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_buffers() {
        let pool = BufferPool::new();
        let buf = pool.acquire(128);
        let cap = buf.capacity();
        pool.release(buf);
        assert_eq!(pool.spare_count(), 1);

        let again = pool.acquire(64);
        assert_eq!(again.capacity(), cap);
        assert_eq!(pool.spare_count(), 0);
    }

    #[test]
    fn acquired_buffers_are_cleared_and_sized() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(16);
        buf.extend_from_slice(b"leftover");
        pool.release(buf);

        let buf = pool.acquire(1024);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn oversize_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        let buf = BytesMut::with_capacity(MAX_FRAME_SIZE + 1);
        pool.release(buf);
        assert_eq!(pool.spare_count(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new();
        for _ in 0..(MAX_POOLED + 16) {
            pool.release(BytesMut::with_capacity(64));
        }
        assert_eq!(pool.spare_count(), MAX_POOLED);
    }
}
