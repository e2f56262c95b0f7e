//! Fixed-size handshake buffers
//!
//! Handshakes are read into a buffer borrowed from a shared free-list so
//! that accepting connections does not allocate per connection. Borrowing
//! never blocks: an empty pool hands out a fresh allocation, and a full
//! pool drops returned buffers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Lock-free pool of equally sized byte buffers.
pub struct BufferPool {
    buffers: ArrayQueue<Box<[u8]>>,
    buffer_len: usize,
}

impl BufferPool {
    pub fn new(buffer_len: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_len,
        })
    }

    /// Borrow a buffer; it returns to the pool when the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_len].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    fn release(&self, buf: Box<[u8]>) {
        // A full pool just lets the buffer go.
        let _ = self.buffers.push(buf);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_len", &self.buffer_len)
            .field("available", &self.available())
            .field("capacity", &self.buffers.capacity())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
