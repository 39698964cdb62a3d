//! Reusable fixed-size byte buffers for connection relays.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Size of one relay copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_MAX_IDLE: usize = 256;

/// A free list of equally sized buffers.
///
/// Acquisition never waits: an idle buffer is reused when available,
/// otherwise a new one is allocated. Buffers come back through
/// [`PooledBuffer`]'s `Drop`, so every exit path of a copy loop releases
/// its buffer.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self::with_max_idle(size, DEFAULT_MAX_IDLE)
    }

    /// Create a pool that keeps at most `max_idle` released buffers.
    pub fn with_max_idle(size: usize, max_idle: usize) -> Self {
        Self {
            size,
            max_idle,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Number of released buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(RELAY_BUFFER_SIZE)
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
