use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// A bounded free list of byte buffers. Writers borrow a buffer per
/// profile, serialize into it, and the buffer returns to the pool cleared
/// on every exit path. Contention is minimal, only the profiler loop
/// writes.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            buffers: Mutex::new(Vec::new()),
            max_buffers,
        })
    }

    pub fn check_out(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self.buffers.lock().pop().unwrap_or_default();
        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    fn check_in(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }
}

/// A buffer checked out of a `BufferPool`. Dropping it hands the storage
/// back to the pool.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buffer.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.check_in(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(2);

        let mut buffer = pool.check_out();
        buffer.extend_from_slice(b"hello");
        let capacity = buffer.capacity();
        drop(buffer);

        let buffer = pool.check_out();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(1);

        let mut first = pool.check_out();
        let mut second = pool.check_out();
        first.push(1);
        second.push(2);
        drop(first);
        drop(second);

        assert_eq!(pool.buffers.lock().len(), 1);
    }

    #[test]
    fn buffers_come_back_cleared() {
        let pool = BufferPool::new(4);
        {
            let mut buffer = pool.check_out();
            buffer.extend_from_slice(&[1, 2, 3]);
        }
        assert!(pool.check_out().is_empty());
    }
}
