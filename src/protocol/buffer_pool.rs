//! Fixed-size I/O buffers with checkout/checkin discipline.
//!
//! Store and retrieve loops check buffers out for the duration of one
//! request. The [`PooledBuffer`] guard hands its buffer back on drop, so a
//! buffer returns to the pool on every exit path including `?` early returns.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared pool of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    checked_out: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `buffer_size` byte buffers keeping at most `max_idle`
    /// returned buffers around for reuse.
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Mutex::new(Vec::new()),
            checked_out: AtomicU64::new(0),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a zeroed buffer out of the pool, allocating if none is idle.
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; self.buffer_size],
        };
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Check out `count` buffers at once (segment lists).
    pub fn checkout_many(self: &Arc<Self>, count: usize) -> Vec<PooledBuffer> {
        (0..count.max(1)).map(|_| self.checkout()).collect()
    }

    /// Buffers currently held by requests.
    pub fn checked_out(&self) -> u64 {
        self.checked_out.load(Ordering::Relaxed)
    }

    /// Buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn checkin(&self, buf: Vec<u8>) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle && buf.len() == self.buffer_size {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
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
            self.pool.checkin(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(16, 4);
        {
            let mut a = pool.checkout();
            let _b = pool.checkout();
            a[0] = 7;
            assert_eq!(a.len(), 16);
            assert_eq!(pool.checked_out(), 2);
        }
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.idle(), 2);

        let reused = pool.checkout();
        assert!(reused.iter().all(|b| *b == 0));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn idle_set_is_bounded() {
        let pool = BufferPool::new(8, 1);
        drop(pool.checkout_many(3));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn buffers_return_on_early_exit() {
        fn fails(pool: &Arc<BufferPool>) -> Result<(), ()> {
            let _buf = pool.checkout();
            Err(())
        }
        let pool = BufferPool::new(8, 4);
        assert!(fails(&pool).is_err());
        assert_eq!(pool.checked_out(), 0);
    }
}
