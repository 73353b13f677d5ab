//! Staging buffers for native calls.
//!
//! A receive stages payload in a contiguous buffer borrowed from here and
//! then copies it into the caller's `BufMut`. The borrow is a guard, so the
//! buffer goes back on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    max_cached: usize,
    active_leases: AtomicUsize,
}

impl BufferPool {
    pub(crate) fn new(max_cached: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                free_list: Mutex::new(Vec::new()),
                max_cached,
                active_leases: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a buffer of exactly `len` bytes. Bytes left by an earlier
    /// lease are not cleared; only newly grown space is zero-filled.
    pub(crate) fn acquire(&self, len: usize) -> PooledBuffer {
        let reused = {
            let mut list = self.inner.free_list.lock();
            let index = list
                .iter()
                .position(|buf| buf.capacity() >= len)
                .or_else(|| list.len().checked_sub(1));
            index.map(|index| list.swap_remove(index))
        };
        let mut buf = reused.unwrap_or_else(|| BytesMut::with_capacity(len));
        if buf.len() < len {
            buf.resize(len, 0);
        }
        self.inner.active_leases.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            len,
            pool: self.inner.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn active_leases(&self) -> usize {
        self.inner.active_leases.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.inner.free_list.lock().len()
    }
}

pub(crate) struct PooledBuffer {
    buf: Option<BytesMut>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.buf.as_deref() {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.buf.as_deref_mut() {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.active_leases.fetch_sub(1, Ordering::Relaxed);
        if let Some(buf) = self.buf.take() {
            let mut list = self.pool.free_list.lock();
            if list.len() < self.pool.max_cached {
                list.push(buf);
            }
        }
    }
}
