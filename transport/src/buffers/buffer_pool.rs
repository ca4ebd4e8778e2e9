use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;

/// A pool of equally sized [FixedBuf]s. There is one pool per peer, shared by all of its
///  connections and channels.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Returns an empty buffer. The buffer goes back to the pool when the returned handle is
    ///  dropped or explicitly released.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            buffers.pop()
        };

        let buf = match buf {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                FixedBuf::new(self.buf_size)
            }
        };

        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn release(&self, mut buf: FixedBuf) {
        if buf.capacity() != self.buf_size {
            debug!("discarding buffer with irregular capacity {}", buf.capacity());
            return;
        }
        buf.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buf);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// A buffer on loan from a [BufferPool]. Ownership guarantees that it is returned exactly once.
pub struct PooledBuf {
    buf: Option<FixedBuf>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Return the buffer to its pool now rather than when the handle goes out of scope
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PooledBuf {
    type Target = FixedBuf;

    fn deref(&self) -> &FixedBuf {
        self.buf.as_ref()
            .expect("buffer is present until the handle is dropped")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut FixedBuf {
        self.buf.as_mut()
            .expect("buffer is present until the handle is dropped")
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.deref().fmt(f)
    }
}
