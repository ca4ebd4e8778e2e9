//! A fixed-capacity byte buffer for reuse through the [crate::buffers::buffer_pool::BufferPool].
//!
//! * backed by a pre-allocated `Vec<u8>` that never grows
//! * tracks a logical length separately from its capacity, so a received datagram can be read
//!    into the full buffer and truncated afterwards
//! * implements `BufMut` to fit into the `bytes` ecosystem

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are pooled and reused, so eager initialization is paid once per buffer
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// make the entire underlying buffer available through as_mut(), e.g. as a target for
    ///  reading from a socket
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
