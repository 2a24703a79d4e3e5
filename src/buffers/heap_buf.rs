use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-capacity, pre-allocated byte buffer with an explicit length. This is
///  the unit of memory that moves between channels, the router and the
///  application layer: whoever holds the buffer owns it exclusively, and it is
///  returned to the [`MemoryPool`](super::memory_pool::MemoryPool) exactly once.
///
/// Implements `BufMut` to fit into the `bytes` ecosystem.
#[derive(Eq)]
pub struct HeapBuf {
    buf: Vec<u8>,
    len: usize,
}

impl HeapBuf {
    /// create a new buffer with the given capacity. The backing memory is
    ///  eagerly initialized - buffers are reused aggressively, so the one-time
    ///  initialization cost is traded for simplicity
    pub fn new(capacity: usize) -> HeapBuf {
        HeapBuf {
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

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// make the entire underlying buffer available through as_mut() - used to
    ///  pass the buffer as a receive target for a whole datagram
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// This is a convenience function for test code. It derives the buffer's
    ///  capacity from the initialization slice, which is a shortcut not
    ///  intended for production usage.
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> HeapBuf {
        let mut result = HeapBuf::new(data.len());
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for HeapBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for HeapBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for HeapBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for HeapBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for HeapBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for HeapBuf {
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
