use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::heap_buf::HeapBuf;
use crate::error::TransportError;

/// smallest size class - allocations below this are rounded up
const MIN_BLOCK_SIZE: usize = 64;

/// A pool of [HeapBuf] instances in power-of-two size classes, plus pooled
///  [PointerSet] backing arrays. All channel output memory is obtained from
///  here and eventually returned here, so steady-state operation does not
///  allocate per message.
///
/// Buffers are *not* zeroed on reuse - callers write a full header and payload
///  before handing a buffer on, so zeroing would be wasted work.
///
/// The free lists are guarded by one mutex per size class; channels allocate
///  and release concurrently, and the locks are only held for a push/pop.
pub struct MemoryPool {
    max_block_size: usize,
    classes: Vec<Mutex<Vec<HeapBuf>>>,
    pointer_sets: Mutex<Vec<Vec<HeapBuf>>>,
    created_buffers: AtomicU64,
}

impl MemoryPool {
    /// `max_block_size` is the largest single allocation the pool will satisfy
    ///  (rounded up to a power of two); `class_cap` is the number of buffers
    ///  retained per size class - buffers returned in excess of this are
    ///  discarded.
    pub fn new(max_block_size: usize, class_cap: usize) -> MemoryPool {
        let max_block_size = max_block_size.next_power_of_two().max(MIN_BLOCK_SIZE);
        let num_classes = Self::class_index_unchecked(max_block_size) + 1;

        MemoryPool {
            max_block_size,
            classes: (0..num_classes)
                .map(|_| Mutex::new(Vec::with_capacity(class_cap)))
                .collect(),
            pointer_sets: Mutex::new(Vec::with_capacity(class_cap)),
            created_buffers: AtomicU64::new(0),
        }
    }

    fn class_index_unchecked(size: usize) -> usize {
        let rounded = size.next_power_of_two().max(MIN_BLOCK_SIZE);
        (rounded.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize
    }

    fn class_size(class_index: usize) -> usize {
        MIN_BLOCK_SIZE << class_index
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// number of buffers newly created (i.e. not served from a free list) over
    ///  the pool's lifetime. Steady-state churn keeps this constant.
    pub fn created_buffers(&self) -> u64 {
        self.created_buffers.load(Ordering::Relaxed)
    }

    pub fn alloc(&self, size: usize) -> Result<HeapBuf, TransportError> {
        if size > self.max_block_size {
            return Err(TransportError::OversizedAllocation {
                requested: size,
                max_block_size: self.max_block_size,
            });
        }

        let class_index = Self::class_index_unchecked(size);
        {
            let mut buffers = self.classes[class_index].lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer of class {} from pool", class_index);
                return Ok(buffer);
            }
        }

        debug!("no buffer of class {} in pool: creating new buffer", class_index);
        self.created_buffers.fetch_add(1, Ordering::Relaxed);
        Ok(HeapBuf::new(Self::class_size(class_index)))
    }

    pub fn release(&self, mut buffer: HeapBuf) {
        let class_index = Self::class_index_unchecked(buffer.capacity());
        assert_eq!(buffer.capacity(), Self::class_size(class_index),
                   "returned buffer's capacity of {} bytes is not a pool size class, it was not allocated from this pool"
                   , buffer.capacity());

        buffer.clear();

        let mut buffers = self.classes[class_index].lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool class {}", class_index);
            buffers.push(buffer);
        }
        else {
            debug!("pool class {} is full: discarding returned buffer", class_index);
        }
    }

    /// a pooled array for passing a variable number of buffers through the
    ///  router without a per-call allocation
    pub fn alloc_pointer_set(&self, capacity: usize) -> PointerSet {
        let mut bufs = {
            let mut sets = self.pointer_sets.lock().unwrap();
            sets.pop().unwrap_or_default()
        };
        if bufs.capacity() < capacity {
            bufs.reserve(capacity);
        }
        PointerSet { bufs }
    }

    /// releases the pointer set's backing array, and any buffers still in it
    pub fn release_pointer_set(&self, mut pointers: PointerSet) {
        for buffer in pointers.bufs.drain(..) {
            self.release(buffer);
        }

        let mut sets = self.pointer_sets.lock().unwrap();
        if sets.capacity() > sets.len() {
            sets.push(pointers.bufs);
        }
    }
}

/// An owned, pooled collection of [HeapBuf] handles in insertion order. Return
///  it via [MemoryPool::release_pointer_set] - buffers taken out of the set
///  individually must be released individually.
pub struct PointerSet {
    bufs: Vec<HeapBuf>,
}

impl PointerSet {
    pub fn push(&mut self, buffer: HeapBuf) {
        self.bufs.push(buffer);
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapBuf> {
        self.bufs.iter()
    }

    /// moves all buffers out of the set, leaving it empty (but still pooled)
    pub fn drain(&mut self) -> impl Iterator<Item = HeapBuf> + '_ {
        self.bufs.drain(..)
    }
}
