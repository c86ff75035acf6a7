//! Shared receive buffers and [`DataChunk`], implementing a zero-copy rule: a
//! receive path reuses one buffer across reads as long as the user callback
//! doesn't retain it, and allocates a fresh one the moment it does.

use std::rc::Rc;
use std::cell::RefCell;

/// A reference-counted, interior-mutable byte buffer handed to user
/// callbacks as part of a [`DataChunk`]. `Rc` (not `Arc`) is correct here:
/// every handle and every buffer is confined to a single reactor thread, so
/// atomic refcounting would be pure overhead.
pub type SharedBuffer = Rc<RefCell<Vec<u8>>>;

/// A read-only view handed to receive callbacks: `{buffer, size, offset}`.
/// `offset` is the cumulative byte count received on the owning handle so
/// far, not a byte offset within `buffer`.
#[derive(Clone)]
pub struct DataChunk {
    buffer: SharedBuffer,
    size: usize,
    offset: u64,
}

impl DataChunk {
    pub fn new(buffer: SharedBuffer, size: usize, offset: u64) -> DataChunk {
        DataChunk {
            buffer,
            size,
            offset,
        }
    }

    /// Borrows the chunk's bytes. Panics if the buffer is already mutably
    /// borrowed elsewhere, which cannot happen through this crate's own API
    /// since receive buffers are only ever mutated between reads, never
    /// while a `DataChunk` referencing them is alive in a callback.
    pub fn bytes(&self) -> std::cell::Ref<'_, [u8]> {
        std::cell::Ref::map(self.buffer.borrow(), |v| &v[..self.size])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Retains the underlying shared buffer past the callback's return,
    /// extending its lifetime. Doing so is what the read pool (see
    /// [`BufferPool::reclaim`]) detects via `Rc::strong_count`.
    pub fn retain_buffer(&self) -> SharedBuffer {
        Rc::clone(&self.buffer)
    }
}

/// Owns at most one buffer and hands out zero-copy reads.
///
/// `take_or_allocate` is called before scheduling the next OS read;
/// `reclaim` is called right after a `DataChunk` built from `current` has
/// been handed to (and returned from) the user's receive callback.
#[derive(Default)]
pub struct BufferPool {
    current: Option<SharedBuffer>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool { current: None }
    }

    /// Returns a buffer of at least `suggested_size`, reusing the pooled one
    /// when present and large enough, allocating otherwise.
    pub fn take_or_allocate(&mut self, suggested_size: usize) -> SharedBuffer {
        match self.current.take() {
            Some(buf) => {
                if buf.borrow().len() < suggested_size {
                    buf.borrow_mut().resize(suggested_size, 0);
                }
                buf
            }
            None => Rc::new(RefCell::new(vec![0u8; suggested_size])),
        }
    }

    /// After a read completes and the chunk has been delivered: if nothing
    /// else holds a reference to `buf` (`strong_count == 1`, i.e. only this
    /// pool's own clone plus the one just returned), keep it for reuse.
    /// Otherwise the user retained it — drop our handle so a fresh buffer is
    /// allocated on the next read.
    pub fn reclaim(&mut self, buf: SharedBuffer) {
        if Rc::strong_count(&buf) == 1 {
            self.current = Some(buf);
        } else {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_when_not_retained() {
        let mut pool = BufferPool::new();
        let buf = pool.take_or_allocate(16);
        let ptr = Rc::as_ptr(&buf);
        pool.reclaim(buf);
        let buf2 = pool.take_or_allocate(16);
        assert_eq!(Rc::as_ptr(&buf2), ptr, "buffer should have been reused");
    }

    #[test]
    fn dropped_when_retained() {
        let mut pool = BufferPool::new();
        let buf = pool.take_or_allocate(16);
        let retained = Rc::clone(&buf); // simulates the user pinning it
        pool.reclaim(buf);
        let buf2 = pool.take_or_allocate(16);
        assert_ne!(
            Rc::as_ptr(&buf2),
            Rc::as_ptr(&retained),
            "a retained buffer must not be reused"
        );
    }
}
