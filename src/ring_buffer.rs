//! Fixed-capacity circular byte buffer used for inbound socket data.
//!
//! Writes are two-phase so the channel can `read(2)` straight into the buffer:
//!
//! ```text
//!   lock_size() ──> lock_ptr() ──> socket.read(region) ──> commit(n)
//!   reserve          borrow region   write in place          account n bytes, unlock
//! ```
//!
//! Bytes written into the reserved region but not committed do not count as data.
//! Only one reservation may be outstanding at a time. Cursors are monotonic
//! counters; positions are taken modulo the capacity, so `used = write - read`.

use crate::error::{Error, Result};

pub struct RingBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    locked: Option<usize>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParameters("ring buffer capacity must be non-zero"));
        }
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            locked: None,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.write.wrapping_sub(self.read)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    #[inline]
    pub fn full(&self) -> bool {
        self.used() == self.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    /// Reserves the contiguous writable region and returns its length.
    ///
    /// The region ends at the physical end of the buffer or at the read cursor,
    /// whichever comes first. Returns 0 without reserving anything when the buffer
    /// is full or a reservation is already outstanding.
    pub fn lock_size(&mut self) -> usize {
        if self.locked.is_some() {
            return 0;
        }
        let size = self.contiguous_free();
        if size > 0 {
            self.locked = Some(size);
        }
        size
    }

    /// The region reserved by the last [`lock_size`](Self::lock_size).
    pub fn lock_ptr(&mut self) -> Result<&mut [u8]> {
        let size = self.locked.ok_or(Error::RingBufferNotLocked)?;
        let start = self.write % self.capacity();
        Ok(&mut self.buf[start..start + size])
    }

    /// Accounts `n` bytes of the reserved region as data and releases the lock.
    pub fn commit(&mut self, n: usize) -> Result<()> {
        let reserved = match self.locked {
            Some(reserved) => reserved,
            None => {
                debug_assert!(false, "commit without an outstanding lock");
                return Err(Error::RingBufferNotLocked);
            }
        };
        if n > reserved {
            debug_assert!(false, "commit of {n} bytes exceeds reservation of {reserved}");
            return Err(Error::InvalidParameters("commit exceeds reserved size"));
        }
        self.write = self.write.wrapping_add(n);
        self.locked = None;
        Ok(())
    }

    /// Contiguous unread bytes starting at the read cursor.
    pub fn read_ptr(&self) -> &[u8] {
        let start = self.read % self.capacity();
        &self.buf[start..start + self.read_size()]
    }

    pub fn read_size(&self) -> usize {
        let start = self.read % self.capacity();
        self.used().min(self.capacity() - start)
    }

    pub fn consume(&mut self, n: usize) -> Result<()> {
        let used = self.used();
        if n > used {
            return Err(Error::InsufficientCapacity {
                requested: n,
                available: used,
            });
        }
        self.read = self.read.wrapping_add(n);
        Ok(())
    }

    /// Copies `data` in, wrapping if needed. All or nothing.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.locked.is_some() {
            return Err(Error::RingBufferLocked);
        }
        if data.len() > self.available() {
            return Err(Error::InsufficientCapacity {
                requested: data.len(),
                available: self.available(),
            });
        }
        let mut written = 0;
        while written < data.len() {
            let size = self.lock_size();
            let chunk = size.min(data.len() - written);
            self.lock_ptr()?[..chunk].copy_from_slice(&data[written..written + chunk]);
            self.commit(chunk)?;
            written += chunk;
        }
        Ok(written)
    }

    /// Copies up to `out.len()` bytes out without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.used());
        let cap = self.capacity();
        let start = self.read % cap;
        let first = count.min(cap - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..count].copy_from_slice(&self.buf[..count - first]);
        count
    }

    /// Copies up to `out.len()` bytes out and consumes them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = self.peek(out);
        self.read = self.read.wrapping_add(count);
        count
    }

    fn contiguous_free(&self) -> usize {
        let start = self.write % self.capacity();
        self.available().min(self.capacity() - start)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("locked", &self.locked)
            .finish()
    }
}
