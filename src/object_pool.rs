use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// A thread-safe pool of byte buffers for the send path.
///
/// Channels copy unsent payload tails into pooled buffers instead of allocating a
/// fresh `Vec` per partial write. Buffers return to the pool when the send queue
/// drops them. At most `max_idle` buffers are kept; extras are freed.
#[derive(Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<VecDeque<Vec<u8>>>>,
    buffer_capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Creates a pool with `initial` preallocated buffers of `buffer_capacity` bytes.
    pub fn new(initial: usize, buffer_capacity: usize) -> Self {
        let max_idle = initial.max(1);
        let mut idle = VecDeque::with_capacity(max_idle);
        for _ in 0..initial {
            idle.push_back(Vec::with_capacity(buffer_capacity));
        }

        Self {
            idle: Arc::new(Mutex::new(idle)),
            buffer_capacity,
            max_idle,
        }
    }

    /// Takes an empty buffer from the pool, allocating one when the pool is dry.
    #[inline]
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = lock(&self.idle)
            .pop_front()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));

        PooledBuffer {
            buffer,
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
            buffer_capacity: self.buffer_capacity,
        }
    }

    /// Acquires a buffer holding a copy of `data`.
    pub fn acquire_with(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.acquire();
        buffer.extend_from_slice(data);
        buffer
    }

    /// Returns the approximate number of idle buffers.
    pub fn available(&self) -> usize {
        lock(&self.idle).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16, 4096)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

// A poisoned pool only means another thread panicked mid push/pop on a VecDeque,
// which leaves it structurally intact.
fn lock(idle: &Mutex<VecDeque<Vec<u8>>>) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
    idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A buffer that goes back to its pool, cleared, when dropped.
///
/// Buffers that grew past the pool's buffer capacity are freed instead, so one
/// large payload does not stay parked in the pool.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    idle: Arc<Mutex<VecDeque<Vec<u8>>>>,
    max_idle: usize,
    buffer_capacity: usize,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    #[inline]
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        if buffer.capacity() > self.buffer_capacity {
            return;
        }
        let mut idle = lock(&self.idle);
        if idle.len() < self.max_idle {
            buffer.clear();
            idle.push_back(buffer);
        }
    }
}
