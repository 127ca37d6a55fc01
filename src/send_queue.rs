//! Pending output of one channel.
//!
//! When a non-blocking write cannot take the whole payload, the tail is copied into
//! a pooled buffer and queued here. Insertion order is send order. The front buffer
//! carries an offset so a partially flushed buffer keeps only its unsent tail.

use std::collections::VecDeque;

use crate::object_pool::{BufferPool, PooledBuffer};

struct Pending {
    buffer: PooledBuffer,
    offset: usize,
}

impl Pending {
    fn remaining(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }
}

pub struct SendQueue {
    pending: VecDeque<Pending>,
    pool: BufferPool,
}

impl SendQueue {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pending: VecDeque::new(),
            pool,
        }
    }

    /// Copies `data` into a pooled buffer at the back of the queue.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.pending.push_back(Pending {
            buffer: self.pool.acquire_with(data),
            offset: 0,
        });
    }

    /// Unsent bytes of the oldest buffer.
    pub fn front(&self) -> Option<&[u8]> {
        self.pending.front().map(Pending::remaining)
    }

    /// Marks `n` bytes of the front buffer as written; drops it once exhausted.
    pub fn advance_front(&mut self, n: usize) {
        let Some(front) = self.pending.front_mut() else {
            return;
        };
        front.offset = (front.offset + n).min(front.buffer.len());
        if front.offset == front.buffer.len() {
            self.pending.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True once the queue holds strictly more than `limit` buffers.
    pub fn exceeds(&self, limit: usize) -> bool {
        self.pending.len() > limit
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|p| p.remaining().len()).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("buffers", &self.len())
            .field("bytes", &self.pending_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = SendQueue::new(BufferPool::new(4, 16));
        queue.push(b"first");
        queue.push(b"second");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap(), b"first");
        queue.advance_front(5);
        assert_eq!(queue.front().unwrap(), b"second");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_partial_advance_keeps_tail() {
        let mut queue = SendQueue::new(BufferPool::new(4, 16));
        queue.push(b"abcdef");
        queue.advance_front(4);
        assert_eq!(queue.front().unwrap(), b"ef");
        assert_eq!(queue.pending_bytes(), 2);
        queue.advance_front(2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_exceeds_is_strict() {
        let mut queue = SendQueue::new(BufferPool::new(4, 16));
        queue.push(b"a");
        queue.push(b"b");
        assert!(!queue.exceeds(2));
        queue.push(b"c");
        assert!(queue.exceeds(2));
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = BufferPool::new(2, 16);
        let mut queue = SendQueue::new(pool.clone());
        queue.push(b"x");
        queue.push(b"y");
        assert_eq!(pool.available(), 0);
        queue.clear();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_empty_push_ignored() {
        let mut queue = SendQueue::new(BufferPool::default());
        queue.push(b"");
        assert!(queue.is_empty());
    }
}
