//! Bounded FIFO of idle work connections for one session.

use std::collections::VecDeque;

/// Idle work connections waiting to be claimed by user connections.
///
/// Pushes never block: once `capacity` connections are idle, or after
/// [`close`](Self::close), the connection is handed back to the caller to be
/// dropped.
#[derive(Debug)]
pub struct WorkConnPool<T> {
    conns: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> WorkConnPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            conns: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// Add an idle connection, or return it if the pool is full or closed.
    pub fn try_push(&mut self, conn: T) -> Result<(), T> {
        if self.closed || self.conns.len() >= self.capacity {
            return Err(conn);
        }
        self.conns.push_back(conn);
        Ok(())
    }

    /// Oldest idle connection, if any.
    pub fn pop(&mut self) -> Option<T> {
        self.conns.pop_front()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuse further pushes and hand back everything still idle.
    pub fn close(&mut self) -> Vec<T> {
        self.closed = true;
        self.conns.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut pool = WorkConnPool::new(3);
        pool.try_push(1).unwrap();
        pool.try_push(2).unwrap();
        assert_eq!(pool.pop(), Some(1));
        assert_eq!(pool.pop(), Some(2));
        assert_eq!(pool.pop(), None);
    }

    #[test]
    fn test_push_beyond_capacity_is_refused() {
        let mut pool = WorkConnPool::new(2);
        pool.try_push("a").unwrap();
        pool.try_push("b").unwrap();
        assert_eq!(pool.try_push("c"), Err("c"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_close_drains_and_refuses() {
        let mut pool = WorkConnPool::new(4);
        pool.try_push(1).unwrap();
        pool.try_push(2).unwrap();
        assert_eq!(pool.close(), vec![1, 2]);
        assert!(pool.is_closed());
        assert!(pool.is_empty());
        assert_eq!(pool.try_push(3), Err(3));
    }
}
