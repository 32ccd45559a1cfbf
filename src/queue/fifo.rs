//! FIFO ring buffer used for breadth-first octree walks

use std::collections::VecDeque;

/// First-in first-out queue over a growable ring buffer
#[derive(Debug, Clone)]
pub struct FifoQueue<T> {
    ring: VecDeque<T>,
}

impl<T> FifoQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self { ring: VecDeque::new() }
    }

    /// Create an empty queue with room for `capacity` items before growing
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
        }
    }

    /// Append at the tail
    pub fn push(&mut self, item: T) {
        self.ring.push_back(item);
    }

    /// Remove from the head
    pub fn pop(&mut self) -> Option<T> {
        self.ring.pop_front()
    }

    /// View the head
    pub fn peek(&self) -> Option<&T> {
        self.ring.front()
    }

    /// Number of held items
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Remove every item, keeping the allocation
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for FifoQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.ring.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = FifoQueue::with_capacity(2);
        q.push("a");
        q.push("b");
        q.push("c");
        assert_eq!(q.peek(), Some(&"a"));
        assert_eq!(q.pop(), Some("a"));
        q.push("d");
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), Some("c"));
        assert_eq!(q.pop(), Some("d"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_clear_and_extend() {
        let mut q = FifoQueue::new();
        q.extend(0..5);
        assert_eq!(q.len(), 5);
        q.clear();
        assert!(q.is_empty());
    }
}
