//! Comparator-driven binary heap
//!
//! `cmp(a, b) == Ordering::Less` means `a` is popped before `b`. Equal items
//! come out in no particular order.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, StreamError};

/// Binary min-heap ordered by a comparator closure
pub struct PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    heap: Vec<T>,
    cmp: F,
}

impl<T, F> PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    /// Create an empty queue with the given comparator
    pub fn new(cmp: F) -> Self {
        Self { heap: Vec::new(), cmp }
    }

    /// Create an empty queue with room for `capacity` items
    pub fn with_capacity(capacity: usize, cmp: F) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            cmp,
        }
    }

    /// Build a queue from arbitrary items in O(n)
    pub fn from_vec(items: Vec<T>, cmp: F) -> Self {
        let mut queue = Self { heap: items, cmp };
        for i in (0..queue.heap.len() / 2).rev() {
            queue.sift_down(i);
        }
        queue
    }

    /// Insert an item
    pub fn push(&mut self, item: T) {
        self.heap.push(item);
        let last = self.heap.len() - 1;
        self.sift_up(last);
    }

    /// Remove and return the minimum item, `None` when empty
    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Remove and return the minimum item; emptiness is an error
    pub fn try_pop(&mut self) -> Result<T> {
        self.pop().ok_or(StreamError::EmptyQueue)
    }

    /// View the minimum item without removing it
    pub fn peek(&self) -> Option<&T> {
        self.heap.first()
    }

    /// Number of held items
    pub fn count(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every item
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Iterate in heap order (not sorted)
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.heap.iter()
    }

    /// Take every item out in heap order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
    }

    /// Keep only items for which `keep` returns true, then restore heap order
    pub fn retain<P: FnMut(&T) -> bool>(&mut self, keep: P) {
        self.heap.retain(keep);
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    /// Consume the queue, yielding items in comparator order
    pub fn into_sorted_vec(mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.cmp)(&self.heap[a], &self.heap[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}

impl<T: fmt::Debug, F> fmt::Debug for PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .field("heap", &self.heap)
            .finish()
    }
}
