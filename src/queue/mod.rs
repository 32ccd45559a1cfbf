//! Queue primitives shared by the worker pool and the scheduler
//!
//! - [`PriorityQueue`]: comparator-driven binary heap, used for pending decode
//!   tasks and per-pass tile ranking
//! - [`FifoQueue`]: ring buffer for breadth-first index traversal

pub mod fifo;
pub mod priority;

pub use fifo::FifoQueue;
pub use priority::PriorityQueue;
