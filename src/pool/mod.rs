//! Bounded decode worker pool
//!
//! ## Table of Contents
//! - **TaskId / WorkerId**: Identifiers for submitted tasks and workers
//! - **DecodeTask**: One unit of decode work with a mutable score
//! - **QueuedTask**: A task waiting for a worker
//! - **TaskOutcome**: Result reported back by a worker
//! - **PoolStatus**: Active and queued counts, published after every change
//! - **WorkerPool**: Lazy workers, priority backlog, rescoring
//!
//! Workers run on tokio; everything else here is touched only by the
//! scheduling side. A task is *queued* until a worker takes it, then
//! *dispatched* and out of reach of `rescore` and `cancel`.

mod worker;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::decode::{DecodeRequest, DecodedAttributes, Decoder};
use crate::error::{DecodeError, Result, StreamError};
use crate::queue::PriorityQueue;
use crate::types::TileId;

use worker::{Job, Running, WorkerSlot};

/// Identifier of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw sequence number
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifier of a worker within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Decode work for one tile
#[derive(Debug, Clone)]
pub struct DecodeTask {
    /// Tile the result belongs to
    pub tile: TileId,
    /// Load generation of the tile at submission
    pub epoch: u64,
    /// What to decode
    pub request: DecodeRequest,
    /// Priority, higher runs first; mutable while queued
    pub score: f64,
    /// Points the tile is expected to contribute
    pub points: u64,
}

/// A task waiting for a worker
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// Task id
    pub id: TaskId,
    /// The work itself
    pub task: DecodeTask,
}

/// Result of a dispatched task
#[derive(Debug)]
pub struct TaskOutcome {
    /// Task id
    pub task: TaskId,
    /// Tile the task decoded
    pub tile: TileId,
    /// Load generation at submission
    pub epoch: u64,
    /// Points the task was budgeted for
    pub points: u64,
    /// Worker that ran it
    pub worker: WorkerId,
    /// Decoded attributes or the decoder's failure
    pub result: std::result::Result<DecodedAttributes, DecodeError>,
}

/// Snapshot published after every pool mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Tasks currently running on a worker
    pub active: usize,
    /// Tasks waiting for a worker
    pub queued: usize,
}

type ScoreOrder = fn(&QueuedTask, &QueuedTask) -> Ordering;

fn highest_score_first(a: &QueuedTask, b: &QueuedTask) -> Ordering {
    b.task.score.total_cmp(&a.task.score)
}

/// Bounded pool of decode workers
pub struct WorkerPool<D: Decoder> {
    decoder: Arc<D>,
    size: usize,
    runtime: Handle,
    workers: Vec<WorkerSlot>,
    idle: Vec<usize>,
    pending: PriorityQueue<QueuedTask, ScoreOrder>,
    results_tx: mpsc::UnboundedSender<TaskOutcome>,
    results_rx: mpsc::UnboundedReceiver<TaskOutcome>,
    undeliverable: VecDeque<TaskOutcome>,
    status: watch::Sender<PoolStatus>,
    next_task: u64,
}

impl<D: Decoder> WorkerPool<D> {
    /// Create a pool of at most `size` workers on the current tokio runtime.
    /// Workers are spawned lazily on first need.
    pub fn new(decoder: Arc<D>, size: usize) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| StreamError::runtime(e.to_string()))?;
        Self::with_runtime(decoder, size, runtime)
    }

    /// Create a pool whose workers run on `runtime`
    pub fn with_runtime(decoder: Arc<D>, size: usize, runtime: Handle) -> Result<Self> {
        if size == 0 {
            return Err(StreamError::config("worker pool size must be at least 1"));
        }
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PoolStatus::default());
        Ok(Self {
            decoder,
            size,
            runtime,
            workers: Vec::with_capacity(size),
            idle: Vec::with_capacity(size),
            pending: PriorityQueue::new(highest_score_first as ScoreOrder),
            results_tx,
            results_rx,
            undeliverable: VecDeque::new(),
            status,
            next_task: 0,
        })
    }

    /// Maximum number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers spawned so far
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks currently running
    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.running.is_some()).count()
    }

    /// Tasks waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.pending.count()
    }

    /// Whether nothing is queued, running or waiting to be collected
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active_count() == 0 && self.undeliverable.is_empty()
    }

    /// Points of all running tasks
    pub fn active_points(&self) -> u64 {
        self.workers
            .iter()
            .filter_map(|w| w.running.map(|r| r.points))
            .sum()
    }

    /// Tiles being decoded right now
    pub fn running_tiles(&self) -> Vec<TileId> {
        self.workers
            .iter()
            .filter_map(|w| w.running.map(|r| r.tile))
            .collect()
    }

    /// Queued tasks in no particular order
    pub fn queued(&self) -> impl Iterator<Item = &QueuedTask> {
        self.pending.iter()
    }

    /// Current status
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active_count(),
            queued: self.queue_len(),
        }
    }

    /// Receiver that observes every status change
    pub fn subscribe_status(&self) -> watch::Receiver<PoolStatus> {
        self.status.subscribe()
    }

    /// Submit a task. Runs immediately on an idle or newly spawned worker,
    /// otherwise waits in the backlog ordered by descending score.
    pub fn submit(&mut self, task: DecodeTask) -> TaskId {
        self.next_task += 1;
        let id = TaskId(self.next_task);
        let queued = QueuedTask { id, task };

        if let Some(slot) = self.free_worker() {
            self.dispatch(slot, queued);
        } else {
            debug!(task = %id, tile = %queued.task.tile, score = queued.task.score, "Task queued");
            self.pending.push(queued);
        }
        self.publish();
        id
    }

    /// Wait for the next finished task. The worker that ran it immediately
    /// picks up the best queued task. Returns `None` when nothing is running.
    pub async fn next_outcome(&mut self) -> Option<TaskOutcome> {
        if let Some(outcome) = self.undeliverable.pop_front() {
            return Some(outcome);
        }
        if self.active_count() == 0 {
            return None;
        }
        let outcome = self.results_rx.recv().await?;
        self.finish(&outcome);
        Some(outcome)
    }

    /// Non-blocking variant of [`next_outcome`](Self::next_outcome)
    pub fn try_next_outcome(&mut self) -> Option<TaskOutcome> {
        if let Some(outcome) = self.undeliverable.pop_front() {
            return Some(outcome);
        }
        let outcome = self.results_rx.try_recv().ok()?;
        self.finish(&outcome);
        Some(outcome)
    }

    /// Re-score every queued task. `score` returns the new priority or `None`
    /// to drop the task. Dispatched tasks are untouched. Returns the dropped
    /// tasks so the caller can release whatever they held.
    pub fn rescore<F>(&mut self, mut score: F) -> Vec<QueuedTask>
    where
        F: FnMut(&DecodeTask) -> Option<f64>,
    {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut survivors = Vec::with_capacity(self.pending.count());
        let mut dropped = Vec::new();
        for mut queued in self.pending.drain() {
            match score(&queued.task) {
                Some(s) => {
                    queued.task.score = s;
                    survivors.push(queued);
                }
                None => {
                    debug!(task = %queued.id, tile = %queued.task.tile, "Queued task dropped by rescore");
                    dropped.push(queued);
                }
            }
        }
        self.pending = PriorityQueue::from_vec(survivors, highest_score_first as ScoreOrder);
        self.publish();
        dropped
    }

    /// Remove a queued task. Dispatched or unknown tasks yield `None`.
    pub fn cancel(&mut self, id: TaskId) -> Option<QueuedTask> {
        if !self.pending.iter().any(|q| q.id == id) {
            return None;
        }
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.pending.drain().into_iter().partition(|q| q.id == id);
        self.pending = PriorityQueue::from_vec(kept, highest_score_first as ScoreOrder);
        self.publish();
        debug!(task = %id, "Queued task cancelled");
        removed.into_iter().next()
    }

    /// Abort every worker and drop the backlog
    pub fn shutdown(&mut self) {
        for slot in self.workers.drain(..) {
            slot.join.abort();
        }
        self.idle.clear();
        self.pending.clear();
        self.undeliverable.clear();
        self.publish();
    }

    fn free_worker(&mut self) -> Option<usize> {
        if let Some(slot) = self.idle.pop() {
            return Some(slot);
        }
        if self.workers.len() < self.size {
            let id = WorkerId(self.workers.len());
            let slot = WorkerSlot::spawn(&self.runtime, id, self.decoder.clone(), self.results_tx.clone());
            self.workers.push(slot);
            return Some(self.workers.len() - 1);
        }
        None
    }

    fn dispatch(&mut self, slot: usize, queued: QueuedTask) {
        let QueuedTask { id, task } = queued;
        let worker = &mut self.workers[slot];
        let job = Job {
            task: id,
            tile: task.tile,
            epoch: task.epoch,
            points: task.points,
            request: task.request,
        };

        match worker.tx.try_send(job) {
            Ok(()) => {
                worker.running = Some(Running {
                    task: id,
                    tile: task.tile,
                    points: task.points,
                });
                debug!(task = %id, tile = %task.tile, worker = %worker.id, "Task dispatched");
            }
            Err(e) => {
                // The worker is gone; report the task as failed and replace the worker.
                let job = e.into_inner();
                warn!(task = %id, worker = %worker.id, "Worker unavailable, failing task");
                self.undeliverable.push_back(TaskOutcome {
                    task: job.task,
                    tile: job.tile,
                    epoch: job.epoch,
                    points: job.points,
                    worker: worker.id,
                    result: Err(DecodeError::Cancelled),
                });
                let id = worker.id;
                worker.join.abort();
                *worker = WorkerSlot::spawn(&self.runtime, id, self.decoder.clone(), self.results_tx.clone());
                match self.pending.pop() {
                    Some(next) => self.dispatch(slot, next),
                    None => self.idle.push(slot),
                }
            }
        }
    }

    fn finish(&mut self, outcome: &TaskOutcome) {
        let Some(slot) = self.workers.iter().position(|w| w.id == outcome.worker) else {
            return;
        };
        self.workers[slot].running = None;
        match self.pending.pop() {
            Some(next) => self.dispatch(slot, next),
            None => self.idle.push(slot),
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }
}

impl<D: Decoder> Drop for WorkerPool<D> {
    fn drop(&mut self) {
        for slot in &self.workers {
            slot.join.abort();
        }
    }
}

impl<D: Decoder> fmt::Debug for WorkerPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("workers", &self.workers.len())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileDescriptor;
    use crate::types::{PointCloudId, TilePath};
    use async_trait::async_trait;
    use glam::DVec3;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    /// Decoder that blocks until a permit is released and records start order
    struct GatedDecoder {
        gate: Semaphore,
        started: Mutex<Vec<u32>>,
    }

    impl GatedDecoder {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Decoder for GatedDecoder {
        async fn decode(&self, request: &DecodeRequest) -> std::result::Result<DecodedAttributes, DecodeError> {
            self.started.lock().push(request.tile.path.x);
            self.gate.acquire().await.unwrap().forget();
            if request.tile.path.y == 1 {
                return Err(DecodeError::malformed("flagged"));
            }
            Ok(DecodedAttributes::zeroed(request.descriptor.point_count as usize))
        }
    }

    fn task(cloud: PointCloudId, label: u32, score: f64) -> DecodeTask {
        let tile = TileId::new(cloud, TilePath::new(3, label, 0, 0));
        DecodeTask {
            tile,
            epoch: 1,
            request: DecodeRequest {
                tile,
                source: "mem".into(),
                descriptor: TileDescriptor { byte_offset: 0, byte_size: 0, point_count: 10 },
                offset: DVec3::ZERO,
            },
            score,
            points: 10,
        }
    }

    fn labels(tiles: Vec<TileId>) -> Vec<u32> {
        let mut v: Vec<u32> = tiles.into_iter().map(|t| t.path.x).collect();
        v.sort_unstable();
        v
    }

    #[tokio::test]
    async fn test_highest_scores_dispatch_first() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 2).unwrap();
        let cloud = PointCloudId::new();

        pool.submit(task(cloud, 100, 0.0));
        pool.submit(task(cloud, 101, 0.0));
        for score in [5u32, 1, 4, 2, 3] {
            pool.submit(task(cloud, score, score as f64));
        }
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.queue_len(), 5);

        decoder.gate.add_permits(2);
        let first = pool.next_outcome().await.unwrap();
        let second = pool.next_outcome().await.unwrap();
        assert_eq!(labels(vec![first.tile, second.tile]), vec![100, 101]);

        assert_eq!(labels(pool.running_tiles()), vec![4, 5]);
        assert_eq!(pool.queue_len(), 3);
        assert_eq!(pool.active_points(), 20);
    }

    #[tokio::test]
    async fn test_rescore_drops_and_reorders_queued_only() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 1).unwrap();
        let cloud = PointCloudId::new();

        pool.submit(task(cloud, 0, 1.0));
        pool.submit(task(cloud, 1, 3.0));
        pool.submit(task(cloud, 2, 2.0));
        pool.submit(task(cloud, 3, 1.0));

        let dropped = pool.rescore(|t| match t.tile.path.x {
            0 => panic!("dispatched task must not be rescored"),
            2 => None,
            // Invert the order of the survivors
            x => Some(10.0 - x as f64),
        });
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].task.tile.path.x, 2);
        assert_eq!(pool.queue_len(), 2);

        decoder.gate.add_permits(1);
        pool.next_outcome().await.unwrap();
        assert_eq!(labels(pool.running_tiles()), vec![1]);
        let next = pool.queued().next().unwrap();
        assert_eq!(next.task.tile.path.x, 3);
        assert_eq!(next.task.score, 7.0);
    }

    #[tokio::test]
    async fn test_cancel_only_affects_queued() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 1).unwrap();
        let cloud = PointCloudId::new();

        let running = pool.submit(task(cloud, 0, 1.0));
        let queued = pool.submit(task(cloud, 1, 1.0));
        assert!(pool.cancel(running).is_none());
        let removed = pool.cancel(queued).unwrap();
        assert_eq!(removed.id, queued);
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn test_status_published_on_every_change() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 1).unwrap();
        let mut status = pool.subscribe_status();
        let cloud = PointCloudId::new();

        pool.submit(task(cloud, 0, 1.0));
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), PoolStatus { active: 1, queued: 0 });

        pool.submit(task(cloud, 1, 1.0));
        assert_eq!(*status.borrow_and_update(), PoolStatus { active: 1, queued: 1 });

        decoder.gate.add_permits(2);
        pool.next_outcome().await.unwrap();
        assert_eq!(*status.borrow_and_update(), PoolStatus { active: 1, queued: 0 });
        pool.next_outcome().await.unwrap();
        assert_eq!(*status.borrow_and_update(), PoolStatus { active: 0, queued: 0 });
        assert!(pool.is_idle());
        assert!(pool.next_outcome().await.is_none());
    }

    #[tokio::test]
    async fn test_next_outcome_waits_for_running_task() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 1).unwrap();
        pool.submit(task(PointCloudId::new(), 0, 1.0));
        assert!(pool.try_next_outcome().is_none());

        {
            let mut next = tokio_test::task::spawn(pool.next_outcome());
            tokio_test::assert_pending!(next.poll());
        }

        decoder.gate.add_permits(1);
        assert!(pool.next_outcome().await.is_some());
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_worker_reused() {
        let decoder = Arc::new(GatedDecoder::new());
        let mut pool = WorkerPool::new(decoder.clone(), 1).unwrap();
        let cloud = PointCloudId::new();

        let mut failing = task(cloud, 0, 1.0);
        failing.tile.path.y = 1;
        failing.request.tile = failing.tile;
        pool.submit(failing);
        pool.submit(task(cloud, 1, 1.0));

        decoder.gate.add_permits(2);
        let first = pool.next_outcome().await.unwrap();
        assert!(matches!(first.result, Err(DecodeError::Malformed(_))));
        let second = pool.next_outcome().await.unwrap();
        assert_eq!(second.result.unwrap().point_count(), 10);
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(*decoder.started.lock(), vec![0, 1]);
    }

    #[test]
    fn test_requires_runtime_and_positive_size() {
        let decoder = Arc::new(GatedDecoder::new());
        assert!(matches!(
            WorkerPool::new(decoder.clone(), 2),
            Err(StreamError::Runtime(_))
        ));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(matches!(
            WorkerPool::with_runtime(decoder, 0, rt.handle().clone()),
            Err(StreamError::Config(_))
        ));
    }
}
