//! Decode worker tasks
//!
//! Each worker is a tokio task fed through its own channel of capacity one,
//! so it can never hold a second job before reporting the first.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{TaskId, TaskOutcome, WorkerId};
use crate::decode::{DecodeRequest, Decoder};
use crate::error::DecodeError;
use crate::types::TileId;

/// Job handed to a worker
#[derive(Debug)]
pub(crate) struct Job {
    pub task: TaskId,
    pub tile: TileId,
    pub epoch: u64,
    pub points: u64,
    pub request: DecodeRequest,
}

/// Task a worker is currently running
#[derive(Debug, Clone, Copy)]
pub(crate) struct Running {
    pub task: TaskId,
    pub tile: TileId,
    pub points: u64,
}

/// Scheduling-side view of one worker
pub(crate) struct WorkerSlot {
    pub id: WorkerId,
    pub tx: mpsc::Sender<Job>,
    pub join: JoinHandle<()>,
    pub running: Option<Running>,
}

impl WorkerSlot {
    /// Spawn a worker on `runtime` that reports into `results`
    pub fn spawn<D: Decoder>(
        runtime: &Handle,
        id: WorkerId,
        decoder: Arc<D>,
        results: mpsc::UnboundedSender<TaskOutcome>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let join = runtime.spawn(run_worker(id, decoder, rx, results));
        debug!(worker = %id, "Spawned decode worker");
        Self {
            id,
            tx,
            join,
            running: None,
        }
    }
}

async fn run_worker<D: Decoder>(
    id: WorkerId,
    decoder: Arc<D>,
    mut jobs: mpsc::Receiver<Job>,
    results: mpsc::UnboundedSender<TaskOutcome>,
) {
    while let Some(job) = jobs.recv().await {
        let started = Instant::now();
        let decoder = decoder.clone();
        let request = job.request;

        // A panicking decoder must still produce an outcome, otherwise the
        // slot would stay busy forever.
        let result = match tokio::spawn(async move { decoder.decode(&request).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!(worker = %id, tile = %job.tile, error = %e, "Decode task aborted");
                Err(DecodeError::Cancelled)
            }
        };

        debug!(
            worker = %id,
            task = %job.task,
            tile = %job.tile,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Decode finished"
        );

        let outcome = TaskOutcome {
            task: job.task,
            tile: job.tile,
            epoch: job.epoch,
            points: job.points,
            worker: id,
            result,
        };
        if results.send(outcome).is_err() {
            break;
        }
    }
}
