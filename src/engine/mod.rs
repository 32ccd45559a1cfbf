//! Streaming engine
//!
//! ## Table of Contents
//! - **StreamEngine**: Owns datasets, visible set, cache, worker pool and renderer
//! - **TileEvent**: What happened to a tile when a completion or retry was handled
//! - **EngineNotice**: User-facing notices (point count mismatch, failed dataset)
//! - **transitions**: `load`, `show`, `cache`, `unload`
//! - **scheduler**: The per-interaction selection pass and its throttle
//!
//! The engine is driven from one thread. Decode work runs on the worker pool
//! and comes back as messages that [`StreamEngine::pump`] or
//! [`StreamEngine::next_event`] apply to the tiles. Every state change goes
//! through the transition methods, which keep the visible set, the cache and
//! the renderer in step with the tile states.

mod scheduler;
mod transitions;

pub use scheduler::{PassReport, Throttle};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::TileCache;
use crate::camera::Camera;
use crate::config::StreamConfig;
use crate::decode::Decoder;
use crate::error::{DecodeError, Result, StreamError};
use crate::metrics::{EngineStats, StreamMetrics};
use crate::pointcloud::{HierarchyEntry, PointCloud, PointCloudMeta};
use crate::pool::{PoolStatus, TaskOutcome, WorkerPool};
use crate::render::{HeadlessRenderer, RenderBackend};
use crate::tile::{Tile, TilePayload, TileState};
use crate::types::{PointCloudId, TileId};

const NOTICE_CAPACITY: usize = 64;

/// Outcome of handling one completion or retry
#[derive(Debug, Clone, PartialEq)]
pub enum TileEvent {
    /// Decode finished and the tile is now visible
    Visible {
        /// Tile
        tile: TileId,
        /// Decoded point count
        points: u64,
    },
    /// Decode failed; another attempt is scheduled
    RetryScheduled {
        /// Tile
        tile: TileId,
        /// Failed attempts so far
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// A retry timer fired and the decode was submitted again
    Resubmitted {
        /// Tile
        tile: TileId,
    },
    /// Decode failed for good; the tile is in `error`
    Failed {
        /// Tile
        tile: TileId,
        /// Last decoder failure
        error: DecodeError,
    },
    /// A completion or retry that no longer matches the tile and was dropped
    Discarded {
        /// Tile
        tile: TileId,
    },
}

/// Notices meant for the user rather than the debug log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineNotice {
    /// Decoded point count differs from the hierarchy; the decoded count wins
    PointCountMismatch {
        /// Tile
        tile: TileId,
        /// Count from the hierarchy
        declared: u64,
        /// Count the decoder produced
        decoded: u64,
    },
    /// The root tile of a dataset could not be loaded
    DatasetFailed {
        /// Dataset
        cloud: PointCloudId,
        /// Dataset name
        name: String,
        /// Last decoder failure
        message: String,
    },
}

/// Retry timer expiry, posted back by the timer task
#[derive(Debug, Clone, Copy)]
struct RetryDue {
    tile: TileId,
    epoch: u64,
}

/// Level-of-detail streaming engine
pub struct StreamEngine<D: Decoder, R: RenderBackend = HeadlessRenderer> {
    config: StreamConfig,
    clouds: Vec<PointCloud>,
    visible: HashSet<TileId>,
    cache: TileCache,
    pool: WorkerPool<D>,
    renderer: R,
    metrics: Arc<StreamMetrics>,
    notices: broadcast::Sender<EngineNotice>,
    retry_tx: mpsc::UnboundedSender<RetryDue>,
    retry_rx: mpsc::UnboundedReceiver<RetryDue>,
    pending_retries: usize,
    failed_clouds: HashSet<PointCloudId>,
    camera: Option<Camera>,
    throttle: Throttle,
    runtime: Handle,
}

impl<D: Decoder, R: RenderBackend> StreamEngine<D, R> {
    /// Create an engine on the current tokio runtime
    pub fn new(config: StreamConfig, decoder: Arc<D>, renderer: R) -> Result<Self> {
        let metrics = Arc::new(StreamMetrics::new()?);
        Self::with_metrics(config, decoder, renderer, metrics)
    }

    /// Create an engine that records into existing metrics
    pub fn with_metrics(
        config: StreamConfig,
        decoder: Arc<D>,
        renderer: R,
        metrics: Arc<StreamMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| StreamError::runtime(e.to_string()))?;
        let pool = WorkerPool::with_runtime(decoder, config.pool_size, runtime.clone())?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        info!(
            point_budget = config.point_budget,
            error_threshold = config.error_threshold,
            pool_size = config.pool_size,
            "Stream engine created"
        );

        Ok(Self {
            cache: TileCache::new(config.effective_cache_ceiling()),
            throttle: Throttle::new(config.throttle),
            config,
            clouds: Vec::new(),
            visible: HashSet::new(),
            pool,
            renderer,
            metrics,
            notices,
            retry_tx,
            retry_rx,
            pending_retries: 0,
            failed_clouds: HashSet::new(),
            camera: None,
            runtime,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register a dataset. The next update runs regardless of the throttle.
    pub fn add_point_cloud(&mut self, cloud: PointCloud) -> PointCloudId {
        let id = cloud.id();
        info!(
            cloud = %id,
            name = %cloud.name(),
            tiles = cloud.index().len(),
            points = cloud.total_declared_points(),
            "Point cloud added"
        );
        self.clouds.push(cloud);
        self.throttle.force();
        id
    }

    /// Build a dataset from hierarchy metadata under the configured orphan
    /// policy and register it
    pub fn add_hierarchy(
        &mut self,
        meta: PointCloudMeta,
        entries: Vec<HierarchyEntry>,
    ) -> Result<PointCloudId> {
        let cloud = PointCloud::from_hierarchy(meta, entries, self.config.orphan_policy)?;
        Ok(self.add_point_cloud(cloud))
    }

    /// Read a `{ meta, hierarchy }` JSON file under the configured orphan
    /// policy and register the dataset
    pub fn add_hierarchy_file(&mut self, path: impl AsRef<Path>) -> Result<PointCloudId> {
        let cloud = PointCloud::from_json_file(path, self.config.orphan_policy)?;
        Ok(self.add_point_cloud(cloud))
    }

    /// Unregister a dataset, releasing every tile it holds and cancelling
    /// its queued decodes. Running decodes finish and are discarded.
    pub fn remove_point_cloud(&mut self, id: PointCloudId) -> Result<PointCloud> {
        let pos = self
            .clouds
            .iter()
            .position(|c| c.id() == id)
            .ok_or(StreamError::UnknownPointCloud(id))?;

        let dropped = self.pool.rescore(|task| {
            if task.tile.cloud == id {
                None
            } else {
                Some(task.score)
            }
        });
        for queued in &dropped {
            if let Some(tile) = find_tile_mut(&mut self.clouds, queued.task.tile) {
                tile.set_task(None);
            }
        }

        let tiles: Vec<TileId> = self.clouds[pos].index().tiles().map(|t| t.id()).collect();
        for tile in tiles {
            if self.state_of(tile) == Some(TileState::Visible) {
                self.hide(tile)?;
            }
            self.unload(tile)?;
        }

        let cloud = self.clouds.remove(pos);
        self.failed_clouds.remove(&id);
        self.throttle.force();
        self.refresh_gauges();
        info!(cloud = %id, name = %cloud.name(), "Point cloud removed");
        Ok(cloud)
    }

    /// Registered datasets in insertion order
    pub fn point_clouds(&self) -> &[PointCloud] {
        &self.clouds
    }

    /// Dataset by id
    pub fn point_cloud(&self, id: PointCloudId) -> Option<&PointCloud> {
        find_cloud(&self.clouds, id)
    }

    /// Set the camera; the next update may run a pass
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = Some(camera);
        self.throttle.mark_dirty();
    }

    /// Current camera
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    /// Tile by id
    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        find_tile(&self.clouds, id)
    }

    /// State of a tile
    pub fn state_of(&self, id: TileId) -> Option<TileState> {
        self.tile(id).map(|t| t.state())
    }

    /// Tiles currently visible
    pub fn visible_tiles(&self) -> Vec<TileId> {
        self.visible.iter().copied().collect()
    }

    /// Sum of point counts over visible tiles
    pub fn visible_points(&self) -> u64 {
        self.visible
            .iter()
            .filter_map(|&id| self.tile(id))
            .map(|t| t.point_count())
            .sum()
    }

    /// Sum of point counts over tiles that are loading
    pub fn in_flight_points(&self) -> u64 {
        self.clouds
            .iter()
            .flat_map(|c| c.index().tiles())
            .filter(|t| t.state() == TileState::Loading)
            .map(|t| t.point_count())
            .sum()
    }

    /// The LRU cache of demoted tiles
    pub fn tile_cache(&self) -> &TileCache {
        &self.cache
    }

    /// Worker pool status
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Observe pool status changes
    pub fn subscribe_status(&self) -> watch::Receiver<PoolStatus> {
        self.pool.subscribe_status()
    }

    /// Observe user-facing notices
    pub fn subscribe_notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Metrics handle
    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        self.metrics.snapshot()
    }

    /// Render backend
    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Mutable render backend
    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Whether no decode is queued, running, or waiting to be retried
    pub fn is_idle(&self) -> bool {
        self.pool.is_idle() && self.pending_retries == 0
    }

    /// Apply every completion and due retry that is already available,
    /// without waiting
    pub fn pump(&mut self) -> Result<Vec<TileEvent>> {
        let mut events = Vec::new();
        while let Some(outcome) = self.pool.try_next_outcome() {
            events.push(self.handle_outcome(outcome)?);
        }
        while let Ok(due) = self.retry_rx.try_recv() {
            events.push(self.handle_retry(due)?);
        }
        if !events.is_empty() {
            self.refresh_gauges();
        }
        Ok(events)
    }

    /// Wait for the next completion or retry and apply it. `None` once the
    /// engine is idle.
    pub async fn next_event(&mut self) -> Result<Option<TileEvent>> {
        if self.is_idle() {
            return Ok(None);
        }
        let busy = !self.pool.is_idle();
        let waiting = self.pending_retries > 0;
        let event = tokio::select! {
            Some(outcome) = self.pool.next_outcome(), if busy => self.handle_outcome(outcome)?,
            Some(due) = self.retry_rx.recv(), if waiting => self.handle_retry(due)?,
            else => return Ok(None),
        };
        self.refresh_gauges();
        Ok(Some(event))
    }

    /// Drive completions and retries until nothing is outstanding
    pub async fn run_until_idle(&mut self) -> Result<Vec<TileEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }

    /// Alternate passes and decode rounds until a pass starts no new load,
    /// or `max_passes` passes have run
    pub async fn refine_until_stable(&mut self, max_passes: usize) -> Result<PassReport> {
        let mut report = PassReport::default();
        for _ in 0..max_passes {
            report = self.run_pass()?;
            self.run_until_idle().await?;
            if report.loads_started == 0 {
                break;
            }
        }
        Ok(report)
    }

    /// Abort workers and drop queued work
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        info!("Stream engine shut down");
    }

    fn handle_outcome(&mut self, outcome: TaskOutcome) -> Result<TileEvent> {
        let id = outcome.tile;
        let Some(tile) = find_tile_mut(&mut self.clouds, id) else {
            debug!(tile = %id, task = %outcome.task, "Completion for removed tile dropped");
            return Ok(TileEvent::Discarded { tile: id });
        };
        if tile.state() != TileState::Loading
            || tile.epoch() != outcome.epoch
            || tile.task() != Some(outcome.task)
        {
            debug!(tile = %id, state = %tile.state(), "Stale completion dropped");
            return Ok(TileEvent::Discarded { tile: id });
        }

        let result = outcome
            .result
            .and_then(|attributes| attributes.validate().map(|()| attributes));
        match result {
            Ok(attributes) => {
                let declared = tile.declared_points();
                let decoded = attributes.point_count() as u64;
                let handle = self.renderer.upload(id, &attributes);
                tile.complete_load(TilePayload {
                    attributes: Arc::new(attributes),
                    handle,
                })?;
                self.metrics.loads_completed.inc();

                if declared != decoded {
                    warn!(tile = %id, declared, decoded, "Decoded point count differs from hierarchy");
                    self.metrics.point_count_mismatches.inc();
                    let _ = self.notices.send(EngineNotice::PointCountMismatch {
                        tile: id,
                        declared,
                        decoded,
                    });
                }

                self.show(id)?;
                self.throttle.mark_dirty();
                Ok(TileEvent::Visible { tile: id, points: decoded })
            }
            Err(error) => {
                let attempt = tile.record_attempt_failure(error.clone());
                let epoch = tile.epoch();
                match self.config.retry.next_delay(attempt) {
                    Some(delay) => {
                        self.schedule_retry(id, epoch, delay);
                        self.metrics.retries.inc();
                        debug!(tile = %id, attempt, error = %error, "Decode failed, retrying");
                        Ok(TileEvent::RetryScheduled { tile: id, attempt, delay })
                    }
                    None => {
                        tile.mark_failed()?;
                        let is_root = tile.path().is_root();
                        self.metrics.load_failures.inc();
                        self.metrics.record_transition(TileState::Error);
                        warn!(tile = %id, attempts = attempt, error = %error, "Tile load failed");
                        if is_root && self.failed_clouds.insert(id.cloud) {
                            let name = find_cloud(&self.clouds, id.cloud)
                                .map(|c| c.name().to_string())
                                .unwrap_or_default();
                            let _ = self.notices.send(EngineNotice::DatasetFailed {
                                cloud: id.cloud,
                                name,
                                message: error.to_string(),
                            });
                        }
                        self.throttle.mark_dirty();
                        Ok(TileEvent::Failed { tile: id, error })
                    }
                }
            }
        }
    }

    fn schedule_retry(&mut self, tile: TileId, epoch: u64, delay: Duration) {
        let tx = self.retry_tx.clone();
        self.pending_retries += 1;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(RetryDue { tile, epoch });
        });
    }

    fn handle_retry(&mut self, due: RetryDue) -> Result<TileEvent> {
        self.pending_retries = self.pending_retries.saturating_sub(1);
        let current = self
            .tile(due.tile)
            .map(|t| (t.state(), t.epoch(), t.task()));
        match current {
            Some((TileState::Loading, epoch, None)) if epoch == due.epoch => {
                self.submit_decode(due.tile)?;
                Ok(TileEvent::Resubmitted { tile: due.tile })
            }
            _ => {
                debug!(tile = %due.tile, "Stale retry dropped");
                Ok(TileEvent::Discarded { tile: due.tile })
            }
        }
    }

    fn refresh_gauges(&self) {
        self.metrics
            .set_residency(self.visible_points(), self.visible.len(), self.cache.total_points());
        let status = self.pool.status();
        self.metrics.set_pool(status.active, status.queued);
    }
}

impl<D: Decoder, R: RenderBackend> std::fmt::Debug for StreamEngine<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("clouds", &self.clouds.len())
            .field("visible", &self.visible.len())
            .field("cached", &self.cache.len())
            .field("pool", &self.pool)
            .finish()
    }
}

fn find_cloud(clouds: &[PointCloud], id: PointCloudId) -> Option<&PointCloud> {
    clouds.iter().find(|c| c.id() == id)
}

fn find_tile(clouds: &[PointCloud], id: TileId) -> Option<&Tile> {
    find_cloud(clouds, id.cloud)?.index().get(&id.path)
}

fn find_tile_mut(clouds: &mut [PointCloud], id: TileId) -> Option<&mut Tile> {
    clouds
        .iter_mut()
        .find(|c| c.id() == id.cloud)?
        .index_mut()
        .get_mut(&id.path)
}
