//! EngineBuilder for configuring and constructing stream engines
//!
//! ## Table of Contents
//! - **EngineBuilder**: Builder pattern over `StreamConfig`, decoder, renderer and datasets

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::camera::Camera;
use crate::config::{OrphanPolicy, StreamConfig};
use crate::decode::Decoder;
use crate::engine::StreamEngine;
use crate::error::Result;
use crate::metrics::StreamMetrics;
use crate::pointcloud::{HierarchyEntry, PointCloud, PointCloudMeta};
use crate::render::{HeadlessRenderer, RenderBackend};
use crate::retry::RetryConfig;

/// Builder for constructing [`StreamEngine`] instances
pub struct EngineBuilder<D: Decoder, R: RenderBackend = HeadlessRenderer> {
    config: StreamConfig,
    decoder: Arc<D>,
    renderer: R,
    metrics: Option<Arc<StreamMetrics>>,
    clouds: Vec<PointCloud>,
    hierarchies: Vec<(PointCloudMeta, Vec<HierarchyEntry>)>,
    hierarchy_files: Vec<PathBuf>,
    camera: Option<Camera>,
}

impl<D: Decoder> EngineBuilder<D, HeadlessRenderer> {
    /// Create a builder with default configuration and a headless renderer
    pub fn new(decoder: Arc<D>) -> Self {
        Self {
            config: StreamConfig::default(),
            decoder,
            renderer: HeadlessRenderer::new(),
            metrics: None,
            clouds: Vec::new(),
            hierarchies: Vec::new(),
            hierarchy_files: Vec::new(),
            camera: None,
        }
    }
}

impl<D: Decoder, R: RenderBackend> EngineBuilder<D, R> {
    /// Use a different render backend
    pub fn with_renderer<R2: RenderBackend>(self, renderer: R2) -> EngineBuilder<D, R2> {
        EngineBuilder {
            config: self.config,
            decoder: self.decoder,
            renderer,
            metrics: self.metrics,
            clouds: self.clouds,
            hierarchies: self.hierarchies,
            hierarchy_files: self.hierarchy_files,
            camera: self.camera,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a JSON file
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = StreamConfig::from_json_file(path)?;
        Ok(self)
    }

    /// Set the point budget
    pub fn with_point_budget(mut self, points: u64) -> Self {
        self.config.point_budget = points;
        self
    }

    /// Set the error threshold
    pub fn with_error_threshold(mut self, threshold: f64) -> Self {
        self.config.error_threshold = threshold;
        self
    }

    /// Set the worker count
    pub fn with_pool_size(mut self, workers: usize) -> Self {
        self.config.pool_size = workers;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the interaction throttle interval
    pub fn with_throttle(mut self, interval: Duration) -> Self {
        self.config.throttle = interval;
        self
    }

    /// Set the cache ceiling in points
    pub fn with_cache_ceiling(mut self, points: u64) -> Self {
        self.config.cache_ceiling = Some(points);
        self
    }

    /// Set the orphan policy applied to hierarchies registered through
    /// [`with_hierarchy`](Self::with_hierarchy) and
    /// [`with_hierarchy_file`](Self::with_hierarchy_file)
    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.config.orphan_policy = policy;
        self
    }

    /// Record into existing metrics
    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a dataset at build time
    pub fn with_point_cloud(mut self, cloud: PointCloud) -> Self {
        self.clouds.push(cloud);
        self
    }

    /// Build a dataset from hierarchy metadata when the engine is built
    pub fn with_hierarchy(mut self, meta: PointCloudMeta, entries: Vec<HierarchyEntry>) -> Self {
        self.hierarchies.push((meta, entries));
        self
    }

    /// Read a `{ meta, hierarchy }` JSON file when the engine is built
    pub fn with_hierarchy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hierarchy_files.push(path.into());
        self
    }

    /// Initial camera
    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Build the engine. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<StreamEngine<D, R>> {
        info!(
            point_budget = self.config.point_budget,
            pool_size = self.config.pool_size,
            clouds = self.clouds.len() + self.hierarchies.len() + self.hierarchy_files.len(),
            orphan_policy = ?self.config.orphan_policy,
            "Building stream engine"
        );

        let metrics = match self.metrics {
            Some(m) => m,
            None => Arc::new(StreamMetrics::new()?),
        };
        let mut engine = StreamEngine::with_metrics(self.config, self.decoder, self.renderer, metrics)?;
        for cloud in self.clouds {
            engine.add_point_cloud(cloud);
        }
        for (meta, entries) in self.hierarchies {
            engine.add_hierarchy(meta, entries)?;
        }
        for path in self.hierarchy_files {
            engine.add_hierarchy_file(&path)?;
        }
        if let Some(camera) = self.camera {
            engine.set_camera(camera);
        }
        Ok(engine)
    }
}
