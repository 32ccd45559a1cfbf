//! Engine metrics
//!
//! ## Table of Contents
//! - **StreamMetrics**: Prometheus counters, gauges and histograms for one engine
//! - **EngineStats**: Plain snapshot of the counters for debug surfaces

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::tile::TileState;

/// Core metrics for the streaming engine
pub struct StreamMetrics {
    registry: Registry,

    // Load metrics
    pub loads_started: IntCounter,
    pub loads_completed: IntCounter,
    pub load_failures: IntCounter,
    pub retries: IntCounter,
    pub point_count_mismatches: IntCounter,

    // Lifecycle metrics
    pub transitions: IntCounterVec,
    pub evictions: IntCounter,
    pub rescore_cancellations: IntCounter,

    // Residency metrics
    pub visible_points: IntGauge,
    pub visible_tiles: IntGauge,
    pub cached_points: IntGauge,

    // Pool metrics
    pub active_workers: IntGauge,
    pub queued_tasks: IntGauge,

    // Scheduler metrics
    pub pass_duration: Histogram,
}

impl StreamMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let loads_started = IntCounter::new("lod_loads_started_total", "Tile loads started")?;
        let loads_completed =
            IntCounter::new("lod_loads_completed_total", "Tile loads that produced data")?;
        let load_failures = IntCounter::new(
            "lod_load_failures_total",
            "Tile loads that ended in error after retries",
        )?;
        let retries = IntCounter::new("lod_load_retries_total", "Decode retries scheduled")?;
        let point_count_mismatches = IntCounter::new(
            "lod_point_count_mismatches_total",
            "Decoded point counts that differ from the hierarchy",
        )?;

        let transitions = IntCounterVec::new(
            Opts::new("lod_tile_transitions_total", "Tile state transitions"),
            &["to"],
        )?;
        let evictions = IntCounter::new("lod_cache_evictions_total", "Tiles evicted from the cache")?;
        let rescore_cancellations = IntCounter::new(
            "lod_rescore_cancellations_total",
            "Queued decode tasks dropped by rescoring",
        )?;

        let visible_points = IntGauge::new("lod_visible_points", "Points currently visible")?;
        let visible_tiles = IntGauge::new("lod_visible_tiles", "Tiles currently visible")?;
        let cached_points = IntGauge::new("lod_cached_points", "Points parked in the cache")?;

        let active_workers = IntGauge::new("lod_active_workers", "Workers running a decode")?;
        let queued_tasks = IntGauge::new("lod_queued_tasks", "Decode tasks waiting for a worker")?;

        let pass_duration = Histogram::with_opts(
            HistogramOpts::new("lod_scheduler_pass_seconds", "Scheduler pass duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
        )?;

        registry.register(Box::new(loads_started.clone()))?;
        registry.register(Box::new(loads_completed.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(point_count_mismatches.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(rescore_cancellations.clone()))?;
        registry.register(Box::new(visible_points.clone()))?;
        registry.register(Box::new(visible_tiles.clone()))?;
        registry.register(Box::new(cached_points.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(queued_tasks.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;

        Ok(Self {
            registry,
            loads_started,
            loads_completed,
            load_failures,
            retries,
            point_count_mismatches,
            transitions,
            evictions,
            rescore_cancellations,
            visible_points,
            visible_tiles,
            cached_points,
            active_workers,
            queued_tasks,
            pass_duration,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a state transition
    pub fn record_transition(&self, to: TileState) {
        self.transitions.with_label_values(&[&to.to_string()]).inc();
    }

    /// Update residency gauges
    pub fn set_residency(&self, visible_points: u64, visible_tiles: usize, cached_points: u64) {
        self.visible_points.set(visible_points as i64);
        self.visible_tiles.set(visible_tiles as i64);
        self.cached_points.set(cached_points as i64);
    }

    /// Update pool gauges
    pub fn set_pool(&self, active: usize, queued: usize) {
        self.active_workers.set(active as i64);
        self.queued_tasks.set(queued as i64);
    }

    /// Snapshot of the counters
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            loads_started: self.loads_started.get(),
            loads_completed: self.loads_completed.get(),
            load_failures: self.load_failures.get(),
            retries: self.retries.get(),
            point_count_mismatches: self.point_count_mismatches.get(),
            evictions: self.evictions.get(),
            rescore_cancellations: self.rescore_cancellations.get(),
            visible_points: self.visible_points.get().max(0) as u64,
            visible_tiles: self.visible_tiles.get().max(0) as u64,
            cached_points: self.cached_points.get().max(0) as u64,
            passes: self.pass_duration.get_sample_count(),
        }
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| StreamError::metrics(format!("Encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| StreamError::metrics(format!("UTF8 error: {}", e)))
    }
}

impl std::fmt::Debug for StreamMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMetrics").field("stats", &self.snapshot()).finish()
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Loads started
    pub loads_started: u64,
    /// Loads that produced data
    pub loads_completed: u64,
    /// Loads that ended in error
    pub load_failures: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Decoded counts that differed from the hierarchy
    pub point_count_mismatches: u64,
    /// Cache evictions
    pub evictions: u64,
    /// Queued tasks dropped by rescoring
    pub rescore_cancellations: u64,
    /// Points visible after the last update
    pub visible_points: u64,
    /// Tiles visible after the last update
    pub visible_tiles: u64,
    /// Points cached after the last update
    pub cached_points: u64,
    /// Scheduler passes run
    pub passes: u64,
}
