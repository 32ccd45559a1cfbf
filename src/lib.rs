//! # LOD Stream
//!
//! Level-of-detail streaming for out-of-core point clouds organised as
//! octrees. On every camera change the engine picks which tiles to show under
//! a global point budget, decodes them on a bounded worker pool and keeps
//! recently hidden tiles in an LRU cache.
//!
//! ## Features
//!
//! - **Spatial Index**: Octree hierarchy with breadth-first, depth-capped traversal
//! - **Tile Lifecycle**: `unloaded -> loading -> visible <-> cached`, with retries and `error`
//! - **Scheduler**: Worst-error-first selection under a strict point budget
//! - **Worker Pool**: Priority-ordered decode queue, re-scored between passes
//! - **Cache**: Point-weighted LRU for demoted tiles
//! - **Metrics**: Prometheus-compatible metrics export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use glam::DVec3;
//! use lod_stream::{
//!     Camera, EngineBuilder, FileSource, OrphanPolicy, PointCloud, Projection, RecordDecoder,
//!     RecordLayout,
//! };
//!
//! #[tokio::main]
//! async fn main() -> lod_stream::Result<()> {
//!     let cloud = PointCloud::from_json_file("data/hierarchy.json", OrphanPolicy::Reparent)?;
//!     let decoder = Arc::new(RecordDecoder::new(
//!         Arc::new(FileSource::new("data")),
//!         RecordLayout::default(),
//!     ));
//!
//!     let mut engine = EngineBuilder::new(decoder)
//!         .with_point_budget(2_000_000)
//!         .with_point_cloud(cloud)
//!         .build()?;
//!
//!     engine.set_camera(Camera::look_at(
//!         DVec3::new(0.0, -50.0, 20.0),
//!         DVec3::ZERO,
//!         DVec3::Z,
//!         Projection::perspective(60f64.to_radians(), 16.0 / 9.0, 0.1, 1000.0),
//!     ));
//!     let report = engine.refine_until_stable(16).await?;
//!     println!("{} points visible", report.visible_points);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod builder;
pub mod cache;
pub mod camera;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod index;
pub mod metrics;
pub mod pointcloud;
pub mod pool;
pub mod queue;
pub mod render;
pub mod retry;
pub mod telemetry;
pub mod tile;
pub mod types;

// Re-exports for ergonomic API
pub use builder::EngineBuilder;
pub use cache::TileCache;
pub use camera::{Camera, Frustum, Projection};
pub use config::{OrphanPolicy, StreamConfig};
pub use decode::{
    ByteSource, DecodeRequest, DecodedAttributes, Decoder, FileSource, MemorySource, RawPoint,
    RecordDecoder, RecordLayout,
};
pub use engine::{EngineNotice, PassReport, StreamEngine, Throttle, TileEvent};
pub use error::{DecodeError, Result, StreamError};
pub use index::SpatialIndex;
pub use metrics::{EngineStats, StreamMetrics};
pub use pointcloud::{HierarchyEntry, PointCloud, PointCloudMeta};
pub use pool::{PoolStatus, TaskId, WorkerPool};
pub use render::{HeadlessRenderer, RenderBackend, RenderHandle};
pub use retry::RetryConfig;
pub use telemetry::init_tracing;
pub use tile::{Tile, TileDescriptor, TileState};
pub use types::{Aabb, PointCloudId, TileId, TilePath};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::EngineBuilder;
    pub use crate::camera::{Camera, Projection};
    pub use crate::config::StreamConfig;
    pub use crate::decode::Decoder;
    pub use crate::engine::{PassReport, StreamEngine};
    pub use crate::error::Result;
    pub use crate::pointcloud::PointCloud;
    pub use crate::types::{TileId, TilePath};
}
