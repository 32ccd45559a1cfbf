//! Error types for the streaming engine
//!
//! ## Table of Contents
//! - **StreamError**: Main error enum covering every failure mode of the engine
//! - **DecodeError**: Failures reported by the external decode service
//! - **Result**: Type alias for `Result<T, StreamError>`

use thiserror::Error;

use crate::tile::TileState;
use crate::types::{PointCloudId, TileId, TilePath};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum StreamError {
    /// A lifecycle transition was requested from a state that does not allow it.
    /// This is a caller bug and aborts the operation.
    #[error("invalid state transition for tile {tile}: {current:?} -> {requested:?}")]
    InvalidStateTransition {
        /// Tile whose transition was rejected
        tile: TileId,
        /// State the tile was in
        current: TileState,
        /// State that was requested
        requested: TileState,
    },

    /// Decoding tile data failed after the retry budget was spent
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Strict pop on an empty queue
    #[error("queue is empty")]
    EmptyQueue,

    /// A non-root tile was inserted before the root
    #[error("index has no root tile")]
    MissingRoot,

    /// No ancestor of the tile exists in the index
    #[error("no ancestor found for tile {0}")]
    MissingAncestor(TilePath),

    /// Depth beyond the supported maximum, or cell coordinates outside the
    /// grid of their level
    #[error("tile path {0} is outside the octree")]
    InvalidPath(TilePath),

    /// The path is already present in the index
    #[error("duplicate tile {0}")]
    DuplicateTile(TilePath),

    /// Lookup of a tile that is not part of any registered point cloud
    #[error("unknown tile {0}")]
    UnknownTile(TileId),

    /// Lookup of a point cloud that is not registered with the engine
    #[error("unknown point cloud {0}")]
    UnknownPointCloud(PointCloudId),

    /// A tile was asked to become visible without decoded data
    #[error("tile {0} has no decoded payload")]
    MissingPayload(TileId),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime not available or already stopped
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Metrics registration or encoding failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Whether this error is a lifecycle contract violation
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }
}

/// Failure reported by a decoder. Every variant is treated as retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte source could not serve the requested range
    #[error("source error: {0}")]
    Source(String),

    /// The bytes do not describe a valid tile
    #[error("malformed tile data: {0}")]
    Malformed(String),

    /// Fewer bytes than the descriptor promised
    #[error("truncated tile data: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes declared by the hierarchy
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// The worker went away before producing a result
    #[error("decode cancelled")]
    Cancelled,

    /// IO failure while reading the source
    #[error("io error: {0}")]
    Io(String),
}

impl DecodeError {
    /// Create a source error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a malformed-data error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<prometheus::Error> for StreamError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
