//! Tile lifecycle
//!
//! ## Table of Contents
//! - **TileState**: Lifecycle states and the legal predecessor table
//! - **TilePayload**: Decoded attributes plus the renderer's handle
//! - **TileDescriptor**: Where a tile's bytes live in the source
//! - **Tile**: One octree cell with its state machine
//!
//! ```text
//! unloaded -> loading -> visible <-> cached
//!                \-> error
//! loading | cached | error -> unloaded
//! ```
//!
//! The mutators here only check and flip the tile's own fields. Side effects
//! on shared collections (visible set, cache, worker pool, renderer) belong
//! to the engine, which is the only caller.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decode::DecodedAttributes;
use crate::error::{DecodeError, Result, StreamError};
use crate::pool::TaskId;
use crate::render::RenderHandle;
use crate::types::{Aabb, TileId, TilePath};

/// Lifecycle state of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileState {
    /// No data held
    Unloaded,
    /// Decode requested or in progress
    Loading,
    /// Decoded and on screen
    Visible,
    /// Decoded, hidden, parked in the LRU cache
    Cached,
    /// Decode failed after exhausting retries
    Error,
}

impl TileState {
    /// States from which a transition into `self` is legal
    pub fn predecessors(self) -> &'static [TileState] {
        match self {
            TileState::Loading => &[TileState::Unloaded, TileState::Error],
            TileState::Visible => &[TileState::Loading, TileState::Cached],
            TileState::Cached => &[TileState::Visible],
            TileState::Error => &[TileState::Loading],
            TileState::Unloaded => &[
                TileState::Unloaded,
                TileState::Loading,
                TileState::Cached,
                TileState::Error,
            ],
        }
    }

    /// Whether `self -> next` is legal
    pub fn can_transition_to(self, next: TileState) -> bool {
        next.predecessors().contains(&self)
    }
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TileState::Unloaded => "unloaded",
            TileState::Loading => "loading",
            TileState::Visible => "visible",
            TileState::Cached => "cached",
            TileState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Render-ready data for a decoded tile
#[derive(Debug, Clone)]
pub struct TilePayload {
    /// Decoded point attributes
    pub attributes: Arc<DecodedAttributes>,
    /// Handle returned by the render backend on upload
    pub handle: RenderHandle,
}

/// Location of a tile's encoded bytes inside its point cloud source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileDescriptor {
    /// Byte offset into the source
    pub byte_offset: u64,
    /// Encoded length in bytes
    pub byte_size: u64,
    /// Point count declared by the hierarchy
    pub point_count: u64,
}

/// A single octree cell
#[derive(Debug)]
pub struct Tile {
    id: TileId,
    bounds: Aabb,
    spacing: f64,
    descriptor: TileDescriptor,
    decoded_points: Option<u64>,
    state: TileState,
    payload: Option<TilePayload>,
    epoch: u64,
    task: Option<TaskId>,
    attempts: u32,
    last_error: Option<DecodeError>,
}

impl Tile {
    /// Create an unloaded tile
    pub fn new(id: TileId, bounds: Aabb, spacing: f64, descriptor: TileDescriptor) -> Self {
        Self {
            id,
            bounds,
            spacing,
            descriptor,
            decoded_points: None,
            state: TileState::Unloaded,
            payload: None,
            epoch: 0,
            task: None,
            attempts: 0,
            last_error: None,
        }
    }

    /// Tile identity, also its cache key
    pub fn id(&self) -> TileId {
        self.id
    }

    /// Octree path
    pub fn path(&self) -> TilePath {
        self.id.path
    }

    /// Octree depth
    pub fn depth(&self) -> u32 {
        self.id.path.depth
    }

    /// Bounding box, fixed at construction
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Nominal point spacing at this depth, fixed at construction
    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    /// Where the tile's bytes live
    pub fn descriptor(&self) -> &TileDescriptor {
        &self.descriptor
    }

    /// Point count from the hierarchy
    pub fn declared_points(&self) -> u64 {
        self.descriptor.point_count
    }

    /// Point count used for budgeting: the decoded count once known
    pub fn point_count(&self) -> u64 {
        self.decoded_points.unwrap_or(self.descriptor.point_count)
    }

    /// Current lifecycle state
    pub fn state(&self) -> TileState {
        self.state
    }

    /// Decoded payload, present only while loading-complete, visible or cached
    pub fn payload(&self) -> Option<&TilePayload> {
        self.payload.as_ref()
    }

    /// Load generation; bumped each time a fresh load starts
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Task currently submitted for this tile
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    /// Failed attempts within the current load
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last decode failure, kept while in `error`
    pub fn last_error(&self) -> Option<&DecodeError> {
        self.last_error.as_ref()
    }

    /// Reject the transition unless the current state is a legal predecessor
    pub fn assert_transition(&self, requested: TileState) -> Result<()> {
        if self.state.can_transition_to(requested) {
            Ok(())
        } else {
            Err(StreamError::InvalidStateTransition {
                tile: self.id,
                current: self.state,
                requested,
            })
        }
    }

    pub(crate) fn begin_load(&mut self) -> Result<u64> {
        self.assert_transition(TileState::Loading)?;
        self.state = TileState::Loading;
        self.epoch += 1;
        self.attempts = 0;
        self.last_error = None;
        self.task = None;
        Ok(self.epoch)
    }

    pub(crate) fn set_task(&mut self, task: Option<TaskId>) {
        self.task = task;
    }

    pub(crate) fn record_attempt_failure(&mut self, err: DecodeError) -> u32 {
        self.attempts += 1;
        self.task = None;
        self.last_error = Some(err);
        self.attempts
    }

    pub(crate) fn complete_load(&mut self, payload: TilePayload) -> Result<()> {
        if self.state != TileState::Loading {
            return Err(StreamError::InvalidStateTransition {
                tile: self.id,
                current: self.state,
                requested: TileState::Visible,
            });
        }
        self.decoded_points = Some(payload.attributes.point_count() as u64);
        self.payload = Some(payload);
        self.task = None;
        Ok(())
    }

    pub(crate) fn mark_visible(&mut self) -> Result<()> {
        self.assert_transition(TileState::Visible)?;
        if self.payload.is_none() {
            return Err(StreamError::MissingPayload(self.id));
        }
        self.state = TileState::Visible;
        Ok(())
    }

    pub(crate) fn mark_cached(&mut self) -> Result<()> {
        self.assert_transition(TileState::Cached)?;
        self.state = TileState::Cached;
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self) -> Result<()> {
        self.assert_transition(TileState::Error)?;
        self.state = TileState::Error;
        self.payload = None;
        self.task = None;
        Ok(())
    }

    /// Back to `unloaded`, handing back any payload so the caller can release it
    pub(crate) fn reset(&mut self) -> Result<Option<TilePayload>> {
        self.assert_transition(TileState::Unloaded)?;
        self.state = TileState::Unloaded;
        self.task = None;
        self.attempts = 0;
        Ok(self.payload.take())
    }
}
