//! Narrow interface to the renderer
//!
//! The engine only needs to hand decoded buffers over, toggle visibility,
//! release GPU resources and ask for a redraw. Everything else about
//! drawing lives outside this crate.

use std::collections::HashMap;

use tracing::debug;

use crate::decode::DecodedAttributes;
use crate::types::TileId;

/// Opaque handle to renderer-side resources of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderHandle(u64);

impl RenderHandle {
    /// Wrap a raw handle value
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Renderer capabilities consumed by the engine
#[cfg_attr(test, mockall::automock)]
pub trait RenderBackend: Send {
    /// Upload decoded attributes; the object starts hidden
    fn upload(&mut self, tile: TileId, attributes: &DecodedAttributes) -> RenderHandle;

    /// Show or hide an uploaded object without discarding it
    fn set_visible(&mut self, handle: RenderHandle, visible: bool);

    /// Free the object's resources
    fn release(&mut self, handle: RenderHandle);

    /// Ask for a new frame
    fn request_redraw(&mut self);
}

#[derive(Debug, Clone, Copy)]
struct HeadlessObject {
    tile: TileId,
    points: usize,
    visible: bool,
}

/// Renderer that only keeps books. Used for headless runs and tests.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    next_handle: u64,
    objects: HashMap<RenderHandle, HeadlessObject>,
    redraws: u64,
}

impl HeadlessRenderer {
    /// Create an empty renderer
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uploaded, unreleased objects
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Objects currently shown
    pub fn visible_tiles(&self) -> Vec<TileId> {
        self.objects
            .values()
            .filter(|o| o.visible)
            .map(|o| o.tile)
            .collect()
    }

    /// Sum of points over shown objects
    pub fn visible_points(&self) -> usize {
        self.objects
            .values()
            .filter(|o| o.visible)
            .map(|o| o.points)
            .sum()
    }

    /// Redraw requests received so far
    pub fn redraw_requests(&self) -> u64 {
        self.redraws
    }
}

impl RenderBackend for HeadlessRenderer {
    fn upload(&mut self, tile: TileId, attributes: &DecodedAttributes) -> RenderHandle {
        self.next_handle += 1;
        let handle = RenderHandle::new(self.next_handle);
        self.objects.insert(
            handle,
            HeadlessObject {
                tile,
                points: attributes.point_count(),
                visible: false,
            },
        );
        debug!(tile = %tile, handle = handle.raw(), "Uploaded tile");
        handle
    }

    fn set_visible(&mut self, handle: RenderHandle, visible: bool) {
        if let Some(obj) = self.objects.get_mut(&handle) {
            obj.visible = visible;
        }
    }

    fn release(&mut self, handle: RenderHandle) {
        self.objects.remove(&handle);
    }

    fn request_redraw(&mut self) {
        self.redraws += 1;
    }
}
