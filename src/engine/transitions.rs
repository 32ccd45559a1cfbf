//! Tile state transitions
//!
//! These are the only code paths that change a tile's state. Each one checks
//! the legal predecessor set first, then keeps the visible set, the cache,
//! the worker pool and the renderer consistent with the new state.

use tracing::debug;

use super::{find_cloud, find_tile_mut, StreamEngine};
use crate::decode::Decoder;
use crate::error::{Result, StreamError};
use crate::pool::DecodeTask;
use crate::render::RenderBackend;
use crate::tile::{Tile, TileState};
use crate::types::TileId;

impl<D: Decoder, R: RenderBackend> StreamEngine<D, R> {
    /// `unloaded | error -> loading`: submit a decode for the tile, scored by
    /// its current error estimate
    pub fn load(&mut self, id: TileId) -> Result<()> {
        let tile = self.tile_entry(id)?;
        let epoch = tile.begin_load()?;
        debug!(tile = %id, epoch, "Tile loading");
        self.metrics.loads_started.inc();
        self.metrics.record_transition(TileState::Loading);
        self.submit_decode(id)
    }

    /// `loading | cached -> visible`. Requires decoded data.
    pub fn show(&mut self, id: TileId) -> Result<()> {
        let tile = self.tile_entry(id)?;
        tile.assert_transition(TileState::Visible)?;
        let Some(handle) = tile.payload().map(|p| p.handle) else {
            return Err(StreamError::MissingPayload(id));
        };
        let was_cached = tile.state() == TileState::Cached;
        tile.mark_visible()?;

        if was_cached {
            self.cache.remove(&id);
        }
        self.renderer.set_visible(handle, true);
        self.visible.insert(id);
        self.metrics.record_transition(TileState::Visible);
        debug!(tile = %id, from_cache = was_cached, "Tile visible");
        Ok(())
    }

    /// `visible -> cached`: hide the tile and park it in the LRU cache.
    /// Tiles pushed out of the cache by this insertion are unloaded.
    pub fn cache(&mut self, id: TileId) -> Result<()> {
        self.hide(id)?;
        let points = self.tile_entry(id)?.point_count();
        let evicted = self.cache.insert(id, points);
        for victim in evicted {
            self.metrics.evictions.inc();
            self.unload(victim)?;
        }
        Ok(())
    }

    /// `loading | cached | error -> unloaded`, a no-op when already unloaded.
    /// Releases renderer resources and cancels the tile's queued decode.
    pub fn unload(&mut self, id: TileId) -> Result<()> {
        let tile = self.tile_entry(id)?;
        if tile.state() == TileState::Unloaded {
            return Ok(());
        }
        tile.assert_transition(TileState::Unloaded)?;
        let task = tile.task();
        let payload = tile.reset()?;

        if let Some(task) = task {
            self.pool.cancel(task);
        }
        if let Some(payload) = payload {
            self.renderer.release(payload.handle);
        }
        self.visible.remove(&id);
        self.cache.remove(&id);
        self.metrics.record_transition(TileState::Unloaded);
        debug!(tile = %id, "Tile unloaded");
        Ok(())
    }

    /// `visible -> cached` without touching the LRU cache
    pub(super) fn hide(&mut self, id: TileId) -> Result<()> {
        let tile = self.tile_entry(id)?;
        tile.mark_cached()?;
        let handle = tile.payload().map(|p| p.handle);
        if let Some(handle) = handle {
            self.renderer.set_visible(handle, false);
        }
        self.visible.remove(&id);
        self.metrics.record_transition(TileState::Cached);
        debug!(tile = %id, "Tile hidden");
        Ok(())
    }

    /// Hand a `loading` tile to the worker pool
    pub(super) fn submit_decode(&mut self, id: TileId) -> Result<()> {
        let cloud = find_cloud(&self.clouds, id.cloud).ok_or(StreamError::UnknownPointCloud(id.cloud))?;
        let tile = cloud.index().tile(&id.path)?;
        let task = DecodeTask {
            tile: id,
            epoch: tile.epoch(),
            request: cloud.decode_request(tile),
            score: self.error_of(tile),
            points: tile.point_count(),
        };
        let task_id = self.pool.submit(task);
        self.tile_entry(id)?.set_task(Some(task_id));
        Ok(())
    }

    /// Error estimate under the current camera, zero without one
    pub(super) fn error_of(&self, tile: &Tile) -> f64 {
        match &self.camera {
            Some(camera) => camera.error_estimate(tile.spacing(), tile.bounds()),
            None => 0.0,
        }
    }

    pub(super) fn tile_entry(&mut self, id: TileId) -> Result<&mut Tile> {
        find_tile_mut(&mut self.clouds, id).ok_or(StreamError::UnknownTile(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrphanPolicy, StreamConfig};
    use crate::decode::{DecodeRequest, DecodedAttributes};
    use crate::engine::TileEvent;
    use crate::error::DecodeError;
    use crate::pointcloud::{HierarchyEntry, PointCloud, PointCloudMeta};
    use crate::render::{HeadlessRenderer, MockRenderBackend, RenderHandle};
    use crate::types::{Aabb, TilePath};
    use async_trait::async_trait;
    use glam::DVec3;
    use std::sync::Arc;

    /// Decoder returning the declared number of points
    struct Declared;

    #[async_trait]
    impl Decoder for Declared {
        async fn decode(&self, request: &DecodeRequest) -> std::result::Result<DecodedAttributes, DecodeError> {
            Ok(DecodedAttributes::zeroed(request.descriptor.point_count as usize))
        }
    }

    fn cloud(points: &[(TilePath, u64)]) -> PointCloud {
        let meta = PointCloudMeta {
            name: "unit".into(),
            source: "unit.bin".into(),
            offset: DVec3::ZERO,
            tight_bounds: Aabb::new(DVec3::ZERO, DVec3::splat(8.0)),
            octree_bounds: Aabb::new(DVec3::ZERO, DVec3::splat(8.0)),
            spacing: 1.0,
        };
        let entries = points
            .iter()
            .map(|&(p, n)| HierarchyEntry::new(p, 0, 0, n))
            .collect();
        PointCloud::from_hierarchy(meta, entries, OrphanPolicy::Reject).unwrap()
    }

    fn engine() -> (StreamEngine<Declared>, TileId, TileId) {
        let mut engine =
            StreamEngine::new(StreamConfig::default(), Arc::new(Declared), HeadlessRenderer::new()).unwrap();
        let pc = cloud(&[(TilePath::ROOT, 100), (TilePath::new(1, 0, 0, 0), 40)]);
        let cloud_id = engine.add_point_cloud(pc);
        (
            engine,
            TileId::new(cloud_id, TilePath::ROOT),
            TileId::new(cloud_id, TilePath::new(1, 0, 0, 0)),
        )
    }

    #[tokio::test]
    async fn test_load_show_cache_show_cycle() {
        let (mut engine, root, _) = engine();
        engine.load(root).unwrap();
        assert_eq!(engine.state_of(root), Some(TileState::Loading));
        assert!(matches!(engine.show(root), Err(StreamError::MissingPayload(_))));

        engine.run_until_idle().await.unwrap();
        assert_eq!(engine.state_of(root), Some(TileState::Visible));
        assert_eq!(engine.visible_points(), 100);
        assert_eq!(engine.renderer().visible_points(), 100);

        engine.cache(root).unwrap();
        assert_eq!(engine.state_of(root), Some(TileState::Cached));
        assert!(engine.tile_cache().contains(&root));
        assert_eq!(engine.renderer().visible_points(), 0);

        engine.show(root).unwrap();
        assert!(!engine.tile_cache().contains(&root));
        assert_eq!(engine.visible_tiles(), vec![root]);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent_and_releases() {
        let (mut engine, root, child) = engine();
        engine.unload(child).unwrap();
        engine.unload(child).unwrap();
        assert_eq!(engine.state_of(child), Some(TileState::Unloaded));

        engine.load(root).unwrap();
        engine.run_until_idle().await.unwrap();
        assert!(engine.unload(root).unwrap_err().is_contract_violation());

        engine.cache(root).unwrap();
        engine.unload(root).unwrap();
        assert_eq!(engine.renderer().live_objects(), 0);
        assert!(engine.tile_cache().is_empty());
        assert!(engine.tile(root).unwrap().payload().is_none());
    }

    #[tokio::test]
    async fn test_illegal_transitions_abort() {
        let (mut engine, root, _) = engine();
        let err = engine.cache(root).unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidStateTransition {
                current: TileState::Unloaded,
                requested: TileState::Cached,
                ..
            }
        ));
        engine.load(root).unwrap();
        assert!(engine.load(root).unwrap_err().is_contract_violation());
        let unknown = TileId::new(root.cloud, TilePath::new(5, 0, 0, 0));
        assert!(matches!(engine.load(unknown), Err(StreamError::UnknownTile(_))));
    }

    #[tokio::test]
    async fn test_unload_during_flight_discards_completion() {
        let (mut engine, root, _) = engine();
        engine.load(root).unwrap();
        engine.unload(root).unwrap();
        let events = engine.run_until_idle().await.unwrap();
        assert_eq!(events, vec![TileEvent::Discarded { tile: root }]);
        assert_eq!(engine.state_of(root), Some(TileState::Unloaded));
        assert!(engine.visible_tiles().is_empty());
    }

    #[tokio::test]
    async fn test_renderer_calls_follow_transitions() {
        let mut renderer = MockRenderBackend::new();
        renderer.expect_upload().times(1).returning(|_, _| RenderHandle::new(9));
        renderer
            .expect_set_visible()
            .withf(|h, v| h.raw() == 9 && *v)
            .times(1)
            .return_const(());
        renderer
            .expect_set_visible()
            .withf(|h, v| h.raw() == 9 && !*v)
            .times(1)
            .return_const(());
        renderer.expect_release().times(1).return_const(());

        let mut engine = StreamEngine::new(StreamConfig::default(), Arc::new(Declared), renderer).unwrap();
        let cloud_id = engine.add_point_cloud(cloud(&[(TilePath::ROOT, 3)]));
        let root = TileId::new(cloud_id, TilePath::ROOT);

        engine.load(root).unwrap();
        engine.run_until_idle().await.unwrap();
        engine.cache(root).unwrap();
        engine.unload(root).unwrap();
    }
}
