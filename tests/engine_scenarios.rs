//! End-to-end behaviour of the streaming engine: budget, cache, rescoring,
//! retries and dataset lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glam::DVec3;
use lod_stream::{
    Aabb, Camera, DecodeError, DecodeRequest, DecodedAttributes, Decoder, EngineNotice,
    FileSource, HierarchyEntry, OrphanPolicy, PointCloud, PointCloudMeta, Projection, RawPoint,
    RecordDecoder, RecordLayout, RetryConfig, StreamConfig, StreamEngine, StreamError, TileEvent,
    TileId, TilePath, TileState, HeadlessRenderer,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Semaphore;

/// Returns the declared point count plus `extra` points
struct Declared {
    extra: usize,
}

#[async_trait]
impl Decoder for Declared {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError> {
        Ok(DecodedAttributes::zeroed(
            request.descriptor.point_count as usize + self.extra,
        ))
    }
}

/// Always fails
struct Broken;

#[async_trait]
impl Decoder for Broken {
    async fn decode(&self, _request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError> {
        Err(DecodeError::unavailable("connection reset"))
    }
}

/// Blocks every decode until permits are added
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Decoder for Gated {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError> {
        let _permit = self.gate.acquire().await.map_err(|_| DecodeError::Cancelled)?;
        Ok(DecodedAttributes::zeroed(request.descriptor.point_count as usize))
    }
}

/// Returns colour and intensity arrays shorter than the positions
struct Ragged;

#[async_trait]
impl Decoder for Ragged {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError> {
        let mut attributes = DecodedAttributes::zeroed(request.descriptor.point_count as usize);
        attributes.colors.truncate(1);
        attributes.intensity.clear();
        Ok(attributes)
    }
}

fn meta(name: &str) -> PointCloudMeta {
    PointCloudMeta {
        name: name.to_string(),
        source: format!("{}.bin", name),
        offset: DVec3::ZERO,
        tight_bounds: Aabb::new(DVec3::ZERO, DVec3::splat(8.0)),
        octree_bounds: Aabb::new(DVec3::ZERO, DVec3::splat(8.0)),
        spacing: 1.0,
    }
}

fn point_cloud(name: &str, tiles: &[(TilePath, u64)]) -> PointCloud {
    let entries = tiles
        .iter()
        .map(|&(path, points)| HierarchyEntry::new(path, 0, 0, points))
        .collect();
    PointCloud::from_hierarchy(meta(name), entries, OrphanPolicy::Reject).unwrap()
}

/// Looks down -z at the whole octree cube
fn overview_camera() -> Camera {
    Camera::look_at(
        DVec3::new(4.0, 4.0, 30.0),
        DVec3::new(4.0, 4.0, 4.0),
        DVec3::Y,
        Projection::perspective(std::f64::consts::FRAC_PI_3, 1.0, 0.1, 1000.0),
    )
}

fn engine<D: Decoder>(config: StreamConfig, decoder: D) -> StreamEngine<D> {
    StreamEngine::new(config, Arc::new(decoder), HeadlessRenderer::new()).unwrap()
}

fn tile(cloud: &PointCloud, path: TilePath) -> TileId {
    TileId::new(cloud.id(), path)
}

#[tokio::test]
async fn test_single_root_becomes_visible() {
    let mut engine = engine(StreamConfig::default(), Declared { extra: 0 });
    let pc = point_cloud("root-only", &[(TilePath::ROOT, 100)]);
    let root = tile(&pc, TilePath::ROOT);
    engine.add_point_cloud(pc);
    engine.set_camera(overview_camera());

    let report = engine.run_pass().unwrap();
    assert_eq!(report.loads_started, 1);
    assert_eq!(report.in_flight_points, 100);

    engine.run_until_idle().await.unwrap();
    assert_eq!(engine.state_of(root), Some(TileState::Visible));
    assert_eq!(engine.visible_points(), 100);
    assert_eq!(engine.renderer().visible_points(), 100);
    assert!(engine.renderer().redraw_requests() >= 1);
}

#[tokio::test]
async fn test_visible_and_in_flight_stay_within_budget() {
    let budget = 450;
    let mut engine = engine(StreamConfig::default().point_budget(budget), Declared { extra: 0 });

    let mut tiles = vec![(TilePath::ROOT, 100)];
    for octant in 0..8 {
        tiles.push((TilePath::ROOT.child(octant), 100));
    }
    let parent = TilePath::ROOT.child(7);
    for octant in 0..8 {
        tiles.push((parent.child(octant), 100));
    }
    let pc = point_cloud("levels", &tiles);
    let root = tile(&pc, TilePath::ROOT);
    engine.add_point_cloud(pc);
    engine.set_camera(overview_camera());

    let mut stable = false;
    for _ in 0..8 {
        let report = engine.run_pass().unwrap();
        assert!(report.visible_points + report.in_flight_points <= budget);
        engine.run_until_idle().await.unwrap();
        assert!(engine.visible_points() <= budget);
        if report.loads_started == 0 {
            stable = true;
            break;
        }
    }
    assert!(stable);
    assert_eq!(engine.state_of(root), Some(TileState::Visible));
    assert_eq!(engine.visible_points(), 400);
    assert_eq!(engine.visible_tiles().len(), 4);
}

#[tokio::test]
async fn test_cache_ceiling_evicts_least_recently_used() {
    let config = StreamConfig::default().cache_ceiling(1000);
    let mut engine = engine(config, Declared { extra: 0 });
    let a = TilePath::new(1, 0, 0, 0);
    let b = TilePath::new(1, 1, 0, 0);
    let c = TilePath::new(1, 0, 1, 0);
    let pc = point_cloud("cache", &[(TilePath::ROOT, 10), (a, 400), (b, 400), (c, 400)]);
    let (a, b, c) = (tile(&pc, a), tile(&pc, b), tile(&pc, c));
    engine.add_point_cloud(pc);

    for id in [a, b, c] {
        engine.load(id).unwrap();
    }
    engine.run_until_idle().await.unwrap();
    assert_eq!(engine.visible_points(), 1200);

    engine.cache(a).unwrap();
    engine.cache(b).unwrap();
    assert_eq!(engine.state_of(a), Some(TileState::Cached));
    engine.cache(c).unwrap();

    assert_eq!(engine.state_of(a), Some(TileState::Unloaded));
    assert_eq!(engine.state_of(b), Some(TileState::Cached));
    assert_eq!(engine.state_of(c), Some(TileState::Cached));
    assert_eq!(engine.tile_cache().total_points(), 800);
    assert_eq!(engine.renderer().live_objects(), 2);
    assert_eq!(engine.stats().evictions, 1);
}

#[tokio::test]
async fn test_rescore_drops_culled_queued_task() {
    let gate = Arc::new(Semaphore::new(0));
    let config = StreamConfig::default().pool_size(1);
    let mut engine = engine(config, Gated { gate: gate.clone() });

    let b = TilePath::new(1, 0, 0, 0);
    let c = TilePath::new(1, 1, 0, 0);
    let d = TilePath::new(1, 0, 1, 0);
    let pc = point_cloud("rescore", &[(TilePath::ROOT, 50), (b, 20), (c, 20), (d, 20)]);
    let root = tile(&pc, TilePath::ROOT);
    let (b, c, d) = (tile(&pc, b), tile(&pc, c), tile(&pc, d));
    engine.add_point_cloud(pc);

    // Sees only x in [0.05, 3.95]; tile c spans x in [4, 8]
    engine.set_camera(Camera::look_at(
        DVec3::new(2.0, 4.0, 30.0),
        DVec3::new(2.0, 4.0, 0.0),
        DVec3::Y,
        Projection::orthographic(3.9, 20.0, 0.1, 100.0),
    ));

    for id in [root, b, c, d] {
        engine.load(id).unwrap();
    }
    assert_eq!(engine.pool_status().active, 1);
    assert_eq!(engine.pool_status().queued, 3);

    let report = engine.run_pass().unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(engine.pool_status().queued, 2);
    assert_eq!(engine.state_of(c), Some(TileState::Unloaded));
    assert_eq!(engine.stats().rescore_cancellations, 1);

    gate.add_permits(16);
    engine.run_until_idle().await.unwrap();
    for id in [root, b, d] {
        assert_eq!(engine.state_of(id), Some(TileState::Visible));
    }
    assert_eq!(engine.state_of(c), Some(TileState::Unloaded));
    assert_eq!(engine.visible_points(), 90);
}

#[tokio::test]
async fn test_stale_completion_is_discarded() {
    let mut engine = engine(StreamConfig::default(), Declared { extra: 0 });
    let pc = point_cloud("stale", &[(TilePath::ROOT, 100)]);
    let root = tile(&pc, TilePath::ROOT);
    engine.add_point_cloud(pc);

    engine.load(root).unwrap();
    engine.unload(root).unwrap();
    engine.unload(root).unwrap();
    engine.load(root).unwrap();
    assert_eq!(engine.tile(root).unwrap().epoch(), 2);

    let events = engine.run_until_idle().await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&TileEvent::Discarded { tile: root }));
    assert!(events.contains(&TileEvent::Visible { tile: root, points: 100 }));
    assert_eq!(engine.state_of(root), Some(TileState::Visible));
    assert_eq!(engine.renderer().live_objects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_then_error_with_single_dataset_notice() {
    let config = StreamConfig::default().retry(
        RetryConfig::new()
            .max_retries(2)
            .delay(Duration::from_millis(200)),
    );
    let mut engine = engine(config, Broken);
    let mut notices = engine.subscribe_notices();
    let pc = point_cloud("offline", &[(TilePath::ROOT, 100)]);
    let root = tile(&pc, TilePath::ROOT);
    let cloud_id = pc.id();
    engine.add_point_cloud(pc);

    engine.load(root).unwrap();
    let events = engine.run_until_idle().await.unwrap();
    assert_eq!(events.len(), 5);
    assert!(matches!(
        events[0],
        TileEvent::RetryScheduled { attempt: 1, delay, .. } if delay == Duration::from_millis(200)
    ));
    assert_eq!(events[1], TileEvent::Resubmitted { tile: root });
    assert!(matches!(events[2], TileEvent::RetryScheduled { attempt: 2, .. }));
    assert_eq!(events[3], TileEvent::Resubmitted { tile: root });
    assert!(matches!(events[4], TileEvent::Failed { .. }));

    let failed = engine.tile(root).unwrap();
    assert_eq!(failed.state(), TileState::Error);
    assert_eq!(failed.attempts(), 3);
    assert!(matches!(failed.last_error(), Some(DecodeError::Source(_))));

    match notices.try_recv().unwrap() {
        EngineNotice::DatasetFailed { cloud, name, .. } => {
            assert_eq!(cloud, cloud_id);
            assert_eq!(name, "offline");
        }
        other => panic!("unexpected notice {:?}", other),
    }

    // A second failed attempt on the same dataset stays quiet
    engine.load(root).unwrap();
    engine.run_until_idle().await.unwrap();
    assert_eq!(engine.state_of(root), Some(TileState::Error));
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));

    let stats = engine.stats();
    assert_eq!(stats.load_failures, 2);
    assert_eq!(stats.retries, 4);
}

#[tokio::test]
async fn test_inconsistent_decoder_output_fails_the_load() {
    let config = StreamConfig::default().retry(RetryConfig::new().max_retries(0));
    let mut engine = engine(config, Ragged);
    let pc = point_cloud("ragged", &[(TilePath::ROOT, 3)]);
    let root = tile(&pc, TilePath::ROOT);
    engine.add_point_cloud(pc);

    engine.load(root).unwrap();
    let events = engine.run_until_idle().await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        TileEvent::Failed { error: DecodeError::Malformed(_), .. }
    ));

    assert_eq!(engine.state_of(root), Some(TileState::Error));
    assert_eq!(engine.visible_points(), 0);
    assert_eq!(engine.renderer().live_objects(), 0);
    assert_eq!(engine.stats().loads_completed, 0);
    assert_eq!(engine.stats().load_failures, 1);
}

#[tokio::test]
async fn test_point_count_mismatch_is_reported_and_decoded_count_wins() {
    let mut engine = engine(StreamConfig::default(), Declared { extra: 5 });
    let mut notices = engine.subscribe_notices();
    let pc = point_cloud("mismatch", &[(TilePath::ROOT, 100)]);
    let root = tile(&pc, TilePath::ROOT);
    engine.add_point_cloud(pc);

    engine.load(root).unwrap();
    engine.run_until_idle().await.unwrap();

    assert_eq!(
        notices.try_recv().unwrap(),
        EngineNotice::PointCountMismatch { tile: root, declared: 100, decoded: 105 }
    );
    assert_eq!(engine.visible_points(), 105);
    assert_eq!(engine.tile(root).unwrap().declared_points(), 100);
    assert_eq!(engine.stats().point_count_mismatches, 1);
}

#[tokio::test]
async fn test_remove_point_cloud_releases_everything() {
    let mut engine = engine(StreamConfig::default(), Declared { extra: 0 });
    let keep = point_cloud("keep", &[(TilePath::ROOT, 10)]);
    let gone = point_cloud("gone", &[(TilePath::ROOT, 20), (TilePath::new(1, 0, 0, 0), 5)]);
    let keep_root = tile(&keep, TilePath::ROOT);
    let drop_root = tile(&gone, TilePath::ROOT);
    let drop_child = tile(&gone, TilePath::new(1, 0, 0, 0));
    let drop_id = gone.id();
    engine.add_point_cloud(keep);
    engine.add_point_cloud(gone);

    for id in [keep_root, drop_root, drop_child] {
        engine.load(id).unwrap();
    }
    engine.run_until_idle().await.unwrap();
    engine.cache(drop_child).unwrap();
    assert_eq!(engine.renderer().live_objects(), 3);

    let removed = engine.remove_point_cloud(drop_id).unwrap();
    assert_eq!(removed.name(), "gone");
    assert_eq!(engine.point_clouds().len(), 1);
    assert_eq!(engine.visible_tiles(), vec![keep_root]);
    assert_eq!(engine.visible_points(), 10);
    assert!(engine.tile_cache().is_empty());
    assert_eq!(engine.renderer().live_objects(), 1);
    assert!(engine.tile(drop_root).is_none());

    assert!(matches!(
        engine.remove_point_cloud(drop_id),
        Err(StreamError::UnknownPointCloud(_))
    ));
}

#[tokio::test]
async fn test_update_respects_throttle() {
    let config = StreamConfig::default().throttle(Duration::from_secs(60));
    let mut engine = engine(config, Declared { extra: 0 });
    engine.add_point_cloud(point_cloud("throttle", &[(TilePath::ROOT, 1)]));
    engine.set_camera(overview_camera());

    let now = Instant::now();
    assert!(engine.update(now).unwrap().is_some());
    engine.set_camera(overview_camera());
    assert!(engine.update(now + Duration::from_millis(10)).unwrap().is_none());
    assert!(engine.update(now + Duration::from_secs(61)).unwrap().is_some());
    assert!(engine.update(now + Duration::from_secs(200)).unwrap().is_none());
}

#[tokio::test]
async fn test_file_backed_dataset_streams_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RecordLayout::default();
    let point = |x: f64, c: u8| RawPoint {
        position: DVec3::new(x, 1.0, 1.0),
        intensity: 100,
        classification: c,
        color: [65535, 65535, 65535],
    };
    let root_bytes = layout.encode(&[point(1.0, 2), point(5.0, 2), point(7.0, 6)]);
    let child_bytes = layout.encode(&[point(0.5, 2), point(1.5, 2)]);
    let mut blob = root_bytes.clone();
    blob.extend_from_slice(&child_bytes);
    std::fs::write(dir.path().join("scan.bin"), &blob).unwrap();

    let doc = serde_json::json!({
        "meta": {
            "name": "scan",
            "source": "scan.bin",
            "offset": [0.0, 0.0, 0.0],
            "tight_bounds": { "min": [0.0, 0.0, 0.0], "max": [8.0, 8.0, 8.0] },
            "octree_bounds": { "min": [0.0, 0.0, 0.0], "max": [8.0, 8.0, 8.0] },
            "spacing": 1.0
        },
        "hierarchy": [
            { "path": "1-0-0-0", "byte_offset": root_bytes.len(), "byte_size": child_bytes.len(), "point_count": 2 },
            { "path": "0-0-0-0", "byte_offset": 0, "byte_size": root_bytes.len(), "point_count": 3 }
        ]
    });
    let hierarchy = dir.path().join("hierarchy.json");
    std::fs::write(&hierarchy, doc.to_string()).unwrap();

    let pc = PointCloud::from_json_file(&hierarchy, OrphanPolicy::Reject).unwrap();
    assert_eq!(pc.total_declared_points(), 5);
    let decoder = RecordDecoder::new(Arc::new(FileSource::new(dir.path())), layout);
    let mut engine = engine(StreamConfig::default(), decoder);
    engine.add_point_cloud(pc);
    engine.set_camera(overview_camera());

    let report = engine.refine_until_stable(4).await.unwrap();
    assert_eq!(report.loads_started, 0);
    assert_eq!(engine.visible_points(), 5);
    assert_eq!(engine.renderer().visible_points(), 5);
    assert_eq!(engine.stats().loads_completed, 2);
}
