//! Streaming Demo
//!
//! Builds a synthetic three-level point cloud in memory, streams it under a
//! small budget, then moves the camera and streams again.
//!
//! Run with: cargo run --example stream_demo

use std::sync::Arc;

use anyhow::Context;
use glam::DVec3;
use lod_stream::{
    init_tracing, Aabb, Camera, EngineBuilder, EngineNotice, HierarchyEntry, MemorySource,
    OrphanPolicy, PointCloud, PointCloudMeta, Projection, RawPoint, RecordDecoder, RecordLayout,
    TilePath,
};

const SOURCE: &str = "synthetic.bin";

/// Points scattered through the cell at `path`
fn cell_points(bounds: &Aabb, path: TilePath, count: usize) -> Vec<RawPoint> {
    let cell = bounds.cell(path);
    let size = cell.size();
    (0..count)
        .map(|i| {
            let t = (i as f64 + 0.5) / count as f64;
            RawPoint {
                position: cell.min + size * DVec3::new(t, (t * 7.0).fract(), (t * 13.0).fract()),
                intensity: (i % 4096) as u16,
                classification: if path.depth == 0 { 2 } else { 1 },
                color: [40_000, 30_000, (path.depth as u16) * 20_000],
            }
        })
        .collect()
}

/// Encode every tile into one blob and describe it as a hierarchy
fn synthetic_dataset(layout: &RecordLayout) -> (PointCloudMeta, Vec<HierarchyEntry>, Vec<u8>) {
    let bounds = Aabb::new(DVec3::ZERO, DVec3::splat(64.0));
    let mut paths = vec![TilePath::ROOT];
    for octant in 0..8 {
        let child = TilePath::ROOT.child(octant);
        paths.push(child);
        if octant < 2 {
            paths.extend((0..8).map(|o| child.child(o)));
        }
    }

    let mut blob = Vec::new();
    let mut entries = Vec::new();
    for path in paths {
        let count = 2_000 >> path.depth;
        let bytes = layout.encode(&cell_points(&bounds, path, count));
        entries.push(HierarchyEntry::new(
            path,
            blob.len() as u64,
            bytes.len() as u64,
            count as u64,
        ));
        blob.extend_from_slice(&bytes);
    }

    let meta = PointCloudMeta {
        name: "synthetic".into(),
        source: SOURCE.into(),
        offset: DVec3::ZERO,
        tight_bounds: bounds,
        octree_bounds: bounds,
        spacing: 4.0,
    };
    (meta, entries, blob)
}

fn camera(eye: DVec3) -> Camera {
    Camera::look_at(
        eye,
        DVec3::splat(32.0),
        DVec3::Z,
        Projection::perspective(60f64.to_radians(), 16.0 / 9.0, 0.1, 2_000.0),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,lod_stream=debug")?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               LOD STREAM DEMO                                ║");
    println!("╚══════════════════════════════════════════════════════════════╝");

    let layout = RecordLayout::default();
    let (meta, entries, blob) = synthetic_dataset(&layout);
    let source = Arc::new(MemorySource::new().with_blob(SOURCE, blob));
    let cloud = PointCloud::from_hierarchy(meta, entries, OrphanPolicy::Reject)
        .context("building synthetic hierarchy")?;
    println!(
        "Dataset: {} tiles, {} points",
        cloud.index().len(),
        cloud.total_declared_points()
    );

    let mut engine = EngineBuilder::new(Arc::new(RecordDecoder::new(source, layout)))
        .with_point_budget(8_000)
        .with_error_threshold(0.01)
        .with_pool_size(2)
        .with_cache_ceiling(4_000)
        .with_point_cloud(cloud)
        .with_camera(camera(DVec3::new(32.0, -120.0, 80.0)))
        .build()?;
    let mut notices = engine.subscribe_notices();

    let report = engine.refine_until_stable(16).await?;
    println!(
        "Overview:  {} points in {} tiles ({} candidates)",
        report.visible_points, report.visible_tiles, report.candidates
    );

    engine.set_camera(camera(DVec3::new(8.0, 8.0, 40.0)));
    let report = engine.refine_until_stable(16).await?;
    println!(
        "Close-up:  {} points in {} tiles, {} demoted, {} cancelled",
        report.visible_points, report.visible_tiles, report.demoted, report.cancelled
    );
    println!(
        "Cache:     {} tiles, {} points",
        engine.tile_cache().len(),
        engine.tile_cache().total_points()
    );

    while let Ok(notice) = notices.try_recv() {
        match notice {
            EngineNotice::PointCountMismatch { tile, declared, decoded } => {
                println!("Notice: {} declared {} points, decoded {}", tile, declared, decoded)
            }
            EngineNotice::DatasetFailed { name, message, .. } => {
                println!("Notice: dataset {} failed: {}", name, message)
            }
        }
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    println!("{}", engine.metrics().gather_text()?);

    engine.shutdown();
    Ok(())
}
