//! Point cloud datasets
//!
//! ## Table of Contents
//! - **PointCloudMeta**: Name, source handle, offset, bounds, root spacing
//! - **HierarchyEntry**: One tile of the hierarchy and where its bytes live
//! - **PointCloud**: Metadata plus the spatial index built from a hierarchy
//!
//! A hierarchy can be loaded from JSON:
//!
//! ```json
//! {
//!   "meta": { "name": "scan", "source": "scan.bin", "offset": [0, 0, 0], ... },
//!   "hierarchy": [ { "path": "0-0-0-0", "byte_offset": 0, "byte_size": 2100, "point_count": 100 } ]
//! }
//! ```

use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::OrphanPolicy;
use crate::decode::DecodeRequest;
use crate::error::{Result, StreamError};
use crate::index::SpatialIndex;
use crate::tile::{Tile, TileDescriptor};
use crate::types::{Aabb, PointCloudId, TileId, TilePath};

/// Dataset-wide metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudMeta {
    /// Display name
    pub name: String,
    /// Handle the byte source resolves
    pub source: String,
    /// Subtracted from decoded positions
    pub offset: DVec3,
    /// Bounds of the actual points
    pub tight_bounds: Aabb,
    /// Cube the octree subdivides
    pub octree_bounds: Aabb,
    /// Nominal point spacing of the root tile
    pub spacing: f64,
}

/// One hierarchy record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    /// Tile address, `depth-x-y-z` in text form
    #[serde(with = "path_text")]
    pub path: TilePath,
    /// Byte offset into the source
    pub byte_offset: u64,
    /// Encoded length
    pub byte_size: u64,
    /// Declared point count, may be zero
    pub point_count: u64,
}

impl HierarchyEntry {
    /// Create an entry
    pub fn new(path: TilePath, byte_offset: u64, byte_size: u64, point_count: u64) -> Self {
        Self {
            path,
            byte_offset,
            byte_size,
            point_count,
        }
    }

    fn descriptor(&self) -> TileDescriptor {
        TileDescriptor {
            byte_offset: self.byte_offset,
            byte_size: self.byte_size,
            point_count: self.point_count,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HierarchyDocument {
    meta: PointCloudMeta,
    hierarchy: Vec<HierarchyEntry>,
}

/// A registered dataset
#[derive(Debug)]
pub struct PointCloud {
    id: PointCloudId,
    meta: PointCloudMeta,
    index: SpatialIndex,
}

impl PointCloud {
    /// Build a point cloud from its hierarchy. Entries may arrive in any
    /// order; they are inserted shallowest first.
    pub fn from_hierarchy(
        meta: PointCloudMeta,
        mut entries: Vec<HierarchyEntry>,
        orphan_policy: OrphanPolicy,
    ) -> Result<Self> {
        let id = PointCloudId::new();
        entries.sort_by_key(|e| e.path.depth);

        let mut index = SpatialIndex::new(id, orphan_policy);
        for entry in &entries {
            if !entry.path.is_valid() {
                return Err(StreamError::InvalidPath(entry.path));
            }
            let bounds = meta.octree_bounds.cell(entry.path);
            let spacing = meta.spacing / (1u64 << entry.path.depth) as f64;
            index.insert(Tile::new(
                TileId::new(id, entry.path),
                bounds,
                spacing,
                entry.descriptor(),
            ))?;
        }

        info!(
            cloud = %id,
            name = %meta.name,
            tiles = index.len(),
            points = index.declared_points(),
            "Built point cloud index"
        );
        Ok(Self { id, meta, index })
    }

    /// Parse a `{ meta, hierarchy }` JSON document
    pub fn from_json_str(json: &str, orphan_policy: OrphanPolicy) -> Result<Self> {
        let doc: HierarchyDocument = serde_json::from_str(json)?;
        Self::from_hierarchy(doc.meta, doc.hierarchy, orphan_policy)
    }

    /// Read a `{ meta, hierarchy }` JSON file
    pub fn from_json_file(path: impl AsRef<Path>, orphan_policy: OrphanPolicy) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text, orphan_policy)
    }

    /// Dataset id
    pub fn id(&self) -> PointCloudId {
        self.id
    }

    /// Metadata
    pub fn meta(&self) -> &PointCloudMeta {
        &self.meta
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Spatial index
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub(crate) fn index_mut(&mut self) -> &mut SpatialIndex {
        &mut self.index
    }

    /// Root tile
    pub fn root(&self) -> Option<&Tile> {
        self.index.root()
    }

    /// Sum of declared point counts over the hierarchy
    pub fn total_declared_points(&self) -> u64 {
        self.index.declared_points()
    }

    /// Decode request for one of this cloud's tiles
    pub fn decode_request(&self, tile: &Tile) -> DecodeRequest {
        DecodeRequest {
            tile: tile.id(),
            source: self.meta.source.clone(),
            descriptor: *tile.descriptor(),
            offset: self.meta.offset,
        }
    }
}

mod path_text {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::TilePath;

    pub fn serialize<S: Serializer>(path: &TilePath, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(path)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TilePath, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
