//! Core identity and geometry types
//!
//! ## Table of Contents
//! - **TilePath**: (depth, x, y, z) address of an octree cell
//! - **PointCloudId**: Unique identifier for a registered point cloud
//! - **TileId**: Tile identity across all point clouds
//! - **Aabb**: Axis-aligned bounding box in double precision

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Address of an octree cell: level plus integer cell coordinates at that level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePath {
    /// Octree level, 0 for the root
    pub depth: u32,
    /// Cell x coordinate at `depth`
    pub x: u32,
    /// Cell y coordinate at `depth`
    pub y: u32,
    /// Cell z coordinate at `depth`
    pub z: u32,
}

impl TilePath {
    /// The root cell
    pub const ROOT: TilePath = TilePath { depth: 0, x: 0, y: 0, z: 0 };

    /// Deepest supported level; cell coordinates at this level still fit in `u32`
    pub const MAX_DEPTH: u32 = 31;

    /// Create a new path
    pub fn new(depth: u32, x: u32, y: u32, z: u32) -> Self {
        Self { depth, x, y, z }
    }

    /// Whether the depth is supported and every coordinate lies inside the
    /// `2^depth` grid of its level
    pub fn is_valid(&self) -> bool {
        if self.depth > Self::MAX_DEPTH {
            return false;
        }
        let cells = 1u64 << self.depth;
        [self.x, self.y, self.z].iter().all(|&c| u64::from(c) < cells)
    }

    /// Whether this is the root cell
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Parent cell, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.depth == 0 {
            return None;
        }
        Some(Self {
            depth: self.depth - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// Child cell for the given octant (bit 0 = x, bit 1 = y, bit 2 = z)
    pub fn child(&self, octant: u8) -> Self {
        Self {
            depth: self.depth + 1,
            x: (self.x << 1) | (octant & 1) as u32,
            y: (self.y << 1) | ((octant >> 1) & 1) as u32,
            z: (self.z << 1) | ((octant >> 2) & 1) as u32,
        }
    }

    /// Iterator over strict ancestors, nearest first
    pub fn ancestors(&self) -> impl Iterator<Item = TilePath> {
        std::iter::successors(self.parent(), |p| p.parent())
    }
}

impl fmt::Display for TilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.depth, self.x, self.y, self.z)
    }
}

impl FromStr for TilePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(format!("expected depth-x-y-z, got {:?}", s));
        }
        let parse = |p: &str| p.parse::<u32>().map_err(|e| format!("{}: {}", s, e));
        Ok(Self {
            depth: parse(parts[0])?,
            x: parse(parts[1])?,
            y: parse(parts[2])?,
            z: parse(parts[3])?,
        })
    }
}

/// Unique identifier for a point cloud registered with the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointCloudId(Uuid);

impl PointCloudId {
    /// Create a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an id from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PointCloudId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PointCloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc-{}", &self.0.to_string()[..8])
    }
}

/// Identity of a tile: owning point cloud plus octree path.
/// Also serves as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    /// Owning point cloud
    pub cloud: PointCloudId,
    /// Octree address inside that cloud
    pub path: TilePath,
}

impl TileId {
    /// Create a new tile id
    pub fn new(cloud: PointCloudId, path: TilePath) -> Self {
        Self { cloud, path }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cloud, self.path)
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: DVec3,
    /// Maximum corner
    pub max: DVec3,
}

impl Aabb {
    /// Create a box from two corners
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Cube centred on `center` with half extent `half`
    pub fn cube(center: DVec3, half: f64) -> Self {
        Self {
            min: center - DVec3::splat(half),
            max: center + DVec3::splat(half),
        }
    }

    /// Box center
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Edge lengths
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Radius of the bounding sphere
    pub fn radius(&self) -> f64 {
        self.size().length() * 0.5
    }

    /// Bounds of the child octant (bit 0 = x, bit 1 = y, bit 2 = z)
    pub fn child(&self, octant: u8) -> Self {
        let c = self.center();
        let min = DVec3::new(
            if octant & 1 == 0 { self.min.x } else { c.x },
            if octant & 2 == 0 { self.min.y } else { c.y },
            if octant & 4 == 0 { self.min.z } else { c.z },
        );
        let max = DVec3::new(
            if octant & 1 == 0 { c.x } else { self.max.x },
            if octant & 2 == 0 { c.y } else { self.max.y },
            if octant & 4 == 0 { c.z } else { self.max.z },
        );
        Self { min, max }
    }

    /// Bounds of the cell at `path`, taking `self` as the root cell
    pub fn cell(&self, path: TilePath) -> Self {
        let cells = f64::from(path.depth).exp2();
        let step = self.size() / cells;
        let min = self.min + step * DVec3::new(path.x as f64, path.y as f64, path.z as f64);
        Self { min, max: min + step }
    }

    /// Whether the point lies inside (inclusive)
    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Closest point inside the box
    pub fn closest_point(&self, p: DVec3) -> DVec3 {
        p.clamp(self.min, self.max)
    }

    /// Translate by `-offset`
    pub fn shifted(&self, offset: DVec3) -> Self {
        Self {
            min: self.min - offset,
            max: self.max - offset,
        }
    }
}
