//! Spatial index over the tiles of one point cloud
//!
//! ## Table of Contents
//! - **SpatialIndex**: Arena of tiles keyed by `TilePath`, sole owner of its tiles
//! - **BreadthFirst**: Lazy level-order traversal, depth-capped and prunable
//! - **DepthFirst**: Pre-order traversal for diagnostics
//!
//! Tiles are stored in a flat arena; parent and child links are arena
//! indices. Everything outside the index refers to tiles by `TileId`.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::OrphanPolicy;
use crate::error::{Result, StreamError};
use crate::queue::FifoQueue;
use crate::tile::Tile;
use crate::types::{PointCloudId, TileId, TilePath};

#[derive(Debug)]
struct IndexNode {
    tile: Tile,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Octree of tiles for one point cloud
#[derive(Debug)]
pub struct SpatialIndex {
    cloud: PointCloudId,
    nodes: Vec<IndexNode>,
    lookup: HashMap<TilePath, usize>,
    orphan_policy: OrphanPolicy,
}

impl SpatialIndex {
    /// Create an empty index for `cloud`
    pub fn new(cloud: PointCloudId, orphan_policy: OrphanPolicy) -> Self {
        Self {
            cloud,
            nodes: Vec::new(),
            lookup: HashMap::new(),
            orphan_policy,
        }
    }

    /// Owning point cloud
    pub fn cloud(&self) -> PointCloudId {
        self.cloud
    }

    /// Number of tiles
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index holds no tiles
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `path` is present
    pub fn contains(&self, path: &TilePath) -> bool {
        self.lookup.contains_key(path)
    }

    /// Insert a tile. The root must come first. A tile whose direct parent is
    /// missing is attached to its nearest existing ancestor or rejected,
    /// depending on the orphan policy.
    pub fn insert(&mut self, tile: Tile) -> Result<()> {
        let id = tile.id();
        if id.cloud != self.cloud {
            return Err(StreamError::UnknownPointCloud(id.cloud));
        }
        let path = id.path;
        if !path.is_valid() {
            return Err(StreamError::InvalidPath(path));
        }
        if self.lookup.contains_key(&path) {
            return Err(StreamError::DuplicateTile(path));
        }

        let parent = if path.is_root() {
            None
        } else {
            if self.nodes.is_empty() {
                return Err(StreamError::MissingRoot);
            }
            Some(self.attach_point(path)?)
        };

        let slot = self.nodes.len();
        self.nodes.push(IndexNode {
            tile,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(slot);
        }
        self.lookup.insert(path, slot);
        Ok(())
    }

    fn attach_point(&self, path: TilePath) -> Result<usize> {
        let direct = path.parent().and_then(|p| self.lookup.get(&p).copied());
        if let Some(slot) = direct {
            return Ok(slot);
        }
        if self.orphan_policy == OrphanPolicy::Reject {
            return Err(StreamError::MissingAncestor(path));
        }
        match path.ancestors().find_map(|a| self.lookup.get(&a).map(|&slot| (a, slot))) {
            Some((ancestor, slot)) => {
                warn!(
                    cloud = %self.cloud,
                    tile = %path,
                    ancestor = %ancestor,
                    "Parent missing, attaching tile to nearest ancestor"
                );
                Ok(slot)
            }
            None => Err(StreamError::MissingAncestor(path)),
        }
    }

    /// Root tile
    pub fn root(&self) -> Option<&Tile> {
        self.nodes.first().map(|n| &n.tile)
    }

    /// Tile at `path`
    pub fn get(&self, path: &TilePath) -> Option<&Tile> {
        self.lookup.get(path).map(|&i| &self.nodes[i].tile)
    }

    pub(crate) fn get_mut(&mut self, path: &TilePath) -> Option<&mut Tile> {
        match self.lookup.get(path) {
            Some(&i) => Some(&mut self.nodes[i].tile),
            None => None,
        }
    }

    /// Tile at `path`, or `UnknownTile`
    pub fn tile(&self, path: &TilePath) -> Result<&Tile> {
        self.get(path)
            .ok_or_else(|| StreamError::UnknownTile(TileId::new(self.cloud, *path)))
    }

    /// Tile the given tile is attached to. Differs from the geometric parent
    /// for reparented orphans.
    pub fn parent_of(&self, path: &TilePath) -> Option<&Tile> {
        let &i = self.lookup.get(path)?;
        self.nodes[i].parent.map(|p| &self.nodes[p].tile)
    }

    /// Tiles attached directly below `path`
    pub fn children_of(&self, path: &TilePath) -> Vec<&Tile> {
        match self.lookup.get(path) {
            Some(&i) => self.nodes[i].children.iter().map(|&c| &self.nodes[c].tile).collect(),
            None => Vec::new(),
        }
    }

    /// All tiles in insertion order
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.nodes.iter().map(|n| &n.tile)
    }

    /// Sum of declared point counts
    pub fn declared_points(&self) -> u64 {
        self.tiles().map(|t| t.declared_points()).sum()
    }

    /// Level-order traversal. Tiles deeper than `max_depth` are skipped and
    /// the children of a tile are visited only if `descend` returns true for it.
    pub fn breadth_first<P>(&self, max_depth: Option<u32>, descend: P) -> BreadthFirst<'_, P>
    where
        P: FnMut(&Tile) -> bool,
    {
        let mut queue = FifoQueue::with_capacity(self.nodes.len().min(64));
        if !self.nodes.is_empty() {
            queue.push(0);
        }
        debug!(cloud = %self.cloud, tiles = self.nodes.len(), "Starting breadth-first traversal");
        BreadthFirst {
            index: self,
            queue,
            max_depth,
            descend,
        }
    }

    /// Pre-order depth-first traversal of every tile
    pub fn depth_first(&self) -> DepthFirst<'_> {
        let stack = if self.nodes.is_empty() { Vec::new() } else { vec![0] };
        DepthFirst { index: self, stack }
    }
}

/// Lazy breadth-first traversal, see [`SpatialIndex::breadth_first`]
pub struct BreadthFirst<'a, P> {
    index: &'a SpatialIndex,
    queue: FifoQueue<usize>,
    max_depth: Option<u32>,
    descend: P,
}

impl<'a, P> Iterator for BreadthFirst<'a, P>
where
    P: FnMut(&Tile) -> bool,
{
    type Item = &'a Tile;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.index;
        let i = self.queue.pop()?;
        let node = &index.nodes[i];
        if (self.descend)(&node.tile) {
            let max = self.max_depth;
            let nodes = &index.nodes;
            self.queue.extend(
                node.children
                    .iter()
                    .copied()
                    .filter(|&c| max.map_or(true, |m| nodes[c].tile.depth() <= m)),
            );
        }
        Some(&node.tile)
    }
}

/// Pre-order traversal, children in insertion order
pub struct DepthFirst<'a> {
    index: &'a SpatialIndex,
    stack: Vec<usize>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a Tile;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.index;
        let i = self.stack.pop()?;
        let node = &index.nodes[i];
        self.stack.extend(node.children.iter().rev().copied());
        Some(&node.tile)
    }
}
