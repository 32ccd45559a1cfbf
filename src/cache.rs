//! LRU cache of demoted tiles
//!
//! The cache never owns tiles. It records which tiles are parked in the
//! `cached` state and how many points they hold, and reports the tiles that
//! fall out when the cumulative point count exceeds the ceiling. The caller
//! runs the unload transition on every reported tile.

use lru::LruCache;
use tracing::debug;

use crate::types::TileId;

/// Point-count bounded LRU index over cached tiles
#[derive(Debug)]
pub struct TileCache {
    entries: LruCache<TileId, u64>,
    total_points: u64,
    ceiling: u64,
}

impl TileCache {
    /// Create a cache that evicts once more than `ceiling` points are held
    pub fn new(ceiling: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_points: 0,
            ceiling,
        }
    }

    /// Record `tile` as most recently used and return the tiles evicted to
    /// get back under the ceiling, least recently used first.
    ///
    /// The tile just inserted is never evicted by its own insertion.
    pub fn insert(&mut self, tile: TileId, points: u64) -> Vec<TileId> {
        if let Some(previous) = self.entries.put(tile, points) {
            self.total_points -= previous;
        }
        self.total_points += points;

        let mut evicted = Vec::new();
        while self.total_points > self.ceiling && self.entries.len() > 1 {
            match self.entries.pop_lru() {
                Some((victim, victim_points)) => {
                    self.total_points -= victim_points;
                    debug!(tile = %victim, points = victim_points, "Evicting cached tile");
                    evicted.push(victim);
                }
                None => break,
            }
        }
        evicted
    }

    /// Drop the back-reference for `tile`. Returns whether it was present.
    pub fn remove(&mut self, tile: &TileId) -> bool {
        match self.entries.pop(tile) {
            Some(points) => {
                self.total_points -= points;
                true
            }
            None => false,
        }
    }

    /// Whether `tile` is currently cached
    pub fn contains(&self, tile: &TileId) -> bool {
        self.entries.contains(tile)
    }

    /// Number of cached tiles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of point counts over cached tiles
    pub fn total_points(&self) -> u64 {
        self.total_points
    }

    /// Configured point ceiling
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Cached tiles from most to least recently used
    pub fn tiles(&self) -> Vec<TileId> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }
}
