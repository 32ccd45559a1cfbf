//! Per-interaction tile selection
//!
//! One pass walks every dataset in view, ranks candidate tiles by error
//! (worst first), spends the point budget on them, demotes what is no longer
//! wanted and re-scores decodes still waiting for a worker. A pass never
//! waits: loads are submitted and picked up later by `pump`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{find_tile, find_tile_mut, StreamEngine};
use crate::decode::Decoder;
use crate::error::Result;
use crate::queue::PriorityQueue;
use crate::render::RenderBackend;
use crate::tile::{Tile, TileState};
use crate::types::TileId;

/// Rate limiter for interaction-triggered passes
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_run: Option<Instant>,
    dirty: bool,
    forced: bool,
}

impl Throttle {
    /// Allow at most one pass per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
            dirty: false,
            forced: false,
        }
    }

    /// Something changed; a pass is wanted once the interval allows it
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// The next check passes regardless of the interval
    pub fn force(&mut self) {
        self.dirty = true;
        self.forced = true;
    }

    /// Whether a pass is wanted
    pub fn is_pending(&self) -> bool {
        self.dirty
    }

    /// Decide whether a pass may run at `now`, recording it if so
    pub fn schedule(&mut self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        let elapsed = self
            .last_run
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if !(self.forced || elapsed) {
            return false;
        }
        self.last_run = Some(now);
        self.dirty = false;
        self.forced = false;
        true
    }
}

/// Summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Points visible after the pass
    pub visible_points: u64,
    /// Tiles visible after the pass
    pub visible_tiles: usize,
    /// Points of tiles still loading after the pass
    pub in_flight_points: u64,
    /// Tiles ranked this pass
    pub candidates: usize,
    /// Loads submitted
    pub loads_started: usize,
    /// Cached tiles promoted back to visible
    pub promoted: usize,
    /// Visible tiles demoted to the cache
    pub demoted: usize,
    /// Queued decodes dropped by rescoring
    pub cancelled: usize,
    /// Wall time of the pass
    #[serde(with = "crate::config::duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    tile: TileId,
    error: f64,
}

type WorstFirst = fn(&Candidate, &Candidate) -> Ordering;

fn worst_first(a: &Candidate, b: &Candidate) -> Ordering {
    b.error.total_cmp(&a.error)
}

impl<D: Decoder, R: RenderBackend> StreamEngine<D, R> {
    /// Run a pass if something changed and the throttle allows it
    pub fn update(&mut self, now: Instant) -> Result<Option<PassReport>> {
        if !self.throttle.schedule(now) {
            return Ok(None);
        }
        self.run_pass().map(Some)
    }

    /// Run a selection pass now
    pub fn run_pass(&mut self) -> Result<PassReport> {
        let started = Instant::now();
        let mut report = PassReport::default();
        let Some(camera) = self.camera else {
            debug!("No camera set, skipping pass");
            return Ok(report);
        };
        let frustum = camera.frustum();
        let threshold = self.config.error_threshold;
        let budget = self.config.point_budget;
        let max_depth = self.config.max_traversal_depth;

        // Traverse and rank
        let mut ranked: PriorityQueue<Candidate, WorstFirst> =
            PriorityQueue::new(worst_first as WorstFirst);
        let mut demote = Vec::new();
        for cloud in &self.clouds {
            let Some(root) = cloud.root() else { continue };
            if !frustum.intersects_aabb(root.bounds()) {
                continue;
            }
            let refine = |t: &Tile| {
                frustum.intersects_aabb(t.bounds())
                    && camera.error_estimate(t.spacing(), t.bounds()) > threshold
            };
            for tile in cloud.index().breadth_first(max_depth, refine) {
                let error = camera.error_estimate(tile.spacing(), tile.bounds());
                if tile.depth() > 0 {
                    let wanted = error > threshold && frustum.intersects_aabb(tile.bounds());
                    if !wanted {
                        if tile.state() == TileState::Visible {
                            demote.push(tile.id());
                        }
                        continue;
                    }
                }
                ranked.push(Candidate { tile: tile.id(), error });
            }
        }
        report.candidates = ranked.count();

        for id in demote {
            self.cache(id)?;
            report.demoted += 1;
        }

        // Spend the budget, in-flight decodes first
        let mut counter = self.in_flight_points();
        let mut retained = HashSet::new();
        while let Some(candidate) = ranked.pop() {
            let id = candidate.tile;
            let Some(tile) = find_tile(&self.clouds, id) else { continue };
            let points = tile.point_count();
            let forced = tile.depth() == 0;
            let should_show = forced
                || (counter.saturating_add(points) <= budget && candidate.error > threshold);

            match (tile.state(), should_show) {
                (TileState::Visible, true) => {
                    counter += points;
                    retained.insert(id);
                }
                (TileState::Visible, false) => {
                    self.cache(id)?;
                    report.demoted += 1;
                }
                (TileState::Cached, true) => {
                    self.show(id)?;
                    counter += points;
                    retained.insert(id);
                    report.promoted += 1;
                }
                (TileState::Unloaded, true) => match self.load(id) {
                    Ok(()) => {
                        counter += points;
                        report.loads_started += 1;
                    }
                    Err(e) => warn!(tile = %id, error = %e, "Could not start load"),
                },
                _ => {}
            }
        }

        // Sweep visible tiles this pass did not keep
        let mut sweep: Vec<TileId> = self
            .visible
            .iter()
            .copied()
            .filter(|id| id.path.depth > 0 && !retained.contains(id))
            .collect();
        sweep.sort_by_key(|id| id.path);
        for id in sweep {
            self.cache(id)?;
            report.demoted += 1;
        }

        // Re-score decodes that have not started
        if self.pool.queue_len() > 0 {
            let clouds = &self.clouds;
            let dropped = self.pool.rescore(|task| {
                let tile = find_tile(clouds, task.tile)?;
                let error = camera.error_estimate(tile.spacing(), tile.bounds());
                let keep = tile.depth() == 0
                    || (error > threshold
                        && frustum.intersects_aabb(tile.bounds())
                        && counter <= budget);
                if keep {
                    Some(error)
                } else {
                    counter = counter.saturating_sub(task.points);
                    None
                }
            });
            for queued in dropped {
                let id = queued.task.tile;
                if let Some(tile) = find_tile_mut(&mut self.clouds, id) {
                    tile.set_task(None);
                }
                self.unload(id)?;
                self.metrics.rescore_cancellations.inc();
                report.cancelled += 1;
            }
        }

        self.renderer.request_redraw();

        report.visible_points = self.visible_points();
        report.visible_tiles = self.visible.len();
        report.in_flight_points = self.in_flight_points();
        report.duration = started.elapsed();
        self.metrics.pass_duration.observe(report.duration.as_secs_f64());
        self.refresh_gauges();
        debug!(
            visible_points = report.visible_points,
            in_flight = report.in_flight_points,
            loads = report.loads_started,
            demoted = report.demoted,
            cancelled = report.cancelled,
            "Scheduler pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_limits_rate() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(300));
        assert!(!throttle.schedule(t0));

        throttle.mark_dirty();
        assert!(throttle.schedule(t0));
        throttle.mark_dirty();
        assert!(!throttle.schedule(t0 + Duration::from_millis(100)));
        assert!(throttle.is_pending());
        assert!(throttle.schedule(t0 + Duration::from_millis(300)));
        assert!(!throttle.is_pending());
    }

    #[test]
    fn test_forced_pass_skips_interval() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(10));
        throttle.mark_dirty();
        assert!(throttle.schedule(t0));
        throttle.force();
        assert!(throttle.schedule(t0 + Duration::from_millis(1)));
    }

    #[test]
    fn test_candidates_pop_worst_first() {
        let cloud = crate::types::PointCloudId::new();
        let mk = |e: f64| Candidate {
            tile: TileId::new(cloud, crate::types::TilePath::ROOT),
            error: e,
        };
        let q = PriorityQueue::from_vec(vec![mk(0.1), mk(0.5), mk(0.3)], worst_first as WorstFirst);
        let order: Vec<f64> = q.into_sorted_vec().into_iter().map(|c| c.error).collect();
        assert_eq!(order, vec![0.5, 0.3, 0.1]);
    }
}
