//! Camera model, view frustum and the view-dependent error estimate
//!
//! Tile bounds and camera positions are in world coordinates, double precision.

use glam::{DMat4, DVec3, DVec4};
use serde::{Deserialize, Serialize};

use crate::types::Aabb;

/// Smallest distance the error estimate divides by
pub const MIN_DISTANCE: f64 = 1e-3;

/// Projection of a camera with the parameters each variant needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Pinhole perspective
    Perspective {
        /// Vertical field of view in radians
        fov_y: f64,
        /// Width over height
        aspect: f64,
        /// Near plane distance
        near: f64,
        /// Far plane distance
        far: f64,
    },
    /// Parallel projection over a view-space box
    Orthographic {
        /// Left extent
        left: f64,
        /// Right extent
        right: f64,
        /// Bottom extent
        bottom: f64,
        /// Top extent
        top: f64,
        /// Near plane distance
        near: f64,
        /// Far plane distance
        far: f64,
    },
}

impl Projection {
    /// Perspective projection
    pub fn perspective(fov_y: f64, aspect: f64, near: f64, far: f64) -> Self {
        Projection::Perspective { fov_y, aspect, near, far }
    }

    /// Orthographic projection centred on the view axis
    pub fn orthographic(width: f64, height: f64, near: f64, far: f64) -> Self {
        Projection::Orthographic {
            left: -width * 0.5,
            right: width * 0.5,
            bottom: -height * 0.5,
            top: height * 0.5,
            near,
            far,
        }
    }

    /// Projection matrix, right-handed, depth in [0, 1]
    pub fn matrix(&self) -> DMat4 {
        match *self {
            Projection::Perspective { fov_y, aspect, near, far } => {
                DMat4::perspective_rh(fov_y, aspect, near, far)
            }
            Projection::Orthographic { left, right, bottom, top, near, far } => {
                DMat4::orthographic_rh(left, right, bottom, top, near, far)
            }
        }
    }

    /// Return a copy adapted to a new viewport aspect ratio
    pub fn with_aspect(self, new_aspect: f64) -> Self {
        match self {
            Projection::Perspective { fov_y, near, far, .. } => Projection::Perspective {
                fov_y,
                aspect: new_aspect,
                near,
                far,
            },
            Projection::Orthographic { left, right, bottom, top, near, far } => {
                let half_w = (top - bottom) * 0.5 * new_aspect;
                let cx = (left + right) * 0.5;
                Projection::Orthographic {
                    left: cx - half_w,
                    right: cx + half_w,
                    bottom,
                    top,
                    near,
                    far,
                }
            }
        }
    }
}

/// Camera pose plus projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Eye position in world space
    pub position: DVec3,
    /// World-to-view transform
    pub view: DMat4,
    /// Projection
    pub projection: Projection,
}

impl Camera {
    /// Camera at `eye` looking at `target`
    pub fn look_at(eye: DVec3, target: DVec3, up: DVec3, projection: Projection) -> Self {
        Self {
            position: eye,
            view: DMat4::look_at_rh(eye, target, up),
            projection,
        }
    }

    /// Projection times view
    pub fn view_projection(&self) -> DMat4 {
        self.projection.matrix() * self.view
    }

    /// Current view frustum
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(&self.view_projection())
    }

    /// Distance proxy used by the error estimate.
    ///
    /// Perspective: eye to the bounding sphere surface. Orthographic: the
    /// larger extent of the view box, independent of the tile position.
    pub fn distance_metric(&self, bounds: &Aabb) -> f64 {
        let d = match self.projection {
            Projection::Perspective { .. } => {
                (bounds.center() - self.position).length() - bounds.radius()
            }
            Projection::Orthographic { left, right, bottom, top, .. } => {
                (right - left).abs().max((top - bottom).abs())
            }
        };
        d.max(MIN_DISTANCE)
    }

    /// `spacing / distance`: larger means coarser relative to the view
    pub fn error_estimate(&self, spacing: f64, bounds: &Aabb) -> f64 {
        spacing / self.distance_metric(bounds)
    }
}

/// Six clip planes, `n·p + d >= 0` inside
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [DVec4; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix
    pub fn from_matrix(m: &DMat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for p in planes.iter_mut() {
            let len = p.truncate().length();
            if len > 0.0 {
                *p /= len;
            }
        }
        Self { planes }
    }

    /// Conservative box test: false only when the box is fully outside a plane
    pub fn intersects_aabb(&self, b: &Aabb) -> bool {
        self.planes.iter().all(|p| {
            let n = p.truncate();
            let positive = DVec3::new(
                if n.x >= 0.0 { b.max.x } else { b.min.x },
                if n.y >= 0.0 { b.max.y } else { b.min.y },
                if n.z >= 0.0 { b.max.z } else { b.min.z },
            );
            n.dot(positive) + p.w >= 0.0
        })
    }

    /// Whether the point lies inside every plane
    pub fn contains_point(&self, point: DVec3) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(point) + p.w >= 0.0)
    }
}
