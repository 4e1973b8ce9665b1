//! Axis-aligned boxes used for node bounds, edit extents and spanner bounds.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// An axis-aligned box described by its minimum and maximum corners.
///
/// Tree nodes are always cubes built with [`Region::cube`]; edits and
/// spanners may use arbitrary boxes. A region whose extent is not positive
/// on every axis, or that has a non-finite coordinate, is *degenerate* and is
/// treated as disjoint from everything by the edit algebra.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Minimum corner.
    pub minimum: Vec3,
    /// Maximum corner.
    pub maximum: Vec3,
}

impl Region {
    /// Create a region from two corners. Components are not reordered.
    pub const fn new(minimum: Vec3, maximum: Vec3) -> Self {
        Self { minimum, maximum }
    }

    /// Create a cube from its minimum corner and edge length.
    pub fn cube(minimum: Vec3, size: f32) -> Self {
        Self {
            minimum,
            maximum: minimum + Vec3::splat(size),
        }
    }

    /// Extent along each axis.
    pub fn size(&self) -> Vec3 {
        self.maximum - self.minimum
    }

    /// Length of the longest side.
    pub fn longest_side(&self) -> f32 {
        self.size().max_element()
    }

    /// Volume; zero for degenerate regions.
    pub fn volume(&self) -> f32 {
        if self.is_degenerate() {
            0.0
        } else {
            let size = self.size();
            size.x * size.y * size.z
        }
    }

    /// Center point.
    pub fn center(&self) -> Vec3 {
        (self.minimum + self.maximum) * 0.5
    }

    /// Returns `true` if any side is not positive or any coordinate is not finite.
    pub fn is_degenerate(&self) -> bool {
        if !self.minimum.is_finite() || !self.maximum.is_finite() {
            return true;
        }
        let size = self.size();
        size.x <= 0.0 || size.y <= 0.0 || size.z <= 0.0
    }

    /// Returns `true` if `other` lies entirely inside this region (boundaries inclusive).
    pub fn contains(&self, other: &Region) -> bool {
        other.minimum.cmpge(self.minimum).all() && other.maximum.cmple(self.maximum).all()
    }

    /// Returns `true` if the point lies inside or on the boundary.
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.minimum).all() && point.cmple(self.maximum).all()
    }

    /// Returns `true` if the two regions overlap or touch.
    pub fn intersects(&self, other: &Region) -> bool {
        self.minimum.cmple(other.maximum).all() && self.maximum.cmpge(other.minimum).all()
    }

    /// Overlap of the two regions, or `None` if it has no volume.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let overlap = Region {
            minimum: self.minimum.max(other.minimum),
            maximum: self.maximum.min(other.maximum),
        };
        (!overlap.is_degenerate()).then_some(overlap)
    }

    /// Fraction of this region's volume that lies inside `other`, in `[0, 1]`.
    pub fn overlap_fraction(&self, other: &Region) -> f32 {
        let volume = self.volume();
        if volume <= 0.0 {
            return 0.0;
        }
        self.intersection(other)
            .map_or(0.0, |overlap| (overlap.volume() / volume).min(1.0))
    }

    /// Smallest region enclosing both.
    pub fn union(&self, other: &Region) -> Region {
        Region {
            minimum: self.minimum.min(other.minimum),
            maximum: self.maximum.max(other.maximum),
        }
    }

    /// Region moved by `offset`.
    pub fn translated(&self, offset: Vec3) -> Region {
        Region {
            minimum: self.minimum + offset,
            maximum: self.maximum + offset,
        }
    }

    /// Region grown by `extents` on every side.
    pub fn expanded(&self, extents: Vec3) -> Region {
        Region {
            minimum: self.minimum - extents,
            maximum: self.maximum + extents,
        }
    }
}
