//! Per-candidate overlap tests
//!
//! Cell membership is conservative: an object is linked into every cell its
//! box touches, so a cell hit is only a hint. Each query carries one of these
//! predicates and runs it against a candidate's stored box before handing
//! the owner to the visitor.

use crate::foundation::math::{Aabb, Ray, Vec3};

/// Overlap test against a candidate's bounds
pub trait Intersect {
    /// True when the query geometry touches `bounds`
    fn intersects(&self, bounds: &Aabb) -> bool;
}

/// Point containment
#[derive(Debug, Clone, Copy)]
pub struct IntersectPoint(pub Vec3);

impl Intersect for IntersectPoint {
    fn intersects(&self, bounds: &Aabb) -> bool {
        bounds.contains_point(self.0)
    }
}

/// Box overlap
#[derive(Debug, Clone, Copy)]
pub struct IntersectBox(pub Aabb);

impl Intersect for IntersectBox {
    fn intersects(&self, bounds: &Aabb) -> bool {
        self.0.intersects(bounds)
    }
}

/// Thin segment against a box
#[derive(Debug, Clone, Copy)]
pub struct IntersectSegment {
    start: Vec3,
    delta: Vec3,
    inv_delta: Vec3,
}

impl IntersectSegment {
    /// Precompute reciprocals for a segment
    pub fn new(ray: &Ray) -> Self {
        Self {
            start: ray.start,
            delta: ray.delta,
            inv_delta: ray.inv_delta(),
        }
    }
}

impl Intersect for IntersectSegment {
    fn intersects(&self, bounds: &Aabb) -> bool {
        bounds.intersects_segment(self.start, self.delta, self.inv_delta)
    }
}

/// Swept box against a box.
///
/// A box of half size `e` moving along a segment touches `bounds` exactly
/// when the segment touches `bounds` grown by `e`.
#[derive(Debug, Clone, Copy)]
pub struct IntersectSweptBox {
    segment: IntersectSegment,
    extents: Vec3,
}

impl IntersectSweptBox {
    /// Precompute the sweep
    pub fn new(ray: &Ray) -> Self {
        Self {
            segment: IntersectSegment::new(ray),
            extents: ray.extents,
        }
    }
}

impl Intersect for IntersectSweptBox {
    fn intersects(&self, bounds: &Aabb) -> bool {
        self.segment.intersects(&bounds.expanded_by(self.extents))
    }
}
