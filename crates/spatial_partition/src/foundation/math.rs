//! Math utilities and types
//!
//! Vector aliases over `nalgebra` plus the small set of geometric primitives
//! the partition works with: axis-aligned boxes, line segments (optionally
//! swept by a box) and bounding spheres.

pub use nalgebra::Vector3;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max points
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB centered at a point with given extents
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Get the center of the AABB
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the extents (half-size) of the AABB
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Full edge lengths on each axis
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// True when `min <= max` on every axis
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Check if this AABB contains a point (inclusive)
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.x >= self.min.x && point.x <= self.max.x &&
        point.y >= self.min.y && point.y <= self.max.y &&
        point.z >= self.min.z && point.z <= self.max.z
    }

    /// Check if `other` lies entirely inside this AABB
    pub fn contains(&self, other: &Self) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Check if this AABB intersects another AABB (touching counts)
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Grow uniformly by `amount` on every side
    pub fn expanded(&self, amount: f32) -> Self {
        self.expanded_by(Vec3::repeat(amount))
    }

    /// Grow by per-axis half extents
    pub fn expanded_by(&self, extents: Vec3) -> Self {
        Self {
            min: self.min - extents,
            max: self.max + extents,
        }
    }

    /// Smallest box holding both
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Clamp both corners into `bounds`
    pub fn clamped(&self, bounds: &Self) -> Self {
        Self {
            min: clamp_point(self.min, bounds),
            max: clamp_point(self.max, bounds),
        }
    }

    /// Segment test using the slab method.
    ///
    /// The segment is `start + t * delta` for `t` in `[0, 1]`. `inv_delta`
    /// holds the per-axis reciprocals of `delta`; axes where `delta` is zero
    /// are tested as a plain range check and their reciprocal is ignored.
    pub fn intersects_segment(&self, start: Vec3, delta: Vec3, inv_delta: Vec3) -> bool {
        let mut t_enter = 0.0_f32;
        let mut t_exit = 1.0_f32;

        for axis in 0..3 {
            if delta[axis] == 0.0 {
                if start[axis] < self.min[axis] || start[axis] > self.max[axis] {
                    return false;
                }
                continue;
            }

            let t0 = (self.min[axis] - start[axis]) * inv_delta[axis];
            let t1 = (self.max[axis] - start[axis]) * inv_delta[axis];
            let (near, far) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };

            t_enter = t_enter.max(near);
            t_exit = t_exit.min(far);
            if t_enter > t_exit {
                return false;
            }
        }

        true
    }
}

/// Line segment from `start` to `start + delta`, optionally swept by a box
/// with half size `extents`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Segment start
    pub start: Vec3,
    /// End minus start
    pub delta: Vec3,
    /// Half extents of the swept box; zero for a thin ray
    pub extents: Vec3,
}

impl Ray {
    /// Thin segment between two points
    pub fn new(start: Vec3, end: Vec3) -> Self {
        Self {
            start,
            delta: end - start,
            extents: Vec3::zeros(),
        }
    }

    /// Box of half size `extents` swept from `start` to `end`
    pub fn swept(start: Vec3, end: Vec3, extents: Vec3) -> Self {
        Self {
            start,
            delta: end - start,
            extents,
        }
    }

    /// Segment end point
    pub fn end(&self) -> Vec3 {
        self.start + self.delta
    }

    /// True for a zero-thickness ray
    pub fn is_thin(&self) -> bool {
        self.extents == Vec3::zeros()
    }

    /// True when the segment has a non-zero length
    pub fn is_moving(&self) -> bool {
        self.delta != Vec3::zeros()
    }

    /// Per-axis reciprocal of `delta`, zero where `delta` is zero
    pub fn inv_delta(&self) -> Vec3 {
        self.delta.map(|d| if d == 0.0 { 0.0 } else { 1.0 / d })
    }

    /// Clip the segment against `bounds`.
    ///
    /// Returns `None` when the segment misses the box entirely. Extents are
    /// carried over unchanged.
    pub fn clipped_to(&self, bounds: &Aabb) -> Option<Self> {
        let inv = self.inv_delta();
        let mut t_enter = 0.0_f32;
        let mut t_exit = 1.0_f32;

        for axis in 0..3 {
            if self.delta[axis] == 0.0 {
                if self.start[axis] < bounds.min[axis] || self.start[axis] > bounds.max[axis] {
                    return None;
                }
                continue;
            }

            let t0 = (bounds.min[axis] - self.start[axis]) * inv[axis];
            let t1 = (bounds.max[axis] - self.start[axis]) * inv[axis];
            let (near, far) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
            t_enter = t_enter.max(near);
            t_exit = t_exit.min(far);
            if t_enter > t_exit {
                return None;
            }
        }

        // Float error can leave the clipped points a hair outside the box.
        let start = clamp_point(self.start + self.delta * t_enter, bounds);
        let end = clamp_point(self.start + self.delta * t_exit, bounds);
        Some(Self {
            start,
            delta: end - start,
            extents: self.extents,
        })
    }
}

/// Bounding sphere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    /// Center position
    pub center: Vec3,
    /// Radius
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Smallest AABB enclosing the sphere
    pub fn enclosing_aabb(&self) -> Aabb {
        Aabb::from_center_extents(self.center, Vec3::repeat(self.radius))
    }
}

/// Component-wise clamp of a point into `bounds`
pub fn clamp_point(point: Vec3, bounds: &Aabb) -> Vec3 {
    Vec3::new(
        point.x.clamp(bounds.min.x, bounds.max.x),
        point.y.clamp(bounds.min.y, bounds.max.y),
        point.z.clamp(bounds.min.z, bounds.max.z),
    )
}

/// Index of the smallest component.
///
/// Ties resolve the same way on every call so that grid walkers stay
/// deterministic: x only wins when strictly below y, y only when strictly
/// below z.
pub fn min_axis(v: [f32; 3]) -> usize {
    if v[0] < v[1] {
        if v[0] < v[2] { 0 } else { 2 }
    } else if v[1] < v[2] {
        1
    } else {
        2
    }
}
