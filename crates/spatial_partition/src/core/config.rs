//! # Partition Configuration
//!
//! World bounds, grid resolution and pool sizing for a
//! [`PartitionIndex`](crate::spatial::PartitionIndex). The world bounds are
//! fixed for the life of an index; everything else is a tuning knob.
//!
//! Configurations load from TOML or RON through the [`Config`] trait:
//!
//! ```toml
//! world_min = [-16384.0, -16384.0, -16384.0]
//! world_max = [16384.0, 16384.0, 16384.0]
//! voxel_shift = 8
//! category_a_mask = 255
//! ```

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};
use crate::foundation::math::{Aabb, Vec3};
use crate::spatial::list_mask::ListMask;
use crate::spatial::voxel::{VoxelIndexer, MAX_X, MAX_Y, MAX_Z};

/// Default bloat applied to every inserted box
pub const DEFAULT_BLOAT_EPSILON: f32 = 0.03125;

/// # Partition Configuration
///
/// Level 0 cells are `1 << voxel_shift` world units wide; each coarser level
/// multiplies that by four.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Minimum corner of the world
    pub world_min: Vec3,
    /// Maximum corner of the world
    pub world_max: Vec3,
    /// Log2 of the level 0 cell edge
    pub voxel_shift: u32,
    /// Lists routed to the category-A tree
    pub category_a_mask: ListMask,
    /// Margin added around every inserted box
    pub bloat_epsilon: f32,
    /// Initial handle table capacity
    pub handle_capacity: usize,
    /// Initial per-level entry pool capacity
    pub entry_capacity: usize,
    /// Initial per-tree leaf pool capacity
    pub leaf_capacity: usize,
}

impl PartitionConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self {
            world_min: Vec3::repeat(-16384.0),
            world_max: Vec3::repeat(16384.0),
            voxel_shift: 8,
            category_a_mask: 0x00FF,
            bloat_epsilon: DEFAULT_BLOAT_EPSILON,
            handle_capacity: 1024,
            entry_capacity: 2048,
            leaf_capacity: 2048,
        }
    }

    /// Set the world bounds
    pub fn with_world_bounds(mut self, min: Vec3, max: Vec3) -> Self {
        self.world_min = min;
        self.world_max = max;
        self
    }

    /// Set the level 0 cell size as a power of two
    pub fn with_voxel_shift(mut self, shift: u32) -> Self {
        self.voxel_shift = shift;
        self
    }

    /// Set which lists go to the category-A tree
    pub fn with_category_a_mask(mut self, mask: ListMask) -> Self {
        self.category_a_mask = mask;
        self
    }

    /// Set the insert bloat margin
    pub fn with_bloat_epsilon(mut self, epsilon: f32) -> Self {
        self.bloat_epsilon = epsilon;
        self
    }

    /// Size the pools up front
    pub fn with_capacities(mut self, handles: usize, entries: usize, leaves: usize) -> Self {
        self.handle_capacity = handles;
        self.entry_capacity = entries;
        self.leaf_capacity = leaves;
        self
    }

    /// World bounds as a box
    pub fn world_bounds(&self) -> Aabb {
        Aabb::new(self.world_min, self.world_max)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let world = self.world_bounds();
        let finite = self.world_min.iter().chain(self.world_max.iter()).all(|v| v.is_finite());
        if !finite {
            return Err("World bounds must be finite".to_string());
        }
        for axis in 0..3 {
            if world.min[axis] >= world.max[axis] {
                return Err(format!(
                    "World min must be below world max on every axis (axis {axis}: {} >= {})",
                    world.min[axis], world.max[axis]
                ));
            }
        }

        if !(1..=24).contains(&self.voxel_shift) {
            return Err(format!("Voxel shift must be in 1..=24, got {}", self.voxel_shift));
        }

        let size = world.size();
        if size.iter().any(|&edge| edge >= i32::MAX as f32) {
            return Err("World is too large for integer voxel offsets".to_string());
        }

        let [x, y, z] = VoxelIndexer::new(world, self.voxel_shift, 0).voxel_count();
        if x - 1 > MAX_X || y - 1 > MAX_Y || z - 1 > MAX_Z {
            return Err(format!(
                "World spans {x}x{y}x{z} level 0 cells; at most {}x{}x{} fit in a packed coordinate",
                MAX_X + 1,
                MAX_Y + 1,
                MAX_Z + 1
            ));
        }

        if !self.bloat_epsilon.is_finite() || self.bloat_epsilon < 0.0 {
            return Err(format!("Bloat epsilon must be finite and non-negative, got {}", self.bloat_epsilon));
        }

        Ok(())
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for PartitionConfig {}
