//! Voxel indexing
//!
//! Maps world positions to packed integer cell coordinates at each of the
//! partition's resolution levels. Level `n` cells are `4^n` times wider than
//! level 0 cells on every axis, so the parent of a cell is found by dropping
//! two bits from each packed axis.

use crate::foundation::math::{clamp_point, Aabb, Vec3};

/// Number of resolution levels
pub const LEVEL_COUNT: usize = 4;

/// Bits dropped per axis when moving one level coarser
pub const LEVEL_SKIP: u32 = 2;

const X_BITS: u32 = 11;
const Y_BITS: u32 = 11;
const Z_BITS: u32 = 10;
const Y_SHIFT: u32 = X_BITS;
const Z_SHIFT: u32 = X_BITS + Y_BITS;

/// Largest x coordinate that fits in the packed field
pub const MAX_X: i32 = (1 << X_BITS) - 1;
/// Largest y coordinate that fits in the packed field
pub const MAX_Y: i32 = (1 << Y_BITS) - 1;
/// Largest z coordinate that fits in the packed field
pub const MAX_Z: i32 = (1 << Z_BITS) - 1;

const X_MASK: u32 = MAX_X as u32;
const Y_MASK: u32 = MAX_Y as u32;

// After shifting the whole word right by LEVEL_SKIP, the low bits of y and z
// spill into the top of the x and y fields. These are the bits to clear.
const PARENT_MASK: u32 = !((0b11 << (Y_SHIFT - LEVEL_SKIP)) | (0b11 << (Z_SHIFT - LEVEL_SKIP)));

/// Packed cell coordinate: x in bits 0..11, y in 11..22, z in 22..32
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelCoord(u32);

impl VoxelCoord {
    /// Pack unsigned axis offsets
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        debug_assert!(x >= 0 && x <= MAX_X);
        debug_assert!(y >= 0 && y <= MAX_Y);
        debug_assert!(z >= 0 && z <= MAX_Z);
        Self((x as u32) | ((y as u32) << Y_SHIFT) | ((z as u32) << Z_SHIFT))
    }

    /// Pack from an `[x, y, z]` array
    pub const fn from_axes(axes: [i32; 3]) -> Self {
        Self::new(axes[0], axes[1], axes[2])
    }

    /// Raw packed value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// X offset
    pub const fn x(self) -> i32 {
        (self.0 & X_MASK) as i32
    }

    /// Y offset
    pub const fn y(self) -> i32 {
        ((self.0 >> Y_SHIFT) & Y_MASK) as i32
    }

    /// Z offset
    pub const fn z(self) -> i32 {
        (self.0 >> Z_SHIFT) as i32
    }

    /// Unpacked `[x, y, z]`
    pub const fn axes(self) -> [i32; 3] {
        [self.x(), self.y(), self.z()]
    }

    /// The cell containing this one at the next coarser level
    pub const fn to_parent_level(self) -> Self {
        Self((self.0 >> LEVEL_SKIP) & PARENT_MASK)
    }

    /// True when this cell lies inside the inclusive range
    pub const fn within(self, min: [i32; 3], max: [i32; 3]) -> bool {
        let (x, y, z) = (self.x(), self.y(), self.z());
        x >= min[0] && x <= max[0] && y >= min[1] && y <= max[1] && z >= min[2] && z <= max[2]
    }
}

/// Derive the range of cells one level up from an unpacked range
pub const fn parent_axes(axes: [i32; 3]) -> [i32; 3] {
    [axes[0] >> LEVEL_SKIP, axes[1] >> LEVEL_SKIP, axes[2] >> LEVEL_SKIP]
}

/// World-to-cell conversion for one level of the partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelIndexer {
    world: Aabb,
    level: usize,
    shift: u32,
    voxel_size: f32,
}

impl VoxelIndexer {
    /// Indexer for `level`, where level 0 cells are `1 << base_shift` wide
    pub fn new(world: Aabb, base_shift: u32, level: usize) -> Self {
        let shift = base_shift + LEVEL_SKIP * level as u32;
        Self {
            world,
            level,
            shift,
            voxel_size: (1_u64 << shift) as f32,
        }
    }

    /// Indexers for every level, finest first
    pub fn levels(world: Aabb, base_shift: u32) -> [Self; LEVEL_COUNT] {
        std::array::from_fn(|level| Self::new(world, base_shift, level))
    }

    /// Level this indexer covers
    pub const fn level(&self) -> usize {
        self.level
    }

    /// Edge length of one cell in world units
    pub const fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// Bit shift from world offset to cell offset
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// World bounds covered by the grid
    pub const fn world(&self) -> &Aabb {
        &self.world
    }

    /// Cells per axis at this level
    pub fn voxel_count(&self) -> [i32; 3] {
        let max = self.grid_max();
        [max[0] + 1, max[1] + 1, max[2] + 1]
    }

    /// Clamp a world position into the grid
    pub fn clamp_point(&self, point: Vec3) -> Vec3 {
        clamp_point(point, &self.world)
    }

    /// Unpacked cell offsets of a point.
    ///
    /// Points outside the world map to offsets outside the grid (possibly
    /// negative), which the ray walkers rely on; only in-world offsets may be
    /// packed.
    pub fn axes_of(&self, point: Vec3) -> [i32; 3] {
        let local = point - self.world.min;
        [
            (local.x.floor() as i32) >> self.shift,
            (local.y.floor() as i32) >> self.shift,
            (local.z.floor() as i32) >> self.shift,
        ]
    }

    /// Highest valid offset on each axis
    pub fn grid_max(&self) -> [i32; 3] {
        self.axes_of(self.world.max)
    }

    /// Cell containing a point that already lies in the world
    pub fn index_of(&self, point: Vec3) -> VoxelCoord {
        VoxelCoord::from_axes(self.axes_of(point))
    }

    /// Inclusive cell range of a box that already lies in the world
    pub fn index_of_box(&self, min: Vec3, max: Vec3) -> (VoxelCoord, VoxelCoord) {
        (self.index_of(min), self.index_of(max))
    }

    /// World-space bounds of a cell
    pub fn voxel_bounds(&self, coord: VoxelCoord) -> Aabb {
        let [x, y, z] = coord.axes();
        let min = self.world.min + Vec3::new(x as f32, y as f32, z as f32) * self.voxel_size;
        Aabb::new(min, min + Vec3::repeat(self.voxel_size))
    }
}
