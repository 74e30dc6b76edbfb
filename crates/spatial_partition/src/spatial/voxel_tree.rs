//! Multi-level voxel tree
//!
//! Four spatial hashes at increasing cell sizes. Each object lives at exactly
//! one level: the finest whose cells are larger than the object on every
//! axis, so it touches at most eight cells there. Queries walk all levels,
//! deriving coarser cell ranges from the finest by shifting.
//!
//! Locking follows two layers. The [`TreeLock`] gate is held for reading for
//! a whole traversal, or for writing around a mutation. The data itself sits
//! in an `RwLock` that a traversal only holds while collecting one cell (or
//! range) of candidates; visitors run with no data borrow alive, which is
//! what lets them mutate the tree they are walking.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use slotmap::SecondaryMap;

use crate::core::config::PartitionConfig;
use crate::foundation::math::{min_axis, Aabb, Ray, Vec3};
use crate::spatial::handle::PartitionHandle;
use crate::spatial::intersect::{Intersect, IntersectBox, IntersectPoint, IntersectSegment, IntersectSweptBox};
use crate::spatial::list_mask::{ListMask, PartitionTree, SharedFlags};
use crate::spatial::lock::{SuspendedReads, TreeLock};
use crate::spatial::visits::{VisitBits, VisitPool, VisitSet};
use crate::spatial::voxel::{parent_axes, VoxelCoord, VoxelIndexer, LEVEL_COUNT, LEVEL_SKIP};
use crate::spatial::voxel_hash::{Candidate, CandidateLookup, Gather, LeafKey, LeafList, VoxelHash};

/// Walker parameter of a face that never crosses a cell boundary.
///
/// Walk parameters run over `0..1`, so any value at or past 1.0 already
/// means "not before the segment ends"; this one also survives having a
/// step added to it.
const NEVER_CROSSES: f32 = 65536.0;

/// Visitor verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    /// Keep going
    Continue,
    /// End the query now
    Stop,
}

impl From<ControlFlow<()>> for IterationControl {
    fn from(flow: ControlFlow<()>) -> Self {
        match flow {
            ControlFlow::Continue(()) => Self::Continue,
            ControlFlow::Break(()) => Self::Stop,
        }
    }
}

/// Object data a tree copies in on insert
#[derive(Debug, Clone)]
pub struct TreeMember<O> {
    /// Value handed to visitors
    pub owner: O,
    /// Lists the object belongs to
    pub list_mask: ListMask,
    /// Flags shared with the handle table (hidden bit)
    pub flags: SharedFlags,
}

#[derive(Debug)]
struct TreeEntity<O> {
    owner: O,
    bounds: Aabb,
    list_mask: ListMask,
    flags: SharedFlags,
    level: usize,
    voxel_min: VoxelCoord,
    voxel_max: VoxelCoord,
    visit_bit: u32,
    leaf_head: Option<LeafKey>,
}

impl<O: Copy> CandidateLookup<O> for SecondaryMap<PartitionHandle, TreeEntity<O>> {
    fn candidate(&self, handle: PartitionHandle) -> Option<Candidate<'_, O>> {
        self.get(handle).map(|entity| Candidate {
            owner: entity.owner,
            bounds: &entity.bounds,
            hidden: entity.flags.is_hidden(),
            visit_bit: entity.visit_bit,
        })
    }
}

#[derive(Debug)]
struct TreeData<O> {
    levels: [VoxelHash; LEVEL_COUNT],
    leaves: LeafList,
    records: SecondaryMap<PartitionHandle, TreeEntity<O>>,
    visit_bits: VisitBits,
}

impl<O> TreeData<O> {
    fn unlink(&mut self, entity: &TreeEntity<O>) -> usize {
        self.visit_bits.release(entity.visit_bit);
        self.levels[entity.level].remove(entity.leaf_head, &mut self.leaves)
    }
}

/// Occupancy snapshot of one tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Object-cell entries per level
    pub entries_per_level: [usize; LEVEL_COUNT],
    /// Occupied cells per level
    pub cells_per_level: [usize; LEVEL_COUNT],
    /// Objects resident at each level
    pub objects_per_level: [usize; LEVEL_COUNT],
    /// Objects in the tree
    pub objects: usize,
    /// Live leaf records
    pub leaves: usize,
    /// Hash mutations since creation
    pub mutations: u64,
    /// Visit bits currently assigned
    pub visit_bits_in_use: usize,
    /// Highest visit bit ever assigned, plus one
    pub visit_bit_high_water: u32,
}

/// Four-level voxel hash with locking and query traversal
#[derive(Debug)]
pub struct VoxelTree<O> {
    kind: PartitionTree,
    world: Aabb,
    bloat_epsilon: f32,
    indexers: [VoxelIndexer; LEVEL_COUNT],
    grid_max: [[i32; 3]; LEVEL_COUNT],
    gate: TreeLock,
    data: RwLock<TreeData<O>>,
    visits: VisitPool,
    mutations: AtomicU64,
}

impl<O: Copy> VoxelTree<O> {
    /// Create an empty tree over the configured world
    pub fn new(kind: PartitionTree, config: &PartitionConfig) -> Self {
        let world = config.world_bounds();
        let indexers = VoxelIndexer::levels(world, config.voxel_shift);
        let levels = indexers.map(|indexer| VoxelHash::new(indexer, config.entry_capacity));

        Self {
            kind,
            world,
            bloat_epsilon: config.bloat_epsilon,
            indexers,
            grid_max: indexers.map(|indexer| indexer.grid_max()),
            gate: TreeLock::new(),
            data: RwLock::new(TreeData {
                levels,
                leaves: LeafList::with_capacity_and_key(config.leaf_capacity),
                records: SecondaryMap::with_capacity(config.handle_capacity),
                visit_bits: VisitBits::new(),
            }),
            visits: VisitPool::new(),
            mutations: AtomicU64::new(0),
        }
    }

    /// Which universe this tree holds
    pub const fn kind(&self) -> PartitionTree {
        self.kind
    }

    /// World bounds
    pub const fn world(&self) -> &Aabb {
        &self.world
    }

    /// Coordinate math for a level
    pub fn indexer(&self, level: usize) -> &VoxelIndexer {
        &self.indexers[level]
    }

    fn read_data(&self) -> RwLockReadGuard<'_, TreeData<O>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, TreeData<O>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finest level whose cells exceed `size` on every axis
    pub fn select_level(&self, size: Vec3) -> usize {
        self.indexers
            .iter()
            .position(|indexer| {
                let edge = indexer.voxel_size();
                size.x < edge && size.y < edge && size.z < edge
            })
            .unwrap_or(LEVEL_COUNT - 1)
    }

    /// Bloat by the insert epsilon and clamp to the world
    pub fn prepare_bounds(&self, mins: Vec3, maxs: Vec3) -> Aabb {
        Aabb::new(mins, maxs).expanded(self.bloat_epsilon).clamped(&self.world)
    }

    /// Insert or move an object.
    ///
    /// Returns true when the hash was touched. A reinsert whose cell range is
    /// unchanged only refreshes the stored bounds.
    pub fn insert_into_tree(&self, handle: PartitionHandle, member: &TreeMember<O>, mins: Vec3, maxs: Vec3, reinsert: bool) -> bool {
        self.insert_prepared(handle, member, self.prepare_bounds(mins, maxs), reinsert)
    }

    /// [`insert_into_tree`](Self::insert_into_tree) with bounds already
    /// passed through [`prepare_bounds`](Self::prepare_bounds)
    pub fn insert_prepared(&self, handle: PartitionHandle, member: &TreeMember<O>, bounds: Aabb, reinsert: bool) -> bool {
        debug_assert!(bounds.is_valid(), "inverted bounds {bounds:?}");
        let level = self.select_level(bounds.size());
        let (voxel_min, voxel_max) = self.indexers[level].index_of_box(bounds.min, bounds.max);

        if reinsert && self.refresh_in_place(handle, bounds, level, voxel_min, voxel_max) {
            return false;
        }

        let _write = self.gate.write();
        let mut guard = self.write_data();
        let data = &mut *guard;

        // Another thread may have moved it between the check and the gate.
        if let Some(existing) = data.records.get_mut(handle) {
            if reinsert && existing.level == level && existing.voxel_min == voxel_min && existing.voxel_max == voxel_max {
                existing.bounds = bounds;
                return false;
            }
        }

        if let Some(old) = data.records.remove(handle) {
            data.unlink(&old);
        }

        let visit_bit = data.visit_bits.acquire();
        let leaf_head = data.levels[level].insert(handle, member.list_mask, voxel_min, voxel_max, &mut data.leaves, None);
        data.records.insert(
            handle,
            TreeEntity {
                owner: member.owner,
                bounds,
                list_mask: member.list_mask,
                flags: member.flags.clone(),
                level,
                voxel_min,
                voxel_max,
                visit_bit,
                leaf_head,
            },
        );
        self.mutations.fetch_add(1, Ordering::Relaxed);
        log::trace!("{:?}: {handle:?} linked at level {level} cells {voxel_min:?}..={voxel_max:?}", self.kind);
        true
    }

    /// Store new bounds for an object whose cell range would not change.
    ///
    /// Returns false, touching nothing, when the object is absent or the
    /// bounds land on other cells. Cell lists stay as they are, so this
    /// skips the exclusive gate and does not wait for running queries.
    pub fn refresh_bounds(&self, handle: PartitionHandle, bounds: Aabb) -> bool {
        let level = self.select_level(bounds.size());
        let (voxel_min, voxel_max) = self.indexers[level].index_of_box(bounds.min, bounds.max);
        self.refresh_in_place(handle, bounds, level, voxel_min, voxel_max)
    }

    fn refresh_in_place(
        &self,
        handle: PartitionHandle,
        bounds: Aabb,
        level: usize,
        voxel_min: VoxelCoord,
        voxel_max: VoxelCoord,
    ) -> bool {
        let mut data = self.write_data();
        match data.records.get_mut(handle) {
            Some(existing) if existing.level == level && existing.voxel_min == voxel_min && existing.voxel_max == voxel_max => {
                existing.bounds = bounds;
                true
            }
            _ => false,
        }
    }

    /// Unlink an object; false if it was not in the tree
    pub fn remove_from_tree(&self, handle: PartitionHandle) -> bool {
        let _write = self.gate.write();
        let mut guard = self.write_data();
        let data = &mut *guard;

        let Some(old) = data.records.remove(handle) else {
            return false;
        };
        data.unlink(&old);
        self.mutations.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Rewrite the list mask snapshot of an object in place
    pub fn update_list_mask(&self, handle: PartitionHandle, list_mask: ListMask) -> bool {
        let _write = self.gate.write();
        let mut guard = self.write_data();
        let data = &mut *guard;

        let Some(entity) = data.records.get_mut(handle) else {
            return false;
        };
        entity.list_mask = list_mask;
        data.levels[entity.level].update_mask(handle, list_mask, entity.leaf_head, &data.leaves);
        true
    }

    /// True if the object is linked into this tree
    pub fn contains(&self, handle: PartitionHandle) -> bool {
        self.read_data().records.contains_key(handle)
    }

    /// Stored (bloated, clamped) bounds
    pub fn stored_bounds(&self, handle: PartitionHandle) -> Option<Aabb> {
        self.read_data().records.get(handle).map(|entity| entity.bounds)
    }

    /// Level the object was placed at
    pub fn level_of(&self, handle: PartitionHandle) -> Option<usize> {
        self.read_data().records.get(handle).map(|entity| entity.level)
    }

    /// List mask snapshot held by the tree
    pub fn stored_list_mask(&self, handle: PartitionHandle) -> Option<ListMask> {
        self.read_data().records.get(handle).map(|entity| entity.list_mask)
    }

    /// Hash mutations since creation
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Objects in the tree
    pub fn len(&self) -> usize {
        self.read_data().records.len()
    }

    /// True when the tree holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every object
    pub fn clear(&self) {
        let _write = self.gate.write();
        let mut data = self.write_data();
        for level in &mut data.levels {
            level.clear();
        }
        data.leaves.clear();
        data.records.clear();
        data.visit_bits.reset();
    }

    /// Park the calling thread's query reads on this tree until the guard
    /// drops, so a write to another tree does not wait while holding them
    pub fn suspend_reads(&self) -> SuspendedReads<'_> {
        self.gate.suspend_reads()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> TreeStats {
        let _read = self.gate.read();
        let data = self.read_data();

        let mut objects_per_level = [0; LEVEL_COUNT];
        for entity in data.records.values() {
            objects_per_level[entity.level] += 1;
        }

        TreeStats {
            entries_per_level: std::array::from_fn(|level| data.levels[level].entry_count()),
            cells_per_level: std::array::from_fn(|level| data.levels[level].bucket_count()),
            objects_per_level,
            objects: data.records.len(),
            leaves: data.leaves.len(),
            mutations: self.mutation_count(),
            visit_bits_in_use: data.visit_bits.in_use(),
            visit_bit_high_water: data.visit_bits.high_water(),
        }
    }

    /// Visit every object whose bounds touch the box
    pub fn enumerate_in_box<F>(&self, mask: ListMask, mins: Vec3, maxs: Vec3, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        let query = Aabb::new(mins, maxs);
        debug_assert!(query.is_valid(), "inverted query box {query:?}");
        if mask == 0 || !query.intersects(&self.world) {
            return IterationControl::Continue;
        }

        let _read = self.gate.read();
        let mut walk = Walk::new(self, mask, true, visitor);
        self.walk_box(&mut walk, &query.clamped(&self.world), &IntersectBox(query)).into()
    }

    /// Visit every object whose bounds touch the sphere's enclosing box
    pub fn enumerate_in_sphere<F>(&self, mask: ListMask, center: Vec3, radius: f32, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        let extents = Vec3::repeat(radius);
        self.enumerate_in_box(mask, center - extents, center + extents, visitor)
    }

    /// Visit every object whose bounds contain the point
    pub fn enumerate_at_point<F>(&self, mask: ListMask, point: Vec3, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        if mask == 0 || !self.world.contains_point(point) {
            return IterationControl::Continue;
        }

        let _read = self.gate.read();
        // One cell per level and one level per object: nothing repeats.
        let mut walk = Walk::new(self, mask, false, visitor);
        let predicate = IntersectPoint(point);
        let mut voxel = self.indexers[0].index_of(point);
        for level in 0..LEVEL_COUNT {
            if walk.cell(level, voxel, &predicate).is_break() {
                return IterationControl::Stop;
            }
            voxel = voxel.to_parent_level();
        }
        IterationControl::Continue
    }

    /// Visit every object touched by a segment or a swept box.
    ///
    /// Thin rays step a grid walk through the finest level; rays with extents
    /// sweep a box. A ray that does not move is a box query around its start.
    pub fn enumerate_along_ray<F>(&self, mask: ListMask, ray: &Ray, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        if !ray.is_moving() {
            return self.enumerate_in_box(mask, ray.start - ray.extents, ray.start + ray.extents, visitor);
        }
        self.enumerate_ray_clipped(mask, ray, !ray.is_thin(), visitor)
    }

    /// Visit every object touched by a swept box, always using the box sweep
    /// even when the extents are zero
    pub fn enumerate_swept_box<F>(&self, mask: ListMask, ray: &Ray, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        if !ray.is_moving() {
            return self.enumerate_in_box(mask, ray.start - ray.extents, ray.start + ray.extents, visitor);
        }
        self.enumerate_ray_clipped(mask, ray, true, visitor)
    }

    fn enumerate_ray_clipped<F>(&self, mask: ListMask, ray: &Ray, swept: bool, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        if mask == 0 {
            return IterationControl::Continue;
        }
        let Some(clipped) = ray.clipped_to(&self.world.expanded_by(ray.extents)) else {
            return IterationControl::Continue;
        };

        let _read = self.gate.read();
        let mut walk = Walk::new(self, mask, true, visitor);
        let flow = if swept {
            self.walk_swept_box(&mut walk, &clipped, &IntersectSweptBox::new(ray))
        } else {
            self.walk_segment(&mut walk, &clipped, &IntersectSegment::new(ray))
        };
        flow.into()
    }

    fn walk_box<F, P>(&self, walk: &mut Walk<'_, O, F>, region: &Aabb, predicate: &P) -> ControlFlow<()>
    where
        F: FnMut(O) -> IterationControl,
        P: Intersect,
    {
        let mut min = self.indexers[0].axes_of(region.min);
        let mut max = self.indexers[0].axes_of(region.max);
        for level in 0..LEVEL_COUNT {
            walk.range(level, min, max, predicate)?;
            min = parent_axes(min);
            max = parent_axes(max);
        }
        ControlFlow::Continue(())
    }

    fn in_grid(&self, axes: [i32; 3]) -> bool {
        (0..3).all(|axis| axes[axis] >= 0 && axes[axis] <= self.grid_max[0][axis])
    }

    /// Grid walk along a thin segment already clipped to the world
    fn walk_segment<F, P>(&self, walk: &mut Walk<'_, O, F>, ray: &Ray, predicate: &P) -> ControlFlow<()>
    where
        F: FnMut(O) -> IterationControl,
        P: Intersect,
    {
        let indexer = &self.indexers[0];
        let mut axes = indexer.axes_of(ray.start);

        if axes == indexer.axes_of(ray.end()) {
            let mut voxel = VoxelCoord::from_axes(axes);
            for level in 0..LEVEL_COUNT {
                walk.cell(level, voxel, predicate)?;
                voxel = voxel.to_parent_level();
            }
            return ControlFlow::Continue(());
        }

        let mut stepper = SegmentStepper::new(indexer, ray, axes);
        let mut last: [Option<VoxelCoord>; LEVEL_COUNT] = [None; LEVEL_COUNT];
        loop {
            if self.in_grid(axes) {
                let mut voxel = VoxelCoord::from_axes(axes);
                walk.cell(0, voxel, predicate)?;
                for (level, seen) in last.iter_mut().enumerate().skip(1) {
                    voxel = voxel.to_parent_level();
                    if *seen != Some(voxel) {
                        *seen = Some(voxel);
                        walk.cell(level, voxel, predicate)?;
                    }
                }
            }
            if !stepper.advance(&mut axes) {
                return ControlFlow::Continue(());
            }
        }
    }

    /// Sweep a box along a segment already clipped to the grown world.
    ///
    /// All cells under the start box are visited first. After that the box's
    /// leading faces enter new slabs of cells and its trailing faces leave
    /// old ones; only the slab just entered is visited, at every level whose
    /// leading coordinate actually changed.
    fn walk_swept_box<F, P>(&self, walk: &mut Walk<'_, O, F>, ray: &Ray, predicate: &P) -> ControlFlow<()>
    where
        F: FnMut(O) -> IterationControl,
        P: Intersect,
    {
        let indexer = &self.indexers[0];
        let start_box = Aabb::from_center_extents(ray.start, ray.extents);

        let mut ranges = [[[0_i32; 3]; 2]; LEVEL_COUNT];
        ranges[0] = [indexer.axes_of(start_box.min), indexer.axes_of(start_box.max)];
        for level in 1..LEVEL_COUNT {
            ranges[level] = [parent_axes(ranges[level - 1][0]), parent_axes(ranges[level - 1][1])];
        }
        for (level, range) in ranges.iter().enumerate() {
            walk.range(level, range[0], range[1], predicate)?;
        }

        let end_box = Aabb::from_center_extents(ray.end(), ray.extents);
        let end = [indexer.axes_of(end_box.min), indexer.axes_of(end_box.max)];
        if (0..3).all(|axis| end[0][axis] >= ranges[0][0][axis] && end[1][axis] <= ranges[0][1][axis]) {
            return ControlFlow::Continue(());
        }

        // Face crossings left to step. More than twice across the grid means
        // the box dwarfs the world, and past a few million cells the f32
        // walk parameters stop advancing; both cases walk the envelope.
        let crossings: i64 = (0..3)
            .map(|axis| {
                (i64::from(end[0][axis]) - i64::from(ranges[0][0][axis])).abs()
                    + (i64::from(end[1][axis]) - i64::from(ranges[0][1][axis])).abs()
            })
            .sum();
        let envelope = start_box.merged(&end_box).clamped(&self.world);
        let grid_crossings: i64 = self.grid_max[0].iter().map(|&max| 2 * (i64::from(max) + 1)).sum();
        if crossings > grid_crossings {
            log::trace!("{:?}: sweep of {crossings} crossings walks its envelope instead", self.kind);
            return self.walk_box(walk, &envelope, predicate);
        }

        let mut stepper = SweepStepper::new(indexer, ray, &start_box, ranges[0]);
        // Rounding may add a crossing per front and axis.
        let mut budget = crossings + 6;
        let mut last = [[0_i32; 3]; LEVEL_COUNT];
        for (level, last_level) in last.iter_mut().enumerate() {
            for axis in 0..3 {
                last_level[axis] = ranges[level][leading_side(stepper.step[axis])][axis];
            }
        }

        while let Some(event) = stepper.next_event() {
            budget -= 1;
            if budget < 0 {
                log::warn!("{:?}: sweep stalled after {crossings} crossings, walking its envelope", self.kind);
                return self.walk_box(walk, &envelope, predicate);
            }
            match event {
                SweepEvent::Trailing(axis) => {
                    let side = 1 - leading_side(stepper.step[axis]);
                    advance_face(&mut ranges, side, axis, stepper.step[axis]);
                }
                SweepEvent::Leading(axis) => {
                    let step = stepper.step[axis];
                    let side = leading_side(step);
                    advance_face(&mut ranges, side, axis, step);

                    let (min, max) = slice(ranges[0], axis, step);
                    walk.range(0, min, max, predicate)?;
                    for level in 1..LEVEL_COUNT {
                        let face = ranges[level][side][axis];
                        if face != last[level][axis] {
                            last[level][axis] = face;
                            let (min, max) = slice(ranges[level], axis, step);
                            walk.range(level, min, max, predicate)?;
                        }
                    }
                }
            }
        }

        ControlFlow::Continue(())
    }
}

/// Range index (0 = min, 1 = max) of the face moving into new cells
const fn leading_side(step: i32) -> usize {
    if step > 0 { 1 } else { 0 }
}

/// Move one face of the level 0 range and re-derive the coarser levels
fn advance_face(ranges: &mut [[[i32; 3]; 2]; LEVEL_COUNT], side: usize, axis: usize, step: i32) {
    ranges[0][side][axis] += step;
    for level in 1..LEVEL_COUNT {
        ranges[level][side][axis] = ranges[0][side][axis] >> (LEVEL_SKIP * level as u32);
    }
}

/// The one-cell-thick slab of `range` on the leading side of `axis`
fn slice(range: [[i32; 3]; 2], axis: usize, step: i32) -> ([i32; 3], [i32; 3]) {
    let (mut min, mut max) = (range[0], range[1]);
    if step < 0 {
        max[axis] = min[axis];
    } else {
        min[axis] = max[axis];
    }
    (min, max)
}

/// Grid walk state for a thin segment
#[derive(Debug)]
struct SegmentStepper {
    step: [i32; 3],
    t_max: [f32; 3],
    t_delta: [f32; 3],
}

impl SegmentStepper {
    fn new(indexer: &VoxelIndexer, ray: &Ray, start: [i32; 3]) -> Self {
        let size = indexer.voxel_size();
        let origin = indexer.world().min;
        let inv = ray.inv_delta();
        let mut stepper = Self {
            step: [0; 3],
            t_max: [NEVER_CROSSES; 3],
            t_delta: [NEVER_CROSSES; 3],
        };

        for axis in 0..3 {
            let delta = ray.delta[axis];
            if delta == 0.0 {
                continue;
            }

            let local_start = ray.start[axis] - origin[axis];
            let local_end = local_start + delta;
            let cell = start[axis] as f32;
            let (step, dist_start, dist_end, recip) = if delta < 0.0 {
                (-1, local_start - cell * size, local_end - cell * size, -inv[axis])
            } else {
                (1, (cell + 1.0) * size - local_start, (cell + 1.0) * size - local_end, inv[axis])
            };

            stepper.step[axis] = step;
            // Both ends inside the same slab: this axis never steps.
            if dist_start > 0.0 && dist_end > 0.0 {
                continue;
            }
            stepper.t_max[axis] = dist_start * recip;
            stepper.t_delta[axis] = size * recip;
        }

        stepper
    }

    /// Step into the next cell; false once the segment end is reached
    fn advance(&mut self, axes: &mut [i32; 3]) -> bool {
        if self.t_max.iter().all(|&t| t >= 1.0) {
            return false;
        }
        let axis = min_axis(self.t_max);
        axes[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepEvent {
    Leading(usize),
    Trailing(usize),
}

/// Grid walk state for both fronts of a swept box
#[derive(Debug)]
struct SweepStepper {
    step: [i32; 3],
    t_max: [f32; 3],
    t_min: [f32; 3],
    t_delta: [f32; 3],
}

impl SweepStepper {
    fn new(indexer: &VoxelIndexer, ray: &Ray, start_box: &Aabb, start_range: [[i32; 3]; 2]) -> Self {
        let size = indexer.voxel_size();
        let origin = indexer.world().min;
        let mut stepper = Self {
            step: [0; 3],
            t_max: [NEVER_CROSSES; 3],
            t_min: [NEVER_CROSSES; 3],
            t_delta: [NEVER_CROSSES; 3],
        };

        for axis in 0..3 {
            let delta = ray.delta[axis];
            if delta == 0.0 {
                continue;
            }

            let min_local = start_box.min[axis] - origin[axis];
            let max_local = start_box.max[axis] - origin[axis];
            let low = start_range[0][axis] as f32;
            let high = start_range[1][axis] as f32;
            let (step, dist_leading, dist_trailing) = if delta < 0.0 {
                (-1, min_local - low * size, max_local - high * size)
            } else {
                (1, (high + 1.0) * size - max_local, (low + 1.0) * size - min_local)
            };

            let dist = delta.abs();
            let recip = 1.0 / dist;
            stepper.step[axis] = step;
            if dist_leading <= dist {
                stepper.t_max[axis] = dist_leading * recip;
                stepper.t_delta[axis] = size * recip;
            }
            if dist_trailing <= dist {
                stepper.t_min[axis] = dist_trailing * recip;
            }
        }

        stepper
    }

    /// Next face crossing in parameter order.
    ///
    /// A trailing face goes first only when it crosses strictly before the
    /// nearest leading face.
    fn next_event(&mut self) -> Option<SweepEvent> {
        if self.t_max.iter().all(|&t| t >= 1.0) {
            return None;
        }
        let leading = min_axis(self.t_max);
        let trailing = min_axis(self.t_min);
        if self.t_min[trailing] < self.t_max[leading] {
            self.t_min[trailing] += self.t_delta[trailing];
            Some(SweepEvent::Trailing(trailing))
        } else {
            self.t_max[leading] += self.t_delta[leading];
            Some(SweepEvent::Leading(leading))
        }
    }
}

/// One traversal: query mask, dedup marks and the caller's visitor
struct Walk<'t, O, F> {
    tree: &'t VoxelTree<O>,
    mask: ListMask,
    visits: Option<VisitSet<'t>>,
    found: Vec<O>,
    visitor: F,
}

impl<'t, O, F> Walk<'t, O, F>
where
    O: Copy,
    F: FnMut(O) -> IterationControl,
{
    fn new(tree: &'t VoxelTree<O>, mask: ListMask, dedup: bool, visitor: F) -> Self {
        let visits = dedup.then(|| {
            let bits = tree.read_data().visit_bits.high_water() as usize;
            tree.visits.check_out(bits)
        });
        Self {
            tree,
            mask,
            visits,
            found: Vec::new(),
            visitor,
        }
    }

    fn cell<P: Intersect>(&mut self, level: usize, voxel: VoxelCoord, predicate: &P) -> ControlFlow<()> {
        {
            let data = self.tree.read_data();
            let mut gather = Gather {
                mask: self.mask,
                lookup: &data.records,
                predicate,
                visits: self.visits.as_mut(),
                found: &mut self.found,
            };
            data.levels[level].gather_cell(voxel, &mut gather);
        }
        self.deliver()
    }

    fn range<P: Intersect>(&mut self, level: usize, min: [i32; 3], max: [i32; 3], predicate: &P) -> ControlFlow<()> {
        let grid = self.tree.grid_max[level];
        let min = min.map(|v| v.max(0));
        let max = [max[0].min(grid[0]), max[1].min(grid[1]), max[2].min(grid[2])];
        if (0..3).any(|axis| min[axis] > max[axis]) {
            return ControlFlow::Continue(());
        }

        {
            let data = self.tree.read_data();
            let mut gather = Gather {
                mask: self.mask,
                lookup: &data.records,
                predicate,
                visits: self.visits.as_mut(),
                found: &mut self.found,
            };
            data.levels[level].gather_range(min, max, &mut gather);
        }
        self.deliver()
    }

    /// Hand collected owners to the visitor with no data borrow held
    fn deliver(&mut self) -> ControlFlow<()> {
        for owner in self.found.drain(..) {
            if (self.visitor)(owner) == IterationControl::Stop {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    type Tree = VoxelTree<u32>;

    fn tree() -> Tree {
        VoxelTree::new(PartitionTree::CategoryA, &PartitionConfig::default())
    }

    fn member(owner: u32, list_mask: ListMask) -> TreeMember<u32> {
        TreeMember {
            owner,
            list_mask,
            flags: SharedFlags::default(),
        }
    }

    fn handles(count: usize) -> Vec<PartitionHandle> {
        let mut keys: SlotMap<PartitionHandle, ()> = SlotMap::with_key();
        (0..count).map(|_| keys.insert(())).collect()
    }

    fn collect_box(tree: &Tree, mask: ListMask, mins: Vec3, maxs: Vec3) -> Vec<u32> {
        let mut found = Vec::new();
        tree.enumerate_in_box(mask, mins, maxs, |owner| {
            found.push(owner);
            IterationControl::Continue
        });
        found.sort_unstable();
        found
    }

    fn collect_ray(tree: &Tree, mask: ListMask, ray: &Ray) -> Vec<u32> {
        let mut found = Vec::new();
        tree.enumerate_along_ray(mask, ray, |owner| {
            found.push(owner);
            IterationControl::Continue
        });
        found.sort_unstable();
        found
    }

    #[test]
    fn test_level_selection() {
        let tree = tree();
        assert_eq!(tree.select_level(Vec3::new(20.0, 20.0, 20.0)), 0);
        assert_eq!(tree.select_level(Vec3::new(255.9, 1.0, 1.0)), 0);
        assert_eq!(tree.select_level(Vec3::new(256.0, 1.0, 1.0)), 1);
        assert_eq!(tree.select_level(Vec3::new(1.0, 3000.0, 1.0)), 2);
        assert_eq!(tree.select_level(Vec3::new(1.0, 1.0, 10000.0)), 3);
        assert_eq!(tree.select_level(Vec3::new(1.0, 1.0, 40000.0)), 3);
    }

    #[test]
    fn test_insert_bloats_and_clamps() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(1, 1), Vec3::new(-10.0, -10.0, -10.0), Vec3::new(20000.0, 10.0, 10.0), false);

        let bounds = tree.stored_bounds(h).unwrap();
        assert_eq!(bounds.min, Vec3::repeat(-10.03125));
        assert_eq!(bounds.max, Vec3::new(16384.0, 10.03125, 10.03125));
        assert_eq!(tree.level_of(h), Some(3));
    }

    #[test]
    fn test_box_query_and_mask_filter() {
        let tree = tree();
        let hs = handles(3);
        tree.insert_into_tree(hs[0], &member(0, 0b01), Vec3::repeat(-10.0), Vec3::repeat(10.0), false);
        tree.insert_into_tree(hs[1], &member(1, 0b10), Vec3::repeat(-10.0), Vec3::repeat(10.0), false);
        tree.insert_into_tree(hs[2], &member(2, 0b01), Vec3::repeat(1000.0), Vec3::repeat(1010.0), false);

        assert_eq!(collect_box(&tree, 0b01, Vec3::repeat(-1.0), Vec3::repeat(1.0)), vec![0]);
        assert_eq!(collect_box(&tree, 0b11, Vec3::repeat(-1.0), Vec3::repeat(1.0)), vec![0, 1]);
        assert_eq!(collect_box(&tree, 0b11, Vec3::repeat(-20.0), Vec3::repeat(2000.0)), vec![0, 1, 2]);
        assert!(collect_box(&tree, 0, Vec3::repeat(-20.0), Vec3::repeat(2000.0)).is_empty());
    }

    #[test]
    fn test_query_outside_world_finds_nothing() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(7, 1), Vec3::new(16000.0, 0.0, 0.0), Vec3::new(16384.0, 10.0, 10.0), false);

        assert_eq!(collect_box(&tree, 1, Vec3::new(16300.0, 0.0, 0.0), Vec3::new(17000.0, 5.0, 5.0)), vec![7]);
        assert!(collect_box(&tree, 1, Vec3::new(17000.0, 0.0, 0.0), Vec3::new(18000.0, 5.0, 5.0)).is_empty());
    }

    #[test]
    fn test_reinsert_in_same_cells_skips_hash() {
        let tree = tree();
        let h = handles(1)[0];
        let m = member(1, 1);
        assert!(tree.insert_into_tree(h, &m, Vec3::repeat(10.0), Vec3::repeat(20.0), false));
        let before = tree.mutation_count();

        assert!(!tree.insert_into_tree(h, &m, Vec3::repeat(11.0), Vec3::repeat(21.0), true));
        assert_eq!(tree.mutation_count(), before);
        assert_eq!(tree.stored_bounds(h).unwrap().min, Vec3::repeat(10.96875));

        assert!(tree.insert_into_tree(h, &m, Vec3::repeat(300.0), Vec3::repeat(310.0), true));
        assert_eq!(tree.mutation_count(), before + 1);
        assert!(collect_box(&tree, 1, Vec3::repeat(0.0), Vec3::repeat(50.0)).is_empty());
        assert_eq!(collect_box(&tree, 1, Vec3::repeat(305.0), Vec3::repeat(306.0)), vec![1]);
    }

    #[test]
    fn test_refresh_bounds_only_within_same_cells() {
        let tree = tree();
        let hs = handles(2);
        tree.insert_into_tree(hs[0], &member(1, 1), Vec3::repeat(10.0), Vec3::repeat(20.0), false);
        let before = tree.mutation_count();

        assert!(tree.refresh_bounds(hs[0], tree.prepare_bounds(Vec3::repeat(12.0), Vec3::repeat(22.0))));
        assert_eq!(tree.stored_bounds(hs[0]).unwrap().max, Vec3::repeat(22.03125));

        // Other cells, or not in the tree at all: nothing changes.
        assert!(!tree.refresh_bounds(hs[0], tree.prepare_bounds(Vec3::repeat(500.0), Vec3::repeat(510.0))));
        assert!(!tree.refresh_bounds(hs[1], tree.prepare_bounds(Vec3::repeat(12.0), Vec3::repeat(22.0))));
        assert_eq!(tree.stored_bounds(hs[0]).unwrap().max, Vec3::repeat(22.03125));
        assert!(!tree.contains(hs[1]));
        assert_eq!(tree.mutation_count(), before);
    }

    #[test]
    fn test_sweep_with_world_sized_extents_finishes() {
        let tree = tree();
        let hs = handles(2);
        tree.insert_into_tree(hs[0], &member(3, 1), Vec3::repeat(-10.0), Vec3::repeat(10.0), false);
        tree.insert_into_tree(hs[1], &member(4, 1), Vec3::new(9000.0, -12000.0, 500.0), Vec3::new(9100.0, -11900.0, 600.0), false);

        let ray = Ray::swept(Vec3::new(-1e10, 0.0, 0.0), Vec3::new(1e10, 0.0, 0.0), Vec3::repeat(1e10));
        assert_eq!(collect_ray(&tree, 1, &ray), vec![3, 4]);
        assert!(collect_ray(&tree, 2, &ray).is_empty());
        assert_eq!(tree.gate.held_reads(), 0);
    }

    #[test]
    fn test_remove_returns_pools_to_empty() {
        let tree = tree();
        let hs = handles(20);
        for (i, &h) in hs.iter().enumerate() {
            let base = i as f32 * 300.0 - 3000.0;
            tree.insert_into_tree(h, &member(i as u32, 1), Vec3::repeat(base), Vec3::repeat(base + 400.0), false);
        }
        assert_eq!(tree.len(), 20);

        for &h in &hs {
            assert!(tree.remove_from_tree(h));
        }
        assert!(!tree.remove_from_tree(hs[0]));

        let stats = tree.stats();
        assert_eq!(stats.entries_per_level, [0; LEVEL_COUNT]);
        assert_eq!(stats.cells_per_level, [0; LEVEL_COUNT]);
        assert_eq!(stats.leaves, 0);
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.visit_bits_in_use, 0);
    }

    #[test]
    fn test_update_list_mask_in_place() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(3, 0b01), Vec3::repeat(-300.0), Vec3::repeat(300.0), false);
        let mutations = tree.mutation_count();

        assert!(tree.update_list_mask(h, 0b10));
        assert_eq!(tree.mutation_count(), mutations);
        assert_eq!(tree.stored_list_mask(h), Some(0b10));
        assert!(collect_box(&tree, 0b01, Vec3::repeat(-1.0), Vec3::repeat(1.0)).is_empty());
        assert_eq!(collect_box(&tree, 0b10, Vec3::repeat(-1.0), Vec3::repeat(1.0)), vec![3]);
    }

    #[test]
    fn test_hidden_objects_are_skipped() {
        let tree = tree();
        let h = handles(1)[0];
        let m = member(5, 1);
        tree.insert_into_tree(h, &m, Vec3::repeat(-10.0), Vec3::repeat(10.0), false);

        m.flags.insert(crate::spatial::list_mask::EntityFlags::HIDDEN);
        assert!(collect_box(&tree, 1, Vec3::repeat(-1.0), Vec3::repeat(1.0)).is_empty());
        m.flags.remove(crate::spatial::list_mask::EntityFlags::HIDDEN);
        assert_eq!(collect_box(&tree, 1, Vec3::repeat(-1.0), Vec3::repeat(1.0)), vec![5]);
    }

    #[test]
    fn test_point_query() {
        let tree = tree();
        let hs = handles(2);
        tree.insert_into_tree(hs[0], &member(0, 1), Vec3::repeat(0.0), Vec3::repeat(100.0), false);
        tree.insert_into_tree(hs[1], &member(1, 1), Vec3::repeat(-5000.0), Vec3::repeat(5000.0), false);

        let mut found = Vec::new();
        tree.enumerate_at_point(1, Vec3::repeat(50.0), |owner| {
            found.push(owner);
            IterationControl::Continue
        });
        found.sort_unstable();
        assert_eq!(found, vec![0, 1]);

        let mut count = 0;
        tree.enumerate_at_point(1, Vec3::repeat(200.0), |_| {
            count += 1;
            IterationControl::Continue
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_visitor_stop_ends_query() {
        let tree = tree();
        let hs = handles(10);
        for (i, &h) in hs.iter().enumerate() {
            tree.insert_into_tree(h, &member(i as u32, 1), Vec3::repeat(-10.0), Vec3::repeat(10.0), false);
        }

        let mut seen = 0;
        let result = tree.enumerate_in_box(1, Vec3::repeat(-1.0), Vec3::repeat(1.0), |_| {
            seen += 1;
            if seen == 3 { IterationControl::Stop } else { IterationControl::Continue }
        });
        assert_eq!(result, IterationControl::Stop);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_thin_ray_hits_along_axis() {
        let tree = tree();
        let hs = handles(4);
        tree.insert_into_tree(hs[0], &member(0, 1), Vec3::new(1000.0, -5.0, -5.0), Vec3::new(1010.0, 5.0, 5.0), false);
        tree.insert_into_tree(hs[1], &member(1, 1), Vec3::new(5000.0, -5.0, -5.0), Vec3::new(7000.0, 5.0, 5.0), false);
        tree.insert_into_tree(hs[2], &member(2, 1), Vec3::new(3000.0, 50.0, -5.0), Vec3::new(3010.0, 60.0, 5.0), false);
        tree.insert_into_tree(hs[3], &member(3, 1), Vec3::new(-9000.0, -5.0, -5.0), Vec3::new(-8000.0, 5.0, 5.0), false);

        let ray = Ray::new(Vec3::new(-20000.0, 0.0, 0.0), Vec3::new(8000.0, 0.0, 0.0));
        assert_eq!(collect_ray(&tree, 1, &ray), vec![0, 1, 3]);

        let short = Ray::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(2000.0, 0.0, 0.0));
        assert_eq!(collect_ray(&tree, 1, &short), vec![0]);
    }

    #[test]
    fn test_single_cell_ray() {
        let tree = tree();
        let hs = handles(2);
        tree.insert_into_tree(hs[0], &member(0, 1), Vec3::repeat(10.0), Vec3::repeat(20.0), false);
        tree.insert_into_tree(hs[1], &member(1, 1), Vec3::repeat(-6000.0), Vec3::repeat(6000.0), false);

        let ray = Ray::new(Vec3::repeat(1.0), Vec3::repeat(30.0));
        assert_eq!(collect_ray(&tree, 1, &ray), vec![0, 1]);
    }

    #[test]
    fn test_swept_box_reaches_beside_the_path() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(9, 1), Vec3::new(2000.0, 40.0, -5.0), Vec3::new(2010.0, 50.0, 5.0), false);

        let thin = Ray::new(Vec3::zeros(), Vec3::new(4000.0, 0.0, 0.0));
        assert!(collect_ray(&tree, 1, &thin).is_empty());

        let swept = Ray::swept(Vec3::zeros(), Vec3::new(4000.0, 0.0, 0.0), Vec3::repeat(45.0));
        assert_eq!(collect_ray(&tree, 1, &swept), vec![9]);
    }

    #[test]
    fn test_zero_length_ray_is_a_box_query() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(4, 1), Vec3::repeat(0.0), Vec3::repeat(10.0), false);

        let ray = Ray::swept(Vec3::repeat(-5.0), Vec3::repeat(-5.0), Vec3::repeat(6.0));
        assert_eq!(collect_ray(&tree, 1, &ray), vec![4]);
        let ray = Ray::new(Vec3::repeat(-5.0), Vec3::repeat(-5.0));
        assert!(collect_ray(&tree, 1, &ray).is_empty());
    }

    #[test]
    fn test_ray_outside_world_does_nothing() {
        let tree = tree();
        let h = handles(1)[0];
        tree.insert_into_tree(h, &member(4, 1), Vec3::repeat(0.0), Vec3::repeat(10.0), false);

        let ray = Ray::new(Vec3::new(-30000.0, 20000.0, 0.0), Vec3::new(30000.0, 20000.0, 0.0));
        assert!(collect_ray(&tree, 1, &ray).is_empty());
    }

    #[test]
    fn test_slice_and_faces() {
        let range = [[1, 2, 3], [4, 5, 6]];
        assert_eq!(slice(range, 0, 1), ([4, 2, 3], [4, 5, 6]));
        assert_eq!(slice(range, 1, -1), ([1, 2, 3], [4, 2, 6]));

        let mut ranges = [[[0; 3]; 2]; LEVEL_COUNT];
        ranges[0][1][2] = 63;
        advance_face(&mut ranges, 1, 2, 1);
        assert_eq!(ranges[0][1][2], 64);
        assert_eq!(ranges[1][1][2], 16);
        assert_eq!(ranges[2][1][2], 4);
        assert_eq!(ranges[3][1][2], 1);
    }

    #[test]
    fn test_clear() {
        let tree = tree();
        let hs = handles(3);
        for (i, &h) in hs.iter().enumerate() {
            tree.insert_into_tree(h, &member(i as u32, 1), Vec3::repeat(0.0), Vec3::repeat(10.0), false);
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.stats().entries_per_level, [0; LEVEL_COUNT]);
        assert!(collect_box(&tree, 1, Vec3::repeat(-1.0), Vec3::repeat(20.0)).is_empty());
    }
}
