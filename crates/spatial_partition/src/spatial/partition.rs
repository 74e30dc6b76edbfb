//! Partition index
//!
//! The public face of the partition. It owns the handle table and two
//! [`VoxelTree`]s, one per object universe, and keeps each object's tree
//! membership in line with its list mask. Objects whose mask touches the
//! category-A lists live in tree A, objects with any other list live in
//! tree B, and an object can be in both.
//!
//! The handle table has its own mutex, which is never held while a tree lock
//! is taken. Visitors may therefore call back into any index operation,
//! including moving or destroying the object they were just handed. Before
//! writing to a tree, an operation parks the calling thread's query reads on
//! both trees, so a visitor in a tree A query that moves an object living in
//! tree B never holds A while it waits for B.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use slotmap::SlotMap;

use crate::core::config::PartitionConfig;
use crate::error::PartitionError;
use crate::foundation::math::{Aabb, BoundingSphere, Ray, Vec3};
use crate::spatial::handle::PartitionHandle;
use crate::spatial::invariant_violated;
use crate::spatial::list_mask::{EntityFlags, ListMask, PartitionTree, SharedFlags};
use crate::spatial::lock::SuspendedReads;
use crate::spatial::voxel_tree::{IterationControl, TreeMember, TreeStats, VoxelTree};

/// Most query callbacks that can be installed at once
pub const MAX_QUERY_CALLBACKS: usize = 3;

/// Hooks run around every query
pub trait QueryCallback: Send + Sync {
    /// Runs before the query walks the tree
    fn on_pre_query(&self, list_mask: ListMask);
    /// Runs after the query finished or was stopped
    fn on_post_query(&self, list_mask: ListMask);
}

/// Handle table record
#[derive(Debug, Clone)]
struct EntityInfo<O> {
    owner: O,
    /// Bloated and clamped; `None` until first placed
    bounds: Option<Aabb>,
    list_mask: ListMask,
    flags: SharedFlags,
}

impl<O: Copy> EntityInfo<O> {
    fn member(&self) -> TreeMember<O> {
        TreeMember {
            owner: self.owner,
            list_mask: self.list_mask,
            flags: self.flags.clone(),
        }
    }
}

/// Occupancy snapshot of the whole index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Live handles
    pub handles: usize,
    /// Per-tree statistics, category A first
    pub trees: [TreeStats; 2],
}

/// Two-universe spatial index over a fixed world
pub struct PartitionIndex<O> {
    config: PartitionConfig,
    handles: Mutex<SlotMap<PartitionHandle, EntityInfo<O>>>,
    trees: [VoxelTree<O>; 2],
    callbacks: RwLock<Vec<Arc<dyn QueryCallback>>>,
    suppressed: AtomicU16,
}

impl<O> std::fmt::Debug for PartitionIndex<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionIndex")
            .field("config", &self.config)
            .field("suppressed", &self.suppressed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<O: Copy + Send + Sync> PartitionIndex<O> {
    /// Create an index over the configured world
    pub fn new(config: PartitionConfig) -> Result<Self, PartitionError> {
        config.validate().map_err(PartitionError::InvalidConfig)?;

        let trees = PartitionTree::ALL.map(|kind| VoxelTree::new(kind, &config));
        log::info!(
            "Partition index over {:?}..{:?}, level 0 cells of {} units",
            config.world_min.as_slice(),
            config.world_max.as_slice(),
            trees[0].indexer(0).voxel_size()
        );

        Ok(Self {
            handles: Mutex::new(SlotMap::with_capacity_and_key(config.handle_capacity)),
            trees,
            callbacks: RwLock::new(Vec::with_capacity(MAX_QUERY_CALLBACKS)),
            suppressed: AtomicU16::new(0),
            config,
        })
    }

    /// Configuration the index was built with
    pub const fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// One of the two trees
    pub const fn tree(&self, kind: PartitionTree) -> &VoxelTree<O> {
        &self.trees[kind.index()]
    }

    fn lock_handles(&self) -> MutexGuard<'_, SlotMap<PartitionHandle, EntityInfo<O>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn suspend_reads(&self) -> [SuspendedReads<'_>; 2] {
        self.trees.each_ref().map(VoxelTree::suspend_reads)
    }

    #[track_caller]
    fn invalid_handle(operation: &str, handle: PartitionHandle) {
        invariant_violated(format_args!("{operation}: invalid partition handle {handle:?}"));
    }

    /// Start tracking an object. It is in no list and no tree yet.
    pub fn create_handle(&self, owner: O) -> PartitionHandle {
        self.lock_handles().insert(EntityInfo {
            owner,
            bounds: None,
            list_mask: 0,
            flags: SharedFlags::default(),
        })
    }

    /// Create, assign lists and place an object in one call
    pub fn create_handle_with(&self, owner: O, list_mask: ListMask, mins: Vec3, maxs: Vec3) -> PartitionHandle {
        let handle = self.create_handle(owner);
        self.insert(list_mask, handle);
        self.element_moved(handle, mins, maxs);
        handle
    }

    /// Stop tracking an object and free its handle
    pub fn destroy_handle(&self, handle: PartitionHandle) {
        let Some(info) = self.lock_handles().remove(handle) else {
            Self::invalid_handle("destroy_handle", handle);
            return;
        };
        let _suspended = self.suspend_reads();
        for tree in &self.trees {
            let flag = tree.kind().presence_flag();
            if info.flags.contains(flag) {
                tree.remove_from_tree(handle);
                info.flags.remove(flag);
            }
        }
    }

    /// Add the object to the lists in `list_mask`
    pub fn insert(&self, list_mask: ListMask, handle: PartitionHandle) {
        self.modify_list_mask("insert", handle, |mask| mask | list_mask);
    }

    /// Take the object out of the lists in `list_mask`
    pub fn remove(&self, list_mask: ListMask, handle: PartitionHandle) {
        self.modify_list_mask("remove", handle, |mask| mask & !list_mask);
    }

    /// Remove from some lists and add to others in one membership update
    pub fn remove_and_insert(&self, remove_mask: ListMask, insert_mask: ListMask, handle: PartitionHandle) {
        self.modify_list_mask("remove_and_insert", handle, |mask| (mask & !remove_mask) | insert_mask);
    }

    /// Take the object out of every list (and so out of both trees)
    pub fn remove_all(&self, handle: PartitionHandle) {
        self.modify_list_mask("remove_all", handle, |_| 0);
    }

    fn modify_list_mask(&self, operation: &str, handle: PartitionHandle, update: impl FnOnce(ListMask) -> ListMask) {
        let (info, new_mask) = {
            let mut handles = self.lock_handles();
            let Some(info) = handles.get_mut(handle) else {
                drop(handles);
                Self::invalid_handle(operation, handle);
                return;
            };
            let new_mask = update(info.list_mask);
            if new_mask == info.list_mask {
                return;
            }
            info.list_mask = new_mask;
            (info.clone(), new_mask)
        };

        let category_a = self.config.category_a_mask;
        let _suspended = self.suspend_reads();
        for tree in &self.trees {
            let flag = tree.kind().presence_flag();
            let should = tree.kind().accepts(new_mask, category_a);
            let is_in = info.flags.contains(flag);

            match (should, is_in) {
                (true, true) => {
                    tree.update_list_mask(handle, new_mask);
                }
                (true, false) => {
                    if let Some(bounds) = info.bounds {
                        tree.insert_prepared(handle, &info.member(), bounds, false);
                        info.flags.insert(flag);
                    }
                }
                (false, true) => {
                    tree.remove_from_tree(handle);
                    info.flags.remove(flag);
                }
                (false, false) => {}
            }
        }
    }

    /// Record new bounds and re-place the object in every tree it belongs to
    pub fn element_moved(&self, handle: PartitionHandle, mins: Vec3, maxs: Vec3) {
        let bounds = self.trees[0].prepare_bounds(mins, maxs);
        let info = {
            let mut handles = self.lock_handles();
            let Some(info) = handles.get_mut(handle) else {
                drop(handles);
                Self::invalid_handle("element_moved", handle);
                return;
            };
            info.bounds = Some(bounds);
            info.clone()
        };

        // A move within the same cells only refreshes the stored bounds and
        // takes no tree write.
        let category_a = self.config.category_a_mask;
        let relink = self.trees.each_ref().map(|tree| {
            tree.kind().accepts(info.list_mask, category_a)
                && !(info.flags.contains(tree.kind().presence_flag()) && tree.refresh_bounds(handle, bounds))
        });
        if !relink.contains(&true) {
            return;
        }

        let member = info.member();
        let _suspended = self.suspend_reads();
        for tree in &self.trees {
            if !relink[tree.kind().index()] {
                continue;
            }
            let flag = tree.kind().presence_flag();
            let reinsert = info.flags.contains(flag);
            tree.insert_prepared(handle, &member, bounds, reinsert);
            if !reinsert {
                info.flags.insert(flag);
            }
        }
    }

    /// [`element_moved`](Self::element_moved) taking a box
    pub fn element_moved_to(&self, handle: PartitionHandle, bounds: &Aabb) {
        self.element_moved(handle, bounds.min, bounds.max);
    }

    /// Skip the object in every query until unhidden
    pub fn hide_element(&self, handle: PartitionHandle) {
        self.with_flags("hide_element", handle, |flags| {
            flags.insert(EntityFlags::HIDDEN);
        });
    }

    /// Make a hidden object visible to queries again
    pub fn unhide_element(&self, handle: PartitionHandle) {
        self.with_flags("unhide_element", handle, |flags| {
            flags.remove(EntityFlags::HIDDEN);
        });
    }

    fn with_flags(&self, operation: &str, handle: PartitionHandle, apply: impl FnOnce(&SharedFlags)) {
        let flags = self.lock_handles().get(handle).map(|info| info.flags.clone());
        match flags {
            Some(flags) => apply(&flags),
            None => Self::invalid_handle(operation, handle),
        }
    }

    /// Owner value given at creation
    pub fn owner(&self, handle: PartitionHandle) -> Option<O> {
        self.lock_handles().get(handle).map(|info| info.owner)
    }

    /// Stored bounds (bloated and clamped), once placed
    pub fn bounds(&self, handle: PartitionHandle) -> Option<Aabb> {
        self.lock_handles().get(handle).and_then(|info| info.bounds)
    }

    /// Current list mask
    pub fn list_mask(&self, handle: PartitionHandle) -> Option<ListMask> {
        self.lock_handles().get(handle).map(|info| info.list_mask)
    }

    /// Hidden state
    pub fn is_hidden(&self, handle: PartitionHandle) -> Option<bool> {
        self.lock_handles().get(handle).map(|info| info.flags.is_hidden())
    }

    /// Whether the object is linked into a tree
    pub fn is_in_tree(&self, handle: PartitionHandle, kind: PartitionTree) -> bool {
        self.lock_handles()
            .get(handle)
            .is_some_and(|info| info.flags.contains(kind.presence_flag()))
    }

    /// True while the handle names a live object
    pub fn contains(&self, handle: PartitionHandle) -> bool {
        self.lock_handles().contains_key(handle)
    }

    /// Live handles
    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every object and handle
    pub fn clear(&self) {
        let mut handles = self.lock_handles();
        let count = handles.len();
        handles.clear();
        drop(handles);

        let _suspended = self.suspend_reads();
        for tree in &self.trees {
            tree.clear();
        }
        log::debug!("Partition index cleared ({count} handles)");
    }

    /// Mark lists as suppressed (or clear the mark).
    ///
    /// A debugging aid: queries still run, but any query touching a
    /// suppressed list logs a warning.
    pub fn suppress_lists(&self, list_mask: ListMask, suppress: bool) {
        if suppress {
            self.suppressed.fetch_or(list_mask, Ordering::Relaxed);
        } else {
            self.suppressed.fetch_and(!list_mask, Ordering::Relaxed);
        }
    }

    /// Lists currently marked suppressed
    pub fn suppressed_lists(&self) -> ListMask {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Register a query hook
    pub fn install_query_callback(&self, callback: Arc<dyn QueryCallback>) -> Result<(), PartitionError> {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if callbacks.len() >= MAX_QUERY_CALLBACKS {
            return Err(PartitionError::TooManyQueryCallbacks { max: MAX_QUERY_CALLBACKS });
        }
        callbacks.push(callback);
        Ok(())
    }

    /// Unregister a query hook; false if it was not installed
    pub fn remove_query_callback(&self, callback: &Arc<dyn QueryCallback>) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        let target = Arc::as_ptr(callback).cast::<()>();
        match callbacks.iter().position(|installed| Arc::as_ptr(installed).cast::<()>() == target) {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    fn query_tree(&self, list_mask: ListMask) -> &VoxelTree<O> {
        self.tree(PartitionTree::for_query(list_mask, self.config.category_a_mask))
    }

    fn run_query(&self, list_mask: ListMask, query: impl FnOnce(&VoxelTree<O>) -> IterationControl) -> IterationControl {
        let suppressed = list_mask & self.suppressed_lists();
        if suppressed != 0 {
            log::warn!("Query for lists {list_mask:#06x} touches suppressed lists {suppressed:#06x}");
        }

        // Snapshot so hooks and visitors never run under the callback lock.
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner).clone();
        for callback in &callbacks {
            callback.on_pre_query(list_mask);
        }
        let result = query(self.query_tree(list_mask));
        for callback in &callbacks {
            callback.on_post_query(list_mask);
        }
        result
    }

    /// Visit every object in `list_mask` whose bounds touch the box
    pub fn enumerate_in_box<F>(&self, list_mask: ListMask, mins: Vec3, maxs: Vec3, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        self.run_query(list_mask, |tree| tree.enumerate_in_box(list_mask, mins, maxs, visitor))
    }

    /// Visit every object in `list_mask` whose bounds touch the sphere's
    /// enclosing box
    pub fn enumerate_in_sphere<F>(&self, list_mask: ListMask, sphere: &BoundingSphere, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        self.run_query(list_mask, |tree| {
            tree.enumerate_in_sphere(list_mask, sphere.center, sphere.radius, visitor)
        })
    }

    /// Visit every object in `list_mask` touched by a segment or swept box
    pub fn enumerate_along_ray<F>(&self, list_mask: ListMask, ray: &Ray, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        self.run_query(list_mask, |tree| tree.enumerate_along_ray(list_mask, ray, visitor))
    }

    /// Visit every object in `list_mask` whose bounds contain the point
    pub fn enumerate_at_point<F>(&self, list_mask: ListMask, point: Vec3, visitor: F) -> IterationControl
    where
        F: FnMut(O) -> IterationControl,
    {
        self.run_query(list_mask, |tree| tree.enumerate_at_point(list_mask, point, visitor))
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            handles: self.len(),
            trees: [self.trees[0].stats(), self.trees[1].stats()],
        }
    }

    /// Log an occupancy report at info level
    pub fn report_stats(&self) {
        let stats = self.stats();
        log::info!("Partition: {} handles", stats.handles);
        for (kind, tree) in PartitionTree::ALL.iter().zip(&stats.trees) {
            log::info!(
                "  {kind:?}: {} objects, {} mutations, visit bits {}/{}",
                tree.objects,
                tree.mutations,
                tree.visit_bits_in_use,
                tree.visit_bit_high_water
            );
            for level in 0..tree.entries_per_level.len() {
                log::info!(
                    "    level {level}: {} objects, {} entries in {} cells",
                    tree.objects_per_level[level],
                    tree.entries_per_level[level],
                    tree.cells_per_level[level]
                );
            }
        }
    }
}
