//! One resolution level of the spatial hash
//!
//! Occupied cells map to the head of an intrusive, doubly linked list of
//! entries. Each entry names the object and a snapshot of its list mask so
//! that the mask filter runs without touching the object record. Alongside
//! the cell lists, every object keeps a chain of leaf records (one per cell
//! it occupies) so removal walks only that object's cells.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::foundation::math::Aabb;
use crate::spatial::handle::PartitionHandle;
use crate::spatial::intersect::Intersect;
use crate::spatial::invariant_violated;
use crate::spatial::list_mask::ListMask;
use crate::spatial::visits::VisitSet;
use crate::spatial::voxel::{VoxelCoord, VoxelIndexer};

/// Smallest bucket table reserved for a level
const MIN_BUCKET_HINT: usize = 16;

/// Bucket table size hint for the finest level; halves per level
const BASE_BUCKET_HINT: usize = 512;

new_key_type! {
    /// Key of one object-in-cell entry
    pub struct EntryKey;
    /// Key of one link in an object's leaf chain
    pub struct LeafKey;
}

#[derive(Debug, Clone, Copy)]
struct SpatialEntry {
    handle: PartitionHandle,
    list_mask: ListMask,
    prev: Option<EntryKey>,
    next: Option<EntryKey>,
}

/// Links one occupied cell back to the object's entry in it
#[derive(Debug, Clone, Copy)]
pub struct LeafEntry {
    voxel: VoxelCoord,
    entry: EntryKey,
    next: Option<LeafKey>,
}

/// Per-tree pool of leaf records shared by all levels
pub type LeafList = SlotMap<LeafKey, LeafEntry>;

/// What a level needs to know about a candidate object
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a, O> {
    /// Value handed to the visitor
    pub owner: O,
    /// Stored bounds for the exact test
    pub bounds: &'a Aabb,
    /// Hidden objects are skipped
    pub hidden: bool,
    /// Dedup bit
    pub visit_bit: u32,
}

/// Resolves a handle stored in a cell to its object record
pub trait CandidateLookup<O> {
    /// Record for `handle`, if the tree still holds it
    fn candidate(&self, handle: PartitionHandle) -> Option<Candidate<'_, O>>;
}

/// State threaded through one cell walk
pub struct Gather<'q, 'v, O, L, P> {
    /// Query list mask
    pub mask: ListMask,
    /// Object records
    pub lookup: &'q L,
    /// Exact test
    pub predicate: &'q P,
    /// Dedup marks; `None` when the walk cannot meet an object twice
    pub visits: Option<&'q mut VisitSet<'v>>,
    /// Owners that passed every filter
    pub found: &'q mut Vec<O>,
}

/// Spatial hash for one level
#[derive(Debug)]
pub struct VoxelHash {
    indexer: VoxelIndexer,
    buckets: HashMap<VoxelCoord, EntryKey>,
    entries: SlotMap<EntryKey, SpatialEntry>,
}

impl VoxelHash {
    /// Create an empty level
    pub fn new(indexer: VoxelIndexer, entry_capacity: usize) -> Self {
        let bucket_hint = (BASE_BUCKET_HINT >> indexer.level()).max(MIN_BUCKET_HINT);
        Self {
            indexer,
            buckets: HashMap::with_capacity(bucket_hint),
            entries: SlotMap::with_capacity_and_key(entry_capacity >> indexer.level()),
        }
    }

    /// Coordinate math for this level
    pub const fn indexer(&self) -> &VoxelIndexer {
        &self.indexer
    }

    /// Live entries (object-cell pairs)
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Occupied cells
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Entries in one cell
    pub fn cell_len(&self, voxel: VoxelCoord) -> usize {
        let mut count = 0;
        let mut cursor = self.buckets.get(&voxel).copied();
        while let Some(key) = cursor {
            count += 1;
            cursor = self.entries.get(key).and_then(|entry| entry.next);
        }
        count
    }

    /// Link `handle` into every cell of the inclusive range.
    ///
    /// Leaf records are prepended to `leaf_head`; the new head is returned.
    pub fn insert(
        &mut self,
        handle: PartitionHandle,
        list_mask: ListMask,
        voxel_min: VoxelCoord,
        voxel_max: VoxelCoord,
        leaves: &mut LeafList,
        mut leaf_head: Option<LeafKey>,
    ) -> Option<LeafKey> {
        let [x0, y0, z0] = voxel_min.axes();
        let [x1, y1, z1] = voxel_max.axes();

        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let voxel = VoxelCoord::new(x, y, z);
                    let entry = self.link(voxel, handle, list_mask);
                    leaf_head = Some(leaves.insert(LeafEntry {
                        voxel,
                        entry,
                        next: leaf_head,
                    }));
                }
            }
        }

        leaf_head
    }

    fn link(&mut self, voxel: VoxelCoord, handle: PartitionHandle, list_mask: ListMask) -> EntryKey {
        let head = self.buckets.get(&voxel).copied();
        let entry = self.entries.insert(SpatialEntry {
            handle,
            list_mask,
            prev: None,
            next: head,
        });
        if let Some(head_entry) = head.and_then(|key| self.entries.get_mut(key)) {
            head_entry.prev = Some(entry);
        }
        self.buckets.insert(voxel, entry);
        entry
    }

    /// Unlink every cell on the leaf chain and free the chain.
    ///
    /// Returns the number of entries removed.
    pub fn remove(&mut self, leaf_head: Option<LeafKey>, leaves: &mut LeafList) -> usize {
        let mut removed = 0;
        let mut cursor = leaf_head;
        while let Some(key) = cursor {
            let Some(leaf) = leaves.remove(key) else {
                invariant_violated(format_args!(
                    "Stale leaf {key:?} while unlinking level {}",
                    self.indexer.level()
                ));
                break;
            };
            cursor = leaf.next;
            if self.unlink(leaf.voxel, leaf.entry) {
                removed += 1;
            }
        }
        removed
    }

    fn unlink(&mut self, voxel: VoxelCoord, key: EntryKey) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            invariant_violated(format_args!("Stale entry {key:?} in cell {voxel:?}"));
            return false;
        };

        match entry.prev.and_then(|prev| self.entries.get_mut(prev)) {
            Some(prev) => prev.next = entry.next,
            None => match entry.next {
                Some(next) => {
                    self.buckets.insert(voxel, next);
                }
                None => {
                    self.buckets.remove(&voxel);
                }
            },
        }
        if let Some(next) = entry.next.and_then(|next| self.entries.get_mut(next)) {
            next.prev = entry.prev;
        }
        true
    }

    /// Rewrite the mask snapshot of every entry on the leaf chain
    pub fn update_mask(&mut self, handle: PartitionHandle, list_mask: ListMask, leaf_head: Option<LeafKey>, leaves: &LeafList) {
        let mut cursor = leaf_head;
        while let Some(leaf) = cursor.and_then(|key| leaves.get(key)) {
            match self.entries.get_mut(leaf.entry) {
                Some(entry) if entry.handle == handle => entry.list_mask = list_mask,
                _ => invariant_violated(format_args!("Leaf chain of {handle:?} points at a foreign entry")),
            }
            cursor = leaf.next;
        }
    }

    /// Walk one cell
    pub fn gather_cell<O: Copy, L: CandidateLookup<O>, P: Intersect>(
        &self,
        voxel: VoxelCoord,
        gather: &mut Gather<'_, '_, O, L, P>,
    ) {
        if let Some(&head) = self.buckets.get(&voxel) {
            self.gather_list(head, gather);
        }
    }

    /// Walk every cell in the inclusive unpacked range.
    ///
    /// When the range has more cells than the level has occupied buckets,
    /// the occupied buckets are filtered instead, so a huge query costs no
    /// more than the level's occupancy.
    pub fn gather_range<O: Copy, L: CandidateLookup<O>, P: Intersect>(
        &self,
        min: [i32; 3],
        max: [i32; 3],
        gather: &mut Gather<'_, '_, O, L, P>,
    ) {
        if self.buckets.is_empty() || (0..3).any(|axis| max[axis] < min[axis]) {
            return;
        }

        let cells: u64 = (0..3).map(|axis| (max[axis] - min[axis] + 1) as u64).product();
        if cells > self.buckets.len() as u64 {
            log::trace!(
                "Level {} range of {cells} cells scans {} occupied buckets instead",
                self.indexer.level(),
                self.buckets.len()
            );
            for (&voxel, &head) in &self.buckets {
                if voxel.within(min, max) {
                    self.gather_list(head, gather);
                }
            }
            return;
        }

        for z in min[2]..=max[2] {
            for y in min[1]..=max[1] {
                for x in min[0]..=max[0] {
                    self.gather_cell(VoxelCoord::new(x, y, z), gather);
                }
            }
        }
    }

    fn gather_list<O: Copy, L: CandidateLookup<O>, P: Intersect>(
        &self,
        head: EntryKey,
        gather: &mut Gather<'_, '_, O, L, P>,
    ) {
        let mut cursor = Some(head);
        while let Some(entry) = cursor.and_then(|key| self.entries.get(key)) {
            cursor = entry.next;

            if entry.list_mask & gather.mask == 0 {
                continue;
            }
            let Some(candidate) = gather.lookup.candidate(entry.handle) else {
                invariant_violated(format_args!("Cell entry for unknown handle {:?}", entry.handle));
                continue;
            };
            if candidate.hidden {
                continue;
            }
            if let Some(visits) = gather.visits.as_deref_mut() {
                if !visits.first_visit(candidate.visit_bit) {
                    continue;
                }
            }
            if gather.predicate.intersects(candidate.bounds) {
                gather.found.push(candidate.owner);
            }
        }
    }

    /// Drop every entry; the caller clears the shared leaf pool
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::spatial::intersect::IntersectBox;
    use crate::spatial::visits::VisitPool;
    use slotmap::SlotMap;
    use std::collections::HashMap as Records;

    struct Record {
        bounds: Aabb,
        hidden: bool,
        bit: u32,
    }

    struct Table(Records<PartitionHandle, Record>);

    impl CandidateLookup<PartitionHandle> for Table {
        fn candidate(&self, handle: PartitionHandle) -> Option<Candidate<'_, PartitionHandle>> {
            self.0.get(&handle).map(|record| Candidate {
                owner: handle,
                bounds: &record.bounds,
                hidden: record.hidden,
                visit_bit: record.bit,
            })
        }
    }

    fn level0() -> VoxelHash {
        let world = Aabb::new(Vec3::repeat(-16384.0), Vec3::repeat(16384.0));
        VoxelHash::new(VoxelIndexer::new(world, 8, 0), 64)
    }

    fn handles(count: usize) -> Vec<PartitionHandle> {
        let mut keys: SlotMap<PartitionHandle, ()> = SlotMap::with_key();
        (0..count).map(|_| keys.insert(())).collect()
    }

    fn everything() -> IntersectBox {
        IntersectBox(Aabb::new(Vec3::repeat(-16384.0), Vec3::repeat(16384.0)))
    }

    fn gather_all(hash: &VoxelHash, table: &Table, mask: ListMask, min: [i32; 3], max: [i32; 3]) -> Vec<PartitionHandle> {
        let pool = VisitPool::new();
        let mut visits = pool.check_out(8);
        let mut found = Vec::new();
        let predicate = everything();
        let mut gather = Gather {
            mask,
            lookup: table,
            predicate: &predicate,
            visits: Some(&mut visits),
            found: &mut found,
        };
        hash.gather_range(min, max, &mut gather);
        found
    }

    #[test]
    fn test_insert_links_every_cell() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let h = handles(1)[0];

        let head = hash.insert(h, 1, VoxelCoord::new(1, 1, 1), VoxelCoord::new(2, 3, 1), &mut leaves, None);
        assert!(head.is_some());
        assert_eq!(hash.entry_count(), 6);
        assert_eq!(hash.bucket_count(), 6);
        assert_eq!(leaves.len(), 6);
        assert_eq!(hash.cell_len(VoxelCoord::new(2, 3, 1)), 1);
        assert_eq!(hash.cell_len(VoxelCoord::new(3, 3, 1)), 0);
    }

    #[test]
    fn test_remove_restores_empty_state() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let hs = handles(3);

        let cell = VoxelCoord::new(5, 5, 5);
        let heads: Vec<_> = hs.iter().map(|&h| hash.insert(h, 1, cell, cell, &mut leaves, None)).collect();
        assert_eq!(hash.cell_len(cell), 3);

        // Middle, head, then tail of the cell list.
        assert_eq!(hash.remove(heads[1], &mut leaves), 1);
        assert_eq!(hash.cell_len(cell), 2);
        assert_eq!(hash.remove(heads[2], &mut leaves), 1);
        assert_eq!(hash.cell_len(cell), 1);
        assert_eq!(hash.remove(heads[0], &mut leaves), 1);

        assert_eq!(hash.entry_count(), 0);
        assert_eq!(hash.bucket_count(), 0);
        assert!(leaves.is_empty());
    }

    #[test]
    fn test_removed_leaf_keys_go_stale() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let hs = handles(2);
        let cell = VoxelCoord::new(7, 7, 7);

        let old = hash.insert(hs[0], 1, cell, cell, &mut leaves, None).unwrap();
        assert_eq!(hash.remove(Some(old), &mut leaves), 1);

        // The freed slots are reused without the old key reaching them.
        let new = hash.insert(hs[1], 1, cell, cell, &mut leaves, None).unwrap();
        assert_ne!(old, new);
        assert!(leaves.get(old).is_none());
        assert_eq!(hash.cell_len(cell), 1);
        assert_eq!(hash.entry_count(), 1);
    }

    #[test]
    fn test_gather_filters_mask_hidden_and_dedups() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let hs = handles(3);
        let bounds = Aabb::new(Vec3::zeros(), Vec3::repeat(1.0));
        let table = Table(
            hs.iter()
                .enumerate()
                .map(|(i, &h)| (h, Record { bounds, hidden: i == 2, bit: i as u32 }))
                .collect(),
        );

        // Spans two cells, must be reported once.
        hash.insert(hs[0], 0b01, VoxelCoord::new(0, 0, 0), VoxelCoord::new(1, 0, 0), &mut leaves, None);
        hash.insert(hs[1], 0b10, VoxelCoord::new(0, 0, 0), VoxelCoord::new(0, 0, 0), &mut leaves, None);
        hash.insert(hs[2], 0b01, VoxelCoord::new(1, 0, 0), VoxelCoord::new(1, 0, 0), &mut leaves, None);

        let found = gather_all(&hash, &table, 0b01, [0, 0, 0], [1, 0, 0]);
        assert_eq!(found, vec![hs[0]]);

        let found = gather_all(&hash, &table, 0b11, [0, 0, 0], [1, 0, 0]);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&hs[0]) && found.contains(&hs[1]));
    }

    #[test]
    fn test_update_mask_rewrites_snapshots() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let h = handles(1)[0];
        let table = Table([(h, Record { bounds: Aabb::new(Vec3::zeros(), Vec3::zeros()), hidden: false, bit: 0 })].into());

        let head = hash.insert(h, 0b01, VoxelCoord::new(0, 0, 0), VoxelCoord::new(1, 1, 0), &mut leaves, None);
        assert!(gather_all(&hash, &table, 0b10, [0, 0, 0], [1, 1, 0]).is_empty());

        hash.update_mask(h, 0b10, head, &leaves);
        assert_eq!(gather_all(&hash, &table, 0b10, [0, 0, 0], [1, 1, 0]), vec![h]);
        assert!(gather_all(&hash, &table, 0b01, [0, 0, 0], [1, 1, 0]).is_empty());
        assert_eq!(hash.entry_count(), 4);
    }

    #[test]
    fn test_huge_range_scans_occupied_buckets() {
        let mut hash = level0();
        let mut leaves = LeafList::with_key();
        let hs = handles(2);
        let bounds = Aabb::new(Vec3::zeros(), Vec3::zeros());
        let table = Table(
            hs.iter()
                .enumerate()
                .map(|(i, &h)| (h, Record { bounds, hidden: false, bit: i as u32 }))
                .collect(),
        );

        hash.insert(hs[0], 1, VoxelCoord::new(3, 4, 5), VoxelCoord::new(3, 4, 5), &mut leaves, None);
        hash.insert(hs[1], 1, VoxelCoord::new(100, 100, 100), VoxelCoord::new(100, 100, 100), &mut leaves, None);

        let found = gather_all(&hash, &table, 1, [0, 0, 0], [50, 50, 50]);
        assert_eq!(found, vec![hs[0]]);
        let found = gather_all(&hash, &table, 1, [0, 0, 0], [128, 128, 128]);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_bucket_hint_shrinks_per_level() {
        let world = Aabb::new(Vec3::repeat(-16384.0), Vec3::repeat(16384.0));
        let coarse = VoxelHash::new(VoxelIndexer::new(world, 8, 3), 64);
        assert!(coarse.buckets.capacity() >= MIN_BUCKET_HINT);
        assert_eq!(coarse.indexer().level(), 3);
    }
}
