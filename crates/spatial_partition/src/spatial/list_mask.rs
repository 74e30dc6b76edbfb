//! List masks and per-object flags
//!
//! Every tracked object belongs to up to sixteen caller-defined lists. A
//! query names the lists it cares about and only sees objects sharing at
//! least one of them. The partition itself attaches no meaning to the bits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

/// Bitmask of list memberships
pub type ListMask = u16;

/// Named list masks for typical simulation use
///
/// Callers are free to ignore these and define their own bit layout.
pub struct PartitionLists;

impl PartitionLists {
    /// No lists
    pub const NONE: ListMask = 0;
    /// Level geometry that never moves
    pub const STATIC: ListMask = 1 << 0;
    /// Moving simulation objects
    pub const DYNAMIC: ListMask = 1 << 1;
    /// Trigger volumes
    pub const TRIGGERS: ListMask = 1 << 2;
    /// Things that block line of sight
    pub const VISIBILITY: ListMask = 1 << 3;
    /// Sound occluders and emitters
    pub const AUDIO: ListMask = 1 << 4;
    /// Presentation-only objects (effects, decals)
    pub const PRESENTATION: ListMask = 1 << 8;
    /// Presentation-only lights
    pub const LIGHTS: ListMask = 1 << 9;
    /// Every list
    pub const ALL: ListMask = ListMask::MAX;

    /// Combine several masks into one
    pub fn combine(masks: &[ListMask]) -> ListMask {
        masks.iter().fold(Self::NONE, |acc, &mask| acc | mask)
    }

    /// True when the two masks share at least one list
    pub const fn intersects(a: ListMask, b: ListMask) -> bool {
        a & b != 0
    }
}

/// The two independent object universes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionTree {
    /// Objects whose mask intersects the configured category-A mask
    CategoryA,
    /// Objects with any list outside the category-A mask
    CategoryB,
}

impl PartitionTree {
    /// Both trees in storage order
    pub const ALL: [Self; 2] = [Self::CategoryA, Self::CategoryB];

    /// Storage index
    pub const fn index(self) -> usize {
        match self {
            Self::CategoryA => 0,
            Self::CategoryB => 1,
        }
    }

    /// Whether an object with `mask` belongs in this tree
    pub const fn accepts(self, mask: ListMask, category_a: ListMask) -> bool {
        match self {
            Self::CategoryA => mask & category_a != 0,
            Self::CategoryB => mask & !category_a != 0,
        }
    }

    /// Tree that answers a query for `mask`
    pub const fn for_query(mask: ListMask, category_a: ListMask) -> Self {
        if mask & category_a != 0 {
            Self::CategoryA
        } else {
            Self::CategoryB
        }
    }

    /// Presence flag recorded on the object
    pub const fn presence_flag(self) -> EntityFlags {
        match self {
            Self::CategoryA => EntityFlags::IN_TREE_A,
            Self::CategoryB => EntityFlags::IN_TREE_B,
        }
    }
}

bitflags! {
    /// Per-object state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntityFlags: u8 {
        /// Skipped by every traversal
        const HIDDEN = 1 << 0;
        /// Linked into the category-A tree
        const IN_TREE_A = 1 << 1;
        /// Linked into the category-B tree
        const IN_TREE_B = 1 << 2;
    }
}

/// Entity flags shared between the handle table and both trees.
///
/// Flipping a bit is a single atomic operation, so hiding an object never
/// takes a tree lock and running traversals see the change immediately.
#[derive(Debug, Clone, Default)]
pub struct SharedFlags(Arc<AtomicU8>);

impl SharedFlags {
    /// Current flags
    pub fn get(&self) -> EntityFlags {
        EntityFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Check a flag
    pub fn contains(&self, flags: EntityFlags) -> bool {
        self.get().contains(flags)
    }

    /// Set flags, returning the previous state
    pub fn insert(&self, flags: EntityFlags) -> EntityFlags {
        EntityFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear flags, returning the previous state
    pub fn remove(&self, flags: EntityFlags) -> EntityFlags {
        EntityFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Shorthand for the hidden bit
    pub fn is_hidden(&self) -> bool {
        self.contains(EntityFlags::HIDDEN)
    }
}
