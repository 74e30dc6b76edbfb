//! Spatial partitioning data structures
//!
//! A loose multi-level voxel hash for broad-phase queries. Objects are
//! filed at the finest level whose cells are larger than their bounds and
//! linked into every cell their bounds touch at that level. Queries walk each
//! level in turn and report every object once.
//!
//! [`PartitionIndex`] is the entry point. The lower layers ([`VoxelTree`],
//! [`VoxelHash`], [`VoxelIndexer`]) are public for tooling and tests.

pub mod handle;
pub mod intersect;
pub mod list_mask;
pub mod lock;
pub mod partition;
pub mod visits;
pub mod voxel;
pub mod voxel_hash;
pub mod voxel_tree;

#[cfg(test)]
mod tests;

pub use handle::PartitionHandle;
pub use intersect::{Intersect, IntersectBox, IntersectPoint, IntersectSegment, IntersectSweptBox};
pub use list_mask::{EntityFlags, ListMask, PartitionLists, PartitionTree, SharedFlags};
pub use lock::{SuspendedReads, TreeLock};
pub use partition::{PartitionIndex, PartitionStats, QueryCallback, MAX_QUERY_CALLBACKS};
pub use voxel::{VoxelCoord, VoxelIndexer, LEVEL_COUNT};
pub use voxel_hash::VoxelHash;
pub use voxel_tree::{IterationControl, TreeMember, TreeStats, VoxelTree};

/// Report a broken internal invariant.
///
/// Logged in every build; debug builds also panic so tests catch it.
#[track_caller]
pub(crate) fn invariant_violated(message: std::fmt::Arguments<'_>) {
    log::error!("{message}");
    if cfg!(debug_assertions) {
        panic!("{message}");
    }
}
