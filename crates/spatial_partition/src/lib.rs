//! # Spatial Partition
//!
//! A multi-level voxel-hash spatial partition for broad-phase collision,
//! visibility and trigger queries.
//!
//! ## Features
//!
//! - **Loose Voxel Levels**: Four nested grids, each object filed at one level
//! - **List Masks**: Objects and queries filtered by a 16-bit list mask
//! - **Two Universes**: Separate trees for simulation and presentation objects
//! - **Reentrant Queries**: Visitors may query, move or destroy objects
//! - **Thread Safe**: Concurrent readers with writer escalation
//!
//! ## Quick Start
//!
//! ```rust
//! use spatial_partition::prelude::*;
//!
//! let index = PartitionIndex::new(PartitionConfig::default())?;
//! let crate_box = index.create_handle_with(
//!     7_u32,
//!     PartitionLists::STATIC,
//!     Vec3::new(-10.0, -10.0, -10.0),
//!     Vec3::new(10.0, 10.0, 10.0),
//! );
//!
//! let mut found = Vec::new();
//! index.enumerate_in_box(PartitionLists::STATIC, Vec3::repeat(-1.0), Vec3::repeat(1.0), |owner| {
//!     found.push(owner);
//!     IterationControl::Continue
//! });
//! assert_eq!(found, vec![7]);
//!
//! index.destroy_handle(crate_box);
//! assert!(index.is_empty());
//! # Ok::<(), spatial_partition::PartitionError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core configuration
pub mod core;
pub mod config;

pub mod foundation;
pub mod spatial;

mod error;

pub use error::PartitionError;
pub use spatial::{IterationControl, PartitionHandle, PartitionIndex};

/// Common imports for partition users
pub mod prelude {
    pub use crate::{
        core::config::{Config, PartitionConfig},
        foundation::math::{Aabb, BoundingSphere, Ray, Vec3},
        spatial::{
            IterationControl, ListMask, PartitionHandle, PartitionIndex, PartitionLists, PartitionTree,
            QueryCallback,
        },
        PartitionError,
    };
}
