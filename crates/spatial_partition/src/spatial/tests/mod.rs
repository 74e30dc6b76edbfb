//! Integration tests for the partition index
//!
//! Exercise the public index end to end: a concrete world scenario, random
//! cross-checks against a brute-force scan, visitors that call back into the
//! index, and readers racing a writer.

mod reentrancy;

use crate::core::config::PartitionConfig;
use crate::foundation::math::{Aabb, Vec3};
use crate::spatial::{IterationControl, ListMask, PartitionHandle, PartitionIndex};

/// Default-world index keyed by object number
fn new_index() -> PartitionIndex<u32> {
    PartitionIndex::new(PartitionConfig::default()).unwrap()
}

/// Box query collected and sorted
fn query_box(index: &PartitionIndex<u32>, mask: ListMask, query: &Aabb) -> Vec<u32> {
    let mut found = Vec::new();
    index.enumerate_in_box(mask, query.min, query.max, |owner| {
        found.push(owner);
        IterationControl::Continue
    });
    found.sort_unstable();
    found
}

/// True when no owner was reported twice
fn all_unique(sorted: &[u32]) -> bool {
    sorted.windows(2).all(|pair| pair[0] != pair[1])
}

/// Random box with the given center range and half size range
fn random_box(rng: &mut fastrand::Rng, spread: f32, min_half: f32, max_half: f32) -> Aabb {
    let center = Vec3::new(
        (rng.f32() * 2.0 - 1.0) * spread,
        (rng.f32() * 2.0 - 1.0) * spread,
        (rng.f32() * 2.0 - 1.0) * spread,
    );
    let half = Vec3::new(
        min_half + rng.f32() * (max_half - min_half),
        min_half + rng.f32() * (max_half - min_half),
        min_half + rng.f32() * (max_half - min_half),
    );
    Aabb::from_center_extents(center, half)
}

/// Populate `index` with `count` objects and return their handles by owner
fn populate(index: &PartitionIndex<u32>, rng: &mut fastrand::Rng, count: u32, masks: &[ListMask]) -> Vec<PartitionHandle> {
    (0..count)
        .map(|owner| {
            // Mostly small objects, with a tail of large ones for the coarse levels.
            let bounds = match rng.u32(0..10) {
                0 => random_box(rng, 16000.0, 1000.0, 9000.0),
                1 | 2 => random_box(rng, 16000.0, 100.0, 1000.0),
                _ => random_box(rng, 16000.0, 2.0, 100.0),
            };
            let mask = masks[rng.usize(0..masks.len())];
            index.create_handle_with(owner, mask, bounds.min, bounds.max)
        })
        .collect()
}
