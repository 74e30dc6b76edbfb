//! Visitors that call back into the index they are visiting

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::spatial::{PartitionLists, PartitionTree, QueryCallback};

const LISTS: ListMask = PartitionLists::DYNAMIC;
const COUNT: u32 = 40;

/// A row of small objects along +x, spanning several level 0 cells
fn row(index: &PartitionIndex<u32>) -> Vec<PartitionHandle> {
    (0..COUNT)
        .map(|owner| {
            let min = Vec3::new(owner as f32 * 300.0, 0.0, 0.0);
            index.create_handle_with(owner, LISTS, min, min + Vec3::repeat(10.0))
        })
        .collect()
}

fn row_region() -> Aabb {
    Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(COUNT as f32 * 300.0, 11.0, 11.0))
}

#[test]
fn test_visitor_moves_visited_object() {
    let index = new_index();
    let handles = row(&index);

    let mut visited = Vec::new();
    let region = row_region();
    index.enumerate_in_box(LISTS, region.min, region.max, |owner| {
        visited.push(owner);
        let min = Vec3::new(owner as f32 * 300.0, 8000.0, 0.0);
        index.element_moved(handles[owner as usize], min, min + Vec3::repeat(10.0));
        IterationControl::Continue
    });

    visited.sort_unstable();
    assert_eq!(visited, (0..COUNT).collect::<Vec<_>>());
    assert!(query_box(&index, LISTS, &region).is_empty());

    let moved = Aabb::new(Vec3::new(-1.0, 7999.0, -1.0), Vec3::new(COUNT as f32 * 300.0, 8011.0, 11.0));
    assert_eq!(query_box(&index, LISTS, &moved).len(), COUNT as usize);
}

#[test]
fn test_visitor_destroys_visited_object() {
    let index = new_index();
    let handles = row(&index);

    let region = row_region();
    let mut destroyed = 0;
    index.enumerate_in_box(LISTS, region.min, region.max, |owner| {
        index.destroy_handle(handles[owner as usize]);
        destroyed += 1;
        IterationControl::Continue
    });

    assert_eq!(destroyed, COUNT);
    assert!(index.is_empty());
    let stats = index.tree(PartitionTree::CategoryA).stats();
    assert_eq!(stats.objects, 0);
    assert_eq!(stats.leaves, 0);
}

#[test]
fn test_visitor_spawns_objects() {
    let index = new_index();
    row(&index);

    let region = row_region();
    let mut spawned = 0;
    index.enumerate_in_box(LISTS, region.min, region.max, |owner| {
        if owner < COUNT {
            let min = Vec3::new(owner as f32 * 300.0 + 100.0, 0.0, 0.0);
            index.create_handle_with(1000 + owner, LISTS, min, min + Vec3::repeat(10.0));
            spawned += 1;
        }
        IterationControl::Continue
    });

    assert_eq!(spawned, COUNT);
    assert_eq!(index.len(), 2 * COUNT as usize);
    assert_eq!(query_box(&index, LISTS, &region).len(), 2 * COUNT as usize);
}

#[test]
fn test_nested_queries_see_consistent_tree() {
    let index = new_index();
    let handles = row(&index);

    let region = row_region();
    let mut outer = 0;
    index.enumerate_in_box(LISTS, region.min, region.max, |owner| {
        outer += 1;
        let bounds = index.bounds(handles[owner as usize]).unwrap();
        let mut inner = Vec::new();
        index.enumerate_in_box(LISTS, bounds.min, bounds.max, |nested| {
            inner.push(nested);
            IterationControl::Continue
        });
        assert_eq!(inner, vec![owner]);
        IterationControl::Continue
    });
    assert_eq!(outer, COUNT);
}

#[test]
fn test_stop_ends_query_early() {
    let index = new_index();
    row(&index);

    let region = row_region();
    let mut seen = 0;
    let result = index.enumerate_in_box(LISTS, region.min, region.max, |_| {
        seen += 1;
        if seen == 3 { IterationControl::Stop } else { IterationControl::Continue }
    });
    assert_eq!(result, IterationControl::Stop);
    assert_eq!(seen, 3);
}

#[derive(Default)]
struct CountingCallback {
    pre: AtomicUsize,
    post: AtomicUsize,
}

impl QueryCallback for CountingCallback {
    fn on_pre_query(&self, _list_mask: ListMask) {
        self.pre.fetch_add(1, Ordering::Relaxed);
    }

    fn on_post_query(&self, _list_mask: ListMask) {
        self.post.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_callbacks_wrap_nested_queries() {
    let index = new_index();
    let handles = row(&index);
    let counter = Arc::new(CountingCallback::default());
    index.install_query_callback(counter.clone()).unwrap();

    let region = row_region();
    index.enumerate_in_box(LISTS, region.min, region.max, |owner| {
        if owner == 0 {
            let point = index.bounds(handles[0]).unwrap().center();
            index.enumerate_at_point(LISTS, point, |_| IterationControl::Continue);
        }
        IterationControl::Continue
    });

    assert_eq!(counter.pre.load(Ordering::Relaxed), 2);
    assert_eq!(counter.post.load(Ordering::Relaxed), 2);
}
