//! Deterministic concatenation order for a staging set.
//!
//! The header shard carries the CSV column row and must come first; body
//! shards follow in lexicographic key order, which matches the shard
//! counters the export process assigns. Arrival order and timestamps play
//! no part, so two listings of the same set always compose identically.

use crate::models::ObjectRef;
use crate::services::naming::HEADER_TAG;

/// Orders a staging set for compose: header first, remainder by key.
pub fn order_for_compose(mut objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
    objects.sort_by(|a, b| sort_rank(&a.key).cmp(&sort_rank(&b.key)));
    objects
}

fn sort_rank(key: &str) -> (u8, &str) {
    if key.contains(HEADER_TAG) {
        (0, key)
    } else {
        (1, key)
    }
}
