//! 32-bit stamp hashes with XOR-combinable contributions.
//!
//! A leaf's hash covers its serialized value and its write time, so both
//! content and freshness divergence are detectable. A parent's hash is the
//! XOR of per-child contributions together with a component for its own
//! last-write time; XOR is order-independent and invertible per child, so
//! a single leaf change updates every ancestor in O(depth).

use crate::types::Datum;

/// A 32-bit unsigned stamp hash, as carried on the mergeable wire.
pub type StampHash = u32;

/// Hash of a leaf value (or tombstone) together with its write time.
pub(crate) fn leaf_hash(value: Option<&Datum>, time: &str) -> StampHash {
    let json = match value {
        Some(datum) => serde_json::to_string(datum).unwrap_or_default(),
        None => "null".to_owned(),
    };
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(json.as_bytes());
    hasher.update(b":");
    hasher.update(time.as_bytes());
    hasher.finalize()
}

/// Contribution of one child to its parent's hash: a pure function of the
/// child id and the child hash, so it can be XORed out and back in.
pub(crate) fn child_contribution(id: &str, child_hash: StampHash) -> StampHash {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(&child_hash.to_le_bytes());
    hasher.finalize()
}

/// Component a node's own last-write time contributes to its hash.
///
/// CRC-32 of empty input is zero, so a fresh node with the unset time and
/// no children carries hash zero without special-casing.
pub(crate) fn time_component(time: &str) -> StampHash {
    crc32fast::hash(time.as_bytes())
}
