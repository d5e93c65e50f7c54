//! Stamp trees: content, last-write time, and hash at every level.
//!
//! Leaves keep tombstones (a `None` value with a fresh time) so deletions
//! propagate through merges; tree nodes are never physically removed.
//! Hash maintenance is incremental: a single leaf change touches exactly
//! its ancestors, never the siblings.

use super::hash::{child_contribution, leaf_hash, time_component, StampHash};
use super::hlc::Time;
use crate::types::{Content, Datum, Id, Tables, Values};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `[content, time, hash]` at one level of the mergeable tree. The time is
/// an HLC token, empty meaning "unset"; the hash is a 32-bit unsigned
/// integer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stamp<C>(pub C, pub Time, pub StampHash);

impl<C> Stamp<C> {
    pub fn content(&self) -> &C {
        &self.0
    }

    pub fn time(&self) -> &str {
        &self.1
    }

    pub fn hash(&self) -> StampHash {
        self.2
    }
}

/// A stamped cell or value; `None` content is a tombstone.
pub type LeafStamp = Stamp<Option<Datum>>;
pub type RowStamp = Stamp<BTreeMap<Id, LeafStamp>>;
pub type TableStamp = Stamp<BTreeMap<Id, RowStamp>>;
pub type TablesStamp = Stamp<BTreeMap<Id, TableStamp>>;
pub type ValuesStamp = Stamp<BTreeMap<Id, LeafStamp>>;

/// Full mergeable wire shape: `[tablesStamp, valuesStamp]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeableContent(pub TablesStamp, pub ValuesStamp);

/// A delta has the same shape as the full content, holding only the
/// stamps of the leaves it carries.
pub type MergeableChanges = MergeableContent;

/// The two top-level hashes, compared first during reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes(pub StampHash, pub StampHash);

/// Swap one child's contribution in a parent's hash and refresh the
/// parent's own last-write time if the child's is newer.
fn update_parent<C>(
    parent: &mut Stamp<BTreeMap<Id, Stamp<C>>>,
    id: &str,
    old_child: Option<StampHash>,
    new_child: StampHash,
    time: &str,
) {
    let mut hash = parent.2;
    if let Some(old) = old_child {
        hash ^= child_contribution(id, old);
    }
    hash ^= child_contribution(id, new_child);
    if time > parent.1.as_str() {
        hash ^= time_component(&parent.1) ^ time_component(time);
        parent.1 = time.to_owned();
    }
    parent.2 = hash;
}

/// Write one leaf stamp under `parent`, maintaining the parent's hash.
fn set_leaf(parent: &mut Stamp<BTreeMap<Id, LeafStamp>>, id: &str, value: Option<Datum>, time: &str) {
    let old = parent.0.get(id).map(|leaf| leaf.2);
    let hash = leaf_hash(value.as_ref(), time);
    parent
        .0
        .insert(id.to_owned(), Stamp(value, time.to_owned(), hash));
    update_parent(parent, id, old, hash, time);
}

/// Stamp one cell, updating its row, table, and the tables root in
/// O(depth).
pub(crate) fn set_cell_stamp(
    tables: &mut TablesStamp,
    t: &str,
    r: &str,
    c: &str,
    value: Option<Datum>,
    time: &str,
) {
    let old_table = tables.0.get(t).map(|stamp| stamp.2);
    let table = tables.0.entry(t.to_owned()).or_default();
    let old_row = table.0.get(r).map(|stamp| stamp.2);
    let row = table.0.entry(r.to_owned()).or_default();
    set_leaf(row, c, value, time);
    let row_hash = row.2;
    update_parent(table, r, old_row, row_hash, time);
    let table_hash = table.2;
    update_parent(tables, t, old_table, table_hash, time);
}

/// Stamp one value, updating the values root.
pub(crate) fn set_value_stamp(values: &mut ValuesStamp, v: &str, value: Option<Datum>, time: &str) {
    set_leaf(values, v, value, time);
}

/// The data-plane content a stamp tree describes: every non-tombstoned
/// leaf.
pub(crate) fn content_of(stamps: &MergeableContent) -> Content {
    let mut tables = Tables::new();
    for (t, table) in &stamps.0 .0 {
        for (r, row) in &table.0 {
            for (c, leaf) in &row.0 {
                if let Some(datum) = &leaf.0 {
                    tables
                        .entry(t.clone())
                        .or_default()
                        .entry(r.clone())
                        .or_default()
                        .insert(c.clone(), datum.clone());
                }
            }
        }
    }
    let mut values = Values::new();
    for (v, leaf) in &stamps.1 .0 {
        if let Some(datum) = &leaf.0 {
            values.insert(v.clone(), datum.clone());
        }
    }
    Content(tables, values)
}

/// A node's hash recomputed from scratch; the incremental path must always
/// agree with this.
#[cfg(test)]
pub(crate) fn computed_node_hash<C>(node: &Stamp<BTreeMap<Id, Stamp<C>>>) -> StampHash {
    let mut hash = time_component(&node.1);
    for (id, child) in &node.0 {
        hash ^= child_contribution(id, child.2);
    }
    hash
}
