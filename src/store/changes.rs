//! Per-transaction change buffers.
//!
//! These buffers exist only between transaction start and commit, are
//! authoritative only during that window, and are cleared atomically at
//! commit.

use crate::types::{
    CellChanges, ContentChanges, Datum, Id, RowChanges, TableChanges, ValueChanges,
};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Old/new pair for one cell or value. `None` means absent.
///
/// The `old` side is captured on the first write of the transaction and
/// never overwritten, so a leaf written several times still reports the
/// pre-transaction value.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ChangedLeaf {
    pub old: Option<Datum>,
    pub new: Option<Datum>,
}

impl ChangedLeaf {
    /// A leaf that ended up back at its starting value produces no events.
    pub fn is_effective(&self) -> bool {
        self.old != self.new
    }
}

#[derive(Debug, Default)]
pub(crate) struct TransactionLog {
    pub changed_cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, ChangedLeaf>>>,
    pub changed_values: BTreeMap<Id, ChangedLeaf>,
    /// Rejected raw inputs, keyed by table/row/cell id.
    pub invalid_cells: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, Vec<serde_json::Value>>>>,
    pub invalid_values: BTreeMap<Id, Vec<serde_json::Value>>,
    /// Ids that appeared (+1) or vanished (-1) this transaction. Entries
    /// whose deltas cancel out are dropped.
    pub changed_table_ids: BTreeMap<Id, i8>,
    pub changed_row_ids: BTreeMap<Id, BTreeMap<Id, i8>>,
    pub changed_cell_ids: BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, i8>>>,
    pub changed_value_ids: BTreeMap<Id, i8>,
}

fn bump(map: &mut BTreeMap<Id, i8>, id: &str, delta: i8) {
    match map.entry(id.to_owned()) {
        Entry::Vacant(slot) => {
            slot.insert(delta);
        }
        Entry::Occupied(mut slot) => {
            let net = *slot.get() + delta;
            if net == 0 {
                slot.remove();
            } else {
                *slot.get_mut() = net;
            }
        }
    }
}

impl TransactionLog {
    pub fn record_cell(&mut self, t: &str, r: &str, c: &str, old: Option<Datum>, new: Option<Datum>) {
        let slot = self
            .changed_cells
            .entry(t.to_owned())
            .or_default()
            .entry(r.to_owned())
            .or_default()
            .entry(c.to_owned());
        match slot {
            Entry::Vacant(v) => {
                v.insert(ChangedLeaf { old, new });
            }
            Entry::Occupied(mut o) => {
                o.get_mut().new = new;
            }
        }
    }

    pub fn record_value(&mut self, v: &str, old: Option<Datum>, new: Option<Datum>) {
        match self.changed_values.entry(v.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(ChangedLeaf { old, new });
            }
            Entry::Occupied(mut slot) => {
                slot.get_mut().new = new;
            }
        }
    }

    pub fn record_invalid_cell(&mut self, t: &str, r: &str, c: &str, raw: serde_json::Value) {
        self.invalid_cells
            .entry(t.to_owned())
            .or_default()
            .entry(r.to_owned())
            .or_default()
            .entry(c.to_owned())
            .or_default()
            .push(raw);
    }

    pub fn record_invalid_value(&mut self, v: &str, raw: serde_json::Value) {
        self.invalid_values.entry(v.to_owned()).or_default().push(raw);
    }

    pub fn bump_table_id(&mut self, t: &str, delta: i8) {
        bump(&mut self.changed_table_ids, t, delta);
    }

    pub fn bump_row_id(&mut self, t: &str, r: &str, delta: i8) {
        bump(self.changed_row_ids.entry(t.to_owned()).or_default(), r, delta);
        if self.changed_row_ids.get(t).is_some_and(|m| m.is_empty()) {
            self.changed_row_ids.remove(t);
        }
    }

    pub fn bump_cell_id(&mut self, t: &str, r: &str, c: &str, delta: i8) {
        let rows = self.changed_cell_ids.entry(t.to_owned()).or_default();
        bump(rows.entry(r.to_owned()).or_default(), c, delta);
        if rows.get(r).is_some_and(|m| m.is_empty()) {
            rows.remove(r);
        }
        if rows.is_empty() {
            self.changed_cell_ids.remove(t);
        }
    }

    pub fn bump_value_id(&mut self, v: &str, delta: i8) {
        bump(&mut self.changed_value_ids, v, delta);
    }

    /// Whether any effective cell change was buffered.
    pub fn any_effective_cell(&self) -> bool {
        self.changed_cells
            .values()
            .flat_map(|rows| rows.values())
            .flat_map(|cells| cells.values())
            .any(ChangedLeaf::is_effective)
    }

    /// Whether any effective value change was buffered.
    pub fn any_effective_value(&self) -> bool {
        self.changed_values.values().any(ChangedLeaf::is_effective)
    }

    /// Assemble the content-shaped delta of this transaction.
    pub fn to_content_changes(&self) -> ContentChanges {
        let mut tables = TableChanges::new();
        for (t, rows) in &self.changed_cells {
            if self.changed_table_ids.get(t) == Some(&-1) {
                tables.insert(t.clone(), None);
                continue;
            }
            let mut row_changes = RowChanges::new();
            for (r, cells) in rows {
                if self.changed_row_ids.get(t).and_then(|m| m.get(r)) == Some(&-1) {
                    row_changes.insert(r.clone(), None);
                    continue;
                }
                let mut cell_changes = CellChanges::new();
                for (c, leaf) in cells {
                    if leaf.is_effective() {
                        cell_changes.insert(c.clone(), leaf.new.clone());
                    }
                }
                if !cell_changes.is_empty() {
                    row_changes.insert(r.clone(), Some(cell_changes));
                }
            }
            if !row_changes.is_empty() {
                tables.insert(t.clone(), Some(row_changes));
            }
        }

        let mut values = ValueChanges::new();
        for (v, leaf) in &self.changed_values {
            if leaf.is_effective() {
                values.insert(v.clone(), leaf.new.clone());
            }
        }
        ContentChanges(tables, values)
    }

    pub fn clear(&mut self) {
        self.changed_cells.clear();
        self.changed_values.clear();
        self.invalid_cells.clear();
        self.invalid_values.clear();
        self.changed_table_ids.clear();
        self.changed_row_ids.clear();
        self.changed_cell_ids.clear();
        self.changed_value_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_old_value_is_kept() {
        let mut log = TransactionLog::default();
        log.record_cell("t", "r", "c", None, Some(1.into()));
        log.record_cell("t", "r", "c", Some(1.into()), Some(2.into()));
        let leaf = &log.changed_cells["t"]["r"]["c"];
        assert_eq!(leaf.old, None);
        assert_eq!(leaf.new, Some(2.into()));
    }

    #[test]
    fn test_reverted_leaf_is_not_effective() {
        let mut log = TransactionLog::default();
        log.record_cell("t", "r", "c", Some(1.into()), Some(2.into()));
        log.record_cell("t", "r", "c", Some(2.into()), Some(1.into()));
        assert!(!log.changed_cells["t"]["r"]["c"].is_effective());
        assert!(!log.any_effective_cell());
    }

    #[test]
    fn test_id_deltas_cancel() {
        let mut log = TransactionLog::default();
        log.bump_table_id("t", 1);
        log.bump_table_id("t", -1);
        assert!(log.changed_table_ids.is_empty());

        log.bump_row_id("t", "r", 1);
        log.bump_row_id("t", "r", -1);
        assert!(log.changed_row_ids.is_empty());
    }

    #[test]
    fn test_content_changes_shape() {
        let mut log = TransactionLog::default();
        log.record_cell("pets", "fido", "species", None, Some("dog".into()));
        log.bump_table_id("pets", 1);
        log.bump_row_id("pets", "fido", 1);
        log.bump_cell_id("pets", "fido", "species", 1);
        log.record_value("open", Some(true.into()), None);
        log.bump_value_id("open", -1);

        let changes = log.to_content_changes();
        let json = serde_json::to_string(&changes).unwrap();
        assert_eq!(json, r#"[{"pets":{"fido":{"species":"dog"}}},{"open":null}]"#);
    }

    #[test]
    fn test_deleted_table_collapses_to_null() {
        let mut log = TransactionLog::default();
        log.record_cell("pets", "fido", "species", Some("dog".into()), None);
        log.bump_cell_id("pets", "fido", "species", -1);
        log.bump_row_id("pets", "fido", -1);
        log.bump_table_id("pets", -1);

        let changes = log.to_content_changes();
        assert_eq!(changes.0.get("pets"), Some(&None));
    }
}
