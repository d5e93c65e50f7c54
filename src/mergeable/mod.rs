//! The mergeable extension: a store whose every accepted mutation is
//! stamped with a hybrid logical clock and folded into a hierarchical
//! content-hash summary, enabling hash-diff reconciliation and
//! last-writer-wins merging across peers.
//!
//! The wrapper hooks the store's internal commit lifecycle; it never
//! alters store semantics. Local commits are stamped with one fresh HLC
//! per transaction; content absorbed from a peer keeps its incoming
//! timestamps verbatim (a re-entrancy guard suppresses local stamping
//! while foreign content is applied).

mod hash;
mod hlc;
mod stamps;

pub use hash::StampHash;
pub use hlc::Time;
pub use stamps::{
    ContentHashes, LeafStamp, MergeableChanges, MergeableContent, RowStamp, Stamp, TableStamp,
    TablesStamp, ValuesStamp,
};

use crate::store::changes::TransactionLog;
use crate::store::Store;
use crate::types::{Datum, Id};
use hlc::Hlc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use stamps::{content_of, set_cell_stamp, set_value_stamp};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Table id to table hash, one level of the coarse-to-fine diff protocol.
pub type TableHashes = BTreeMap<Id, StampHash>;
/// Row hashes for the tables that disagreed.
pub type RowHashes = BTreeMap<Id, BTreeMap<Id, StampHash>>;
/// Cell hashes for the rows that disagreed.
pub type CellHashes = BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, StampHash>>>;
/// Value id to value hash.
pub type ValueHashes = BTreeMap<Id, StampHash>;

struct MergeableState {
    store_id: Id,
    clock: Hlc,
    stamps: MergeableContent,
    /// Stamps of exactly the leaves touched by the most recent
    /// transaction; rebuilt per transaction.
    txn_changes: MergeableChanges,
    /// Non-zero while foreign content is being applied.
    applying: u32,
}

/// A [`Store`] wrapped with clock-stamping, hash summaries, and merge
/// semantics. Dereferences to the store, so the whole tabular surface is
/// available; every mutation, however made, is observed through the
/// commit hooks.
pub struct MergeableStore {
    store: Store,
    state: Arc<Mutex<MergeableState>>,
}

impl MergeableStore {
    /// Create an empty mergeable store with a generated unique id.
    pub fn new() -> Self {
        let id = unique_id();
        let clock = Hlc::new(&id);
        Self::build(id, clock)
    }

    /// Create with an explicit store id (the id feeds the HLC client
    /// suffix, so two peers must not share one).
    pub fn with_id(store_id: impl Into<Id>) -> Self {
        let id = store_id.into();
        let clock = Hlc::new(&id);
        Self::build(id, clock)
    }

    /// Create with an injected millisecond source, for deterministic
    /// clocks in tests.
    pub fn with_now(store_id: impl Into<Id>, now: Box<dyn FnMut() -> u64>) -> Self {
        let id = store_id.into();
        let clock = Hlc::with_now(&id, now);
        Self::build(id, clock)
    }

    fn build(store_id: Id, clock: Hlc) -> Self {
        let state = Arc::new(Mutex::new(MergeableState {
            store_id,
            clock,
            stamps: MergeableContent::default(),
            txn_changes: MergeableChanges::default(),
            applying: 0,
        }));
        let mut store = Store::new();
        let on_start = {
            let state = Arc::clone(&state);
            Box::new(move || {
                state.lock().txn_changes = MergeableChanges::default();
            }) as Box<dyn FnMut()>
        };
        let on_finish = {
            let state = Arc::clone(&state);
            Box::new(move |log: &TransactionLog| {
                stamp_transaction(&mut *state.lock(), log);
            }) as Box<dyn FnMut(&TransactionLog)>
        };
        store.set_internal_hooks(on_start, on_finish);
        Self { store, state }
    }

    pub fn get_id(&self) -> Id {
        self.state.lock().store_id.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    // --- Mergeable content ---

    /// The full stamp tree: `[tablesStamp, valuesStamp]`.
    pub fn get_mergeable_content(&self) -> MergeableContent {
        self.state.lock().stamps.clone()
    }

    /// Adopt a full snapshot. The incoming stamps are authoritative:
    /// content replaces local state unconditionally per subtree, times and
    /// hashes are preserved verbatim, and the data plane is rewritten
    /// through a guarded transaction so listeners still observe the
    /// change.
    pub fn set_mergeable_content(&mut self, content: MergeableContent) -> &mut Self {
        let desired = content_of(&content);
        {
            let mut state = self.state.lock();
            fold_times(&content, &mut state.clock);
            state.stamps = content;
        }
        self.guarded(|store| {
            store.set_content(desired);
        });
        self
    }

    /// Apply a delta with per-leaf last-writer-wins: an incoming leaf
    /// replaces the stored one only if its timestamp is strictly greater;
    /// ties keep the existing value. Idempotent and commutative.
    pub fn apply_mergeable_changes(&mut self, changes: &MergeableChanges) -> &mut Self {
        let mut cell_writes: Vec<(Id, Id, Id, Option<Datum>)> = Vec::new();
        let mut value_writes: Vec<(Id, Option<Datum>)> = Vec::new();
        {
            let mut state = self.state.lock();
            for (t, table) in &changes.0 .0 {
                for (r, row) in &table.0 {
                    for (c, leaf) in &row.0 {
                        state.clock.seen(&leaf.1);
                        let existing = state
                            .stamps
                            .0
                             .0
                            .get(t)
                            .and_then(|table| table.0.get(r))
                            .and_then(|row| row.0.get(c))
                            .map(|l| l.1.clone());
                        let wins = match &existing {
                            Some(time) => leaf.1 > *time,
                            None => !leaf.1.is_empty(),
                        };
                        if wins {
                            set_cell_stamp(&mut state.stamps.0, t, r, c, leaf.0.clone(), &leaf.1);
                            cell_writes.push((t.clone(), r.clone(), c.clone(), leaf.0.clone()));
                        }
                    }
                }
            }
            for (v, leaf) in &changes.1 .0 {
                state.clock.seen(&leaf.1);
                let existing = state.stamps.1 .0.get(v).map(|l| l.1.clone());
                let wins = match &existing {
                    Some(time) => leaf.1 > *time,
                    None => !leaf.1.is_empty(),
                };
                if wins {
                    set_value_stamp(&mut state.stamps.1, v, leaf.0.clone(), &leaf.1);
                    value_writes.push((v.clone(), leaf.0.clone()));
                }
            }
        }
        if !cell_writes.is_empty() || !value_writes.is_empty() {
            trace!(
                cells = cell_writes.len(),
                values = value_writes.len(),
                "applying merged changes"
            );
            self.guarded(move |store| {
                for (t, r, c, datum) in &cell_writes {
                    match datum {
                        Some(d) => {
                            store.set_cell(t, r, c, d.clone());
                        }
                        None => {
                            store.del_cell(t, r, c);
                        }
                    }
                }
                for (v, datum) in &value_writes {
                    match datum {
                        Some(d) => {
                            store.set_value(v, d.clone());
                        }
                        None => {
                            store.del_value(v);
                        }
                    }
                }
            });
        }
        self
    }

    /// Exchange full mergeable content with another store, both ways.
    /// Disjoint edits union; conflicting ones resolve last-writer-wins.
    pub fn merge(&mut self, other: &mut MergeableStore) -> &mut Self {
        let ours = self.get_mergeable_content();
        let theirs = other.get_mergeable_content();
        self.apply_mergeable_changes(&theirs);
        other.apply_mergeable_changes(&ours);
        self
    }

    /// The stamps of exactly the leaves touched by the most recent
    /// transaction. Rebuilt per transaction and readable until the next
    /// one begins: the synchronizer handoff window.
    pub fn get_transaction_mergeable_changes(&self) -> MergeableChanges {
        self.state.lock().txn_changes.clone()
    }

    // --- Hash-diff reconciliation, coarse to fine ---
    //
    // A peer first compares `get_mergeable_content_hashes`; on divergence
    // it exchanges table hashes, then row hashes for the differing
    // tables, then cell hashes for the differing rows. Each `*_diff` call
    // runs on the responder with the requester's hashes and returns the
    // content the requester is missing plus the ids to descend into, so
    // bytes exchanged stay proportional to the disagreeing leaves.

    pub fn get_mergeable_content_hashes(&self) -> ContentHashes {
        let state = self.state.lock();
        ContentHashes(state.stamps.0 .2, state.stamps.1 .2)
    }

    pub fn get_mergeable_table_hashes(&self) -> TableHashes {
        self.state
            .lock()
            .stamps
            .0
             .0
            .iter()
            .map(|(t, stamp)| (t.clone(), stamp.2))
            .collect()
    }

    /// Full stamps for tables the requester lacks entirely, plus our hash
    /// for every table present on both sides with a different hash.
    pub fn get_mergeable_table_diff(&self, other: &TableHashes) -> (MergeableChanges, TableHashes) {
        let state = self.state.lock();
        let mut missing = MergeableChanges::default();
        let mut differing = TableHashes::new();
        for (t, table) in &state.stamps.0 .0 {
            match other.get(t) {
                None => {
                    missing.0 .0.insert(t.clone(), table.clone());
                }
                Some(hash) if *hash != table.2 => {
                    differing.insert(t.clone(), table.2);
                }
                Some(_) => {}
            }
        }
        (missing, differing)
    }

    /// Our row hashes for the requested tables.
    pub fn get_mergeable_row_hashes(&self, differing_tables: &TableHashes) -> RowHashes {
        let state = self.state.lock();
        differing_tables
            .keys()
            .filter_map(|t| {
                state.stamps.0 .0.get(t).map(|table| {
                    (
                        t.clone(),
                        table.0.iter().map(|(r, stamp)| (r.clone(), stamp.2)).collect(),
                    )
                })
            })
            .collect()
    }

    /// Full stamps for rows the requester lacks, plus our hash for rows
    /// that differ.
    pub fn get_mergeable_row_diff(&self, other: &RowHashes) -> (MergeableChanges, RowHashes) {
        let state = self.state.lock();
        let mut missing = MergeableChanges::default();
        let mut differing = RowHashes::new();
        for (t, other_rows) in other {
            let Some(table) = state.stamps.0 .0.get(t) else {
                continue;
            };
            for (r, row) in &table.0 {
                match other_rows.get(r) {
                    None => {
                        missing
                            .0
                             .0
                            .entry(t.clone())
                            .or_default()
                            .0
                            .insert(r.clone(), row.clone());
                    }
                    Some(hash) if *hash != row.2 => {
                        differing.entry(t.clone()).or_default().insert(r.clone(), row.2);
                    }
                    Some(_) => {}
                }
            }
        }
        (missing, differing)
    }

    /// Our cell hashes for the requested rows.
    pub fn get_mergeable_cell_hashes(&self, differing_rows: &RowHashes) -> CellHashes {
        let state = self.state.lock();
        let mut out = CellHashes::new();
        for (t, rows) in differing_rows {
            let Some(table) = state.stamps.0 .0.get(t) else {
                continue;
            };
            for r in rows.keys() {
                if let Some(row) = table.0.get(r) {
                    out.entry(t.clone()).or_default().insert(
                        r.clone(),
                        row.0.iter().map(|(c, leaf)| (c.clone(), leaf.2)).collect(),
                    );
                }
            }
        }
        out
    }

    /// The leaf stamps the requester is missing or holds differently.
    pub fn get_mergeable_cell_diff(&self, other: &CellHashes) -> MergeableChanges {
        let state = self.state.lock();
        let mut missing = MergeableChanges::default();
        for (t, other_rows) in other {
            let Some(table) = state.stamps.0 .0.get(t) else {
                continue;
            };
            for (r, other_cells) in other_rows {
                let Some(row) = table.0.get(r) else {
                    continue;
                };
                for (c, leaf) in &row.0 {
                    if other_cells.get(c) != Some(&leaf.2) {
                        missing
                            .0
                             .0
                            .entry(t.clone())
                            .or_default()
                            .0
                            .entry(r.clone())
                            .or_default()
                            .0
                            .insert(c.clone(), leaf.clone());
                    }
                }
            }
        }
        missing
    }

    pub fn get_mergeable_value_hashes(&self) -> ValueHashes {
        self.state
            .lock()
            .stamps
            .1
             .0
            .iter()
            .map(|(v, leaf)| (v.clone(), leaf.2))
            .collect()
    }

    /// The value stamps the requester is missing or holds differently.
    pub fn get_mergeable_value_diff(&self, other: &ValueHashes) -> MergeableChanges {
        let state = self.state.lock();
        let mut missing = MergeableChanges::default();
        for (v, leaf) in &state.stamps.1 .0 {
            if other.get(v) != Some(&leaf.2) {
                missing.1 .0.insert(v.clone(), leaf.clone());
            }
        }
        missing
    }

    /// Run a data-plane rewrite with local stamping suppressed.
    fn guarded(&mut self, f: impl FnOnce(&mut Store)) {
        self.state.lock().applying += 1;
        self.store.transaction(f);
        self.state.lock().applying -= 1;
    }
}

impl Deref for MergeableStore {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl DerefMut for MergeableStore {
    fn deref_mut(&mut self) -> &mut Store {
        &mut self.store
    }
}

impl Default for MergeableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Stamp every leaf a committing transaction touched, and its ancestors,
/// with one fresh HLC. Suppressed while foreign content is applied.
fn stamp_transaction(state: &mut MergeableState, log: &TransactionLog) {
    if state.applying > 0 {
        return;
    }
    let mut touched_cells: Vec<(Id, Id, Id, Option<Datum>)> = Vec::new();
    for (t, rows) in &log.changed_cells {
        for (r, cells) in rows {
            for (c, leaf) in cells {
                if leaf.is_effective() {
                    touched_cells.push((t.clone(), r.clone(), c.clone(), leaf.new.clone()));
                }
            }
        }
    }
    let mut touched_values: Vec<(Id, Option<Datum>)> = Vec::new();
    for (v, leaf) in &log.changed_values {
        if leaf.is_effective() {
            touched_values.push((v.clone(), leaf.new.clone()));
        }
    }
    if touched_cells.is_empty() && touched_values.is_empty() {
        return;
    }

    let time = state.clock.next();
    trace!(
        leaves = touched_cells.len() + touched_values.len(),
        %time,
        "stamping transaction"
    );
    for (t, r, c, new) in touched_cells {
        set_cell_stamp(&mut state.stamps.0, &t, &r, &c, new.clone(), &time);
        set_cell_stamp(&mut state.txn_changes.0, &t, &r, &c, new, &time);
    }
    for (v, new) in touched_values {
        set_value_stamp(&mut state.stamps.1, &v, new.clone(), &time);
        set_value_stamp(&mut state.txn_changes.1, &v, new, &time);
    }
}

/// Learn every timestamp carried by a snapshot so local stamps keep
/// sorting after them.
fn fold_times(content: &MergeableContent, clock: &mut Hlc) {
    clock.seen(&content.0 .1);
    for table in content.0 .0.values() {
        clock.seen(&table.1);
        for row in table.0.values() {
            clock.seen(&row.1);
            for leaf in row.0.values() {
                clock.seen(&leaf.1);
            }
        }
    }
    clock.seen(&content.1 .1);
    for leaf in content.1 .0.values() {
        clock.seen(&leaf.1);
    }
}

/// A practically-unique store id: a hash over the wall clock, the process
/// id, and a per-process counter.
fn unique_id() -> Id {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = Sha256::digest(format!("{}:{}:{}", nanos, std::process::id(), count).as_bytes());
    hex::encode(&digest[..8])
}
