//! Transaction state machine and two-phase commit dispatch.
//!
//! `Idle → Open(depth) → Idle`, with a `Closing` interlude while the
//! immutable listener phase runs. Nested transactions only bump the depth
//! counter; the outermost call drives commit:
//!
//! 1. mutator-phase listeners (invalids, then changed categories) — these
//!    may write further, folding into the live buffers;
//! 2. the rollback predicate, which restores every buffered old value
//!    verbatim when it returns true;
//! 3. will-finish, immutable-phase listeners over the settled state,
//!    did-finish;
//! 4. buffers cleared.

use super::changes::TransactionLog;
use super::Store;
use crate::listeners::{ListenerFn, ListenerId, Topic};
use crate::types::{Datum, Id};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransactionState {
    Idle,
    Open { depth: u32 },
    /// The immutable phase of a commit; writes are silently ignored.
    Closing,
}

/// Internal commit lifecycle hooks. Non-public: only the mergeable wrapper
/// attaches these, to observe commits without altering store semantics.
#[derive(Default)]
pub(crate) struct CommitHooks {
    pub start: Option<Box<dyn FnMut()>>,
    pub finish: Option<Box<dyn FnMut(&TransactionLog)>>,
}

impl Store {
    /// Run `actions` inside a transaction. Reentrant: nested calls only
    /// increment a depth counter, and only the outermost call commits.
    pub fn transaction<T>(&mut self, actions: impl FnOnce(&mut Self) -> T) -> T {
        self.start_transaction();
        let out = actions(self);
        self.finish_transaction();
        out
    }

    /// Like [`Store::transaction`], but if `do_rollback` returns true
    /// against the committed-but-unflushed state, every buffered old value
    /// is written back and the transaction leaves no trace.
    pub fn transaction_with_rollback<T>(
        &mut self,
        actions: impl FnOnce(&mut Self) -> T,
        do_rollback: impl FnOnce(&Self) -> bool,
    ) -> T {
        self.start_transaction();
        let out = actions(self);
        self.finish_transaction_with(do_rollback);
        out
    }

    pub fn start_transaction(&mut self) -> &mut Self {
        match self.state {
            TransactionState::Idle => {
                self.state = TransactionState::Open { depth: 1 };
                if let Some(mut hook) = self.hooks.start.take() {
                    hook();
                    self.hooks.start = Some(hook);
                }
                self.dispatch0_all(Topic::StartTransaction);
            }
            TransactionState::Open { depth } => {
                self.state = TransactionState::Open { depth: depth + 1 };
            }
            TransactionState::Closing => {}
        }
        self
    }

    pub fn finish_transaction(&mut self) -> &mut Self {
        self.finish_transaction_with(|_| false)
    }

    pub fn finish_transaction_with(&mut self, do_rollback: impl FnOnce(&Self) -> bool) -> &mut Self {
        let TransactionState::Open { depth } = self.state else {
            return self;
        };
        if depth > 1 {
            self.state = TransactionState::Open { depth: depth - 1 };
            return self;
        }

        debug!(
            tables = self.log.changed_cells.len(),
            values = self.log.changed_values.len(),
            "committing transaction"
        );

        // Mutator phase, with depth held at 1 so listener writes fold into
        // the same transaction instead of starting a new commit.
        self.dispatch_changes(true);

        if do_rollback(self) {
            self.rollback();
        }

        if let Some(mut hook) = self.hooks.finish.take() {
            hook(&self.log);
            self.hooks.finish = Some(hook);
        }

        // Immutable phase over the settled state.
        self.state = TransactionState::Closing;
        self.dispatch0_all(Topic::WillFinishTransaction);
        self.dispatch_changes(false);
        self.dispatch0_all(Topic::DidFinishTransaction);

        self.log.clear();
        self.state = TransactionState::Idle;
        self
    }

    /// Whether the store is inside an open transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self.state, TransactionState::Open { .. })
    }

    pub(crate) fn can_mutate(&self) -> bool {
        !matches!(self.state, TransactionState::Closing)
    }

    /// Every public setter funnels through here: an implicit transaction
    /// around a single write, folded into any enclosing one.
    pub(super) fn with_transaction(&mut self, f: impl FnOnce(&mut Self)) {
        if !self.can_mutate() {
            return;
        }
        self.start_transaction();
        f(self);
        self.finish_transaction();
    }

    pub(crate) fn set_internal_hooks(
        &mut self,
        start: Box<dyn FnMut()>,
        finish: Box<dyn FnMut(&TransactionLog)>,
    ) {
        self.hooks.start = Some(start);
        self.hooks.finish = Some(finish);
    }

    /// Write every buffered old value back, undoing the whole transaction.
    fn rollback(&mut self) {
        debug!("rolling back transaction");
        let cells: Vec<(Id, Id, Id, Option<Datum>)> = self
            .log
            .changed_cells
            .iter()
            .flat_map(|(t, rows)| {
                rows.iter().flat_map(move |(r, cells)| {
                    cells
                        .iter()
                        .map(move |(c, leaf)| (t.clone(), r.clone(), c.clone(), leaf.old.clone()))
                })
            })
            .collect();
        for (t, r, c, old) in cells {
            match old {
                Some(datum) => self.write_cell(&t, &r, &c, datum),
                None => self.erase_cell(&t, &r, &c),
            }
        }

        let values: Vec<(Id, Option<Datum>)> = self
            .log
            .changed_values
            .iter()
            .map(|(v, leaf)| (v.clone(), leaf.old.clone()))
            .collect();
        for (v, old) in values {
            match old {
                Some(datum) => self.write_value(&v, datum),
                None => self.erase_value(&v),
            }
        }

        // Invalid reports die with the rolled-back transaction.
        self.log.invalid_cells.clear();
        self.log.invalid_values.clear();
    }

    /// One dispatch pass over the buffered change set: invalid reports
    /// first, then changed categories fine to coarse. Snapshots are taken
    /// up front so mutator-phase writes do not disturb iteration.
    fn dispatch_changes(&mut self, mutator: bool) {
        let phase = Some(mutator);

        let invalid_cells: Vec<(Id, Id, Id, Vec<serde_json::Value>)> = self
            .log
            .invalid_cells
            .iter()
            .flat_map(|(t, rows)| {
                rows.iter().flat_map(move |(r, cells)| {
                    cells
                        .iter()
                        .map(move |(c, raws)| (t.clone(), r.clone(), c.clone(), raws.clone()))
                })
            })
            .collect();
        let invalid_values: Vec<(Id, Vec<serde_json::Value>)> = self
            .log
            .invalid_values
            .iter()
            .map(|(v, raws)| (v.clone(), raws.clone()))
            .collect();
        let changed_cells: Vec<(Id, Id, Id, Option<Datum>, Option<Datum>)> = self
            .log
            .changed_cells
            .iter()
            .flat_map(|(t, rows)| {
                rows.iter().flat_map(move |(r, cells)| {
                    cells.iter().filter(|(_, leaf)| leaf.is_effective()).map(
                        move |(c, leaf)| {
                            (t.clone(), r.clone(), c.clone(), leaf.old.clone(), leaf.new.clone())
                        },
                    )
                })
            })
            .collect();
        let cell_id_paths: Vec<(Id, Id)> = self
            .log
            .changed_cell_ids
            .iter()
            .flat_map(|(t, rows)| rows.keys().map(move |r| (t.clone(), r.clone())))
            .collect();
        let row_id_tables: Vec<Id> = self.log.changed_row_ids.keys().cloned().collect();
        let table_ids_changed = !self.log.changed_table_ids.is_empty();
        let value_ids_changed = !self.log.changed_value_ids.is_empty();
        let changed_values: Vec<(Id, Option<Datum>, Option<Datum>)> = self
            .log
            .changed_values
            .iter()
            .filter(|(_, leaf)| leaf.is_effective())
            .map(|(v, leaf)| (v.clone(), leaf.old.clone(), leaf.new.clone()))
            .collect();

        // changed_cells is sorted by (table, row, cell), so row and table
        // paths dedup consecutively.
        let mut changed_rows: Vec<(Id, Id)> = changed_cells
            .iter()
            .map(|(t, r, ..)| (t.clone(), r.clone()))
            .collect();
        changed_rows.dedup();
        let mut changed_tables: Vec<Id> = changed_cells.iter().map(|(t, ..)| t.clone()).collect();
        changed_tables.dedup();

        for (t, r, c, raws) in &invalid_cells {
            for id in self
                .listeners
                .matches(Topic::InvalidCell, &[t.as_str(), r.as_str(), c.as_str()], phase)
            {
                self.invoke_invalid_cell(id, t, r, c, raws);
            }
        }
        for (v, raws) in &invalid_values {
            for id in self.listeners.matches(Topic::InvalidValue, &[v.as_str()], phase) {
                self.invoke_invalid_value(id, v, raws);
            }
        }

        for (t, r, c, old, new) in &changed_cells {
            for id in self.listeners.matches(Topic::Cell, &[t.as_str(), r.as_str(), c.as_str()], phase) {
                self.invoke_cell(id, t, r, c, new.clone(), old.clone());
            }
        }
        for (t, r) in &cell_id_paths {
            for id in self.listeners.matches(Topic::CellIds, &[t.as_str(), r.as_str()], phase) {
                self.invoke2(id, t, r);
            }
        }
        for (t, r) in &changed_rows {
            for id in self.listeners.matches(Topic::Row, &[t.as_str(), r.as_str()], phase) {
                self.invoke2(id, t, r);
            }
        }
        for t in &row_id_tables {
            for id in self.listeners.matches(Topic::RowIds, &[t.as_str()], phase) {
                self.invoke1(id, t);
            }
        }
        for t in &changed_tables {
            for id in self.listeners.matches(Topic::Table, &[t.as_str()], phase) {
                self.invoke1(id, t);
            }
        }
        if table_ids_changed {
            self.dispatch0(Topic::TableIds, phase);
        }
        if !changed_cells.is_empty() {
            self.dispatch0(Topic::Tables, phase);
        }

        for (v, old, new) in &changed_values {
            for id in self.listeners.matches(Topic::Value, &[v.as_str()], phase) {
                self.invoke_value(id, v, new.clone(), old.clone());
            }
        }
        if value_ids_changed {
            self.dispatch0(Topic::ValueIds, phase);
        }
        if !changed_values.is_empty() {
            self.dispatch0(Topic::Values, phase);
        }
    }

    fn dispatch0(&mut self, topic: Topic, phase: Option<bool>) {
        for id in self.listeners.matches(topic, &[], phase) {
            self.invoke0(id);
        }
    }

    fn dispatch0_all(&mut self, topic: Topic) {
        self.dispatch0(topic, None);
    }

    // --- Invocation ---
    //
    // Callbacks live behind shared mutexes so they can be called while the
    // store itself is passed back in mutably. A listener deregistered
    // mid-dispatch is simply skipped.

    pub(super) fn invoke0(&mut self, id: ListenerId) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        match &mut *guard {
            ListenerFn::Tables(f)
            | ListenerFn::TableIds(f)
            | ListenerFn::Values(f)
            | ListenerFn::ValueIds(f)
            | ListenerFn::StartTransaction(f)
            | ListenerFn::WillFinishTransaction(f)
            | ListenerFn::DidFinishTransaction(f) => f(self),
            _ => {}
        }
    }

    pub(super) fn invoke1(&mut self, id: ListenerId, a: &str) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        match &mut *guard {
            ListenerFn::Table(f) | ListenerFn::RowIds(f) => f(self, a),
            _ => {}
        }
    }

    pub(super) fn invoke2(&mut self, id: ListenerId, a: &str, b: &str) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        match &mut *guard {
            ListenerFn::Row(f) | ListenerFn::CellIds(f) => f(self, a, b),
            _ => {}
        }
    }

    pub(super) fn invoke_cell(
        &mut self,
        id: ListenerId,
        t: &str,
        r: &str,
        c: &str,
        new: Option<Datum>,
        old: Option<Datum>,
    ) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        if let ListenerFn::Cell(f) = &mut *guard {
            f(self, t, r, c, new, old);
        }
    }

    pub(super) fn invoke_value(
        &mut self,
        id: ListenerId,
        v: &str,
        new: Option<Datum>,
        old: Option<Datum>,
    ) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        if let ListenerFn::Value(f) = &mut *guard {
            f(self, v, new, old);
        }
    }

    pub(super) fn invoke_invalid_cell(
        &mut self,
        id: ListenerId,
        t: &str,
        r: &str,
        c: &str,
        raws: &[serde_json::Value],
    ) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        if let ListenerFn::InvalidCell(f) = &mut *guard {
            f(self, t, r, c, raws);
        }
    }

    pub(super) fn invoke_invalid_value(
        &mut self,
        id: ListenerId,
        v: &str,
        raws: &[serde_json::Value],
    ) {
        let Some(func) = self.listeners.func(id) else {
            return;
        };
        let mut guard = func.lock();
        if let ListenerFn::InvalidValue(f) = &mut *guard {
            f(self, v, raws);
        }
    }
}
