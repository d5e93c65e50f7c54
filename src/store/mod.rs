//! The store core: tables, values, schemas, and the reactive write surface.
//!
//! All mutation funnels through implicit transactions, so a bare
//! `set_cell` behaves exactly like the same write wrapped in
//! [`Store::transaction`]. Setters are silent-and-corrective: invalid
//! input is recorded in the transaction's invalid report and defaulted or
//! dropped, never thrown.

pub(crate) mod changes;
mod transaction;

use crate::listeners::{ListenerFn, ListenerId, ListenerRegistry, Topic};
use crate::pool::IdPool;
use crate::schema::{sanitize_schema, validate_datum, TablesSchema, Validated, ValuesSchema};
use crate::types::{Content, ContentChanges, Datum, Id, Row, Table, Tables, Values};
use changes::TransactionLog;
use std::collections::BTreeMap;
use tracing::debug;
use transaction::{CommitHooks, TransactionState};

/// An in-memory, schema-optional, reactive tabular data store.
///
/// Owns its table and value maps outright; getters return owned copies,
/// and `for_each_*` iterates without materializing any.
pub struct Store {
    tables: Tables,
    values: Values,
    tables_schema: Option<TablesSchema>,
    values_schema: Option<ValuesSchema>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) state: TransactionState,
    pub(crate) log: TransactionLog,
    /// Per-table pools for generated row ids.
    row_pools: BTreeMap<Id, IdPool>,
    pub(crate) hooks: CommitHooks,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tables: Tables::new(),
            values: Values::new(),
            tables_schema: None,
            values_schema: None,
            listeners: ListenerRegistry::new(),
            state: TransactionState::Idle,
            log: TransactionLog::default(),
            row_pools: BTreeMap::new(),
            hooks: CommitHooks::default(),
        }
    }

    // --- Getters ---

    pub fn get_content(&self) -> Content {
        Content(self.tables.clone(), self.values.clone())
    }

    pub fn has_content(&self) -> bool {
        !self.tables.is_empty() || !self.values.is_empty()
    }

    pub fn get_tables(&self) -> Tables {
        self.tables.clone()
    }

    pub fn has_tables(&self) -> bool {
        !self.tables.is_empty()
    }

    pub fn get_table(&self, table_id: &str) -> Table {
        self.tables.get(table_id).cloned().unwrap_or_default()
    }

    pub fn has_table(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }

    /// Table ids in lexicographic order.
    pub fn get_table_ids(&self) -> Vec<Id> {
        self.tables.keys().cloned().collect()
    }

    pub fn get_row(&self, table_id: &str, row_id: &str) -> Row {
        self.tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.tables
            .get(table_id)
            .is_some_and(|t| t.contains_key(row_id))
    }

    pub fn get_row_ids(&self, table_id: &str) -> Vec<Id> {
        self.tables
            .get(table_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_row_count(&self, table_id: &str) -> usize {
        self.tables.get(table_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<Datum> {
        self.tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .and_then(|r| r.get(cell_id))
            .cloned()
    }

    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.get_cell(table_id, row_id, cell_id).is_some()
    }

    pub fn get_cell_ids(&self, table_id: &str, row_id: &str) -> Vec<Id> {
        self.tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_values(&self) -> Values {
        self.values.clone()
    }

    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn get_value(&self, value_id: &str) -> Option<Datum> {
        self.values.get(value_id).cloned()
    }

    pub fn has_value(&self, value_id: &str) -> bool {
        self.values.contains_key(value_id)
    }

    pub fn get_value_ids(&self) -> Vec<Id> {
        self.values.keys().cloned().collect()
    }

    // --- Iteration ---

    pub fn for_each_table(&self, mut f: impl FnMut(&str, &Table)) {
        for (id, table) in &self.tables {
            f(id, table);
        }
    }

    pub fn for_each_row(&self, table_id: &str, mut f: impl FnMut(&str, &Row)) {
        if let Some(table) = self.tables.get(table_id) {
            for (id, row) in table {
                f(id, row);
            }
        }
    }

    pub fn for_each_cell(&self, table_id: &str, row_id: &str, mut f: impl FnMut(&str, &Datum)) {
        if let Some(row) = self.tables.get(table_id).and_then(|t| t.get(row_id)) {
            for (id, datum) in row {
                f(id, datum);
            }
        }
    }

    pub fn for_each_value(&self, mut f: impl FnMut(&str, &Datum)) {
        for (id, datum) in &self.values {
            f(id, datum);
        }
    }

    // --- Setters ---

    pub fn set_content(&mut self, content: Content) -> &mut Self {
        let Content(tables, values) = content;
        self.with_transaction(|s| {
            s.set_tables(tables);
            s.set_values(values);
        });
        self
    }

    pub fn set_tables(&mut self, tables: Tables) -> &mut Self {
        self.with_transaction(|s| {
            let existing = s.get_table_ids();
            for t in existing {
                if !tables.contains_key(&t) {
                    s.del_table(&t);
                }
            }
            for (t, table) in tables {
                if !t.is_empty() {
                    s.set_table(&t, table);
                }
            }
        });
        self
    }

    pub fn set_table(&mut self, table_id: &str, table: Table) -> &mut Self {
        if table_id.is_empty() {
            return self;
        }
        self.with_transaction(|s| {
            let existing = s.get_row_ids(table_id);
            for r in existing {
                if !table.contains_key(&r) {
                    s.del_row(table_id, &r);
                }
            }
            for (r, row) in table {
                if !r.is_empty() {
                    s.set_row(table_id, &r, row);
                }
            }
        });
        self
    }

    /// Replace a row wholesale: cells not re-supplied are removed, schema
    /// defaults fill the gaps, and each remaining cell is validated.
    pub fn set_row(&mut self, table_id: &str, row_id: &str, row: Row) -> &mut Self {
        if table_id.is_empty() || row_id.is_empty() {
            return self;
        }
        self.with_transaction(|s| {
            let existing = s.get_cell_ids(table_id, row_id);
            for c in existing {
                if !row.contains_key(&c) {
                    s.erase_cell(table_id, row_id, &c);
                }
            }
            for (c, datum) in row {
                if !c.is_empty() {
                    s.apply_validated_cell(table_id, row_id, &c, datum);
                }
            }
            s.fill_row_defaults(table_id, row_id);
        });
        self
    }

    /// Insert a row under a generated id, reusing released ids before
    /// minting new ones. Returns `None` if the row ends up empty (every
    /// supplied cell invalid, with no defaults to fall back on).
    pub fn add_row(&mut self, table_id: &str, row: Row) -> Option<Id> {
        if table_id.is_empty() || !self.can_mutate() {
            return None;
        }
        let row_id = loop {
            let candidate = self
                .row_pools
                .entry(table_id.to_owned())
                .or_default()
                .acquire_text();
            if !self.has_row(table_id, &candidate) {
                break candidate;
            }
        };
        self.set_row(table_id, &row_id, row);
        if self.has_row(table_id, &row_id) {
            Some(row_id)
        } else {
            if let Some(pool) = self.row_pools.get_mut(table_id) {
                pool.release_text(&row_id);
            }
            None
        }
    }

    /// Merge cells into a row without clearing the ones not supplied.
    pub fn set_partial_row(&mut self, table_id: &str, row_id: &str, row: Row) -> &mut Self {
        if table_id.is_empty() || row_id.is_empty() {
            return self;
        }
        self.with_transaction(|s| {
            let new_row = !s.has_row(table_id, row_id);
            for (c, datum) in row {
                if !c.is_empty() {
                    s.apply_validated_cell(table_id, row_id, &c, datum);
                }
            }
            if new_row && s.has_row(table_id, row_id) {
                s.fill_row_defaults(table_id, row_id);
            }
        });
        self
    }

    pub fn set_cell(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        datum: impl Into<Datum>,
    ) -> &mut Self {
        if table_id.is_empty() || row_id.is_empty() || cell_id.is_empty() {
            return self;
        }
        let datum = datum.into();
        self.with_transaction(|s| {
            let new_row = !s.has_row(table_id, row_id);
            s.apply_validated_cell(table_id, row_id, cell_id, datum);
            if new_row && s.has_row(table_id, row_id) {
                s.fill_row_defaults(table_id, row_id);
            }
        });
        self
    }

    pub fn set_values(&mut self, values: Values) -> &mut Self {
        self.with_transaction(|s| {
            let existing = s.get_value_ids();
            for v in existing {
                if !values.contains_key(&v) {
                    s.erase_value(&v);
                }
            }
            for (v, datum) in values {
                if !v.is_empty() {
                    s.apply_validated_value(&v, datum);
                }
            }
            s.fill_value_defaults();
        });
        self
    }

    /// Merge values without clearing the ones not supplied.
    pub fn set_partial_values(&mut self, values: Values) -> &mut Self {
        self.with_transaction(|s| {
            for (v, datum) in values {
                if !v.is_empty() {
                    s.apply_validated_value(&v, datum);
                }
            }
        });
        self
    }

    pub fn set_value(&mut self, value_id: &str, datum: impl Into<Datum>) -> &mut Self {
        if value_id.is_empty() {
            return self;
        }
        let datum = datum.into();
        self.with_transaction(|s| s.apply_validated_value(value_id, datum));
        self
    }

    // --- Deleters ---
    //
    // Deleting something absent is a no-op: nothing is buffered and no
    // listener fires.

    pub fn del_content(&mut self) -> &mut Self {
        self.with_transaction(|s| {
            s.del_tables();
            s.del_values();
        });
        self
    }

    pub fn del_tables(&mut self) -> &mut Self {
        self.with_transaction(|s| {
            for t in s.get_table_ids() {
                s.del_table(&t);
            }
        });
        self
    }

    pub fn del_table(&mut self, table_id: &str) -> &mut Self {
        self.with_transaction(|s| {
            for r in s.get_row_ids(table_id) {
                s.del_row(table_id, &r);
            }
        });
        self
    }

    pub fn del_row(&mut self, table_id: &str, row_id: &str) -> &mut Self {
        self.with_transaction(|s| {
            for c in s.get_cell_ids(table_id, row_id) {
                s.erase_cell(table_id, row_id, &c);
            }
        });
        self
    }

    pub fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) -> &mut Self {
        self.with_transaction(|s| s.erase_cell(table_id, row_id, cell_id));
        self
    }

    pub fn del_values(&mut self) -> &mut Self {
        self.with_transaction(|s| {
            for v in s.get_value_ids() {
                s.erase_value(&v);
            }
        });
        self
    }

    pub fn del_value(&mut self, value_id: &str) -> &mut Self {
        self.with_transaction(|s| s.erase_value(value_id));
        self
    }

    // --- Change deltas ---

    /// The content-shaped delta of the current transaction. Authoritative
    /// only during the commit window (usable from did-finish listeners);
    /// empty outside a transaction.
    pub fn get_transaction_changes(&self) -> ContentChanges {
        self.log.to_content_changes()
    }

    /// Apply a content-shaped delta: `None` fields delete, everything else
    /// goes through the usual validation.
    pub fn apply_changes(&mut self, changes: &ContentChanges) -> &mut Self {
        self.with_transaction(|s| {
            for (t, table) in &changes.0 {
                match table {
                    None => {
                        s.del_table(t);
                    }
                    Some(rows) => {
                        for (r, row) in rows {
                            match row {
                                None => {
                                    s.del_row(t, r);
                                }
                                Some(cells) => {
                                    for (c, datum) in cells {
                                        match datum {
                                            None => {
                                                s.del_cell(t, r, c);
                                            }
                                            Some(d) => {
                                                s.set_cell(t, r, c, d.clone());
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            for (v, datum) in &changes.1 {
                match datum {
                    None => {
                        s.del_value(v);
                    }
                    Some(d) => {
                        s.set_value(v, d.clone());
                    }
                }
            }
        });
        self
    }

    // --- JSON convenience ---

    pub fn get_content_json(&self) -> String {
        serde_json::to_string(&self.get_content()).unwrap_or_else(|_| "[{},{}]".to_owned())
    }

    /// Set content from a JSON string. A cleanly-shaped payload replaces
    /// the whole content; malformed payloads fall back to a best-effort
    /// partial apply, recording unusable leaves as invalid. Input that is
    /// not even a two-part array leaves prior state unchanged.
    pub fn set_content_json(&mut self, json: &str) -> &mut Self {
        if let Ok(content) = serde_json::from_str::<Content>(json) {
            return self.set_content(content);
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return self;
        };
        let Some(parts) = value.as_array() else {
            return self;
        };
        let tables = parts.first().and_then(|v| v.as_object()).cloned();
        let values = parts.get(1).and_then(|v| v.as_object()).cloned();
        self.with_transaction(|s| {
            if let Some(tables) = tables {
                for (t, rows) in tables {
                    let Some(rows) = rows.as_object() else { continue };
                    for (r, cells) in rows {
                        let Some(cells) = cells.as_object() else { continue };
                        for (c, raw) in cells {
                            match serde_json::from_value::<Datum>(raw.clone()) {
                                Ok(datum) => {
                                    s.set_cell(&t, r, c, datum);
                                }
                                Err(_) => s.log.record_invalid_cell(&t, r, c, raw.clone()),
                            }
                        }
                    }
                }
            }
            if let Some(values) = values {
                for (v, raw) in values {
                    match serde_json::from_value::<Datum>(raw.clone()) {
                        Ok(datum) => {
                            s.set_value(&v, datum);
                        }
                        Err(_) => s.log.record_invalid_value(&v, raw.clone()),
                    }
                }
            }
        });
        self
    }

    // --- Schemas ---

    /// Install a tables schema and retroactively re-validate and re-default
    /// all existing table data against it.
    pub fn set_tables_schema(&mut self, mut schema: TablesSchema) -> &mut Self {
        for table_schema in schema.values_mut() {
            sanitize_schema(table_schema);
        }
        self.with_transaction(|s| {
            s.tables_schema = Some(schema);
            s.revalidate_tables();
        });
        self
    }

    pub fn del_tables_schema(&mut self) -> &mut Self {
        self.tables_schema = None;
        self
    }

    pub fn get_tables_schema(&self) -> Option<TablesSchema> {
        self.tables_schema.clone()
    }

    /// Install a values schema and retroactively re-validate and re-default
    /// the value namespace against it.
    pub fn set_values_schema(&mut self, mut schema: ValuesSchema) -> &mut Self {
        sanitize_schema(&mut schema);
        self.with_transaction(|s| {
            s.values_schema = Some(schema);
            s.revalidate_values();
        });
        self
    }

    pub fn del_values_schema(&mut self) -> &mut Self {
        self.values_schema = None;
        self
    }

    pub fn get_values_schema(&self) -> Option<ValuesSchema> {
        self.values_schema.clone()
    }

    /// Both schemas as `[tablesSchema, valuesSchema]`, with `null` for an
    /// absent one.
    pub fn get_schema_json(&self) -> String {
        serde_json::to_string(&(&self.tables_schema, &self.values_schema))
            .unwrap_or_else(|_| "[null,null]".to_owned())
    }

    /// Set both schemas from `[tablesSchema, valuesSchema]` JSON. Malformed
    /// input leaves prior schemas unchanged.
    pub fn set_schema_json(&mut self, json: &str) -> &mut Self {
        if let Ok((tables, values)) =
            serde_json::from_str::<(Option<TablesSchema>, Option<ValuesSchema>)>(json)
        {
            self.with_transaction(|s| {
                match tables {
                    Some(schema) => {
                        s.set_tables_schema(schema);
                    }
                    None => {
                        s.del_tables_schema();
                    }
                }
                match values {
                    Some(schema) => {
                        s.set_values_schema(schema);
                    }
                    None => {
                        s.del_values_schema();
                    }
                }
            });
        }
        self
    }

    // --- Listeners ---

    pub fn add_tables_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners
            .add(vec![], mutator, ListenerFn::Tables(Box::new(listener)))
    }

    pub fn add_table_ids_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners
            .add(vec![], mutator, ListenerFn::TableIds(Box::new(listener)))
    }

    /// `None` for `table_id` is the wildcard: any table.
    pub fn add_table_listener(
        &mut self,
        table_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![table_id.map(str::to_owned)],
            mutator,
            ListenerFn::Table(Box::new(listener)),
        )
    }

    pub fn add_row_ids_listener(
        &mut self,
        table_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![table_id.map(str::to_owned)],
            mutator,
            ListenerFn::RowIds(Box::new(listener)),
        )
    }

    pub fn add_row_listener(
        &mut self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![table_id.map(str::to_owned), row_id.map(str::to_owned)],
            mutator,
            ListenerFn::Row(Box::new(listener)),
        )
    }

    pub fn add_cell_ids_listener(
        &mut self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![table_id.map(str::to_owned), row_id.map(str::to_owned)],
            mutator,
            ListenerFn::CellIds(Box::new(listener)),
        )
    }

    /// Fires with the concrete path plus the new and old datum. Any slot
    /// left `None` matches every id at that position.
    pub fn add_cell_listener(
        &mut self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, &str, &str, Option<Datum>, Option<Datum>) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![
                table_id.map(str::to_owned),
                row_id.map(str::to_owned),
                cell_id.map(str::to_owned),
            ],
            mutator,
            ListenerFn::Cell(Box::new(listener)),
        )
    }

    pub fn add_values_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners
            .add(vec![], mutator, ListenerFn::Values(Box::new(listener)))
    }

    pub fn add_value_ids_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners
            .add(vec![], mutator, ListenerFn::ValueIds(Box::new(listener)))
    }

    pub fn add_value_listener(
        &mut self,
        value_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, Option<Datum>, Option<Datum>) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![value_id.map(str::to_owned)],
            mutator,
            ListenerFn::Value(Box::new(listener)),
        )
    }

    pub fn add_invalid_cell_listener(
        &mut self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, &str, &str, &[serde_json::Value]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![
                table_id.map(str::to_owned),
                row_id.map(str::to_owned),
                cell_id.map(str::to_owned),
            ],
            mutator,
            ListenerFn::InvalidCell(Box::new(listener)),
        )
    }

    pub fn add_invalid_value_listener(
        &mut self,
        value_id: Option<&str>,
        listener: impl FnMut(&mut Store, &str, &[serde_json::Value]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.listeners.add(
            vec![value_id.map(str::to_owned)],
            mutator,
            ListenerFn::InvalidValue(Box::new(listener)),
        )
    }

    pub fn add_start_transaction_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
    ) -> ListenerId {
        self.listeners.add(
            vec![],
            false,
            ListenerFn::StartTransaction(Box::new(listener)),
        )
    }

    pub fn add_will_finish_transaction_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
    ) -> ListenerId {
        self.listeners.add(
            vec![],
            false,
            ListenerFn::WillFinishTransaction(Box::new(listener)),
        )
    }

    pub fn add_did_finish_transaction_listener(
        &mut self,
        listener: impl FnMut(&mut Store) + 'static,
    ) -> ListenerId {
        self.listeners.add(
            vec![],
            false,
            ListenerFn::DidFinishTransaction(Box::new(listener)),
        )
    }

    /// Deregister a listener; its id returns to the pool. Subsequent
    /// matching changes no longer invoke it.
    pub fn del_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Re-invoke one listener as if its registered path's wildcard slots
    /// were each re-expanded against the current id universe. Synthesizes
    /// an initial notification for a freshly attached observer; only paths
    /// that currently exist are visited, with the current datum as `new`.
    pub fn call_listener(&mut self, id: ListenerId) -> &mut Self {
        let Some((topic, path)) = self.listeners.registration(id) else {
            return self;
        };
        match topic {
            Topic::Tables
            | Topic::TableIds
            | Topic::Values
            | Topic::ValueIds
            | Topic::StartTransaction
            | Topic::WillFinishTransaction
            | Topic::DidFinishTransaction => self.invoke0(id),
            Topic::Table | Topic::RowIds => {
                for t in self.expand_tables(&path[0]) {
                    self.invoke1(id, &t);
                }
            }
            Topic::Row | Topic::CellIds => {
                for t in self.expand_tables(&path[0]) {
                    for r in self.expand_rows(&t, &path[1]) {
                        self.invoke2(id, &t, &r);
                    }
                }
            }
            Topic::Cell => {
                for t in self.expand_tables(&path[0]) {
                    for r in self.expand_rows(&t, &path[1]) {
                        for c in self.expand_cells(&t, &r, &path[2]) {
                            let current = self.get_cell(&t, &r, &c);
                            self.invoke_cell(id, &t, &r, &c, current, None);
                        }
                    }
                }
            }
            Topic::Value => {
                for v in self.expand_values(&path[0]) {
                    let current = self.get_value(&v);
                    self.invoke_value(id, &v, current, None);
                }
            }
            // No replayable state.
            Topic::InvalidCell | Topic::InvalidValue => {}
        }
        self
    }

    // --- Internal write path ---

    /// Unvalidated write: creates the table/row on demand and records the
    /// change. Writing the current value is a no-op.
    pub(crate) fn write_cell(&mut self, t: &str, r: &str, c: &str, datum: Datum) {
        let row_added = match self.tables.get(t) {
            Some(table) => !table.contains_key(r),
            None => true,
        };
        let table_added = !self.tables.contains_key(t);
        let row = self
            .tables
            .entry(t.to_owned())
            .or_default()
            .entry(r.to_owned())
            .or_default();
        let old = row.get(c).cloned();
        if old.as_ref() == Some(&datum) {
            return;
        }
        let cell_added = old.is_none();
        row.insert(c.to_owned(), datum.clone());
        self.log.record_cell(t, r, c, old, Some(datum));
        if table_added {
            self.log.bump_table_id(t, 1);
        }
        if row_added {
            self.log.bump_row_id(t, r, 1);
        }
        if cell_added {
            self.log.bump_cell_id(t, r, c, 1);
        }
    }

    /// Unvalidated removal, cascading empty rows and tables away. Removing
    /// something absent is a no-op.
    pub(crate) fn erase_cell(&mut self, t: &str, r: &str, c: &str) {
        let mut removed = None;
        let mut row_emptied = false;
        let mut table_emptied = false;
        if let Some(table) = self.tables.get_mut(t) {
            if let Some(row) = table.get_mut(r) {
                removed = row.remove(c);
                if removed.is_some() && row.is_empty() {
                    table.remove(r);
                    row_emptied = true;
                    table_emptied = table.is_empty();
                }
            }
        }
        let Some(old) = removed else { return };
        if table_emptied {
            self.tables.remove(t);
        }
        self.log.record_cell(t, r, c, Some(old), None);
        self.log.bump_cell_id(t, r, c, -1);
        if row_emptied {
            self.log.bump_row_id(t, r, -1);
            if let Some(pool) = self.row_pools.get_mut(t) {
                pool.release_text(r);
            }
            if table_emptied {
                self.log.bump_table_id(t, -1);
            }
        }
    }

    pub(crate) fn write_value(&mut self, v: &str, datum: Datum) {
        let old = self.values.get(v).cloned();
        if old.as_ref() == Some(&datum) {
            return;
        }
        let added = old.is_none();
        self.values.insert(v.to_owned(), datum.clone());
        self.log.record_value(v, old, Some(datum));
        if added {
            self.log.bump_value_id(v, 1);
        }
    }

    pub(crate) fn erase_value(&mut self, v: &str) {
        let Some(old) = self.values.remove(v) else {
            return;
        };
        self.log.record_value(v, Some(old), None);
        self.log.bump_value_id(v, -1);
    }

    // --- Validation ---

    fn validate_cell(&self, t: &str, c: &str, datum: Datum) -> Validated {
        match &self.tables_schema {
            None => validate_datum(datum, None),
            Some(schema) => match schema.get(t) {
                // A table outside the schema may not hold data at all.
                None => Validated::Rejected {
                    rejected: datum.to_json_value(),
                },
                Some(table_schema) => match table_schema.get(c) {
                    None => Validated::Rejected {
                        rejected: datum.to_json_value(),
                    },
                    entry => validate_datum(datum, entry),
                },
            },
        }
    }

    fn validate_value(&self, v: &str, datum: Datum) -> Validated {
        match &self.values_schema {
            None => validate_datum(datum, None),
            Some(schema) => match schema.get(v) {
                None => Validated::Rejected {
                    rejected: datum.to_json_value(),
                },
                entry => validate_datum(datum, entry),
            },
        }
    }

    fn apply_validated_cell(&mut self, t: &str, r: &str, c: &str, datum: Datum) {
        match self.validate_cell(t, c, datum) {
            Validated::Ok(d) => self.write_cell(t, r, c, d),
            Validated::Defaulted { rejected, datum: d } => {
                self.log.record_invalid_cell(t, r, c, rejected);
                self.write_cell(t, r, c, d);
            }
            Validated::Rejected { rejected } => {
                self.log.record_invalid_cell(t, r, c, rejected);
            }
        }
    }

    fn apply_validated_value(&mut self, v: &str, datum: Datum) {
        match self.validate_value(v, datum) {
            Validated::Ok(d) => self.write_value(v, d),
            Validated::Defaulted { rejected, datum: d } => {
                self.log.record_invalid_value(v, rejected);
                self.write_value(v, d);
            }
            Validated::Rejected { rejected } => {
                self.log.record_invalid_value(v, rejected);
            }
        }
    }

    /// Insert schema defaults for every id the row omits.
    fn fill_row_defaults(&mut self, t: &str, r: &str) {
        let defaults: Vec<(Id, Datum)> = match self.tables_schema.as_ref().and_then(|s| s.get(t)) {
            Some(table_schema) => table_schema
                .iter()
                .filter_map(|(c, entry)| entry.default.clone().map(|d| (c.clone(), d)))
                .collect(),
            None => return,
        };
        for (c, datum) in defaults {
            let missing = !self.has_cell(t, r, &c);
            if missing {
                self.write_cell(t, r, &c, datum);
            }
        }
    }

    /// Insert schema defaults for every value id the namespace omits.
    fn fill_value_defaults(&mut self) {
        let defaults: Vec<(Id, Datum)> = match &self.values_schema {
            Some(schema) => schema
                .iter()
                .filter_map(|(v, entry)| entry.default.clone().map(|d| (v.clone(), d)))
                .collect(),
            None => return,
        };
        for (v, datum) in defaults {
            if !self.has_value(&v) {
                self.write_value(&v, datum);
            }
        }
    }

    /// Re-validate and re-default every stored cell after a schema change.
    fn revalidate_tables(&mut self) {
        debug!("revalidating tables against new schema");
        let snapshot: Vec<(Id, Id, Id, Datum)> = self
            .tables
            .iter()
            .flat_map(|(t, rows)| {
                rows.iter().flat_map(move |(r, cells)| {
                    cells
                        .iter()
                        .map(move |(c, d)| (t.clone(), r.clone(), c.clone(), d.clone()))
                })
            })
            .collect();
        for (t, r, c, datum) in snapshot {
            match self.validate_cell(&t, &c, datum) {
                Validated::Ok(_) => {}
                Validated::Defaulted { rejected, datum: d } => {
                    self.log.record_invalid_cell(&t, &r, &c, rejected);
                    self.write_cell(&t, &r, &c, d);
                }
                Validated::Rejected { rejected } => {
                    self.log.record_invalid_cell(&t, &r, &c, rejected);
                    self.erase_cell(&t, &r, &c);
                }
            }
        }
        let rows: Vec<(Id, Id)> = self
            .tables
            .iter()
            .flat_map(|(t, rows)| rows.keys().map(move |r| (t.clone(), r.clone())))
            .collect();
        for (t, r) in rows {
            self.fill_row_defaults(&t, &r);
        }
    }

    fn revalidate_values(&mut self) {
        debug!("revalidating values against new schema");
        let snapshot: Vec<(Id, Datum)> = self
            .values
            .iter()
            .map(|(v, d)| (v.clone(), d.clone()))
            .collect();
        for (v, datum) in snapshot {
            match self.validate_value(&v, datum) {
                Validated::Ok(_) => {}
                Validated::Defaulted { rejected, datum: d } => {
                    self.log.record_invalid_value(&v, rejected);
                    self.write_value(&v, d);
                }
                Validated::Rejected { rejected } => {
                    self.log.record_invalid_value(&v, rejected);
                    self.erase_value(&v);
                }
            }
        }
        self.fill_value_defaults();
    }

    // --- Expansion for targeted replay ---

    fn expand_tables(&self, slot: &Option<Id>) -> Vec<Id> {
        match slot {
            Some(t) if self.has_table(t) => vec![t.clone()],
            Some(_) => vec![],
            None => self.get_table_ids(),
        }
    }

    fn expand_rows(&self, t: &str, slot: &Option<Id>) -> Vec<Id> {
        match slot {
            Some(r) if self.has_row(t, r) => vec![r.clone()],
            Some(_) => vec![],
            None => self.get_row_ids(t),
        }
    }

    fn expand_cells(&self, t: &str, r: &str, slot: &Option<Id>) -> Vec<Id> {
        match slot {
            Some(c) if self.has_cell(t, r, c) => vec![c.clone()],
            Some(_) => vec![],
            None => self.get_cell_ids(t, r),
        }
    }

    fn expand_values(&self, slot: &Option<Id>) -> Vec<Id> {
        match slot {
            Some(v) if self.has_value(v) => vec![v.clone()],
            Some(_) => vec![],
            None => self.get_value_ids(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CellSchema;
    use crate::types::DatumType;

    #[test]
    fn test_cell_roundtrip_and_cascade() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "species", "dog");
        assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
        assert_eq!(store.get_row_ids("pets"), vec!["fido".to_owned()]);

        store.del_cell("pets", "fido", "species");
        assert!(store.get_table_ids().is_empty());
        assert!(!store.has_row("pets", "fido"));
    }

    #[test]
    fn test_set_row_replaces() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "species", "dog");
        store.set_cell("pets", "fido", "legs", 4);

        let mut row = Row::new();
        row.insert("color".into(), "brown".into());
        store.set_row("pets", "fido", row);

        assert_eq!(store.get_cell_ids("pets", "fido"), vec!["color".to_owned()]);
    }

    #[test]
    fn test_add_row_generates_and_reuses_ids() {
        let mut store = Store::new();
        let mut row = Row::new();
        row.insert("species".into(), "dog".into());

        let first = store.add_row("pets", row.clone()).unwrap();
        assert_eq!(first, "0");
        let second = store.add_row("pets", row.clone()).unwrap();
        assert_eq!(second, "1");

        store.del_row("pets", "0");
        let reused = store.add_row("pets", row).unwrap();
        assert_eq!(reused, "0");
    }

    #[test]
    fn test_empty_ids_are_noops() {
        let mut store = Store::new();
        store.set_cell("", "r", "c", 1);
        store.set_cell("t", "", "c", 1);
        store.set_cell("t", "r", "", 1);
        store.set_value("", 1);
        assert!(!store.has_tables());
        assert!(!store.has_values());
    }

    #[test]
    fn test_values_namespace() {
        let mut store = Store::new();
        store.set_value("open", true);
        store.set_value("visits", 3);
        assert_eq!(
            store.get_value_ids(),
            vec!["open".to_owned(), "visits".to_owned()]
        );
        store.del_value("open");
        assert_eq!(store.get_value("open"), None);
        assert_eq!(store.get_value("visits"), Some(3.into()));
    }

    #[test]
    fn test_schema_gates_unknown_tables_and_cells() {
        let mut store = Store::new();
        let mut table_schema = BTreeMap::new();
        table_schema.insert("species".to_owned(), CellSchema::new(DatumType::Text));
        let mut schema = TablesSchema::new();
        schema.insert("pets".to_owned(), table_schema);
        store.set_tables_schema(schema);

        store.set_cell("pets", "fido", "species", "dog");
        store.set_cell("pets", "fido", "legs", 4);
        store.set_cell("cars", "beetle", "wheels", 4);

        assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
        assert!(!store.has_cell("pets", "fido", "legs"));
        assert!(!store.has_table("cars"));
    }

    #[test]
    fn test_schema_retroactive_revalidation() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "legs", "four");
        store.set_cell("pets", "fido", "species", "dog");

        let mut table_schema = BTreeMap::new();
        table_schema.insert(
            "legs".to_owned(),
            CellSchema::with_default(DatumType::Number, 4),
        );
        table_schema.insert("species".to_owned(), CellSchema::new(DatumType::Text));
        let mut schema = TablesSchema::new();
        schema.insert("pets".to_owned(), table_schema);
        store.set_tables_schema(schema);

        // "four" fails the number schema and takes the default.
        assert_eq!(store.get_cell("pets", "fido", "legs"), Some(4.into()));
        assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
    }

    #[test]
    fn test_set_content_json_best_effort() {
        let mut store = Store::new();
        store.set_cell("keep", "r", "c", 1);

        // Not even an array: prior state unchanged.
        store.set_content_json("not json at all");
        assert_eq!(store.get_cell("keep", "r", "c"), Some(1.into()));

        // Partially usable: the object leaf is skipped, the rest applies.
        store.set_content_json(r#"[{"pets":{"fido":{"species":"dog","junk":{"a":1}}}},{"open":true}]"#);
        assert_eq!(store.get_cell("pets", "fido", "species"), Some("dog".into()));
        assert!(!store.has_cell("pets", "fido", "junk"));
        assert_eq!(store.get_value("open"), Some(true.into()));
    }

    #[test]
    fn test_content_json_roundtrip() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "species", "dog");
        store.set_value("open", true);
        let json = store.get_content_json();

        let mut other = Store::new();
        other.set_content_json(&json);
        assert_eq!(other.get_content(), store.get_content());
    }
}
