//! Wildcard listener engine.
//!
//! A generic registry mapping an event category and a partially-specified
//! path of identifiers to callbacks. Registration supports exact and
//! wildcard (any-id) slots; broadcast matches a concrete path against the
//! cross-product of exact-or-wildcard branches and invokes every matched
//! listener once, in registration order.

mod trie;

pub(crate) use trie::TrieNode;

use crate::pool::IdPool;
use crate::store::Store;
use crate::types::{Datum, Id};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a registered listener.
///
/// Drawn from the same pool mechanism as row ids, so released ids are
/// reused before new ones are minted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of event categories a listener can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Topic {
    Tables,
    TableIds,
    Table,
    RowIds,
    Row,
    CellIds,
    Cell,
    Values,
    ValueIds,
    Value,
    InvalidCell,
    InvalidValue,
    StartTransaction,
    WillFinishTransaction,
    DidFinishTransaction,
}

/// A registered callback, typed per category.
///
/// Every callback receives the owning store mutably; whether its writes
/// take effect depends on the delivery phase (mutator-phase writes fold
/// into the active transaction, immutable-phase writes are ignored).
pub(crate) enum ListenerFn {
    Tables(Box<dyn FnMut(&mut Store)>),
    TableIds(Box<dyn FnMut(&mut Store)>),
    Table(Box<dyn FnMut(&mut Store, &str)>),
    RowIds(Box<dyn FnMut(&mut Store, &str)>),
    Row(Box<dyn FnMut(&mut Store, &str, &str)>),
    CellIds(Box<dyn FnMut(&mut Store, &str, &str)>),
    Cell(Box<dyn FnMut(&mut Store, &str, &str, &str, Option<Datum>, Option<Datum>)>),
    Values(Box<dyn FnMut(&mut Store)>),
    ValueIds(Box<dyn FnMut(&mut Store)>),
    Value(Box<dyn FnMut(&mut Store, &str, Option<Datum>, Option<Datum>)>),
    InvalidCell(Box<dyn FnMut(&mut Store, &str, &str, &str, &[serde_json::Value])>),
    InvalidValue(Box<dyn FnMut(&mut Store, &str, &[serde_json::Value])>),
    StartTransaction(Box<dyn FnMut(&mut Store)>),
    WillFinishTransaction(Box<dyn FnMut(&mut Store)>),
    DidFinishTransaction(Box<dyn FnMut(&mut Store)>),
}

impl ListenerFn {
    pub fn topic(&self) -> Topic {
        match self {
            ListenerFn::Tables(_) => Topic::Tables,
            ListenerFn::TableIds(_) => Topic::TableIds,
            ListenerFn::Table(_) => Topic::Table,
            ListenerFn::RowIds(_) => Topic::RowIds,
            ListenerFn::Row(_) => Topic::Row,
            ListenerFn::CellIds(_) => Topic::CellIds,
            ListenerFn::Cell(_) => Topic::Cell,
            ListenerFn::Values(_) => Topic::Values,
            ListenerFn::ValueIds(_) => Topic::ValueIds,
            ListenerFn::Value(_) => Topic::Value,
            ListenerFn::InvalidCell(_) => Topic::InvalidCell,
            ListenerFn::InvalidValue(_) => Topic::InvalidValue,
            ListenerFn::StartTransaction(_) => Topic::StartTransaction,
            ListenerFn::WillFinishTransaction(_) => Topic::WillFinishTransaction,
            ListenerFn::DidFinishTransaction(_) => Topic::DidFinishTransaction,
        }
    }
}

pub(crate) struct ListenerEntry {
    pub topic: Topic,
    pub path: Vec<Option<Id>>,
    pub mutator: bool,
    /// Registration order; pool ids are reused, so the id itself is not it.
    pub seq: u64,
    pub func: Arc<Mutex<ListenerFn>>,
}

/// Registry of listeners: one trie per category plus an id-keyed arena.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: HashMap<ListenerId, ListenerEntry>,
    tries: HashMap<Topic, TrieNode>,
    pool: IdPool,
    next_seq: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: Vec<Option<Id>>, mutator: bool, func: ListenerFn) -> ListenerId {
        let topic = func.topic();
        let id = ListenerId(self.pool.acquire());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tries.entry(topic).or_default().insert(&path, id);
        self.entries.insert(
            id,
            ListenerEntry {
                topic,
                path,
                mutator,
                seq,
                func: Arc::new(Mutex::new(func)),
            },
        );
        id
    }

    /// Deregister. Prunes the trie and releases the id for reuse.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if let Some(root) = self.tries.get_mut(&entry.topic) {
                    if root.remove(&entry.path, id) {
                        self.tries.remove(&entry.topic);
                    }
                }
                self.pool.release(id.0);
                true
            }
            None => false,
        }
    }

    /// Matching listener ids for a concrete path, in registration order.
    /// `phase` of `Some(mutator)` filters by delivery phase; `None` keeps
    /// every match.
    pub fn matches(&self, topic: Topic, path: &[&str], phase: Option<bool>) -> Vec<ListenerId> {
        let mut ids = Vec::new();
        if let Some(root) = self.tries.get(&topic) {
            root.collect(path, &mut ids);
        }
        if let Some(mutator) = phase {
            ids.retain(|id| {
                self.entries
                    .get(id)
                    .map(|e| e.mutator == mutator)
                    .unwrap_or(false)
            });
        }
        ids.sort_by_key(|id| self.entries.get(id).map(|e| e.seq).unwrap_or(u64::MAX));
        ids
    }

    pub fn func(&self, id: ListenerId) -> Option<Arc<Mutex<ListenerFn>>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.func))
    }

    pub fn registration(&self, id: ListenerId) -> Option<(Topic, Vec<Option<Id>>)> {
        self.entries.get(&id).map(|e| (e.topic, e.path.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
