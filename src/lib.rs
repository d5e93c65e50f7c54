//! # Tessera
//!
//! An in-memory, schema-optional, reactive tabular data store: tables of
//! rows of cells, a flat namespace of standalone values, reentrant
//! transactions with two-phase listener delivery and rollback, wildcard
//! change subscription, and a mergeable CRDT variant for multi-peer
//! synchronization.
//!
//! ## Core Concepts
//!
//! - **Store**: tables, rows, cells, and values, created on first write
//!   and destroyed when their last field is removed
//! - **Schemas**: optional per-cell/per-value type tags with defaults;
//!   invalid writes are defaulted or dropped, never thrown
//! - **Transactions**: a reentrancy/batching discipline with mutator and
//!   immutable listener phases and verbatim rollback
//! - **Listeners**: exact or wildcard paths over event categories, fired
//!   synchronously inside the commit that triggered them
//! - **MergeableStore**: hybrid-logical-clock stamps and incremental hash
//!   summaries for hash-diff reconciliation and last-writer-wins merge
//!
//! ## Example
//!
//! ```ignore
//! use tessera::Store;
//!
//! let mut store = Store::new();
//! store.add_cell_listener(None, None, None, |_, t, r, c, new, _| {
//!     println!("{t}/{r}/{c} changed to {new:?}");
//! }, false);
//!
//! store.transaction(|s| {
//!     s.set_cell("pets", "fido", "species", "dog");
//!     s.set_value("open", true);
//! });
//! ```

pub mod error;
pub mod listeners;
pub mod mergeable;
pub mod persist;
pub mod schema;
pub mod store;
pub mod types;

mod pool;

// Re-exports
pub use error::{Result, StoreError};
pub use listeners::ListenerId;
pub use mergeable::{
    CellHashes, ContentHashes, LeafStamp, MergeableChanges, MergeableContent, MergeableStore,
    RowHashes, RowStamp, Stamp, StampHash, TableHashes, TableStamp, TablesStamp, Time,
    ValueHashes, ValuesStamp,
};
pub use persist::{Persistence, Persister, PersisterStatus};
pub use schema::{CellSchema, TableSchema, TablesSchema, ValuesSchema};
pub use store::Store;
pub use types::*;
