//! Collaborator contract for persistence adapters.
//!
//! Concrete adapters (file, key-value, SQL, remote) live outside the
//! core; this module defines what they implement and the harness that
//! drives one against a store: at most one load and one save in flight at
//! a time, with status and counters for observability.

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{Content, ContentChanges};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where a persistence harness is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersisterStatus {
    #[default]
    Idle,
    Loading,
    Saving,
}

/// Implemented by storage adapters. The harness never issues overlapping
/// calls.
pub trait Persister {
    /// Read the persisted content, or `None` when nothing is persisted
    /// yet.
    fn load_content(&mut self) -> Result<Option<Content>>;

    /// Write the content out. `changes` carries the delta since the last
    /// save when the caller has one, letting incremental media avoid a
    /// full rewrite.
    fn save_content(&mut self, content: &Content, changes: Option<&ContentChanges>) -> Result<()>;

    /// Begin watching the medium for external changes; `changed` is
    /// invoked when the persisted content is modified from outside.
    /// Media with no change feed keep the default no-op.
    fn attach_changed(&mut self, changed: Box<dyn FnMut()>) {
        let _ = changed;
    }

    /// Stop watching the medium.
    fn detach_changed(&mut self) {}
}

/// Drives a [`Persister`] against a store.
pub struct Persistence<P: Persister> {
    persister: P,
    status: PersisterStatus,
    loads: u64,
    saves: u64,
}

impl<P: Persister> Persistence<P> {
    pub fn new(persister: P) -> Self {
        Self {
            persister,
            status: PersisterStatus::Idle,
            loads: 0,
            saves: 0,
        }
    }

    pub fn status(&self) -> PersisterStatus {
        self.status
    }

    pub fn load_count(&self) -> u64 {
        self.loads
    }

    pub fn save_count(&self) -> u64 {
        self.saves
    }

    /// Load persisted content into the store. Nothing-persisted is not an
    /// error; the store is simply left as it was.
    pub fn load(&mut self, store: &mut Store) -> Result<()> {
        if self.status != PersisterStatus::Idle {
            return Err(StoreError::LoadInFlight);
        }
        self.status = PersisterStatus::Loading;
        let outcome = self.persister.load_content();
        self.status = PersisterStatus::Idle;
        if let Some(content) = outcome? {
            store.set_content(content);
        }
        self.loads += 1;
        debug!(loads = self.loads, "load complete");
        Ok(())
    }

    /// Save the store's current content.
    pub fn save(&mut self, store: &Store) -> Result<()> {
        self.save_with_changes(store, None)
    }

    /// Save, handing the adapter the delta since its last save as well.
    pub fn save_with_changes(
        &mut self,
        store: &Store,
        changes: Option<&ContentChanges>,
    ) -> Result<()> {
        if self.status != PersisterStatus::Idle {
            return Err(StoreError::SaveInFlight);
        }
        self.status = PersisterStatus::Saving;
        let outcome = self.persister.save_content(&store.get_content(), changes);
        self.status = PersisterStatus::Idle;
        outcome?;
        self.saves += 1;
        debug!(saves = self.saves, "save complete");
        Ok(())
    }

    pub fn persister(&self) -> &P {
        &self.persister
    }

    pub fn persister_mut(&mut self) -> &mut P {
        &mut self.persister
    }

    pub fn into_inner(self) -> P {
        self.persister
    }
}
