mod conflict;
mod directory;
mod error;
mod scheduling;

pub use error::{EngineError, ErrorKind};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::store::EntityStore;

/// Per-resource serialization scope. Holds no data.
pub type ResourceLock = Arc<Mutex<()>>;

/// Resource directory and scheduling engine over an [`EntityStore`].
///
/// The store is the only holder of rows. The engine adds one mutex per
/// resource, under which `reserve` runs its read-check-insert sequence.
pub struct Engine {
    store: Arc<dyn EntityStore>,
    locks: DashMap<Ulid, ResourceLock>,
}

impl Engine {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// The serialization scope of a resource, created on first use.
    pub(super) fn resource_lock(&self, resource_id: Ulid) -> ResourceLock {
        self.locks.entry(resource_id).or_default().value().clone()
    }
}
