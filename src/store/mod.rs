//! Entity store: the only owner of persisted resources and reservations.
//!
//! The engine reads and appends through [`EntityStore`] and never caches rows
//! of its own. [`InMemoryStore`] backs tests and is the index of
//! [`DurableStore`], which adds a group-committed write-ahead log.

mod durable;
mod memory;

pub use durable::DurableStore;
pub use memory::InMemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Reservation, Resource};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique violation on {field}: {value}")]
    UniqueViolation { field: &'static str, value: String },
    #[error("foreign key violation: resource {0} does not exist")]
    ForeignKeyViolation(Ulid),
    #[error("exclusion violation: overlaps reservation {conflicting} on resource {resource_id}")]
    ExclusionViolation { resource_id: Ulid, conflicting: Ulid },
    #[error("outcome of an earlier write to resource {0} is still pending")]
    InDoubt(Ulid),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store is shut down")]
    Closed,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fails with `UniqueViolation` on a duplicate id or name.
    async fn insert_resource(&self, resource: Resource) -> Result<(), StoreError>;

    /// Fails with `ForeignKeyViolation` when the resource is unknown and
    /// `UniqueViolation` on a duplicate id. Performs no overlap check.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;

    async fn resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    /// Creation order.
    async fn all_resources(&self) -> Result<Vec<Resource>, StoreError>;

    /// Case-sensitive, creation order.
    async fn resources_by_name_prefix(&self, prefix: &str) -> Result<Vec<Resource>, StoreError>;

    async fn resource_count(&self) -> Result<usize, StoreError>;

    /// Ordered by span start.
    async fn reservations_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    /// Creation order.
    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn reservation_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
}
