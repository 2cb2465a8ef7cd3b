use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::{EntityStore, StoreError};

/// A stored row tagged with its insertion sequence number.
#[derive(Debug, Clone)]
struct Row<T> {
    seq: u64,
    value: T,
}

/// Concurrent in-memory tables.
///
/// Inserts are split into a claim phase (uniqueness and foreign keys, atomic
/// per key) and a commit phase (row becomes visible), so the durable store
/// can log between the two.
pub struct InMemoryStore {
    resources: DashMap<Ulid, Row<Resource>>,
    /// Unique index: name → resource id.
    names: DashMap<String, Ulid>,
    /// Resource id → reservations sorted by `span.start`.
    reservations: DashMap<Ulid, Vec<Row<Reservation>>>,
    /// Reverse lookup: reservation id → resource id.
    reservation_to_resource: DashMap<Ulid, Ulid>,
    next_seq: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            names: DashMap::new(),
            reservations: DashMap::new(),
            reservation_to_resource: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ── Resources ────────────────────────────────────────────

    pub(super) fn claim_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        if self.resources.contains_key(&resource.id) {
            return Err(StoreError::UniqueViolation {
                field: "resources.id",
                value: resource.id.to_string(),
            });
        }
        match self.names.entry(resource.name.clone()) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                field: "resources.name",
                value: resource.name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(resource.id);
                Ok(())
            }
        }
    }

    pub(super) fn release_resource(&self, resource: &Resource) {
        self.names.remove_if(&resource.name, |_, id| *id == resource.id);
    }

    pub(super) fn commit_resource(&self, resource: Resource) {
        let id = resource.id;
        self.reservations.entry(id).or_default();
        let seq = self.next_seq();
        self.resources.insert(id, Row { seq, value: resource });
    }

    pub fn put_resource(&self, resource: Resource) -> Result<(), StoreError> {
        self.claim_resource(&resource)?;
        self.commit_resource(resource);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<Resource> {
        self.resources.get(id).map(|r| r.value.clone())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    fn resources_where(&self, pred: impl Fn(&Resource) -> bool) -> Vec<Resource> {
        let mut rows: Vec<Row<Resource>> = self
            .resources
            .iter()
            .filter(|e| pred(&e.value().value))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.value).collect()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources_where(|_| true)
    }

    pub fn find_resources_by_prefix(&self, prefix: &str) -> Vec<Resource> {
        self.resources_where(|r| r.name.starts_with(prefix))
    }

    // ── Reservations ─────────────────────────────────────────

    pub(super) fn claim_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        if !self.resources.contains_key(&reservation.resource_id) {
            return Err(StoreError::ForeignKeyViolation(reservation.resource_id));
        }
        match self.reservation_to_resource.entry(reservation.id) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                field: "reservations.id",
                value: reservation.id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(reservation.resource_id);
                Ok(())
            }
        }
    }

    pub(super) fn release_reservation(&self, reservation: &Reservation) {
        self.reservation_to_resource.remove(&reservation.id);
    }

    /// Insert maintaining sort order by span.start.
    pub(super) fn commit_reservation(&self, reservation: Reservation) {
        let seq = self.next_seq();
        let mut rows = self.reservations.entry(reservation.resource_id).or_default();
        // Equal starts keep insertion order.
        let pos = rows.partition_point(|r| r.value.span.start <= reservation.span.start);
        rows.insert(pos, Row { seq, value: reservation });
    }

    pub fn put_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.claim_reservation(&reservation)?;
        self.commit_reservation(reservation);
        Ok(())
    }

    pub fn reservations_for(&self, resource_id: &Ulid) -> Vec<Reservation> {
        self.reservations
            .get(resource_id)
            .map(|rows| rows.iter().map(|r| r.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn list_reservations(&self) -> Vec<Reservation> {
        let mut rows: Vec<Row<Reservation>> = self
            .reservations
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.value).collect()
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let resource_id = *self.reservation_to_resource.get(id)?;
        let rows = self.reservations.get(&resource_id)?;
        rows.iter().find(|r| r.value.id == *id).map(|r| r.value.clone())
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::ResourceCreated { id, name } => self.put_resource(Resource {
                id: *id,
                name: name.clone(),
            }),
            Event::ReservationCreated { id, resource_id, span } => {
                // Only the engine checks overlaps on the way in; a log must not
                // bring back two bookings of the same time.
                if let Some(existing) = self.reservations_for(resource_id).iter().find(|r| r.span.overlaps(span)) {
                    return Err(StoreError::ExclusionViolation {
                        resource_id: *resource_id,
                        conflicting: existing.id,
                    });
                }
                self.put_reservation(Reservation {
                    id: *id,
                    resource_id: *resource_id,
                    span: *span,
                })
            }
        }
    }

    /// Minimal event list that recreates the current state: every resource,
    /// then every reservation, each in creation order.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.list_resources().iter().map(Event::from).collect();
        events.extend(self.list_reservations().iter().map(Event::from));
        events
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn insert_resource(&self, resource: Resource) -> Result<(), StoreError> {
        self.put_resource(resource)
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.put_reservation(reservation)
    }

    async fn resource_by_id(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.get_resource(&id))
    }

    async fn all_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.list_resources())
    }

    async fn resources_by_name_prefix(&self, prefix: &str) -> Result<Vec<Resource>, StoreError> {
        Ok(self.find_resources_by_prefix(prefix))
    }

    async fn resource_count(&self) -> Result<usize, StoreError> {
        Ok(InMemoryStore::resource_count(self))
    }

    async fn reservations_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_for(&resource_id))
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.list_reservations())
    }

    async fn reservation_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.get_reservation(&id))
    }
}
