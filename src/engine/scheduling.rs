use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_CREATED_TOTAL, RESERVATIONS_REJECTED_TOTAL, RESERVE_LOCK_WAIT_SECONDS};

use super::conflict::check_no_conflict;
use super::{Engine, EngineError, ErrorKind};

impl Engine {
    /// Book `request.span()` on its resource if nothing there overlaps it.
    ///
    /// The existing-reservation read, the overlap check, and the insert run
    /// under the resource's lock, so concurrent calls for the same resource
    /// are totally ordered and at most one of two overlapping requests wins.
    /// Calls for different resources never wait on each other.
    pub async fn reserve(&self, request: NewReservation) -> Result<Reservation, EngineError> {
        let result = self.reserve_inner(request).await;
        if let Err(e) = &result {
            let reason = match e.kind() {
                ErrorKind::Unavailable => "unavailable",
                ErrorKind::NotFound => "not_found",
                ErrorKind::StorageFailure => "storage",
                ErrorKind::InvalidInput | ErrorKind::Conflict => "invalid",
            };
            metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
        }
        result
    }

    async fn reserve_inner(&self, request: NewReservation) -> Result<Reservation, EngineError> {
        let resource_id = request.resource_id();
        let span = request.span();

        self.resource(resource_id).await?;

        let lock = self.resource_lock(resource_id);
        let wait_start = Instant::now();
        let _scope = lock.lock().await;
        metrics::histogram!(RESERVE_LOCK_WAIT_SECONDS).record(wait_start.elapsed().as_secs_f64());

        let existing = self
            .store
            .reservations_by_resource(resource_id)
            .await
            .inspect_err(|e| warn!(%resource_id, "reading reservations failed: {e}"))?;
        debug_assert!(existing.is_sorted_by_key(|r| r.span.start));
        if existing.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        if let Err(e) = check_no_conflict(resource_id, &existing, &span) {
            debug!(%resource_id, start = span.start, end = span.end, "reservation rejected: {e}");
            return Err(e);
        }

        let reservation = Reservation {
            id: Ulid::new(),
            resource_id,
            span,
        };
        self.store
            .insert_reservation(reservation.clone())
            .await
            .inspect_err(|e| warn!(%resource_id, "persisting reservation failed: {e}"))?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            id = %reservation.id,
            %resource_id,
            start = span.start,
            end = span.end,
            "reserved"
        );
        Ok(reservation)
    }

    /// Every reservation, in creation order.
    pub async fn list_reservations(&self) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.all_reservations().await?)
    }

    /// Reservations of one resource, ordered by start. An unknown resource
    /// simply has none.
    pub async fn list_reservations_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.reservations_by_resource(resource_id).await?)
    }

    pub async fn get_reservation(&self, raw_id: &str) -> Result<Reservation, EngineError> {
        let id = parse_id(raw_id)?;
        self.store
            .reservation_by_id(id)
            .await?
            .ok_or(EngineError::ReservationNotFound(id))
    }
}
