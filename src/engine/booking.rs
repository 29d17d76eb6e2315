use std::time::Instant;

use ulid::Ulid;

use crate::limits::MAX_RESERVATIONS_PER_RESOURCE;
use crate::model::*;

use super::availability::check_bookable;
use super::validate::{now_ms, validate_interval};
use super::{BookingError, Engine};

/// Input to `Engine::create_reservation`. `start`/`end` are optional so a
/// missing bound is reported as `InvalidInterval` rather than being
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub resource_id: Ulid,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl BookingRequest {
    /// Request with a freshly generated reservation id.
    pub fn new(requester_id: Ulid, resource_id: Ulid, start: Ms, end: Ms) -> Self {
        Self {
            id: Ulid::new(),
            requester_id,
            resource_id,
            start: Some(start),
            end: Some(end),
        }
    }
}

impl Engine {
    /// Book `request.resource_id` for `[start, end)`.
    ///
    /// The eligibility check runs twice: once under a shared lock as a cheap
    /// pre-check, and again under the exclusive row lock immediately before
    /// the commit. Only the second one is authoritative; the commit is a single
    /// WAL record that carries both the reservation and the RESERVED status.
    pub async fn create_reservation(
        &self,
        request: BookingRequest,
    ) -> Result<Reservation, BookingError> {
        let started = Instant::now();
        let result = self.try_create_reservation(&request).await;
        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(crate::observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(r) => tracing::info!(
                "reservation {} committed on {} [{}, {}) for {}",
                r.id, r.resource_id, r.span.start, r.span.end, r.requester_id
            ),
            Err(e) if e.is_retryable() => {
                tracing::warn!("reservation {} on {} failed: {e}", request.id, request.resource_id)
            }
            Err(e) => tracing::debug!(
                "reservation {} on {} rejected: {e}",
                request.id,
                request.resource_id
            ),
        }
        result
    }

    async fn try_create_reservation(
        &self,
        request: &BookingRequest,
    ) -> Result<Reservation, BookingError> {
        // Validated
        let span = validate_interval(
            request.start,
            request.end,
            self.config.require_future,
            now_ms(),
        )?;

        if !self.store.contains_requester(&request.requester_id) {
            return Err(BookingError::RequesterNotFound(request.requester_id));
        }
        let rs = self
            .store
            .get_by_id(&request.resource_id)
            .ok_or(BookingError::ResourceNotFound(request.resource_id))?;
        if self.store.contains_reservation(&request.id) {
            return Err(BookingError::AlreadyExists(request.id));
        }

        {
            let snapshot = self.lock_for_read(request.resource_id, rs.clone()).await?;
            check_bookable(&snapshot, &span, self.config.policy)?;
        }

        // ReservedLock
        let guard = self.lock_for_update(request.resource_id, rs).await?;
        check_bookable(&guard, &span, self.config.policy)?;
        if self.store.contains_reservation(&request.id) {
            return Err(BookingError::AlreadyExists(request.id));
        }
        // Closed history stays on the row; only bookings in force count.
        if guard.active_count() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(BookingError::LimitExceeded("too many active reservations on resource"));
        }

        // Committed
        let reservation = Reservation {
            id: request.id,
            resource_id: request.resource_id,
            requester_id: request.requester_id,
            span,
            status: ReservationStatus::Active,
            created_at: now_ms(),
        };
        let event = Event::ReservationCommitted {
            reservation: reservation.clone(),
            resource_status: ResourceStatus::Reserved,
        };
        self.persist_and_apply(guard, event).await?;
        Ok(reservation)
    }

    /// ACTIVE → CANCELLED. With `requester_id`, only the owner may cancel.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        requester_id: Option<Ulid>,
    ) -> Result<Reservation, BookingError> {
        self.close_reservation(id, requester_id, ReservationStatus::Cancelled).await
    }

    /// ACTIVE → COMPLETED.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, BookingError> {
        self.close_reservation(id, None, ReservationStatus::Completed).await
    }

    async fn close_reservation(
        &self,
        id: Ulid,
        requester_id: Option<Ulid>,
        to: ReservationStatus,
    ) -> Result<Reservation, BookingError> {
        let guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .ok_or(BookingError::ReservationNotFound(id))?
            .clone();
        if let Some(requester) = requester_id
            && current.requester_id != requester
        {
            return Err(BookingError::NotOwner(id));
        }
        if !current.is_active() {
            return Err(BookingError::InvalidTransition { id, status: current.status });
        }

        // Release the resource only if this was the last booking holding it.
        // RENTED and MAINTENANCE belong to fleet operations and stay as they are.
        let others_active = guard
            .reservations
            .iter()
            .any(|r| r.id != id && r.is_active());
        let resource_status = match guard.status {
            ResourceStatus::Reserved if !others_active => ResourceStatus::Available,
            status => status,
        };

        let event = Event::ReservationClosed {
            id,
            resource_id: current.resource_id,
            status: to,
            closed_at: now_ms(),
            resource_status,
        };
        self.persist_and_apply(guard, event).await?;

        metrics::counter!(crate::observability::RESERVATIONS_CLOSED_TOTAL, "status" => to.as_str())
            .increment(1);
        tracing::info!(
            "reservation {id} {to}; resource {} now {resource_status}",
            current.resource_id
        );
        Ok(Reservation { status: to, ..current })
    }
}
