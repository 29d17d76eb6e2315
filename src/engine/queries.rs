use ulid::Ulid;

use crate::model::*;

use super::overlap;
use super::{BookingError, Engine};

impl Engine {
    pub async fn get_resource(&self, id: &Ulid) -> Option<ResourceInfo> {
        let rs = self.store.get_by_id(id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    /// Every resource, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut ids = self.store.resource_ids();
        ids.sort();
        let mut infos = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(info) = self.get_resource(id).await {
                infos.push(info);
            }
        }
        infos
    }

    pub fn get_requester(&self, id: &Ulid) -> Option<RequesterInfo> {
        self.store.get_requester(id)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, BookingError> {
        let resource_id = self
            .store
            .resource_for_reservation(&id)
            .ok_or(BookingError::ReservationNotFound(id))?;
        let rs = self
            .store
            .get_by_id(&resource_id)
            .ok_or(BookingError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        guard
            .reservation(&id)
            .cloned()
            .ok_or(BookingError::ReservationNotFound(id))
    }

    /// A requester's reservations in commit order, optionally narrowed to one
    /// status. Unknown requesters simply have none.
    pub async fn find_by_requester(
        &self,
        requester_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Vec<Reservation> {
        let mut found = Vec::new();
        for (reservation_id, resource_id) in self.store.find_by_requester(&requester_id) {
            let Some(rs) = self.store.get_by_id(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(r) = guard.reservation(&reservation_id)
                && status.is_none_or(|s| r.status == s)
            {
                found.push(r.clone());
            }
        }
        found
    }

    /// All reservations on a resource (any status), ordered by start.
    pub async fn reservations_for_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<Reservation>, BookingError> {
        let rs = self
            .store
            .get_by_id(&resource_id)
            .ok_or(BookingError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    /// Number of ACTIVE reservations on `resource_id` intersecting `[start, end)`.
    pub async fn count_overlapping(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<usize, BookingError> {
        let span = Span::try_new(start, end)
            .ok_or(BookingError::InvalidInterval("start must be before end"))?;
        let rs = self
            .store
            .get_by_id(&resource_id)
            .ok_or(BookingError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(overlap::count_overlapping(&guard, &span))
    }
}
