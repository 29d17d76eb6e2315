use std::collections::HashSet;
use std::str::FromStr;

use ulid::Ulid;

use crate::model::*;

use super::overlap::first_overlapping;
use super::{BookingError, Engine};

/// Which resource statuses admit a new booking.
///
/// `SingleUnit` treats a resource as wholly free or wholly taken: once one
/// booking lands the resource is RESERVED and takes no more until that
/// booking is closed. `MultiSlot` also admits RESERVED resources, so disjoint
/// intervals can coexist. RENTED and MAINTENANCE admit nothing either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookingPolicy {
    #[default]
    SingleUnit,
    MultiSlot,
}

impl BookingPolicy {
    pub fn admits(self, status: ResourceStatus) -> bool {
        match status {
            ResourceStatus::Available => true,
            ResourceStatus::Reserved => self == BookingPolicy::MultiSlot,
            ResourceStatus::Rented | ResourceStatus::Maintenance => false,
        }
    }
}

impl FromStr for BookingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "single_unit" => Ok(BookingPolicy::SingleUnit),
            "multi" | "multi_slot" => Ok(BookingPolicy::MultiSlot),
            other => Err(format!("unknown booking policy: {other}")),
        }
    }
}

/// Can `span` be booked on `rs` right now?
///
/// Order matters: an out-of-service resource is unavailable whatever its
/// history, a colliding ACTIVE reservation is reported as the conflict it is,
/// and only then does the policy get a say about RESERVED.
pub fn check_bookable(
    rs: &ResourceState,
    span: &Span,
    policy: BookingPolicy,
) -> Result<(), BookingError> {
    let unavailable = || BookingError::ResourceUnavailable { id: rs.id, status: rs.status };
    if rs.status.is_out_of_service() {
        return Err(unavailable());
    }
    if let Some(conflict) = first_overlapping(rs, span) {
        return Err(BookingError::OverlapConflict(conflict.id));
    }
    if !policy.admits(rs.status) {
        return Err(unavailable());
    }
    Ok(())
}

impl Engine {
    /// Is `resource_id` bookable for `[start, end)`? Read-only. Unknown
    /// resources and malformed intervals are simply not available.
    pub async fn check_availability(&self, resource_id: Ulid, start: Ms, end: Ms) -> bool {
        let Some(span) = Span::try_new(start, end) else {
            return false;
        };
        let Some(rs) = self.store.get_by_id(&resource_id) else {
            return false;
        };
        let guard = rs.read().await;
        check_bookable(&guard, &span, self.config.policy).is_ok()
    }

    /// The subset of `candidates` bookable for `[start, end)`, in input order.
    pub async fn filter_available(&self, candidates: &[Ulid], start: Ms, end: Ms) -> Vec<Ulid> {
        let Some(span) = Span::try_new(start, end) else {
            return Vec::new();
        };
        let mut free = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(rs) = self.store.get_by_id(id) else {
                continue;
            };
            let guard = rs.read().await;
            if check_bookable(&guard, &span, self.config.policy).is_ok() {
                free.push(*id);
            }
        }
        free
    }

    /// Catalog-style lookup: resources matching `filter` that are bookable
    /// for `[start, end)`. Explicit ids keep their order; otherwise by id.
    pub async fn available_resources(
        &self,
        filter: &ResourceFilter,
        start: Ms,
        end: Ms,
    ) -> Vec<ResourceInfo> {
        let candidates: Vec<ResourceInfo> = match &filter.ids {
            Some(ids) => {
                let mut infos = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(info) = self.get_resource(id).await {
                        infos.push(info);
                    }
                }
                infos
            }
            None => self.list_resources().await,
        };
        let candidate_ids: Vec<Ulid> = candidates
            .iter()
            .filter(|info| filter.matches(info))
            .map(|info| info.id)
            .collect();
        let free: HashSet<Ulid> =
            self.filter_available(&candidate_ids, start, end).await.into_iter().collect();
        candidates
            .into_iter()
            .filter(|info| free.contains(&info.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(status: ResourceStatus, active: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, 4, status);
        for &(start, end) in active {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource_id: rs.id,
                requester_id: Ulid::new(),
                span: Span::new(start, end),
                status: ReservationStatus::Active,
                created_at: 0,
            });
        }
        rs
    }

    #[test]
    fn policy_admission() {
        use ResourceStatus::*;
        let single = BookingPolicy::SingleUnit;
        let multi = BookingPolicy::MultiSlot;
        assert!(single.admits(Available) && multi.admits(Available));
        assert!(!single.admits(Reserved) && multi.admits(Reserved));
        for s in [Rented, Maintenance] {
            assert!(!single.admits(s) && !multi.admits(s));
        }
        assert_eq!("multi".parse::<BookingPolicy>(), Ok(BookingPolicy::MultiSlot));
        assert_eq!(BookingPolicy::default(), BookingPolicy::SingleUnit);
    }

    #[test]
    fn maintenance_wins_over_conflict() {
        let rs = resource(ResourceStatus::Maintenance, &[(10, 20)]);
        let err = check_bookable(&rs, &Span::new(15, 25), BookingPolicy::MultiSlot).unwrap_err();
        assert!(matches!(
            err,
            BookingError::ResourceUnavailable { status: ResourceStatus::Maintenance, .. }
        ));
    }

    #[test]
    fn conflict_reported_before_reserved_status() {
        let rs = resource(ResourceStatus::Reserved, &[(10, 20)]);
        let conflict_id = rs.reservations[0].id;
        assert_eq!(
            check_bookable(&rs, &Span::new(15, 25), BookingPolicy::SingleUnit),
            Err(BookingError::OverlapConflict(conflict_id))
        );
    }

    #[test]
    fn reserved_disjoint_depends_on_policy() {
        let rs = resource(ResourceStatus::Reserved, &[(10, 20)]);
        let later = Span::new(20, 30);
        assert!(matches!(
            check_bookable(&rs, &later, BookingPolicy::SingleUnit),
            Err(BookingError::ResourceUnavailable { .. })
        ));
        assert!(check_bookable(&rs, &later, BookingPolicy::MultiSlot).is_ok());
    }
}
