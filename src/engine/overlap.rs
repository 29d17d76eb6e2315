//! Overlap calculator: the single conflict predicate shared by the
//! availability pre-check and the authoritative re-check under the row lock.

use crate::model::*;

/// ACTIVE reservations on `rs` intersecting `span` (strict half-open).
/// Items borrow from `rs` only; the iterator itself also holds `span`.
pub fn active_overlapping<'a, 'b>(
    rs: &'a ResourceState,
    span: &'b Span,
) -> impl Iterator<Item = &'a Reservation> + use<'a, 'b> {
    rs.overlapping(span).filter(|r| r.is_active())
}

pub fn count_overlapping(rs: &ResourceState, span: &Span) -> usize {
    active_overlapping(rs, span).count()
}

pub fn first_overlapping<'a>(rs: &'a ResourceState, span: &Span) -> Option<&'a Reservation> {
    active_overlapping(rs, span).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn resource_with(spans: &[(Ms, Ms, ReservationStatus)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, 4, ResourceStatus::Available);
        for &(start, end, status) in spans {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource_id: rs.id,
                requester_id: Ulid::new(),
                span: Span::new(start, end),
                status,
                created_at: 0,
            });
        }
        rs
    }

    #[test]
    fn overlap_is_symmetric() {
        // Every pair of non-empty intervals with endpoints in 0..6.
        let mut spans = Vec::new();
        for s in 0..6 {
            for e in (s + 1)..=6 {
                spans.push(Span::new(s, e));
            }
        }
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
                let expected = a.start < b.end && a.end > b.start;
                assert_eq!(a.overlaps(b), expected);
            }
        }
    }

    #[test]
    fn touching_endpoints_do_not_conflict() {
        let rs = resource_with(&[(10, 11, ReservationStatus::Active)]);
        assert_eq!(count_overlapping(&rs, &Span::new(11, 12)), 0);
        assert_eq!(count_overlapping(&rs, &Span::new(9, 10)), 0);
        assert_eq!(count_overlapping(&rs, &Span::new(10, 11)), 1);
    }

    #[test]
    fn partial_overlap_conflicts() {
        let rs = resource_with(&[(10, 12, ReservationStatus::Active)]);
        let hit = first_overlapping(&rs, &Span::new(11, 13)).unwrap();
        assert_eq!(hit.span, Span::new(10, 12));
    }

    #[test]
    fn hit_outlives_query_span() {
        let rs = resource_with(&[(10, 12, ReservationStatus::Active)]);
        let hit = {
            let query = Span::new(11, 13);
            first_overlapping(&rs, &query)
        };
        assert_eq!(hit.map(|r| r.span), Some(Span::new(10, 12)));
    }

    #[test]
    fn only_active_reservations_count() {
        let rs = resource_with(&[
            (10, 20, ReservationStatus::Cancelled),
            (12, 18, ReservationStatus::Completed),
            (15, 25, ReservationStatus::Active),
            (30, 40, ReservationStatus::Active),
        ]);
        assert_eq!(count_overlapping(&rs, &Span::new(10, 14)), 0);
        assert_eq!(count_overlapping(&rs, &Span::new(10, 35)), 2);
        assert!(first_overlapping(&rs, &Span::new(25, 30)).is_none());
    }
}
