use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC), the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input: `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict half-open overlap. Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Operational state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    Reserved,
    Rented,
    Maintenance,
}

impl ResourceStatus {
    /// Rented and in-maintenance resources cannot take any booking.
    pub fn is_out_of_service(self) -> bool {
        matches!(self, ResourceStatus::Rented | ResourceStatus::Maintenance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Available => "AVAILABLE",
            ResourceStatus::Reserved => "RESERVED",
            ResourceStatus::Rented => "RENTED",
            ResourceStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(ResourceStatus::Available),
            "RESERVED" => Ok(ResourceStatus::Reserved),
            "RENTED" => Ok(ResourceStatus::Rented),
            "MAINTENANCE" => Ok(ResourceStatus::Maintenance),
            other => Err(format!("unknown resource status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(ReservationStatus::Active),
            "CANCELLED" | "CANCELED" => Ok(ReservationStatus::Cancelled),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// A committed claim on one resource for one half-open interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// One resource row: descriptive attributes, status, and its reservations.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub category: Option<String>,
    /// Seating capacity. Descriptive only; booking never looks at it.
    pub seats: u32,
    pub status: ResourceStatus,
    /// All reservations (any status), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, category: Option<String>, seats: u32, status: ResourceStatus) -> Self {
        Self {
            id,
            category,
            seats,
            status,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations of any status whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.overlaps(query))
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            category: self.category.clone(),
            seats: self.seats,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

/// Flat event types. This is the WAL record format.
///
/// A booking is a single `ReservationCommitted` record carrying both the new
/// reservation and the resource status it leaves behind, so the two writes
/// are durable together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        category: Option<String>,
        seats: u32,
        status: ResourceStatus,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: ResourceStatus,
    },
    RequesterRegistered {
        id: Ulid,
        name: Option<String>,
    },
    ReservationCommitted {
        reservation: Reservation,
        resource_status: ResourceStatus,
    },
    ReservationClosed {
        id: Ulid,
        resource_id: Ulid,
        status: ReservationStatus,
        closed_at: Ms,
        resource_status: ResourceStatus,
    },
}

impl Event {
    /// The resource row this event mutates, if any.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceCreated { id, .. } | Event::ResourceStatusChanged { id, .. } => {
                Some(*id)
            }
            Event::ReservationCommitted { reservation, .. } => Some(reservation.resource_id),
            Event::ReservationClosed { resource_id, .. } => Some(*resource_id),
            Event::RequesterRegistered { .. } => None,
        }
    }

    /// Short name used for notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ResourceCreated { .. } => "resource_created",
            Event::ResourceStatusChanged { .. } => "resource_status_changed",
            Event::RequesterRegistered { .. } => "requester_registered",
            Event::ReservationCommitted { .. } => "reservation_committed",
            Event::ReservationClosed { .. } => "reservation_closed",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub category: Option<String>,
    pub seats: u32,
    pub status: ResourceStatus,
}

/// Attribute filter applied before availability in catalog-style lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub ids: Option<Vec<Ulid>>,
    pub min_seats: Option<u32>,
    pub category: Option<String>,
}

impl ResourceFilter {
    pub fn matches(&self, info: &ResourceInfo) -> bool {
        self.min_seats.is_none_or(|n| info.seats >= n)
            && self
                .category
                .as_ref()
                .is_none_or(|c| info.category.as_deref() == Some(c.as_str()))
    }
}
