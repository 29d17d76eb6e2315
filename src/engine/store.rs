use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::overlap;
use super::SharedResourceState;

/// Resource Store + Reservation Store.
///
/// Each resource row is an `Arc<RwLock<ResourceState>>`; holding its write
/// guard is the row lock (`SELECT ... FOR UPDATE`). Row-level writes
/// (`update_status`, `insert`, `close`) take `&mut ResourceState`, so they can
/// only be called by someone holding that guard.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    requesters: DashMap<Ulid, RequesterInfo>,
    /// Reverse lookup: reservation id → resource id.
    reservation_to_resource: DashMap<Ulid, Ulid>,
    /// Requester id → reservation ids, in commit order.
    by_requester: DashMap<Ulid, Vec<Ulid>>,
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
            requesters: DashMap::new(),
            reservation_to_resource: DashMap::new(),
            by_requester: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_by_id(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, state: ResourceState) {
        self.resources
            .insert(state.id, std::sync::Arc::new(tokio::sync::RwLock::new(state)));
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    pub fn update_status(&self, rs: &mut ResourceState, status: ResourceStatus) {
        rs.status = status;
    }

    // ── Requesters ───────────────────────────────────────────

    pub fn requester_count(&self) -> usize {
        self.requesters.len()
    }

    pub fn contains_requester(&self, id: &Ulid) -> bool {
        self.requesters.contains_key(id)
    }

    pub fn get_requester(&self, id: &Ulid) -> Option<RequesterInfo> {
        self.requesters.get(id).map(|e| e.value().clone())
    }

    pub fn insert_requester(&self, info: RequesterInfo) {
        self.requesters.insert(info.id, info);
    }

    pub fn requesters(&self) -> Vec<RequesterInfo> {
        self.requesters.iter().map(|e| e.value().clone()).collect()
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn contains_reservation(&self, id: &Ulid) -> bool {
        self.reservation_to_resource.contains_key(id)
    }

    pub fn resource_for_reservation(&self, id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource.get(id).map(|e| *e.value())
    }

    pub fn insert(&self, rs: &mut ResourceState, reservation: Reservation) {
        self.reservation_to_resource
            .insert(reservation.id, reservation.resource_id);
        self.by_requester
            .entry(reservation.requester_id)
            .or_default()
            .push(reservation.id);
        rs.insert_reservation(reservation);
    }

    pub fn count_overlapping(&self, rs: &ResourceState, span: &Span) -> usize {
        overlap::count_overlapping(rs, span)
    }

    /// `(reservation_id, resource_id)` pairs for a requester, in commit order.
    pub fn find_by_requester(&self, requester_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        let Some(ids) = self.by_requester.get(requester_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.resource_for_reservation(id).map(|rid| (*id, rid)))
            .collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that creates a top-level entity (no row lock involved).
    /// Returns `false` if the event is row-level and must go through `apply_event`.
    pub fn apply_global(&self, event: &Event) -> bool {
        match event {
            Event::ResourceCreated { id, category, seats, status } => {
                self.insert_resource(ResourceState::new(*id, category.clone(), *seats, *status));
                true
            }
            Event::RequesterRegistered { id, name } => {
                self.insert_requester(RequesterInfo { id: *id, name: name.clone() });
                true
            }
            _ => false,
        }
    }

    /// Apply a row-level event. The caller holds the row's write guard.
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceStatusChanged { status, .. } => self.update_status(rs, *status),
            Event::ReservationCommitted { reservation, resource_status } => {
                self.insert(rs, reservation.clone());
                self.update_status(rs, *resource_status);
            }
            Event::ReservationClosed { id, status, resource_status, .. } => {
                if let Some(r) = rs.reservation_mut(id) {
                    r.status = *status;
                }
                self.update_status(rs, *resource_status);
            }
            Event::ResourceCreated { .. } | Event::RequesterRegistered { .. } => {}
        }
    }
}
