use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{BookingError, Engine, WalCommand};

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        category: Option<String>,
        seats: u32,
        status: ResourceStatus,
    ) -> Result<(), BookingError> {
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(BookingError::LimitExceeded("too many resources"));
        }
        if let Some(ref c) = category
            && c.len() > MAX_CATEGORY_LEN
        {
            return Err(BookingError::LimitExceeded("category too long"));
        }
        if self.store.contains_resource(&id) {
            return Err(BookingError::AlreadyExists(id));
        }

        self.persist_global(Event::ResourceCreated { id, category, seats, status })
            .await?;
        tracing::info!("resource {id} created ({status}, {seats} seats)");
        Ok(())
    }

    pub async fn register_requester(
        &self,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), BookingError> {
        if self.store.requester_count() >= MAX_REQUESTERS {
            return Err(BookingError::LimitExceeded("too many requesters"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(BookingError::LimitExceeded("requester name too long"));
        }
        if self.store.contains_requester(&id) {
            return Err(BookingError::AlreadyExists(id));
        }

        self.persist_global(Event::RequesterRegistered { id, name }).await
    }

    /// Fleet lifecycle change (rented out, sent to maintenance, returned).
    /// Existing reservations are left as they are.
    pub async fn update_resource_status(
        &self,
        id: Ulid,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, BookingError> {
        let rs = self.store.get_by_id(&id).ok_or(BookingError::ResourceNotFound(id))?;
        let mut guard = self.lock_for_update(id, rs).await?;
        if guard.status != status {
            guard = self
                .persist_and_apply(guard, Event::ResourceStatusChanged { id, status })
                .await?;
            tracing::info!("resource {id} is now {status}");
        }
        Ok(guard.info())
    }

    /// ACTIVE reservations whose interval has ended by `now`. Rows that are
    /// locked right now are skipped and picked up on the next sweep.
    pub fn collect_elapsed_reservations(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_by_id(&id) else {
                continue;
            };
            if let Ok(guard) = rs.try_read() {
                elapsed.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.is_active() && r.span.end <= now)
                        .map(|r| r.id),
                );
            }
        }
        elapsed
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Closed reservations are kept, as history for requester lookups.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _gate = self.compaction_gate.write().await;

        let mut events: Vec<Event> = self
            .store
            .requesters()
            .into_iter()
            .map(|r| Event::RequesterRegistered { id: r.id, name: r.name })
            .collect();

        // Row writes append under the write guard, so holding every read
        // guard until the swap is done keeps the snapshot exact.
        let mut guards = Vec::new();
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_by_id(&id) else {
                continue;
            };
            guards.push(rs.read_owned().await);
        }
        let mut commits = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                category: guard.category.clone(),
                seats: guard.seats,
                status: guard.status,
            });
            commits.extend(guard.reservations.iter().map(|r| (r.clone(), guard.status)));
        }
        // Keeps per-requester listings in commit order after replay.
        commits.sort_by_key(|(r, _)| (r.created_at, r.id));
        events.extend(commits.into_iter().map(|(reservation, resource_status)| {
            Event::ReservationCommitted { reservation, resource_status }
        }));
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::StorageFailure(e.to_string()))?;
        tracing::info!("wal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
