mod availability;
mod booking;
mod error;
mod mutations;
mod overlap;
mod queries;
mod store;
mod validate;

pub use availability::{check_bookable, BookingPolicy};
pub use booking::BookingRequest;
pub use error::BookingError;
pub use overlap::{count_overlapping, first_overlapping};
pub use store::InMemoryStore;
pub use validate::{now_ms, validate_interval};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Takes the first append, drains whatever else is already queued, then
/// fsyncs once and acknowledges every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::warn!("wal flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after an append error so a half-buffered batch does not
    // leak into the next one; every sender in this batch is told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Send one event to the group-commit writer and wait for its fsync.
async fn append_event(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), BookingError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| BookingError::StorageFailure("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| BookingError::StorageFailure("WAL writer dropped response".into()))?
        .map_err(|e| BookingError::StorageFailure(e.to_string()))
}

/// The booking engine: resource rows, reservations, and the WAL behind them.
pub struct Engine {
    pub store: Arc<InMemoryStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// Held shared by catalog writes (resources, requesters) and exclusively
    /// by compaction, so no append slips between snapshot and swap.
    compaction_gate: Arc<RwLock<()>>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Arc::new(InMemoryStore::new()),
            wal_tx,
            notify,
            config,
            compaction_gate: Arc::new(RwLock::new(())),
        };

        // Nothing else can see these rows yet, so try_write never contends.
        // blocking_write would panic here when called from async context.
        for event in &events {
            if engine.store.apply_global(event) {
                continue;
            }
            let Some(rs) = event.resource_id().and_then(|id| engine.store.get_by_id(&id)) else {
                tracing::warn!("replay: event for unknown resource skipped: {}", event.kind());
                continue;
            };
            let mut guard = rs
                .try_write()
                .map_err(|_| io::Error::other("replay: resource row unexpectedly locked"))?;
            engine.store.apply_event(&mut guard, event);
        }

        tracing::info!(
            "engine ready: {} events replayed, {} resources, {} requesters",
            events.len(),
            engine.store.resource_count(),
            engine.store.requester_count()
        );
        Ok(engine)
    }

    /// Log first, then mutate: the row only changes once the event is durable.
    ///
    /// The append and the apply run in their own task, which owns the row
    /// guard. Dropping the caller's future cannot separate the two: the task
    /// finishes, applies, and only then releases the row. The guard comes back
    /// to the caller when it is still waiting.
    pub(super) async fn persist_and_apply(
        &self,
        mut guard: OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, BookingError> {
        let wal_tx = self.wal_tx.clone();
        let store = self.store.clone();
        let notify = self.notify.clone();
        let commit = tokio::spawn(async move {
            append_event(&wal_tx, &event).await?;
            store.apply_event(&mut guard, &event);
            notify.send(guard.id, &event);
            Ok::<_, BookingError>(guard)
        });
        commit
            .await
            .map_err(|e| BookingError::StorageFailure(format!("commit task failed: {e}")))?
    }

    /// Catalog counterpart of `persist_and_apply` for events that create a
    /// resource or requester. The task holds the compaction gate until applied.
    pub(super) async fn persist_global(&self, event: Event) -> Result<(), BookingError> {
        let gate = self.compaction_gate.clone().read_owned().await;
        let wal_tx = self.wal_tx.clone();
        let store = self.store.clone();
        let notify = self.notify.clone();
        let commit = tokio::spawn(async move {
            let _gate = gate;
            append_event(&wal_tx, &event).await?;
            store.apply_global(&event);
            if let Some(id) = event.resource_id() {
                notify.send(id, &event);
            }
            Ok::<_, BookingError>(())
        });
        commit
            .await
            .map_err(|e| BookingError::StorageFailure(format!("commit task failed: {e}")))?
    }

    /// Take the exclusive row lock for `resource_id`, waiting at most
    /// `config.lock_timeout`. Dropping the returned future while it waits
    /// leaves the lock untouched.
    pub(super) async fn lock_for_update(
        &self,
        resource_id: Ulid,
        rs: SharedResourceState,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, BookingError> {
        let wait_start = Instant::now();
        match tokio::time::timeout(self.config.lock_timeout, rs.write_owned()).await {
            Ok(guard) => {
                metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
                    .record(wait_start.elapsed().as_secs_f64());
                Ok(guard)
            }
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(
                    "lock timeout on resource {resource_id} after {:?}",
                    self.config.lock_timeout
                );
                Err(BookingError::LockTimeout(resource_id))
            }
        }
    }

    /// Shared row lock with the same bounded wait, for the booking pre-check.
    pub(super) async fn lock_for_read(
        &self,
        resource_id: Ulid,
        rs: SharedResourceState,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, BookingError> {
        tokio::time::timeout(self.config.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("read lock timeout on resource {resource_id}");
                BookingError::LockTimeout(resource_id)
            })
    }

    /// Lookup reservation → resource, then take that row's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, BookingError> {
        let resource_id = self
            .store
            .resource_for_reservation(reservation_id)
            .ok_or(BookingError::ReservationNotFound(*reservation_id))?;
        let rs = self
            .store
            .get_by_id(&resource_id)
            .ok_or(BookingError::ResourceNotFound(resource_id))?;
        self.lock_for_update(resource_id, rs).await
    }
}
