use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

/// Background task that completes ACTIVE reservations whose interval has
/// ended, releasing their resources.
pub async fn run_completer(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        complete_elapsed(&engine, now_ms()).await;
    }
}

/// One completion sweep. Returns how many reservations were completed.
pub async fn complete_elapsed(engine: &Engine, now: i64) -> usize {
    let mut completed = 0;
    for id in engine.collect_elapsed_reservations(now) {
        match engine.complete_reservation(id).await {
            Ok(_) => {
                completed += 1;
                info!("completed elapsed reservation {id}");
            }
            // Cancelled or completed by a client since the sweep started.
            Err(e) => tracing::debug!("completer skip {id}: {e}"),
        }
    }
    completed
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted wal after {appends} appends"),
            Err(e) => tracing::warn!("wal compaction failed: {e}"),
        }
    }
}
