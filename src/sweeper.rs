use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::model::now_ms;

/// Background task that periodically reclaims expired holds. The same
/// sweep is reachable through the wire for external schedulers; the job
/// lock makes the two callers take turns instead of racing.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.sweep(now_ms()).await {
            Ok(report) if report.leader => {
                if report.expired > 0 || report.freed > 0 {
                    info!("sweep: expired {} holds, freed {} slots", report.expired, report.freed);
                }
            }
            Ok(_) => {
                tracing::debug!("sweep skipped: another run holds the job lock");
            }
            Err(e) => {
                warn!("sweep failed: {e}");
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_hold() {
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(test_wal_path("reclaim.wal"), notify).unwrap());

        let rid = Ulid::new();
        let slot_id = Ulid::new();
        engine.create_resource(rid, None).await.unwrap();
        engine
            .create_slot(slot_id, rid, Span::new(1_000_000_000_000, 1_000_000_060_000))
            .await
            .unwrap();

        // Minimum TTL, then sweep as if the TTL has long passed.
        let grant = engine.create_hold(slot_id, rid, None, Some(1)).await.unwrap();
        let report = engine.sweep(grant.expires_at + 1).await.unwrap();

        assert!(report.leader);
        assert_eq!(report.expired, 1);
        assert_eq!(report.freed, 1);
        assert_eq!(engine.get_hold(grant.hold_id).unwrap().status, HoldStatus::Expired);
        assert_eq!(engine.get_slot(slot_id).unwrap().status, SlotStatus::Available);

        // Second sweep finds nothing left to do.
        let again = engine.sweep(grant.expires_at + 2).await.unwrap();
        assert_eq!((again.expired, again.freed), (0, 0));
    }
}
