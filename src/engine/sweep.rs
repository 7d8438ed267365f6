use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Named job lock for sweeper leader election. One sweep runs at a time
/// across every caller sharing this engine.
const SWEEP_JOB: &str = "sweep";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: u64,
    pub freed: u64,
    pub leader: bool,
}

impl Engine {
    /// Reclaim abandoned holds.
    ///
    /// Protocol: try-lock the sweep job; if another sweep is running,
    /// return `leader: false` — that is a normal outcome, not an error.
    /// As leader: (a) expire every Active hold past its TTL; (b) free every
    /// Held slot with no remaining Active hold and no Pending/Confirmed
    /// reservation. Each slot's fix-up runs inside that slot's exclusive
    /// section, so a concurrent confirm either wins before the sweep looks
    /// or finds the hold already Expired.
    ///
    /// Deliberately independent of `cancel_hold`: this pass must also
    /// reclaim slots whose holds died with a crashed client.
    pub async fn sweep(&self, now: Ms) -> Result<SweepReport, EngineError> {
        let Some(_leader) = self.locks.try_acquire_job(SWEEP_JOB) else {
            return Ok(SweepReport { expired: 0, freed: 0, leader: false });
        };

        let mut expired = 0u64;
        let stale: Vec<(Ulid, Ulid)> = self
            .holds
            .iter()
            .filter(|h| h.status == HoldStatus::Active && h.is_expired(now))
            .map(|h| (h.id, h.slot_id))
            .collect();
        for (hold_id, slot_id) in stale {
            let _section = self.lock_slot(slot_id).await?;
            // Re-check under the lock; a confirm may have converted it.
            let still_stale = self
                .holds
                .get(&hold_id)
                .is_some_and(|h| h.status == HoldStatus::Active && h.is_expired(now));
            if !still_stale {
                debug!("sweep skip {hold_id}: no longer stale");
                continue;
            }
            self.persist_and_apply(Event::HoldStatusSet { hold_id, status: HoldStatus::Expired })
                .await?;
            expired += 1;
        }

        let mut freed = 0u64;
        let held: Vec<Ulid> = self
            .slots
            .iter()
            .filter(|s| s.status == SlotStatus::Held)
            .map(|s| s.id)
            .collect();
        for slot_id in held {
            let _section = self.lock_slot(slot_id).await?;
            if self.has_active_hold(slot_id, None) || self.has_active_reservation(slot_id) {
                continue;
            }
            freed += self
                .transition_and_persist(slot_id, None, &[SlotStatus::Held], SlotStatus::Available)
                .await?;
        }

        metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(expired);
        metrics::counter!(crate::observability::SLOTS_FREED_TOTAL).increment(freed);
        Ok(SweepReport { expired, freed, leader: true })
    }
}
