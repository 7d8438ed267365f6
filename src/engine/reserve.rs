use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The atomic terminal transition: Hold → Reservation.
    ///
    /// This is the only code path that creates a Reservation from a Hold;
    /// the direct confirm call and the payment-webhook reconciler both land
    /// here, so the two triggers cannot drift apart.
    ///
    /// Inside the slot's exclusive section the hold is re-validated (the
    /// caller's checks ran before the lock was taken), the slot is gated
    /// {Held, Available} → Reserved — Available tolerates a sweeper having
    /// optimistically reclaimed the slot — and a single WAL record converts
    /// the hold, creates the Confirmed reservation, and reserves the slot
    /// as one unit. Any failure aborts the whole unit.
    pub async fn confirm(&self, hold_id: Ulid) -> Result<Ulid, EngineError> {
        let hold = self
            .holds
            .get(&hold_id)
            .map(|h| h.value().clone())
            .ok_or(EngineError::NotFound(hold_id))?;

        let _section = self.lock_slot(hold.slot_id).await?;

        // Re-read inside the lock: between the caller's validation and the
        // lock acquisition the hold may have expired, converted, or been
        // canceled.
        let hold = self
            .holds
            .get(&hold_id)
            .map(|h| h.value().clone())
            .ok_or(EngineError::NotFound(hold_id))?;
        let now = now_ms();
        if hold.status != HoldStatus::Active || hold.is_expired(now) {
            return Err(EngineError::Expired(hold_id));
        }

        let slot = self
            .slots
            .get(&hold.slot_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(hold.slot_id))?;

        let prev = slot.status;
        if self.transition_slot(
            hold.slot_id,
            None,
            &[SlotStatus::Held, SlotStatus::Available],
            SlotStatus::Reserved,
        ) == 0
        {
            return Err(EngineError::Conflict(hold.slot_id));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            slot_id: hold.slot_id,
            resource_id: slot.resource_id,
            user_id: hold.user_id,
            status: ReservationStatus::Confirmed,
            confirmed_at: Some(now),
        };
        let reservation_id = reservation.id;

        let event = Event::HoldConverted { hold_id, reservation };
        if let Err(e) = self.persist_and_apply(event).await {
            self.force_slot_status(hold.slot_id, prev);
            return Err(e);
        }
        Ok(reservation_id)
    }
}
