use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The single compare-and-swap gate for slot status.
    ///
    /// Performs one indivisible conditional update: succeeds only if the
    /// slot's current status is a member of `from` and, when supplied, the
    /// resource reference matches. Returns the count of rows affected
    /// (0 or 1); 0 means the caller lost the transition, not that anything
    /// went wrong. Every intended status change must be gated through this
    /// method — never read a status and write it back at a distance.
    pub fn transition_slot(
        &self,
        slot_id: Ulid,
        resource_id: Option<Ulid>,
        from: &[SlotStatus],
        to: SlotStatus,
    ) -> u64 {
        match self.slots.get_mut(&slot_id) {
            Some(mut slot)
                if from.contains(&slot.status)
                    && resource_id.is_none_or(|rid| rid == slot.resource_id) =>
            {
                slot.status = to;
                1
            }
            _ => 0,
        }
    }

    pub(super) fn slot_status(&self, slot_id: Ulid) -> Option<SlotStatus> {
        self.slots.get(&slot_id).map(|s| s.status)
    }

    /// Roll back an in-memory flip whose WAL record failed to append. Only
    /// valid inside the slot's exclusive section, before the error returns.
    pub(super) fn force_slot_status(&self, slot_id: Ulid, status: SlotStatus) {
        if let Some(mut slot) = self.slots.get_mut(&slot_id) {
            slot.status = status;
        }
    }

    /// Gate a transition, then make it durable; roll back the flip if the
    /// append fails so memory never runs ahead of the log.
    pub(super) async fn transition_and_persist(
        &self,
        slot_id: Ulid,
        resource_id: Option<Ulid>,
        from: &[SlotStatus],
        to: SlotStatus,
    ) -> Result<u64, EngineError> {
        let prev = self.slot_status(slot_id);
        if self.transition_slot(slot_id, resource_id, from, to) == 0 {
            return Ok(0);
        }
        let event = Event::SlotStatusSet { slot_id, status: to };
        if let Err(e) = self.persist_and_apply(event).await {
            if let Some(prev) = prev {
                self.force_slot_status(slot_id, prev);
            }
            return Err(e);
        }
        Ok(1)
    }

    // ── Administrative transitions (outside the booking path) ──

    /// Available → Blocked. Held/Reserved slots cannot be blocked out from
    /// under their holder.
    pub async fn block_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }
        let _section = self.lock_slot(slot_id).await?;
        match self
            .transition_and_persist(slot_id, None, &[SlotStatus::Available], SlotStatus::Blocked)
            .await?
        {
            0 => Err(EngineError::Conflict(slot_id)),
            _ => Ok(()),
        }
    }

    /// Blocked → Available.
    pub async fn unblock_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }
        let _section = self.lock_slot(slot_id).await?;
        match self
            .transition_and_persist(slot_id, None, &[SlotStatus::Blocked], SlotStatus::Available)
            .await?
        {
            0 => Err(EngineError::Conflict(slot_id)),
            _ => Ok(()),
        }
    }

    /// Transition contract for external cancellation/sync flows: mark the
    /// reservation Canceled and free its slot when nothing else claims it.
    /// Canceling an already-canceled reservation is an idempotent no-op.
    pub async fn cancel_reservation(&self, reservation_id: Ulid) -> Result<(), EngineError> {
        let reservation = self
            .reservations
            .get(&reservation_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(reservation_id))?;
        if !reservation.status.is_active() {
            return Ok(());
        }

        let _section = self.lock_slot(reservation.slot_id).await?;

        // Re-read inside the lock; a concurrent cancel may have won.
        let Some(current) = self.reservations.get(&reservation_id).map(|r| r.status) else {
            return Err(EngineError::NotFound(reservation_id));
        };
        if !current.is_active() {
            return Ok(());
        }

        let slot_id = reservation.slot_id;
        let free = !self.has_active_hold(slot_id, None)
            && !self.has_active_reservation_excluding(slot_id, reservation_id);
        let prev = self.slot_status(slot_id);
        let slot_freed =
            free && self.transition_slot(slot_id, None, &[SlotStatus::Reserved], SlotStatus::Available) == 1;

        let event = Event::ReservationCanceled { reservation_id, slot_freed };
        if let Err(e) = self.persist_and_apply(event).await {
            if slot_freed && let Some(prev) = prev {
                self.force_slot_status(slot_id, prev);
            }
            return Err(e);
        }
        Ok(())
    }
}
