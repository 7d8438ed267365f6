use ulid::Ulid;

use crate::model::*;

use super::Engine;

/// Read side. These lookups take no exclusive section and may observe
/// pre-transition state; callers must treat them as advisory. The write
/// paths never trust them — they re-read inside the slot's lock.
impl Engine {
    pub fn list_resources(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = self.resources.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Slots of one resource, optionally clipped to a time window, ordered
    /// by start time.
    pub fn list_slots(&self, resource_id: Ulid, window: Option<Span>) -> Vec<Slot> {
        let Some(ids) = self.resource_slots.get(&resource_id) else {
            return Vec::new();
        };
        let mut out: Vec<Slot> = ids
            .iter()
            .filter_map(|id| self.slots.get(id).map(|s| s.value().clone()))
            .filter(|s| window.as_ref().is_none_or(|w| s.span.overlaps(w)))
            .collect();
        out.sort_by_key(|s| s.span.start);
        out
    }

    pub fn get_slot(&self, slot_id: Ulid) -> Option<Slot> {
        self.slots.get(&slot_id).map(|s| s.value().clone())
    }

    pub fn get_hold(&self, hold_id: Ulid) -> Option<Hold> {
        self.holds.get(&hold_id).map(|h| h.value().clone())
    }

    pub fn get_reservation(&self, reservation_id: Ulid) -> Option<Reservation> {
        self.reservations.get(&reservation_id).map(|r| r.value().clone())
    }

    pub fn list_reservations(&self, user_id: Option<Ulid>) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| user_id.is_none_or(|uid| r.user_id == Some(uid)))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Does any Active hold other than `exclude` reference the slot?
    pub(super) fn has_active_hold(&self, slot_id: Ulid, exclude: Option<Ulid>) -> bool {
        self.slot_holds.get(&slot_id).is_some_and(|ids| {
            ids.iter().any(|id| {
                exclude != Some(*id)
                    && self.holds.get(id).is_some_and(|h| h.status == HoldStatus::Active)
            })
        })
    }

    pub(super) fn has_active_reservation(&self, slot_id: Ulid) -> bool {
        self.slot_reservations.get(&slot_id).is_some_and(|ids| {
            ids.iter()
                .any(|id| self.reservations.get(id).is_some_and(|r| r.status.is_active()))
        })
    }

    pub(super) fn has_active_reservation_excluding(&self, slot_id: Ulid, exclude: Ulid) -> bool {
        self.slot_reservations.get(&slot_id).is_some_and(|ids| {
            ids.iter().any(|id| {
                *id != exclude
                    && self.reservations.get(id).is_some_and(|r| r.status.is_active())
            })
        })
    }
}
