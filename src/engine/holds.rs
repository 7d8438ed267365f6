use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// What a successful `create_hold` hands back to the caller. The token is
/// the only credential needed to confirm, so it goes to the caller and
/// nowhere else.
#[derive(Debug, Clone, Serialize)]
pub struct HoldGrant {
    pub hold_id: Ulid,
    pub token: Ulid,
    pub expires_at: Ms,
}

impl Engine {
    /// Soft-reserve a slot: gate Available → Held, mint a token, insert the
    /// hold. Exactly one concurrent caller wins; the rest get Conflict.
    ///
    /// `ttl_ms` is clamped to [MIN_HOLD_TTL_MS, MAX_HOLD_TTL_MS] and
    /// defaults to DEFAULT_HOLD_TTL_MS.
    pub async fn create_hold(
        &self,
        slot_id: Ulid,
        resource_id: Ulid,
        user_id: Option<Ulid>,
        ttl_ms: Option<Ms>,
    ) -> Result<HoldGrant, EngineError> {
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }
        let ttl = ttl_ms
            .unwrap_or(DEFAULT_HOLD_TTL_MS)
            .clamp(MIN_HOLD_TTL_MS, MAX_HOLD_TTL_MS);

        let _section = self.lock_slot(slot_id).await?;

        let prev = self.slot_status(slot_id);
        if self.transition_slot(slot_id, Some(resource_id), &[SlotStatus::Available], SlotStatus::Held)
            == 0
        {
            return Err(EngineError::Conflict(slot_id));
        }

        let hold = Hold {
            id: Ulid::new(),
            slot_id,
            user_id,
            status: HoldStatus::Active,
            token: Ulid::new(),
            expires_at: now_ms() + ttl,
        };
        let grant = HoldGrant {
            hold_id: hold.id,
            token: hold.token,
            expires_at: hold.expires_at,
        };

        // One record covers the flip and the insert; a failed append rolls
        // the flip back so memory never runs ahead of the log.
        if let Err(e) = self.persist_and_apply(Event::HoldPlaced { hold }).await {
            if let Some(prev) = prev {
                self.force_slot_status(slot_id, prev);
            }
            return Err(e);
        }
        Ok(grant)
    }

    /// Cancel a hold. Unknown or already-terminal holds are treated as
    /// already canceled — repeated cancels always succeed.
    pub async fn cancel_hold(&self, hold_id: Ulid) -> Result<(), EngineError> {
        let Some(hold) = self.holds.get(&hold_id).map(|h| h.value().clone()) else {
            return Ok(());
        };
        if hold.status.is_terminal() {
            return Ok(());
        }

        let _section = self.lock_slot(hold.slot_id).await?;

        // Re-read inside the lock; a confirm or sweep may have beaten us.
        let Some(status) = self.holds.get(&hold_id).map(|h| h.status) else {
            return Ok(());
        };
        if status.is_terminal() {
            debug!("cancel {hold_id}: already {status:?}");
            return Ok(());
        }

        self.persist_and_apply(Event::HoldStatusSet { hold_id, status: HoldStatus::Canceled })
            .await?;

        // Free the slot only when nothing else claims it.
        if !self.has_active_hold(hold.slot_id, None) && !self.has_active_reservation(hold.slot_id) {
            self.transition_and_persist(
                hold.slot_id,
                None,
                &[SlotStatus::Held],
                SlotStatus::Available,
            )
            .await?;
        }
        Ok(())
    }

    /// Validate the caller's credentials for a hold, then hand the terminal
    /// transition to `confirm`. Validation failures never mutate state.
    pub async fn confirm_hold(&self, hold_id: Ulid, token: Ulid) -> Result<Ulid, EngineError> {
        let Some(hold) = self.holds.get(&hold_id).map(|h| h.value().clone()) else {
            return Err(EngineError::NotFound(hold_id));
        };
        // An unknown hold and a wrong token are indistinguishable to the
        // caller; neither confirms which hold ids exist.
        if hold.token != token {
            return Err(EngineError::NotFound(hold_id));
        }
        if hold.status != HoldStatus::Active || hold.is_expired(now_ms()) {
            return Err(EngineError::Expired(hold_id));
        }
        self.confirm(hold_id).await
    }
}
