use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::Outcome;

/// Route tag scoping gateway payment ids in the idempotency store, so the
/// same payment id cannot collide with a caller-supplied key on another
/// route.
pub const WEBHOOK_CONFIRM_ROUTE: &str = "webhook_confirm";

/// A verified payment-gateway notification. Signature verification happened
/// upstream; by the time an event reaches the reconciler it is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Gateway-assigned payment identifier; doubles as the idempotency key.
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn ack() -> String {
    r#"{"ok":true}"#.to_string()
}

/// Consume one gateway notification.
///
/// The returned string is the acknowledgment body, and it is always a
/// success-shaped ack — an internal failure must not trigger gateway-side
/// redelivery storms. The true outcome lives in the idempotency record and
/// the Hold/Slot state, not in the response.
pub async fn handle_payment_event(engine: &Engine, event: &PaymentEvent) -> String {
    match event.kind.as_str() {
        "payment_succeeded" => {
            let hold_id = event
                .metadata
                .get("hold_id")
                .and_then(|s| Ulid::from_string(s).ok());
            let Some(hold_id) = hold_id else {
                debug!("payment {}: no hold reference in metadata", event.id);
                return ack();
            };

            let result = engine
                .get_or_compute(&event.id, WEBHOOK_CONFIRM_ROUTE, || async {
                    match engine.confirm(hold_id).await {
                        Ok(reservation_id) => Ok((
                            format!(r#"{{"ok":true,"reservation_id":"{reservation_id}"}}"#),
                            Outcome::Succeeded,
                        )),
                        // Internal failures are retryable: record nothing so a
                        // redelivery re-executes.
                        Err(e @ (EngineError::LockTimeout | EngineError::WalError(_))) => Err(e),
                        Err(EngineError::Conflict(_)) => Ok((
                            r#"{"ok":false,"error":"NOT_AVAILABLE"}"#.to_string(),
                            Outcome::Failed,
                        )),
                        Err(_) => Ok((
                            r#"{"ok":false,"error":"HOLD_EXPIRED_OR_INVALID"}"#.to_string(),
                            Outcome::Failed,
                        )),
                    }
                })
                .await;

            match result {
                Ok((response, _)) => response,
                Err(e) => {
                    error!("webhook confirm for payment {}: {e}", event.id);
                    ack()
                }
            }
        }
        "payment_failed" => {
            // No mutation required: the hold lapses via the sweeper.
            debug!("payment {} failed; leaving hold to expire", event.id);
            ack()
        }
        other => {
            debug!("ignoring payment event type {other}");
            ack()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_webhook");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_held_slot(name: &str) -> (Engine, Ulid, crate::engine::HoldGrant) {
        let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
        let rid = Ulid::new();
        let slot_id = Ulid::new();
        engine.create_resource(rid, None).await.unwrap();
        engine
            .create_slot(slot_id, rid, Span::new(1_000_000_000_000, 1_000_000_060_000))
            .await
            .unwrap();
        let grant = engine.create_hold(slot_id, rid, None, None).await.unwrap();
        (engine, slot_id, grant)
    }

    fn succeeded(payment_id: &str, hold_id: Ulid) -> PaymentEvent {
        PaymentEvent {
            kind: "payment_succeeded".into(),
            id: payment_id.into(),
            metadata: HashMap::from([("hold_id".to_string(), hold_id.to_string())]),
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_replays_stored_response() {
        let (engine, slot_id, grant) = engine_with_held_slot("dup_delivery.wal").await;

        let event = succeeded("pay_1", grant.hold_id);
        let first = handle_payment_event(&engine, &event).await;
        let second = handle_payment_event(&engine, &event).await;

        assert_eq!(first, second, "replay must be byte-identical");
        assert_eq!(engine.list_reservations(None).len(), 1);
        assert_eq!(engine.get_slot(slot_id).unwrap().status, SlotStatus::Reserved);
    }

    #[tokio::test]
    async fn failure_event_mutates_nothing() {
        let (engine, slot_id, grant) = engine_with_held_slot("failure_event.wal").await;

        let event = PaymentEvent {
            kind: "payment_failed".into(),
            id: "pay_2".into(),
            metadata: HashMap::from([("hold_id".to_string(), grant.hold_id.to_string())]),
        };
        assert_eq!(handle_payment_event(&engine, &event).await, r#"{"ok":true}"#);

        assert_eq!(engine.get_slot(slot_id).unwrap().status, SlotStatus::Held);
        assert_eq!(engine.get_hold(grant.hold_id).unwrap().status, HoldStatus::Active);
        assert!(engine.list_reservations(None).is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_is_acked() {
        let (engine, _slot_id, _grant) = engine_with_held_slot("missing_meta.wal").await;
        let event = PaymentEvent {
            kind: "payment_succeeded".into(),
            id: "pay_3".into(),
            metadata: HashMap::new(),
        };
        assert_eq!(handle_payment_event(&engine, &event).await, r#"{"ok":true}"#);
        assert!(engine.list_reservations(None).is_empty());
    }

    #[tokio::test]
    async fn expired_hold_is_acked_and_recorded_as_failed() {
        let (engine, _slot_id, grant) = engine_with_held_slot("expired_hold.wal").await;
        engine.cancel_hold(grant.hold_id).await.unwrap();

        let event = succeeded("pay_4", grant.hold_id);
        let response = handle_payment_event(&engine, &event).await;
        assert_eq!(response, r#"{"ok":false,"error":"HOLD_EXPIRED_OR_INVALID"}"#);

        let record = engine
            .idempotency_lookup("pay_4", WEBHOOK_CONFIRM_ROUTE)
            .unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert!(engine.list_reservations(None).is_empty());
    }
}
