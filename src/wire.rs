use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::auth;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::webhook::{self, PaymentEvent};

const MAX_LINE_LEN: usize = 64 * 1024;

/// One JSON object per line in, one JSON object per line out.
///
/// Mutating operations accept an optional caller-supplied idempotency key;
/// a retried key replays the stored response byte for byte.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateHold {
        slot_id: Ulid,
        resource_id: Ulid,
        user_id: Option<Ulid>,
        ttl_ms: Option<Ms>,
        idempotency_key: Option<String>,
    },
    ConfirmHold {
        hold_id: Ulid,
        token: Ulid,
        idempotency_key: Option<String>,
    },
    CancelHold {
        hold_id: Ulid,
    },
    /// Scheduler-triggered; gated by the shared sweep secret.
    Sweep {
        secret: String,
    },
    PaymentWebhook {
        event: PaymentEvent,
    },
    CreateResource {
        id: Option<Ulid>,
        name: Option<String>,
    },
    CreateSlot {
        id: Option<Ulid>,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    BlockSlot {
        slot_id: Ulid,
    },
    UnblockSlot {
        slot_id: Ulid,
    },
    CancelReservation {
        reservation_id: Ulid,
    },
    ListResources,
    ListSlots {
        resource_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    HoldStatus {
        hold_id: Ulid,
    },
    ListReservations {
        user_id: Option<Ulid>,
    },
    Watch {
        resource_id: Ulid,
    },
}

pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub sweep_secret: String,
}

fn error_body(code: &str) -> String {
    format!(r#"{{"error":"{code}"}}"#)
}

/// Map an engine error to the wire taxonomy. `hold_ctx` distinguishes the
/// hold-scoped NOT_FOUND the original callers expect.
fn engine_error_code(e: &EngineError, hold_ctx: bool) -> &'static str {
    match e {
        EngineError::NotFound(_) if hold_ctx => "HOLD_NOT_FOUND",
        EngineError::NotFound(_) => "NOT_FOUND",
        EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
        EngineError::Conflict(_) => "NOT_AVAILABLE",
        EngineError::Expired(_) => "HOLD_EXPIRED",
        EngineError::Forbidden => "FORBIDDEN",
        EngineError::LimitExceeded(_) => "INVALID_BODY",
        EngineError::LockTimeout | EngineError::WalError(_) => "SERVER_ERROR",
    }
}

/// Run a mutating computation, optionally memoized under (key, route).
/// Internal errors (lock timeout, WAL) are never memoized.
async fn run_keyed<F, Fut>(
    engine: &Engine,
    key: Option<String>,
    route: &'static str,
    compute: F,
) -> String
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(String, Outcome), EngineError>>,
{
    let result = match key {
        Some(key) => engine.get_or_compute(&key, route, compute).await,
        None => compute().await,
    };
    match result {
        Ok((body, _)) => body,
        Err(e) => error_body(engine_error_code(&e, false)),
    }
}

/// Split expected outcomes from internal failures: conflict/not-found/
/// expired become memoizable failed responses, internal errors propagate.
fn keyed_outcome(
    result: Result<String, EngineError>,
    hold_ctx: bool,
) -> Result<(String, Outcome), EngineError> {
    match result {
        Ok(body) => Ok((body, Outcome::Succeeded)),
        Err(e @ (EngineError::LockTimeout | EngineError::WalError(_))) => Err(e),
        Err(e) => Ok((error_body(engine_error_code(&e, hold_ctx)), Outcome::Failed)),
    }
}

async fn dispatch(ctx: &ServerContext, req: Request) -> String {
    let engine = &ctx.engine;
    match req {
        Request::CreateHold { slot_id, resource_id, user_id, ttl_ms, idempotency_key } => {
            run_keyed(engine, idempotency_key, "create_hold", || async move {
                keyed_outcome(
                    engine
                        .create_hold(slot_id, resource_id, user_id, ttl_ms)
                        .await
                        .map(|grant| {
                            json!({
                                "ok": true,
                                "hold_id": grant.hold_id,
                                "token": grant.token,
                                "expires_at": grant.expires_at,
                            })
                            .to_string()
                        }),
                    false,
                )
            })
            .await
        }
        Request::ConfirmHold { hold_id, token, idempotency_key } => {
            run_keyed(engine, idempotency_key, "confirm_hold", || async move {
                keyed_outcome(
                    engine
                        .confirm_hold(hold_id, token)
                        .await
                        .map(|rid| json!({ "ok": true, "reservation_id": rid }).to_string()),
                    true,
                )
            })
            .await
        }
        Request::CancelHold { hold_id } => match engine.cancel_hold(hold_id).await {
            Ok(()) => r#"{"ok":true}"#.to_string(),
            Err(e) => error_body(engine_error_code(&e, true)),
        },
        Request::Sweep { secret } => {
            if !auth::verify_secret(&ctx.sweep_secret, &secret) {
                return error_body("FORBIDDEN");
            }
            match engine.sweep(now_ms()).await {
                Ok(report) => {
                    metrics::counter!(
                        observability::SWEEPS_TOTAL,
                        "leader" => if report.leader { "true" } else { "false" }
                    )
                    .increment(1);
                    json!({
                        "ok": true,
                        "expired": report.expired,
                        "freed": report.freed,
                        "leader": report.leader,
                    })
                    .to_string()
                }
                Err(e) => error_body(engine_error_code(&e, false)),
            }
        }
        Request::PaymentWebhook { event } => webhook::handle_payment_event(engine, &event).await,
        Request::CreateResource { id, name } => {
            let id = id.unwrap_or_else(Ulid::new);
            match engine.create_resource(id, name).await {
                Ok(()) => json!({ "ok": true, "id": id }).to_string(),
                Err(e) => error_body(engine_error_code(&e, false)),
            }
        }
        Request::CreateSlot { id, resource_id, start, end } => {
            let id = id.unwrap_or_else(Ulid::new);
            if start >= end {
                return error_body("INVALID_BODY");
            }
            match engine.create_slot(id, resource_id, Span { start, end }).await {
                Ok(()) => json!({ "ok": true, "id": id }).to_string(),
                Err(e) => error_body(engine_error_code(&e, false)),
            }
        }
        Request::BlockSlot { slot_id } => match engine.block_slot(slot_id).await {
            Ok(()) => r#"{"ok":true}"#.to_string(),
            Err(e) => error_body(engine_error_code(&e, false)),
        },
        Request::UnblockSlot { slot_id } => match engine.unblock_slot(slot_id).await {
            Ok(()) => r#"{"ok":true}"#.to_string(),
            Err(e) => error_body(engine_error_code(&e, false)),
        },
        Request::CancelReservation { reservation_id } => {
            match engine.cancel_reservation(reservation_id).await {
                Ok(()) => r#"{"ok":true}"#.to_string(),
                Err(e) => error_body(engine_error_code(&e, false)),
            }
        }
        Request::ListResources => {
            json!({ "ok": true, "resources": engine.list_resources() }).to_string()
        }
        Request::ListSlots { resource_id, start, end } => {
            let window = match (start, end) {
                (Some(start), Some(end)) if start < end => Some(Span { start, end }),
                (None, None) => None,
                _ => return error_body("INVALID_BODY"),
            };
            json!({ "ok": true, "slots": engine.list_slots(resource_id, window) }).to_string()
        }
        Request::HoldStatus { hold_id } => match engine.get_hold(hold_id) {
            Some(hold) => json!({
                "ok": true,
                "hold_id": hold.id,
                "status": hold.status,
                "expires_at": hold.expires_at,
            })
            .to_string(),
            None => error_body("HOLD_NOT_FOUND"),
        },
        Request::ListReservations { user_id } => {
            json!({ "ok": true, "reservations": engine.list_reservations(user_id) }).to_string()
        }
        // Handled by the connection loop; unreachable here.
        Request::Watch { .. } => error_body("SERVER_ERROR"),
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                debug!("rejecting malformed request: {e}");
                framed.send(error_body("INVALID_BODY")).await?;
                continue;
            }
        };

        let op = observability::op_label(&req);
        let start = Instant::now();

        if let Request::Watch { resource_id } = &req {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            watch(&mut framed, &ctx, *resource_id).await?;
            continue;
        }

        let body = dispatch(&ctx, req).await;
        let status = if body.starts_with(r#"{"error""#) { "error" } else { "ok" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());

        framed.send(body).await?;
    }
    Ok(())
}

/// What watchers are allowed to see. Hold tokens are credentials and never
/// leave the `create_hold` response.
fn event_summary(event: &Event) -> Option<serde_json::Value> {
    let summary = match event {
        Event::SlotCreated { id, resource_id, span, status } => json!({
            "type": "slot_created",
            "slot_id": id,
            "resource_id": resource_id,
            "start": span.start,
            "end": span.end,
            "status": status,
        }),
        Event::SlotStatusSet { slot_id, status } => json!({
            "type": "slot_status",
            "slot_id": slot_id,
            "status": status,
        }),
        Event::HoldPlaced { hold } => json!({
            "type": "hold_placed",
            "hold_id": hold.id,
            "slot_id": hold.slot_id,
            "expires_at": hold.expires_at,
        }),
        Event::HoldStatusSet { hold_id, status } => json!({
            "type": "hold_status",
            "hold_id": hold_id,
            "status": status,
        }),
        Event::HoldConverted { hold_id, reservation } => json!({
            "type": "reserved",
            "hold_id": hold_id,
            "slot_id": reservation.slot_id,
            "reservation_id": reservation.id,
        }),
        Event::ReservationCanceled { reservation_id, slot_freed } => json!({
            "type": "reservation_canceled",
            "reservation_id": reservation_id,
            "slot_freed": slot_freed,
        }),
        Event::ResourceCreated { .. }
        | Event::ReservationCreated { .. }
        | Event::IdempotencyRecorded { .. } => return None,
    };
    Some(summary)
}

/// Stream committed events for one resource until the client sends another
/// line or disconnects.
async fn watch(
    framed: &mut Framed<TcpStream, LinesCodec>,
    ctx: &ServerContext,
    resource_id: Ulid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut rx = ctx.engine.notify.subscribe(resource_id);
    framed
        .send(json!({ "ok": true, "watching": resource_id }).to_string())
        .await?;

    loop {
        tokio::select! {
            incoming = framed.next() => {
                match incoming {
                    // Any line ends the watch; the client resumes normal requests.
                    Some(Ok(_)) => {
                        framed.send(json!({ "ok": true, "watching": false }).to_string()).await?;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(summary) = event_summary(&event) {
                            framed.send(json!({ "event": summary }).to_string()).await?;
                        }
                    }
                    // Missed events under load; watchers reconcile via listings.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("watch on {resource_id} lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}
