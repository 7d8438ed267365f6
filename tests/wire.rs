use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use slotd::engine::Engine;
use slotd::notify::NotifyHub;
use slotd::wire::{self, ServerContext};

const SWEEP_SECRET: &str = "cron-secret";
const SPAN_START: i64 = 1_700_000_000_000;
const SPAN_END: i64 = 1_700_000_060_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<ServerContext>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine =
        Arc::new(Engine::new(dir.join("slotd.wal"), Arc::new(NotifyHub::new())).unwrap());
    let ctx = Arc::new(ServerContext { engine, sweep_secret: SWEEP_SECRET.into() });

    let accept_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let ctx = accept_ctx.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, ctx).await;
            });
        }
    });

    (addr, ctx)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self { reader: BufReader::new(read), writer }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv_raw(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        assert!(n > 0, "server closed the connection");
        line.trim_end().to_string()
    }

    /// Send a request, return the raw response line.
    async fn call_raw(&mut self, req: Value) -> String {
        self.send_raw(&req.to_string()).await;
        self.recv_raw().await
    }

    async fn call(&mut self, req: Value) -> Value {
        serde_json::from_str(&self.call_raw(req).await).unwrap()
    }
}

/// Create a resource with one slot, returning (resource_id, slot_id).
async fn seed(client: &mut Client) -> (String, String) {
    let resource = client.call(json!({"op": "create_resource", "name": "Court 1"})).await;
    assert_eq!(resource["ok"], true);
    let resource_id = resource["id"].as_str().unwrap().to_string();

    let slot = client
        .call(json!({
            "op": "create_slot",
            "resource_id": resource_id,
            "start": SPAN_START,
            "end": SPAN_END,
        }))
        .await;
    assert_eq!(slot["ok"], true);
    let slot_id = slot["id"].as_str().unwrap().to_string();

    (resource_id, slot_id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn hold_then_confirm_end_to_end() {
    let (addr, ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    let hold = client
        .call(json!({
            "op": "create_hold",
            "slot_id": slot_id,
            "resource_id": resource_id,
            "user_id": Ulid::new().to_string(),
        }))
        .await;
    assert_eq!(hold["ok"], true);
    let hold_id = hold["hold_id"].as_str().unwrap();
    let token = hold["token"].as_str().unwrap();
    assert!(hold["expires_at"].as_i64().unwrap() > 0);

    let confirmed = client
        .call(json!({"op": "confirm_hold", "hold_id": hold_id, "token": token}))
        .await;
    assert_eq!(confirmed["ok"], true);
    assert!(confirmed["reservation_id"].is_string());

    let slots = client
        .call(json!({"op": "list_slots", "resource_id": resource_id}))
        .await;
    assert_eq!(slots["slots"][0]["status"], "Reserved");

    assert_eq!(ctx.engine.list_reservations(None).len(), 1);
}

#[tokio::test]
async fn contended_slot_returns_not_available() {
    let (addr, _ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    let first = client
        .call(json!({"op": "create_hold", "slot_id": slot_id, "resource_id": resource_id}))
        .await;
    assert_eq!(first["ok"], true);

    // A second client racing for the same slot loses cleanly.
    let mut rival = Client::connect(addr).await;
    let second = rival
        .call(json!({"op": "create_hold", "slot_id": slot_id, "resource_id": resource_id}))
        .await;
    assert_eq!(second["error"], "NOT_AVAILABLE");
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (addr, _ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    client.send_raw("this is not json").await;
    assert_eq!(client.recv_raw().await, r#"{"error":"INVALID_BODY"}"#);

    // Unknown op
    let response = client.call(json!({"op": "frobnicate"})).await;
    assert_eq!(response["error"], "INVALID_BODY");

    // The connection survives and keeps serving.
    let listing = client.call(json!({"op": "list_resources"})).await;
    assert_eq!(listing["ok"], true);
}

#[tokio::test]
async fn sweep_is_secret_gated() {
    let (addr, _ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let denied = client.call(json!({"op": "sweep", "secret": "wrong"})).await;
    assert_eq!(denied["error"], "FORBIDDEN");

    let allowed = client.call(json!({"op": "sweep", "secret": SWEEP_SECRET})).await;
    assert_eq!(allowed["ok"], true);
    assert_eq!(allowed["leader"], true);
    assert_eq!(allowed["expired"], 0);
    assert_eq!(allowed["freed"], 0);
}

#[tokio::test]
async fn idempotency_key_replays_identical_bytes() {
    let (addr, ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    let req = json!({
        "op": "create_hold",
        "slot_id": slot_id,
        "resource_id": resource_id,
        "idempotency_key": "retry-42",
    });
    let first = client.call_raw(req.clone()).await;
    let second = client.call_raw(req).await;

    assert_eq!(first, second, "retried response must be byte-identical");
    // One hold underneath, not two.
    let first: Value = serde_json::from_str(&first).unwrap();
    let hold_id = Ulid::from_string(first["hold_id"].as_str().unwrap()).unwrap();
    assert!(ctx.engine.get_hold(hold_id).is_some());
    let slot = ctx.engine.get_slot(Ulid::from_string(&slot_id).unwrap()).unwrap();
    assert_eq!(slot.status, slotd::model::SlotStatus::Held);
}

#[tokio::test]
async fn duplicate_webhook_deliveries_create_one_reservation() {
    let (addr, ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    let hold = client
        .call(json!({"op": "create_hold", "slot_id": slot_id, "resource_id": resource_id}))
        .await;
    let hold_id = hold["hold_id"].as_str().unwrap();

    let webhook = json!({
        "op": "payment_webhook",
        "event": {
            "type": "payment_succeeded",
            "id": "pi_12345",
            "metadata": {"hold_id": hold_id},
        },
    });
    let first = client.call_raw(webhook.clone()).await;
    let second = client.call_raw(webhook).await;

    assert_eq!(first, second);
    let body: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(ctx.engine.list_reservations(None).len(), 1);
}

#[tokio::test]
async fn expired_hold_confirm_fails_after_sweep() {
    let (addr, _ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    // Minimum TTL, then wait it out.
    let hold = client
        .call(json!({
            "op": "create_hold",
            "slot_id": slot_id,
            "resource_id": resource_id,
            "ttl_ms": 1,
        }))
        .await;
    assert_eq!(hold["ok"], true);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let swept = client.call(json!({"op": "sweep", "secret": SWEEP_SECRET})).await;
    assert_eq!(swept["expired"], 1);
    assert_eq!(swept["freed"], 1);

    let confirm = client
        .call(json!({
            "op": "confirm_hold",
            "hold_id": hold["hold_id"],
            "token": hold["token"],
        }))
        .await;
    assert_eq!(confirm["error"], "HOLD_EXPIRED");

    // The slot went back on the market.
    let slots = client
        .call(json!({"op": "list_slots", "resource_id": resource_id}))
        .await;
    assert_eq!(slots["slots"][0]["status"], "Available");
}

#[tokio::test]
async fn watch_streams_slot_transitions() {
    let (addr, _ctx) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (resource_id, slot_id) = seed(&mut client).await;

    let mut watcher = Client::connect(addr).await;
    let opened = watcher.call(json!({"op": "watch", "resource_id": resource_id})).await;
    assert_eq!(opened["ok"], true);

    let hold = client
        .call(json!({"op": "create_hold", "slot_id": slot_id, "resource_id": resource_id}))
        .await;
    assert_eq!(hold["ok"], true);

    let event: Value = serde_json::from_str(&watcher.recv_raw().await).unwrap();
    assert_eq!(event["event"]["type"], "hold_placed", "got {event}");
    assert_eq!(event["event"]["slot_id"], slot_id);
    // Tokens are credentials; watchers never see them.
    assert!(event["event"]["token"].is_null());
}
