use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire operations executed. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotd_requests_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotd_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

// ── Sweep counters ──────────────────────────────────────────────

/// Counter: holds moved Active → Expired by the sweeper.
pub const HOLDS_EXPIRED_TOTAL: &str = "slotd_holds_expired_total";

/// Counter: slots freed Held → Available by the sweeper.
pub const SLOTS_FREED_TOTAL: &str = "slotd_slots_freed_total";

/// Counter: sweep runs. Labels: leader.
pub const SWEEPS_TOTAL: &str = "slotd_sweeps_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateHold { .. } => "create_hold",
        Request::ConfirmHold { .. } => "confirm_hold",
        Request::CancelHold { .. } => "cancel_hold",
        Request::Sweep { .. } => "sweep",
        Request::PaymentWebhook { .. } => "payment_webhook",
        Request::CreateResource { .. } => "create_resource",
        Request::CreateSlot { .. } => "create_slot",
        Request::BlockSlot { .. } => "block_slot",
        Request::UnblockSlot { .. } => "unblock_slot",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::ListResources => "list_resources",
        Request::ListSlots { .. } => "list_slots",
        Request::HoldStatus { .. } => "hold_status",
        Request::ListReservations { .. } => "list_reservations",
        Request::Watch { .. } => "watch",
    }
}
