use crate::model::Ms;

// ── Hold TTL policy ─────────────────────────────────────────────

/// Default hold lifetime when the caller does not supply one.
pub const DEFAULT_HOLD_TTL_MS: Ms = 120_000;

/// Callers may shorten a hold down to one second.
pub const MIN_HOLD_TTL_MS: Ms = 1_000;

/// Callers may stretch a hold up to fifteen minutes.
pub const MAX_HOLD_TTL_MS: Ms = 900_000;

// ── Exclusive sections ──────────────────────────────────────────

/// Width of the lock namespace. Keys hash into this range; a collision only
/// over-serializes two unrelated slots, it never loses exclusion.
pub const LOCK_STRIPES: usize = 1024;

/// A lock wait longer than this aborts the whole operation.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

// ── Entity limits ───────────────────────────────────────────────

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_SLOTS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

// ── Timestamp sanity bounds ─────────────────────────────────────

/// 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single slot never spans more than 7 days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;
