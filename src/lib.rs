//! slotd — a slot-reservation concurrency engine.
//!
//! Pre-materialized time slots on shared resources are reserved exactly
//! once under concurrent demand, with a tokenized hold step that survives
//! a payment round-trip, a TTL sweep that reclaims abandoned holds, and an
//! idempotency layer that makes replayed confirmations safe.

pub mod auth;
pub mod engine;
pub mod limits;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod wal;
pub mod webhook;
pub mod wire;
