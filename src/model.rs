use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A bookable entity that owns slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Held,
    Reserved,
    Blocked,
}

/// One bookable time window on one resource. Status changes only go through
/// `Engine::transition_slot` — never by writing the field directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Active,
    Expired,
    Converted,
    Canceled,
}

impl HoldStatus {
    /// Expired/Converted/Canceled are terminal; only Active holds pin a slot.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Active)
    }
}

/// A time-boxed soft reservation. The token is required to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub user_id: Option<Ulid>,
    pub status: HoldStatus,
    pub token: Ulid,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl ReservationStatus {
    /// Pending and Confirmed reservations keep their slot claimed.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }
}

/// The durable, terminal booking record. Never physically removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Option<Ulid>,
    pub status: ReservationStatus,
    pub confirmed_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Memoized outcome of a keyed mutating call. The response is stored as the
/// raw JSON text so replays are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub route: String,
    pub response: String,
    pub outcome: Outcome,
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// Each record is one atomic unit: `HoldPlaced` flips the slot to Held and
/// inserts the hold; `HoldConverted` converts the hold, inserts the
/// reservation and reserves the slot. Replaying a prefix of the log never
/// leaves a half-applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
    },
    /// Carries the status so it doubles as the compaction snapshot record.
    SlotCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        status: SlotStatus,
    },
    SlotStatusSet {
        slot_id: Ulid,
        status: SlotStatus,
    },
    HoldPlaced {
        hold: Hold,
    },
    HoldStatusSet {
        hold_id: Ulid,
        status: HoldStatus,
    },
    HoldConverted {
        hold_id: Ulid,
        reservation: Reservation,
    },
    /// Compaction snapshot only — runtime reservations arrive via HoldConverted.
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCanceled {
        reservation_id: Ulid,
        slot_freed: bool,
    },
    IdempotencyRecorded {
        record: IdempotencyRecord,
    },
}

impl Event {
    /// Slot the event touches, for notification routing. Events that only
    /// name a hold or reservation are resolved by the engine before send.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { id, .. } => Some(*id),
            Event::SlotStatusSet { slot_id, .. } => Some(*slot_id),
            Event::HoldPlaced { hold } => Some(hold.slot_id),
            Event::HoldConverted { reservation, .. } => Some(reservation.slot_id),
            Event::ReservationCreated { reservation } => Some(reservation.slot_id),
            _ => None,
        }
    }
}
