mod error;
mod holds;
mod idempotency;
mod queries;
mod reserve;
mod slot;
mod sweep;

pub use error::EngineError;
pub use holds::HoldGrant;
pub use sweep::SweepReport;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::lock::{LockTable, LockTimeout, SectionGuard};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The slot-reservation engine: all shared mutable state, the WAL writer,
/// and the per-slot exclusive sections.
///
/// Correctness rests on two primitives, used together:
/// - `transition_slot` — a single conditional update that is race-safe on
///   its own and decides the winner of any contended transition;
/// - `lock_slot` — the exclusive section that makes multi-statement
///   sequences (re-read a hold, then decide) appear atomic per slot.
///
/// Unlocked reads (the `queries` module) may observe pre-transition state
/// and are advisory only.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, Resource>,
    pub(super) slots: DashMap<Ulid, Slot>,
    pub(super) holds: DashMap<Ulid, Hold>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    /// Slot → every hold ever placed on it.
    pub(super) slot_holds: DashMap<Ulid, Vec<Ulid>>,
    /// Slot → every reservation ever created on it.
    pub(super) slot_reservations: DashMap<Ulid, Vec<Ulid>>,
    /// Resource → its slots, in creation order.
    pub(super) resource_slots: DashMap<Ulid, Vec<Ulid>>,
    /// (key, route) → memoized response.
    pub(super) idempotency: DashMap<(String, String), IdempotencyRecord>,
    pub(super) locks: LockTable,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_lock_timeout(
            wal_path,
            notify,
            Duration::from_millis(crate::limits::DEFAULT_LOCK_TIMEOUT_MS),
        )
    }

    pub fn with_lock_timeout(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        lock_timeout: Duration,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            slots: DashMap::new(),
            holds: DashMap::new(),
            reservations: DashMap::new(),
            slot_holds: DashMap::new(),
            slot_reservations: DashMap::new(),
            resource_slots: DashMap::new(),
            idempotency: DashMap::new(),
            locks: LockTable::new(lock_timeout),
            wal_tx,
            notify,
        };

        for event in &events {
            engine.apply_event(event);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call. Every runtime mutation goes
    /// through here; a failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_event(&event);
        if let Some(resource_id) = self.notify_target(&event) {
            self.notify.send(resource_id, &event);
        }
        Ok(())
    }

    /// Enter the exclusive section for one slot. The guard spans the whole
    /// mutating sequence and releases on drop.
    pub(super) async fn lock_slot(&self, slot_id: Ulid) -> Result<SectionGuard, EngineError> {
        self.locks
            .acquire(&slot_id.to_string())
            .await
            .map_err(|LockTimeout| EngineError::LockTimeout)
    }

    /// Apply an event to the in-memory state. Shared by replay and the
    /// runtime path; each event is one atomic unit.
    fn apply_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated { id, name } => {
                self.resources.insert(*id, Resource { id: *id, name: name.clone() });
                self.resource_slots.entry(*id).or_default();
            }
            Event::SlotCreated { id, resource_id, span, status } => {
                self.slots.insert(
                    *id,
                    Slot { id: *id, resource_id: *resource_id, span: *span, status: *status },
                );
                self.resource_slots.entry(*resource_id).or_default().push(*id);
            }
            Event::SlotStatusSet { slot_id, status } => {
                if let Some(mut slot) = self.slots.get_mut(slot_id) {
                    slot.status = *status;
                }
            }
            Event::HoldPlaced { hold } => {
                self.slot_holds.entry(hold.slot_id).or_default().push(hold.id);
                // Snapshot records may carry terminal holds; only an Active
                // hold pins its slot.
                if hold.status == HoldStatus::Active
                    && let Some(mut slot) = self.slots.get_mut(&hold.slot_id)
                {
                    slot.status = SlotStatus::Held;
                }
                self.holds.insert(hold.id, hold.clone());
            }
            Event::HoldStatusSet { hold_id, status } => {
                if let Some(mut hold) = self.holds.get_mut(hold_id) {
                    hold.status = *status;
                }
            }
            Event::HoldConverted { hold_id, reservation } => {
                if let Some(mut hold) = self.holds.get_mut(hold_id) {
                    hold.status = HoldStatus::Converted;
                }
                if let Some(mut slot) = self.slots.get_mut(&reservation.slot_id) {
                    slot.status = SlotStatus::Reserved;
                }
                self.slot_reservations
                    .entry(reservation.slot_id)
                    .or_default()
                    .push(reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCreated { reservation } => {
                self.slot_reservations
                    .entry(reservation.slot_id)
                    .or_default()
                    .push(reservation.id);
                // Snapshot replay: an active reservation keeps its slot pinned.
                if reservation.status.is_active()
                    && let Some(mut slot) = self.slots.get_mut(&reservation.slot_id)
                {
                    slot.status = SlotStatus::Reserved;
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCanceled { reservation_id, slot_freed } => {
                let slot_id = if let Some(mut res) = self.reservations.get_mut(reservation_id) {
                    res.status = ReservationStatus::Canceled;
                    Some(res.slot_id)
                } else {
                    None
                };
                if *slot_freed
                    && let Some(slot_id) = slot_id
                    && let Some(mut slot) = self.slots.get_mut(&slot_id)
                {
                    slot.status = SlotStatus::Available;
                }
            }
            Event::IdempotencyRecorded { record } => {
                self.idempotency
                    .insert((record.key.clone(), record.route.clone()), record.clone());
            }
        }
    }

    /// Resource whose watchers should hear about this event.
    fn notify_target(&self, event: &Event) -> Option<Ulid> {
        let slot_id = match event {
            Event::ResourceCreated { id, .. } => return Some(*id),
            Event::HoldStatusSet { hold_id, .. } => self.holds.get(hold_id)?.slot_id,
            Event::ReservationCanceled { reservation_id, .. } => {
                self.reservations.get(reservation_id)?.slot_id
            }
            Event::IdempotencyRecorded { .. } => return None,
            other => other.slot_id()?,
        };
        self.slots.get(&slot_id).map(|s| s.resource_id)
    }

    // ── Setup surface (resources and slots are materialized here, ──
    // ── outside the reservation transition path)                  ──

    pub async fn create_resource(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.resources.len() >= crate::limits::MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > crate::limits::MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(Event::ResourceCreated { id, name }).await
    }

    pub async fn create_slot(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self
            .resource_slots
            .get(&resource_id)
            .is_some_and(|s| s.len() >= crate::limits::MAX_SLOTS_PER_RESOURCE)
        {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }
        self.persist_and_apply(Event::SlotCreated {
            id,
            resource_id,
            span,
            status: SlotStatus::Available,
        })
        .await
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Terminal holds are history and are
    /// dropped; reservations and idempotency records are kept forever.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.resources.iter() {
            events.push(Event::ResourceCreated {
                id: entry.id,
                name: entry.name.clone(),
            });
        }
        for entry in self.slots.iter() {
            events.push(Event::SlotCreated {
                id: entry.id,
                resource_id: entry.resource_id,
                span: entry.span,
                status: entry.status,
            });
        }
        for entry in self.holds.iter() {
            if entry.status == HoldStatus::Active {
                events.push(Event::HoldPlaced { hold: entry.value().clone() });
            }
        }
        for entry in self.reservations.iter() {
            events.push(Event::ReservationCreated { reservation: entry.value().clone() });
        }
        for entry in self.idempotency.iter() {
            events.push(Event::IdempotencyRecorded { record: entry.value().clone() });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub(super) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("empty span"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}
