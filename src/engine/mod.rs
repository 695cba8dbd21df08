mod batch;
mod error;
mod intake;
mod matcher;
mod queries;
mod release;
mod rooms;
mod saga;
#[cfg(test)]
mod tests;
mod waitlist;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::payment::PaymentInitiator;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub(crate) type SharedRequest = Arc<RwLock<RoomRequest>>;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
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

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_and_respond(journal: &mut Journal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    journal: &mut Journal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
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

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

/// The allocation engine for one hostel: capacity ledger, request store,
/// allocation history, waitlist, and the journal they persist through.
pub struct Engine {
    pub(crate) rooms: DashMap<Ulid, SharedRoomState>,
    pub(crate) requesters: DashMap<Ulid, Requester>,
    pub(crate) requests: DashMap<Ulid, SharedRequest>,
    pub(crate) allocations: DashMap<Ulid, Allocation>,
    pub(crate) batches: DashMap<Ulid, BatchRecord>,
    pub(crate) waitlist: DashMap<Ulid, WaitlistEntry>,
    /// requester → request currently blocking a new submission
    pub(crate) active_request: DashMap<Ulid, Ulid>,
    /// requester → active allocation. Authoritative "is housed" index; the
    /// requester's `room_id` pointer is only a cache of this.
    pub(crate) active_allocation: DashMap<Ulid, Ulid>,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(crate) payments: Arc<dyn PaymentInitiator>,
}

impl Engine {
    pub fn new(
        journal_path: PathBuf,
        notify: Arc<NotifyHub>,
        payments: Arc<dyn PaymentInitiator>,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            requesters: DashMap::new(),
            requests: DashMap::new(),
            allocations: DashMap::new(),
            batches: DashMap::new(),
            waitlist: DashMap::new(),
            active_request: DashMap::new(),
            active_allocation: DashMap::new(),
            journal_tx,
            notify,
            payments,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context (e.g. lazy hostel
        // creation).
        for event in &events {
            match event {
                Event::RoomUpdated { id, .. }
                | Event::RoomMaintenanceSet { id, .. }
                | Event::RoomOccupancySet { id, .. } => {
                    if let Some(entry) = engine.rooms.get(id) {
                        let rs = entry.value().clone();
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        Self::apply_to_room(&mut guard, event);
                    }
                }
                Event::RequestTransitioned { id, .. } => {
                    if let Some(entry) = engine.requests.get(id) {
                        let arc = entry.value().clone();
                        let mut guard = arc.try_write().expect("replay: uncontended write");
                        Self::apply_transition(&mut guard, event);
                        let snapshot = guard.clone();
                        drop(guard);
                        engine.reindex_request(&snapshot);
                    }
                }
                Event::RequestRescored { id, priority_score } => {
                    if let Some(entry) = engine.requests.get(id) {
                        let arc = entry.value().clone();
                        arc.try_write()
                            .expect("replay: uncontended write")
                            .priority_score = *priority_score;
                    }
                }
                other => engine.apply_record(other),
            }
        }

        Ok(engine)
    }

    /// Write event to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    // ── Lookup helpers ───────────────────────────────────────

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn room(&self, id: &Ulid) -> Result<SharedRoomState, EngineError> {
        self.get_room(id).ok_or(EngineError::NotFound(*id))
    }

    pub(crate) fn request_arc(&self, id: &Ulid) -> Result<SharedRequest, EngineError> {
        self.requests
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(crate) fn requester(&self, id: &Ulid) -> Result<Requester, EngineError> {
        self.requesters
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// Authoritative housing check against the allocation store. The
    /// denormalized pointer is only consulted to detect drift, never
    /// trusted on its own.
    pub(crate) fn housed_in(&self, requester_id: &Ulid) -> Option<Ulid> {
        let active = self.active_allocation.get(requester_id).map(|e| *e.value());
        if active.is_none()
            && let Some(r) = self.requesters.get(requester_id)
            && r.room_id.is_some()
        {
            tracing::warn!(
                requester = %requester_id,
                "room pointer set without an active allocation; treating as unhoused"
            );
        }
        active
    }

    // ── Persist + apply ──────────────────────────────────────

    /// Journal-append + apply + notify in one call, for record-level events
    /// that need no lock beyond the map shard (rooms map membership,
    /// requesters, submissions, allocations, waitlist, batches).
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        self.apply_record(event);
        self.notify.publish(event);
        Ok(())
    }

    /// Journal-append + apply + notify for room-state mutations. The caller
    /// holds the room's write lock, so the availability check it just made
    /// and this write are atomic with respect to other allocators.
    pub(super) async fn persist_and_apply_room(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        Self::apply_to_room(rs, event);
        self.notify.publish(event);
        Ok(())
    }

    /// Validate and persist a request status transition while holding the
    /// request's write lock. The expected-status check, the transition-table
    /// check, and the write happen under one lock, so concurrent processors
    /// of the same request serialize here. Returns the previous status.
    pub(crate) async fn transition_request(
        &self,
        id: Ulid,
        expected: &[RequestStatus],
        event: Event,
    ) -> Result<RequestStatus, EngineError> {
        let Event::RequestTransitioned { status: next, .. } = &event else {
            unreachable!("transition_request called with a non-transition event")
        };
        let next = *next;
        let req_arc = self.request_arc(&id)?;
        let mut guard = req_arc.write().await;
        if !expected.contains(&guard.status) || !guard.status.can_transition_to(next) {
            return Err(EngineError::InvalidState {
                id,
                status: guard.status,
            });
        }
        let prev = guard.status;
        self.journal_append(&event).await?;
        Self::apply_transition(&mut guard, &event);
        let snapshot = guard.clone();
        drop(guard);
        self.reindex_request(&snapshot);
        self.notify.publish(&event);
        tracing::info!(request = %id, from = %prev, to = %next, "request transitioned");
        Ok(prev)
    }

    /// Refresh a request's priority score (batch runs do this before
    /// ordering, so waiting requests keep climbing).
    pub(crate) async fn rescore_request(&self, id: Ulid, score: i64) -> Result<(), EngineError> {
        let req_arc = self.request_arc(&id)?;
        let mut guard = req_arc.write().await;
        if guard.priority_score == score {
            return Ok(());
        }
        let event = Event::RequestRescored {
            id,
            priority_score: score,
        };
        self.journal_append(&event).await?;
        guard.priority_score = score;
        Ok(())
    }

    // ── Event application ────────────────────────────────────

    pub(super) fn apply_to_room(rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomUpdated {
                number,
                floor,
                room_type,
                capacity,
                ..
            } => {
                rs.number = number.clone();
                rs.floor = *floor;
                rs.room_type = *room_type;
                rs.capacity = *capacity;
            }
            Event::RoomMaintenanceSet { maintenance, .. } => {
                rs.maintenance = *maintenance;
            }
            Event::RoomOccupancySet { occupied, .. } => {
                rs.occupied = *occupied;
            }
            _ => unreachable!("not a room-state event"),
        }
    }

    pub(super) fn apply_transition(req: &mut RoomRequest, event: &Event) {
        let Event::RequestTransitioned {
            status,
            processed_at,
            processed_by,
            room_id,
            note,
            ..
        } = event
        else {
            unreachable!("not a transition event")
        };
        req.status = *status;
        req.processed_at = *processed_at;
        req.processed_by = *processed_by;
        req.allocated_room_id = *room_id;
        if note.is_some() {
            req.note = note.clone();
        }
    }

    pub(super) fn reindex_request(&self, req: &RoomRequest) {
        if req.status.blocks_new_request() {
            self.active_request.insert(req.requester_id, req.id);
        } else {
            self.active_request
                .remove_if(&req.requester_id, |_, v| *v == req.id);
        }
    }

    /// Apply a record-level event to the in-memory maps. Room-state changes
    /// and request transitions never come through here outside replay; they
    /// go through the lock-holding paths above.
    pub(super) fn apply_record(&self, event: &Event) {
        match event {
            Event::RoomAdded {
                id,
                number,
                floor,
                room_type,
                capacity,
            } => {
                let rs = RoomState::new(*id, number.clone(), *floor, *room_type, *capacity);
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::RoomRemoved { id } => {
                self.rooms.remove(id);
            }
            Event::RequesterRegistered {
                id,
                name,
                role,
                registered_at,
            } => {
                self.requesters.insert(
                    *id,
                    Requester {
                        id: *id,
                        name: name.clone(),
                        role: *role,
                        registered_at: *registered_at,
                        room_id: None,
                    },
                );
            }
            Event::RequesterPointerSet { id, room_id } => {
                if let Some(mut r) = self.requesters.get_mut(id) {
                    r.room_id = *room_id;
                }
            }
            Event::RequestSubmitted {
                id,
                requester_id,
                preferred_type,
                preferred_floor,
                priority_score,
                created_at,
                expires_at,
                note,
            } => {
                let request = RoomRequest {
                    id: *id,
                    requester_id: *requester_id,
                    preferred_type: *preferred_type,
                    preferred_floor: *preferred_floor,
                    priority_score: *priority_score,
                    status: RequestStatus::Pending,
                    created_at: *created_at,
                    expires_at: *expires_at,
                    processed_at: None,
                    processed_by: None,
                    allocated_room_id: None,
                    note: note.clone(),
                };
                self.requests.insert(*id, Arc::new(RwLock::new(request)));
                self.active_request.insert(*requester_id, *id);
            }
            Event::AllocationOpened {
                id,
                requester_id,
                room_id,
                kind,
                opened_at,
                opened_by,
            } => {
                self.allocations.insert(
                    *id,
                    Allocation {
                        id: *id,
                        requester_id: *requester_id,
                        room_id: *room_id,
                        kind: *kind,
                        status: AllocationStatus::Active,
                        allocated_at: *opened_at,
                        allocated_by: *opened_by,
                        ended_at: None,
                        ended_reason: None,
                    },
                );
                self.active_allocation.insert(*requester_id, *id);
            }
            Event::AllocationClosed {
                id,
                requester_id,
                status,
                ended_at,
                reason,
                ..
            } => {
                if let Some(mut a) = self.allocations.get_mut(id) {
                    a.status = *status;
                    a.ended_at = Some(*ended_at);
                    a.ended_reason = Some(reason.clone());
                }
                self.active_allocation.remove_if(requester_id, |_, v| v == id);
            }
            Event::AllocationReopened { id, requester_id, .. } => {
                if let Some(mut a) = self.allocations.get_mut(id) {
                    a.status = AllocationStatus::Active;
                    a.ended_at = None;
                    a.ended_reason = None;
                }
                self.active_allocation.insert(*requester_id, *id);
            }
            Event::AllocationVoided { id, requester_id, .. } => {
                self.allocations.remove(id);
                self.active_allocation.remove_if(requester_id, |_, v| v == id);
            }
            Event::WaitlistJoined {
                request_id,
                requester_id,
                preferred_type,
                preferred_floor,
                priority_score,
                position,
                added_at,
                expires_at,
            } => {
                self.waitlist.insert(
                    *request_id,
                    WaitlistEntry {
                        request_id: *request_id,
                        requester_id: *requester_id,
                        preferred_type: *preferred_type,
                        preferred_floor: *preferred_floor,
                        priority_score: *priority_score,
                        position: *position,
                        added_at: *added_at,
                        expires_at: *expires_at,
                    },
                );
            }
            Event::WaitlistLeft { request_id, .. } => {
                self.waitlist.remove(request_id);
            }
            Event::BatchRecorded { record } => {
                self.batches.insert(record.id, record.clone());
            }
            Event::RoomUpdated { .. }
            | Event::RoomMaintenanceSet { .. }
            | Event::RoomOccupancySet { .. }
            | Event::RequestTransitioned { .. }
            | Event::RequestRescored { .. } => {
                unreachable!("room-state and request events are applied under their locks")
            }
        }
    }

    // ── Journal maintenance ──────────────────────────────────

    /// Compact the journal by rewriting it with only the events needed to
    /// recreate the current state, history included.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Snapshot the Arcs first; awaiting while an iterator holds a map
        // shard would stall concurrent writers.
        let room_arcs: Vec<SharedRoomState> =
            self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in room_arcs {
            let guard = rs.read().await;
            events.push(Event::RoomAdded {
                id: guard.id,
                number: guard.number.clone(),
                floor: guard.floor,
                room_type: guard.room_type,
                capacity: guard.capacity,
            });
            if guard.maintenance {
                events.push(Event::RoomMaintenanceSet {
                    id: guard.id,
                    maintenance: true,
                });
            }
            if guard.occupied > 0 {
                events.push(Event::RoomOccupancySet {
                    id: guard.id,
                    occupied: guard.occupied,
                });
            }
        }

        for entry in self.requesters.iter() {
            let r = entry.value();
            events.push(Event::RequesterRegistered {
                id: r.id,
                name: r.name.clone(),
                role: r.role,
                registered_at: r.registered_at,
            });
            if r.room_id.is_some() {
                events.push(Event::RequesterPointerSet {
                    id: r.id,
                    room_id: r.room_id,
                });
            }
        }

        let request_arcs: Vec<SharedRequest> =
            self.requests.iter().map(|e| e.value().clone()).collect();
        for arc in request_arcs {
            let req = arc.read().await;
            events.push(Event::RequestSubmitted {
                id: req.id,
                requester_id: req.requester_id,
                preferred_type: req.preferred_type,
                preferred_floor: req.preferred_floor,
                priority_score: req.priority_score,
                created_at: req.created_at,
                expires_at: req.expires_at,
                note: req.note.clone(),
            });
            if req.status != RequestStatus::Pending {
                events.push(Event::RequestTransitioned {
                    id: req.id,
                    requester_id: req.requester_id,
                    status: req.status,
                    processed_at: req.processed_at,
                    processed_by: req.processed_by,
                    room_id: req.allocated_room_id,
                    note: None,
                });
            }
        }

        for entry in self.allocations.iter() {
            let a = entry.value();
            events.push(Event::AllocationOpened {
                id: a.id,
                requester_id: a.requester_id,
                room_id: a.room_id,
                kind: a.kind,
                opened_at: a.allocated_at,
                opened_by: a.allocated_by,
            });
            if a.status != AllocationStatus::Active {
                events.push(Event::AllocationClosed {
                    id: a.id,
                    requester_id: a.requester_id,
                    room_id: a.room_id,
                    status: a.status,
                    ended_at: a.ended_at.unwrap_or(a.allocated_at),
                    reason: a.ended_reason.clone().unwrap_or_default(),
                });
            }
        }

        for entry in self.waitlist.iter() {
            let w = entry.value();
            events.push(Event::WaitlistJoined {
                request_id: w.request_id,
                requester_id: w.requester_id,
                preferred_type: w.preferred_type,
                preferred_floor: w.preferred_floor,
                priority_score: w.priority_score,
                position: w.position,
                added_at: w.added_at,
                expires_at: w.expires_at,
            });
        }

        for entry in self.batches.iter() {
            events.push(Event::BatchRecorded {
                record: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Journal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Journal(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
