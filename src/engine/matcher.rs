use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{Actor, Capability, authorize};
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::{self, record_operation};

use super::saga::Undo;
use super::waitlist::rejoin_event;
use super::{Engine, EngineError};

impl Engine {
    /// Direct admin approval: allocate a specific room to a pending request.
    pub async fn approve_request(
        &self,
        actor: &Actor,
        request_id: Ulid,
        room_id: Ulid,
    ) -> Result<(Allocation, RoomInfo), EngineError> {
        authorize(actor, Capability::ProcessRequests)?;
        let started = Instant::now();
        let result = self.approve_request_inner(actor, request_id, room_id).await;
        record_operation("approve_request", started, result.is_ok());
        result
    }

    async fn approve_request_inner(
        &self,
        actor: &Actor,
        request_id: Ulid,
        room_id: Ulid,
    ) -> Result<(Allocation, RoomInfo), EngineError> {
        // Preconditions, each a distinct failure mode. The availability
        // verdict here is advisory; the occupancy step re-verifies under
        // the room's write lock before committing the increment.
        let request = self.request_snapshot(&request_id).await?;
        if request.status != RequestStatus::Pending {
            return Err(EngineError::InvalidState {
                id: request_id,
                status: request.status,
            });
        }
        if let Some(allocation_id) = self.housed_in(&request.requester_id) {
            return Err(EngineError::Conflict(allocation_id));
        }
        let rs = self.room(&room_id)?;
        {
            let guard = rs.read().await;
            if guard.occupied >= guard.capacity {
                return Err(EngineError::CapacityExceeded {
                    room_id,
                    capacity: guard.capacity,
                });
            }
            if !matches!(
                guard.status(),
                RoomStatus::Available | RoomStatus::PartiallyFilled
            ) {
                return Err(EngineError::Unavailable(room_id));
            }
        }

        self.commit_allocation(request_id, room_id, Some(actor.id), AllocationKind::Manual)
            .await
    }

    /// Reject a pending or waitlisted request with a reason.
    pub async fn reject_request(
        &self,
        actor: &Actor,
        request_id: Ulid,
        reason: String,
    ) -> Result<RoomRequest, EngineError> {
        authorize(actor, Capability::ProcessRequests)?;
        let started = Instant::now();
        let result = self.reject_request_inner(actor, request_id, reason).await;
        record_operation("reject_request", started, result.is_ok());
        result
    }

    async fn reject_request_inner(
        &self,
        actor: &Actor,
        request_id: Ulid,
        reason: String,
    ) -> Result<RoomRequest, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let request = self.request_snapshot(&request_id).await?;
        if !matches!(
            request.status,
            RequestStatus::Pending | RequestStatus::Waitlisted
        ) {
            return Err(EngineError::InvalidState {
                id: request_id,
                status: request.status,
            });
        }

        let mut undos: Vec<Undo> = Vec::new();
        if let Some(entry) = self.waitlist.get(&request_id).map(|e| e.value().clone()) {
            let left = Event::WaitlistLeft {
                request_id,
                requester_id: request.requester_id,
            };
            self.persist_and_apply(&left).await?;
            undos.push(Undo::Record(rejoin_event(&entry)));
            self.update_waitlist_gauge();
        }

        let transition = Event::RequestTransitioned {
            id: request_id,
            requester_id: request.requester_id,
            status: RequestStatus::Rejected,
            processed_at: Some(now_ms()),
            processed_by: Some(actor.id),
            room_id: None,
            note: Some(reason),
        };
        if let Err(e) = self
            .transition_request(
                request_id,
                &[RequestStatus::Pending, RequestStatus::Waitlisted],
                transition,
            )
            .await
        {
            return Err(self.unwind(undos, e).await);
        }
        self.update_waitlist_gauge();
        self.request_snapshot(&request_id).await
    }

    /// Auto-match policy: first room in ascending (floor, number) order
    /// that satisfies the stated preferences and has capacity. Preferences
    /// are never relaxed — an unmatchable request goes to the waitlist.
    pub(crate) async fn find_room(
        &self,
        preferred_type: Option<RoomType>,
        preferred_floor: Option<i32>,
    ) -> Option<Ulid> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut candidates: Vec<(i32, String, Ulid)> = Vec::new();
        for rs in arcs {
            let guard = rs.read().await;
            if !guard.accepts_allocation() {
                continue;
            }
            if let Some(t) = preferred_type
                && guard.room_type != t
            {
                continue;
            }
            if let Some(f) = preferred_floor
                && guard.floor != f
            {
                continue;
            }
            candidates.push((guard.floor, guard.number.clone(), guard.id));
        }
        candidates.sort();
        candidates.into_iter().next().map(|(_, _, id)| id)
    }

    /// The canonical allocation sequence: the store only offers
    /// single-record atomic writes, so the commit is an ordered sequence
    /// of them with an explicit compensation stack.
    ///
    ///   (a) request → approved
    ///   (b) allocation record opened (active)
    ///   (c) room occupancy re-verified under the write lock, incremented
    ///   (d) requester pointer set
    ///   (e) waitlist entry removed, if the request came from the waitlist
    ///   (f) request → allocated
    ///
    /// Any failure executes the undo stack in reverse; an undo failure
    /// surfaces as `Inconsistency`.
    pub(crate) async fn commit_allocation(
        &self,
        request_id: Ulid,
        room_id: Ulid,
        actor: Option<Ulid>,
        kind: AllocationKind,
    ) -> Result<(Allocation, RoomInfo), EngineError> {
        let request = self.request_snapshot(&request_id).await?;
        let requester_id = request.requester_id;
        if let Some(allocation_id) = self.housed_in(&requester_id) {
            return Err(EngineError::Conflict(allocation_id));
        }
        let now = now_ms();
        let mut undos: Vec<Undo> = Vec::new();

        // (a) — on failure there is nothing to roll back yet.
        let previous = self
            .transition_request(
                request_id,
                &[RequestStatus::Pending, RequestStatus::Waitlisted],
                Event::RequestTransitioned {
                    id: request_id,
                    requester_id,
                    status: RequestStatus::Approved,
                    processed_at: Some(now),
                    processed_by: actor,
                    room_id: Some(room_id),
                    note: None,
                },
            )
            .await?;
        undos.push(Undo::RevertRequest {
            id: request_id,
            expected: RequestStatus::Approved,
            event: Event::RequestTransitioned {
                id: request_id,
                requester_id,
                status: previous,
                processed_at: None,
                processed_by: None,
                room_id: None,
                note: None,
            },
        });

        // (b)
        let allocation_id = Ulid::new();
        let opened = Event::AllocationOpened {
            id: allocation_id,
            requester_id,
            room_id,
            kind,
            opened_at: now,
            opened_by: actor,
        };
        if let Err(e) = self.persist_and_apply(&opened).await {
            return Err(self.unwind(undos, e).await);
        }
        undos.push(Undo::Record(Event::AllocationVoided {
            id: allocation_id,
            requester_id,
            room_id,
        }));

        // (c)
        let room_info = match self.occupy_room(room_id).await {
            Ok(info) => info,
            Err(e) => return Err(self.unwind(undos, e).await),
        };
        undos.push(Undo::Vacate(room_id));

        // (d)
        let previous_pointer = self.requesters.get(&requester_id).and_then(|r| r.room_id);
        let pointer = Event::RequesterPointerSet {
            id: requester_id,
            room_id: Some(room_id),
        };
        if let Err(e) = self.persist_and_apply(&pointer).await {
            return Err(self.unwind(undos, e).await);
        }
        undos.push(Undo::Record(Event::RequesterPointerSet {
            id: requester_id,
            room_id: previous_pointer,
        }));

        // (e)
        if previous == RequestStatus::Waitlisted
            && let Some(entry) = self.waitlist.get(&request_id).map(|e| e.value().clone())
        {
            let left = Event::WaitlistLeft {
                request_id,
                requester_id,
            };
            if let Err(e) = self.persist_and_apply(&left).await {
                return Err(self.unwind(undos, e).await);
            }
            undos.push(Undo::Record(rejoin_event(&entry)));
            self.update_waitlist_gauge();
        }

        // (f)
        let finalize = Event::RequestTransitioned {
            id: request_id,
            requester_id,
            status: RequestStatus::Allocated,
            processed_at: Some(now),
            processed_by: actor,
            room_id: Some(room_id),
            note: None,
        };
        if let Err(e) = self
            .transition_request(request_id, &[RequestStatus::Approved], finalize)
            .await
        {
            return Err(self.unwind(undos, e).await);
        }

        info!(
            request = %request_id,
            requester = %requester_id,
            room = %room_id,
            "room allocated"
        );

        // Best-effort side effect: a payment failure never rolls the
        // allocation back.
        if let Err(e) = self
            .payments
            .initiate(requester_id, room_id, allocation_id)
            .await
        {
            warn!(allocation = %allocation_id, "payment initiation failed: {e}");
            metrics::counter!(observability::SIDE_EFFECT_FAILURES_TOTAL).increment(1);
        }

        let allocation = Allocation {
            id: allocation_id,
            requester_id,
            room_id,
            kind,
            status: AllocationStatus::Active,
            allocated_at: now,
            allocated_by: actor,
            ended_at: None,
            ended_reason: None,
        };
        Ok((allocation, room_info))
    }
}
