use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{Actor, Capability, authorize};
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::record_operation;

use super::saga::Undo;
use super::waitlist::rejoin_event;
use super::{Engine, EngineError};

impl Engine {
    /// Cancel a request. Requesters may cancel their own; anyone else
    /// needs the process-requests capability. A request that already holds
    /// a room runs the full compensating release sequence.
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        request_id: Ulid,
    ) -> Result<RoomRequest, EngineError> {
        let started = Instant::now();
        let result = self.cancel_request_inner(actor, request_id).await;
        record_operation("cancel_request", started, result.is_ok());
        result
    }

    async fn cancel_request_inner(
        &self,
        actor: &Actor,
        request_id: Ulid,
    ) -> Result<RoomRequest, EngineError> {
        let request = self.request_snapshot(&request_id).await?;
        if actor.id != request.requester_id {
            authorize(actor, Capability::ProcessRequests)?;
        }

        match request.status {
            RequestStatus::Rejected | RequestStatus::Cancelled => Err(EngineError::InvalidState {
                id: request_id,
                status: request.status,
            }),
            RequestStatus::Pending => {
                self.cancel_transition(&request, actor, request.status).await?;
                self.request_snapshot(&request_id).await
            }
            RequestStatus::Waitlisted => {
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
                if let Err(e) = self.cancel_transition(&request, actor, request.status).await {
                    return Err(self.unwind(undos, e).await);
                }
                self.request_snapshot(&request_id).await
            }
            RequestStatus::Approved | RequestStatus::Allocated => {
                // Single-winner claim on the active allocation; whoever
                // removes the index entry owns the release sequence.
                let Some((_, allocation_id)) =
                    self.active_allocation.remove(&request.requester_id)
                else {
                    // Status says housed but the store disagrees; the store
                    // wins. Cancel the request record alone.
                    warn!(request = %request_id, "no active allocation behind a housed request");
                    self.cancel_transition(&request, actor, request.status).await?;
                    return self.request_snapshot(&request_id).await;
                };
                let result = self
                    .release_allocation(
                        allocation_id,
                        request.requester_id,
                        AllocationStatus::Ended,
                        "request cancelled".into(),
                        Some(&request),
                        actor,
                    )
                    .await;
                match result {
                    Ok(()) => {
                        if let Err(e) = self.promote_waitlist().await {
                            warn!("waitlist promotion after cancellation failed: {e}");
                        }
                        self.request_snapshot(&request_id).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn cancel_transition(
        &self,
        request: &RoomRequest,
        actor: &Actor,
        expected: RequestStatus,
    ) -> Result<(), EngineError> {
        self.transition_request(
            request.id,
            &[expected],
            Event::RequestTransitioned {
                id: request.id,
                requester_id: request.requester_id,
                status: RequestStatus::Cancelled,
                processed_at: Some(now_ms()),
                processed_by: Some(actor.id),
                room_id: None,
                note: None,
            },
        )
        .await?;
        Ok(())
    }

    /// Unwind a partial release/transfer and, unless compensation itself
    /// failed, put the claimed active-allocation index entry back — the
    /// allocation it points at is still open.
    async fn abort_claimed(
        &self,
        undos: Vec<Undo>,
        requester_id: Ulid,
        allocation_id: Ulid,
        cause: EngineError,
    ) -> EngineError {
        let err = self.unwind(undos, cause).await;
        if !matches!(err, EngineError::Inconsistency(_)) {
            self.active_allocation.insert(requester_id, allocation_id);
        }
        err
    }

    /// The release sequence, the allocation sequence in reverse: pointer
    /// cleared, occupancy decremented, allocation ended, and (for
    /// cancellations) the request transitioned — each step compensated.
    /// The caller has already claimed the active-allocation index entry;
    /// it is reinstated on any failure that leaves the allocation open.
    async fn release_allocation(
        &self,
        allocation_id: Ulid,
        requester_id: Ulid,
        end_status: AllocationStatus,
        reason: String,
        request_to_cancel: Option<&RoomRequest>,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        let Some(allocation) = self.allocations.get(&allocation_id).map(|e| e.value().clone())
        else {
            return Err(EngineError::Inconsistency(format!(
                "active index pointed at missing allocation {allocation_id}"
            )));
        };
        let room_id = allocation.room_id;
        let now = now_ms();
        let mut undos: Vec<Undo> = Vec::new();

        // Until the close event is journaled, failures reinstate the claim
        // (abort_claimed); after it, the compensation stack's reopen event
        // restores the index by itself.

        // (1) clear the requester pointer
        let previous_pointer = self.requesters.get(&requester_id).and_then(|r| r.room_id);
        let clear = Event::RequesterPointerSet {
            id: requester_id,
            room_id: None,
        };
        if let Err(e) = self.persist_and_apply(&clear).await {
            return Err(self.abort_claimed(undos, requester_id, allocation_id, e).await);
        }
        undos.push(Undo::Record(Event::RequesterPointerSet {
            id: requester_id,
            room_id: previous_pointer,
        }));

        // (2) decrement occupancy
        if let Err(e) = self.vacate_room(room_id).await {
            return Err(self.abort_claimed(undos, requester_id, allocation_id, e).await);
        }
        undos.push(Undo::Occupy(room_id));

        // (3) end the allocation — history, never deleted
        let close = Event::AllocationClosed {
            id: allocation_id,
            requester_id,
            room_id,
            status: end_status,
            ended_at: now,
            reason,
        };
        if let Err(e) = self.persist_and_apply(&close).await {
            return Err(self.abort_claimed(undos, requester_id, allocation_id, e).await);
        }
        undos.push(Undo::Record(Event::AllocationReopened {
            id: allocation_id,
            requester_id,
            room_id,
        }));

        // (4) cancel the request, when the release came through one
        if let Some(request) = request_to_cancel
            && let Err(e) = self.cancel_transition(request, actor, request.status).await
        {
            return Err(self.unwind(undos, e).await);
        }

        info!(allocation = %allocation_id, room = %room_id, "allocation released");
        Ok(())
    }

    /// End a requester's stay directly, bypassing any request record.
    pub async fn checkout(
        &self,
        actor: &Actor,
        requester_id: Ulid,
        reason: String,
    ) -> Result<Allocation, EngineError> {
        authorize(actor, Capability::ProcessRequests)?;
        let started = Instant::now();
        let result = self.checkout_inner(actor, requester_id, reason).await;
        record_operation("checkout", started, result.is_ok());
        result
    }

    async fn checkout_inner(
        &self,
        actor: &Actor,
        requester_id: Ulid,
        reason: String,
    ) -> Result<Allocation, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let Some((_, allocation_id)) = self.active_allocation.remove(&requester_id) else {
            return Err(EngineError::NotFound(requester_id));
        };
        self.release_allocation(
            allocation_id,
            requester_id,
            AllocationStatus::Ended,
            reason,
            None,
            actor,
        )
        .await?;

        if let Err(e) = self.promote_waitlist().await {
            warn!("waitlist promotion after checkout failed: {e}");
        }
        self.allocations
            .get(&allocation_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(allocation_id))
    }

    /// Move a requester to another room. The new room is reserved before
    /// the old one is released — a failure anywhere leaves the requester
    /// housed where they were, never in between.
    pub async fn transfer(
        &self,
        actor: &Actor,
        requester_id: Ulid,
        new_room_id: Ulid,
    ) -> Result<(Allocation, Allocation), EngineError> {
        authorize(actor, Capability::ProcessRequests)?;
        let started = Instant::now();
        let result = self.transfer_inner(actor, requester_id, new_room_id).await;
        record_operation("transfer", started, result.is_ok());
        result
    }

    async fn transfer_inner(
        &self,
        actor: &Actor,
        requester_id: Ulid,
        new_room_id: Ulid,
    ) -> Result<(Allocation, Allocation), EngineError> {
        let Some((_, old_allocation_id)) = self.active_allocation.remove(&requester_id) else {
            return Err(EngineError::NotFound(requester_id));
        };
        // Precondition failures reinstate the claim before returning; the
        // old allocation is untouched until step (3).
        let unclaim = |err: EngineError| {
            self.active_allocation.insert(requester_id, old_allocation_id);
            err
        };

        let Some(old_allocation) = self
            .allocations
            .get(&old_allocation_id)
            .map(|e| e.value().clone())
        else {
            return Err(EngineError::Inconsistency(format!(
                "active index pointed at missing allocation {old_allocation_id}"
            )));
        };
        let old_room_id = old_allocation.room_id;
        if old_room_id == new_room_id {
            return Err(unclaim(EngineError::Validation(
                "transfer to the currently held room",
            )));
        }

        // Validate the target exactly like a direct approval would.
        let new_rs = match self.room(&new_room_id) {
            Ok(rs) => rs,
            Err(e) => return Err(unclaim(e)),
        };
        {
            let guard = new_rs.read().await;
            if guard.occupied >= guard.capacity {
                return Err(unclaim(EngineError::CapacityExceeded {
                    room_id: new_room_id,
                    capacity: guard.capacity,
                }));
            }
            if !matches!(
                guard.status(),
                RoomStatus::Available | RoomStatus::PartiallyFilled
            ) {
                return Err(unclaim(EngineError::Unavailable(new_room_id)));
            }
        }

        let now = now_ms();
        let mut undos: Vec<Undo> = Vec::new();

        // (1) reserve the new room first
        if let Err(e) = self.occupy_room(new_room_id).await {
            return Err(unclaim(e));
        }
        undos.push(Undo::Vacate(new_room_id));

        // (2) open the new allocation
        let new_allocation_id = Ulid::new();
        let opened = Event::AllocationOpened {
            id: new_allocation_id,
            requester_id,
            room_id: new_room_id,
            kind: AllocationKind::Transfer,
            opened_at: now,
            opened_by: Some(actor.id),
        };
        if let Err(e) = self.persist_and_apply(&opened).await {
            return Err(
                self.abort_claimed(undos, requester_id, old_allocation_id, e)
                    .await,
            );
        }
        undos.push(Undo::Record(Event::AllocationVoided {
            id: new_allocation_id,
            requester_id,
            room_id: new_room_id,
        }));

        // (3) close the old allocation as transferred
        let close = Event::AllocationClosed {
            id: old_allocation_id,
            requester_id,
            room_id: old_room_id,
            status: AllocationStatus::Transferred,
            ended_at: now,
            reason: "transferred".into(),
        };
        if let Err(e) = self.persist_and_apply(&close).await {
            return Err(
                self.abort_claimed(undos, requester_id, old_allocation_id, e)
                    .await,
            );
        }
        undos.push(Undo::Record(Event::AllocationReopened {
            id: old_allocation_id,
            requester_id,
            room_id: old_room_id,
        }));

        // (4) free the old room
        if let Err(e) = self.vacate_room(old_room_id).await {
            return Err(self.unwind(undos, e).await);
        }
        undos.push(Undo::Occupy(old_room_id));

        // (5) repoint the requester
        let pointer = Event::RequesterPointerSet {
            id: requester_id,
            room_id: Some(new_room_id),
        };
        if let Err(e) = self.persist_and_apply(&pointer).await {
            return Err(self.unwind(undos, e).await);
        }

        info!(
            requester = %requester_id,
            from = %old_room_id,
            to = %new_room_id,
            "transfer complete"
        );

        if let Err(e) = self.promote_waitlist().await {
            warn!("waitlist promotion after transfer failed: {e}");
        }

        let ended = self
            .allocations
            .get(&old_allocation_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(old_allocation_id))?;
        let begun = self
            .allocations
            .get(&new_allocation_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(new_allocation_id))?;
        Ok((ended, begun))
    }
}
