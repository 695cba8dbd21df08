use std::time::Instant;

use tracing::{info, warn};

use crate::auth::{Actor, Capability, authorize};
use crate::limits::MAX_WAITLIST;
use crate::model::*;
use crate::observability::{self, record_operation};

use super::saga::Undo;
use super::{Engine, EngineError};

pub(super) fn rejoin_event(entry: &WaitlistEntry) -> Event {
    Event::WaitlistJoined {
        request_id: entry.request_id,
        requester_id: entry.requester_id,
        preferred_type: entry.preferred_type,
        preferred_floor: entry.preferred_floor,
        priority_score: entry.priority_score,
        position: entry.position,
        added_at: entry.added_at,
        expires_at: entry.expires_at,
    }
}

impl Engine {
    pub(crate) fn update_waitlist_gauge(&self) {
        metrics::gauge!(observability::WAITLIST_DEPTH).set(self.waitlist.len() as f64);
    }

    /// Ordered snapshot: (priority desc, added_at asc), positions
    /// renumbered to the contiguous 1..N the ordering implies.
    pub(crate) fn waitlist_snapshot(&self) -> Vec<WaitlistEntry> {
        let mut entries: Vec<WaitlistEntry> =
            self.waitlist.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then(a.added_at.cmp(&b.added_at))
                .then(a.request_id.cmp(&b.request_id))
        });
        for (i, e) in entries.iter_mut().enumerate() {
            e.position = (i + 1) as u32;
        }
        entries
    }

    /// Route a request that found no matching room onto the waitlist:
    /// request → waitlisted, entry appended at max position + 1.
    pub(crate) async fn enqueue_waitlist(
        &self,
        request: &RoomRequest,
    ) -> Result<WaitlistEntry, EngineError> {
        if self.waitlist.len() >= MAX_WAITLIST {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        let now = now_ms();
        let mut undos: Vec<Undo> = Vec::new();

        self.transition_request(
            request.id,
            &[RequestStatus::Pending],
            Event::RequestTransitioned {
                id: request.id,
                requester_id: request.requester_id,
                status: RequestStatus::Waitlisted,
                processed_at: Some(now),
                processed_by: None,
                room_id: None,
                note: None,
            },
        )
        .await?;
        undos.push(Undo::RevertRequest {
            id: request.id,
            expected: RequestStatus::Waitlisted,
            event: Event::RequestTransitioned {
                id: request.id,
                requester_id: request.requester_id,
                status: RequestStatus::Pending,
                processed_at: None,
                processed_by: None,
                room_id: None,
                note: None,
            },
        });

        let position = self
            .waitlist
            .iter()
            .map(|e| e.value().position)
            .max()
            .unwrap_or(0)
            + 1;
        let entry = WaitlistEntry {
            request_id: request.id,
            requester_id: request.requester_id,
            preferred_type: request.preferred_type,
            preferred_floor: request.preferred_floor,
            priority_score: request.priority_score,
            position,
            added_at: now,
            expires_at: request.expires_at,
        };
        if let Err(e) = self.persist_and_apply(&rejoin_event(&entry)).await {
            return Err(self.unwind(undos, e).await);
        }
        self.update_waitlist_gauge();
        info!(request = %request.id, position, "request waitlisted");
        Ok(entry)
    }

    /// Passive expiry check, run on every waitlist read/promote cycle —
    /// there is no background timer. Expired entries leave the list and
    /// their requests are cancelled.
    pub(crate) async fn sweep_waitlist(&self, now: Ms) {
        let expired: Vec<WaitlistEntry> = self
            .waitlist
            .iter()
            .filter(|e| e.value().expires_at.is_some_and(|x| x <= now))
            .map(|e| e.value().clone())
            .collect();
        for entry in expired {
            let left = Event::WaitlistLeft {
                request_id: entry.request_id,
                requester_id: entry.requester_id,
            };
            if let Err(e) = self.persist_and_apply(&left).await {
                warn!(request = %entry.request_id, "could not expire waitlist entry: {e}");
                continue;
            }
            let cancel = Event::RequestTransitioned {
                id: entry.request_id,
                requester_id: entry.requester_id,
                status: RequestStatus::Cancelled,
                processed_at: Some(now),
                processed_by: None,
                room_id: None,
                note: Some("waitlist expired".into()),
            };
            match self
                .transition_request(entry.request_id, &[RequestStatus::Waitlisted], cancel)
                .await
            {
                Ok(_) => info!(request = %entry.request_id, "waitlist entry expired"),
                Err(e) => {
                    warn!(request = %entry.request_id, "expired entry left a dangling request: {e}");
                }
            }
        }
        self.update_waitlist_gauge();
    }

    /// Promote from the head of the waitlist while capacity allows.
    /// Strict FIFO-within-priority: if the head's preferences cannot be
    /// satisfied right now, nobody behind it is considered — no
    /// backfilling past a higher-priority entry.
    pub async fn promote_waitlist(&self) -> Result<usize, EngineError> {
        self.sweep_waitlist(now_ms()).await;
        let mut promoted = 0usize;
        loop {
            let Some(head) = self.waitlist_snapshot().into_iter().next() else {
                break;
            };
            let Some(room_id) = self
                .find_room(head.preferred_type, head.preferred_floor)
                .await
            else {
                break;
            };
            match self
                .commit_allocation(head.request_id, room_id, None, AllocationKind::Automatic)
                .await
            {
                Ok(_) => {
                    promoted += 1;
                    info!(request = %head.request_id, room = %room_id, "promoted from waitlist");
                }
                Err(e @ (EngineError::InvalidState { .. } | EngineError::Conflict(_))) => {
                    // The request moved on (or its requester got housed)
                    // without leaving the list; drop the stale entry so it
                    // cannot block the queue. If even that write fails,
                    // stop instead of spinning on the same head.
                    warn!(request = %head.request_id, "dropping stale waitlist entry: {e}");
                    let left = Event::WaitlistLeft {
                        request_id: head.request_id,
                        requester_id: head.requester_id,
                    };
                    if self.persist_and_apply(&left).await.is_err() {
                        break;
                    }
                    self.update_waitlist_gauge();
                }
                Err(e) => {
                    warn!(request = %head.request_id, "waitlist promotion stopped: {e}");
                    break;
                }
            }
        }
        Ok(promoted)
    }

    pub async fn list_waitlist(&self, actor: &Actor) -> Result<Vec<WaitlistEntry>, EngineError> {
        authorize(actor, Capability::ViewReports)?;
        let started = Instant::now();
        self.sweep_waitlist(now_ms()).await;
        let snapshot = self.waitlist_snapshot();
        record_operation("list_waitlist", started, true);
        Ok(snapshot)
    }
}
