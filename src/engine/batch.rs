use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{Actor, Capability, authorize};
use crate::limits::MAX_LABEL_LEN;
use crate::model::*;
use crate::observability::record_operation;

use super::{Engine, EngineError};

impl Engine {
    /// Sweep all pending requests in priority order, auto-matching each.
    /// One request's failure never aborts the run; requests that fit
    /// nowhere go to the waitlist, everything else is recorded.
    pub async fn run_batch(
        &self,
        actor: &Actor,
        label: String,
    ) -> Result<BatchRecord, EngineError> {
        authorize(actor, Capability::RunBatch)?;
        let started = Instant::now();
        let result = self.run_batch_inner(actor, label).await;
        record_operation("run_batch", started, result.is_ok());
        result
    }

    async fn run_batch_inner(
        &self,
        actor: &Actor,
        label: String,
    ) -> Result<BatchRecord, EngineError> {
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("batch label too long"));
        }
        let started_at = now_ms();
        self.sweep_waitlist(started_at).await;

        // Refresh every pending request's priority score, then order by
        // (score desc, created_at asc). Scores only climb while waiting,
        // so re-running a batch never demotes anyone.
        let pending = self.list_requests(Some(RequestStatus::Pending)).await;
        let mut scored: Vec<RoomRequest> = Vec::with_capacity(pending.len());
        for mut request in pending {
            let role = match self.requesters.get(&request.requester_id) {
                Some(r) => r.role,
                None => continue,
            };
            let registered_at = self
                .requesters
                .get(&request.requester_id)
                .map(|r| r.registered_at)
                .unwrap_or(started_at);
            let score = super::intake::priority_score(
                role,
                registered_at,
                request.created_at,
                started_at,
            );
            if let Err(e) = self.rescore_request(request.id, score).await {
                warn!(request = %request.id, "rescore failed: {e}");
            } else {
                request.priority_score = score;
            }
            scored.push(request);
        }
        scored.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then(a.created_at.cmp(&b.created_at))
        });

        let total_considered = scored.len() as u32;
        let mut allocated = 0u32;
        let mut waitlisted = 0u32;
        let mut failures: Vec<BatchFailure> = Vec::new();

        for request in scored {
            // Requests may have been processed (or expired) since loading.
            let current = match self.request_snapshot(&request.id).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            if current.status != RequestStatus::Pending {
                continue;
            }
            if let Some(exp) = current.expires_at
                && exp <= started_at
            {
                let lapse = Event::RequestTransitioned {
                    id: current.id,
                    requester_id: current.requester_id,
                    status: RequestStatus::Cancelled,
                    processed_at: Some(started_at),
                    processed_by: None,
                    room_id: None,
                    note: Some("request expired".into()),
                };
                if let Err(e) = self
                    .transition_request(current.id, &[RequestStatus::Pending], lapse)
                    .await
                {
                    warn!(request = %current.id, "could not expire request: {e}");
                }
                continue;
            }
            if let Some(allocation_id) = self.housed_in(&current.requester_id) {
                failures.push(BatchFailure {
                    request_id: current.id,
                    error: EngineError::Conflict(allocation_id).to_string(),
                });
                continue;
            }

            match self
                .find_room(current.preferred_type, current.preferred_floor)
                .await
            {
                None => match self.enqueue_waitlist(&current).await {
                    Ok(_) => waitlisted += 1,
                    Err(e) => failures.push(BatchFailure {
                        request_id: current.id,
                        error: e.to_string(),
                    }),
                },
                Some(room_id) => {
                    match self
                        .commit_allocation(
                            current.id,
                            room_id,
                            Some(actor.id),
                            AllocationKind::Automatic,
                        )
                        .await
                    {
                        Ok(_) => allocated += 1,
                        // Lost the race for the last slot — the waitlist is
                        // the right place, same as finding no room at all.
                        Err(
                            EngineError::CapacityExceeded { .. } | EngineError::Unavailable(_),
                        ) => match self.enqueue_waitlist(&current).await {
                            Ok(_) => waitlisted += 1,
                            Err(e) => failures.push(BatchFailure {
                                request_id: current.id,
                                error: e.to_string(),
                            }),
                        },
                        Err(e) => failures.push(BatchFailure {
                            request_id: current.id,
                            error: e.to_string(),
                        }),
                    }
                }
            }
        }

        let record = BatchRecord {
            id: Ulid::new(),
            label,
            run_by: actor.id,
            total_considered,
            allocated,
            waitlisted,
            failures,
            started_at,
            completed_at: now_ms(),
        };
        // The sweep itself already committed; failing to journal the run
        // record is not worth failing the run over.
        if let Err(e) = self
            .persist_and_apply(&Event::BatchRecorded {
                record: record.clone(),
            })
            .await
        {
            warn!(batch = %record.id, "batch record not journaled: {e}");
        }
        info!(
            summary = %serde_json::to_string(&record).unwrap_or_default(),
            "batch allocation completed"
        );
        Ok(record)
    }

    pub fn get_batch(&self, actor: &Actor, id: &Ulid) -> Result<BatchRecord, EngineError> {
        authorize(actor, Capability::ViewReports)?;
        self.batches
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}
