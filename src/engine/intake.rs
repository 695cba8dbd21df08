use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::record_operation;

use super::{Engine, EngineError};

/// Priority policy: role weight dominates. Queue time adds one point per
/// hour and account seniority one point per month, both capped below the
/// smallest gap between role weights so no amount of waiting crosses a
/// role boundary. Ties inside a role fall to earliest `created_at` at
/// ordering time. Scores only ever climb while a request waits.
pub(crate) fn priority_score(role: Role, registered_at: Ms, created_at: Ms, now: Ms) -> i64 {
    let queued_hours = ((now - created_at).max(0) / 3_600_000).min(240);
    let seniority_months = ((now - registered_at).max(0) / (30 * 86_400_000)).min(120);
    role.weight() + queued_hours + seniority_months
}

impl Engine {
    /// Mirror a requester from the surrounding application's user store.
    /// Only the fields the allocation engine needs live here.
    pub async fn register_requester(
        &self,
        id: Ulid,
        name: String,
        role: Role,
    ) -> Result<Requester, EngineError> {
        if name.is_empty() {
            return Err(EngineError::Validation("requester name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("requester name too long"));
        }
        if self.requesters.len() >= MAX_REQUESTERS {
            return Err(EngineError::LimitExceeded("too many requesters"));
        }
        if self.requesters.contains_key(&id) {
            return Err(EngineError::Conflict(id));
        }
        let event = Event::RequesterRegistered {
            id,
            name,
            role,
            registered_at: now_ms(),
        };
        self.persist_and_apply(&event).await?;
        self.requester(&id)
    }

    /// Submit a room request. No side effects on the capacity ledger; the
    /// request starts `Pending` and waits for an admin or a batch run.
    pub async fn submit_request(
        &self,
        requester_id: Ulid,
        preferred_type: Option<RoomType>,
        preferred_floor: Option<i32>,
        expires_at: Option<Ms>,
        note: Option<String>,
    ) -> Result<RoomRequest, EngineError> {
        let started = Instant::now();
        let result = self
            .submit_request_inner(requester_id, preferred_type, preferred_floor, expires_at, note)
            .await;
        record_operation("submit_request", started, result.is_ok());
        result
    }

    async fn submit_request_inner(
        &self,
        requester_id: Ulid,
        preferred_type: Option<RoomType>,
        preferred_floor: Option<i32>,
        expires_at: Option<Ms>,
        note: Option<String>,
    ) -> Result<RoomRequest, EngineError> {
        let requester = self.requester(&requester_id)?;
        if let Some(floor) = preferred_floor
            && !(MIN_FLOOR..=MAX_FLOOR).contains(&floor)
        {
            return Err(EngineError::Validation("preferred floor out of range"));
        }
        if let Some(n) = &note
            && n.len() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let now = now_ms();
        if let Some(exp) = expires_at {
            if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&exp) {
                return Err(EngineError::LimitExceeded("expiry timestamp out of range"));
            }
            if exp <= now {
                return Err(EngineError::Validation("expiry is in the past"));
            }
        }

        // One active allocation per requester — checked against the
        // allocation store, never the cached pointer.
        if let Some(allocation_id) = self.housed_in(&requester_id) {
            return Err(EngineError::Conflict(allocation_id));
        }

        // One non-terminal request per requester. Reserving the index slot
        // before journaling makes concurrent submissions serialize here.
        let request_id = Ulid::new();
        match self.active_request.entry(requester_id) {
            Entry::Occupied(e) => return Err(EngineError::Conflict(*e.get())),
            Entry::Vacant(v) => {
                v.insert(request_id);
            }
        }

        let event = Event::RequestSubmitted {
            id: request_id,
            requester_id,
            preferred_type,
            preferred_floor,
            priority_score: priority_score(requester.role, requester.registered_at, now, now),
            created_at: now,
            expires_at,
            note,
        };
        if let Err(e) = self.persist_and_apply(&event).await {
            self.active_request
                .remove_if(&requester_id, |_, v| *v == request_id);
            return Err(e);
        }
        info!(request = %request_id, requester = %requester_id, "room request submitted");

        self.request_snapshot(&request_id).await
    }
}
