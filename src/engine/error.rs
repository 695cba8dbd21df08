use ulid::Ulid;

use crate::model::RequestStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input.
    Validation(&'static str),
    /// Input crosses a hard cap.
    LimitExceeded(&'static str),
    NotFound(Ulid),
    /// Duplicate active request/allocation; carries the conflicting id.
    Conflict(Ulid),
    /// Operation not legal for the request's current status.
    InvalidState { id: Ulid, status: RequestStatus },
    /// Room cannot take one more occupant at this instant.
    CapacityExceeded { room_id: Ulid, capacity: u32 },
    /// Room exists but is not open for allocation (maintenance).
    Unavailable(Ulid),
    /// Capability gate refused the actor.
    Forbidden(&'static str),
    /// A compensation step itself failed; state needs manual reconciliation.
    Inconsistency(String),
    Journal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => write!(f, "conflicts with existing record: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "request {id} is {status}; operation not allowed")
            }
            EngineError::CapacityExceeded { room_id, capacity } => {
                write!(f, "room {room_id} is at full capacity ({capacity})")
            }
            EngineError::Unavailable(id) => write!(f, "room {id} is not open for allocation"),
            EngineError::Forbidden(what) => write!(f, "actor may not {what}"),
            EngineError::Inconsistency(msg) => write!(f, "inconsistent state: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
