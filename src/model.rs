use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Bed configuration of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    Single,
    Double,
    Triple,
    Dormitory,
}

/// Derived occupancy state of a room. `Maintenance` is the only state set
/// by hand; the rest are a pure function of `occupied` vs `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Available,
    PartiallyFilled,
    Full,
    Maintenance,
}

/// Requester role, ordered by allocation priority weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Warden,
    OperationsAssistant,
    Student,
    Guest,
}

impl Role {
    /// Priority weight; dominates the queue-time and seniority components.
    pub fn weight(self) -> i64 {
        match self {
            Role::Admin => 10_000,
            Role::Warden => 8_000,
            Role::OperationsAssistant => 6_000,
            Role::Student => 1_000,
            Role::Guest => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Waitlisted,
    Allocated,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    /// A requester may hold at most one request in these statuses.
    pub fn blocks_new_request(self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Approved | RequestStatus::Waitlisted
        )
    }

    /// Closed transition table. Anything not listed here is rejected with
    /// `InvalidState` before a transition event is ever journaled.
    /// `Approved → Pending` is the compensation edge.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Waitlisted)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Allocated)
                | (Approved, Pending)
                | (Approved, Cancelled)
                | (Waitlisted, Approved)
                | (Waitlisted, Rejected)
                | (Waitlisted, Cancelled)
                | (Allocated, Cancelled)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Waitlisted => "waitlisted",
            RequestStatus::Allocated => "allocated",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Active,
    Ended,
    Transferred,
}

/// How an allocation came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    Manual,
    Automatic,
    Transfer,
}

// ── Records ──────────────────────────────────────────────────────

/// Authoritative capacity-ledger state for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub id: Ulid,
    pub number: String,
    pub floor: i32,
    pub room_type: RoomType,
    /// Max concurrent occupants (always ≥ 1).
    pub capacity: u32,
    /// Current occupants; `occupied ≤ capacity` at all times.
    pub occupied: u32,
    pub maintenance: bool,
}

impl RoomState {
    pub fn new(id: Ulid, number: String, floor: i32, room_type: RoomType, capacity: u32) -> Self {
        Self {
            id,
            number,
            floor,
            room_type,
            capacity,
            occupied: 0,
            maintenance: false,
        }
    }

    pub fn status(&self) -> RoomStatus {
        if self.maintenance {
            RoomStatus::Maintenance
        } else if self.occupied == 0 {
            RoomStatus::Available
        } else if self.occupied < self.capacity {
            RoomStatus::PartiallyFilled
        } else {
            RoomStatus::Full
        }
    }

    /// A room can take one more occupant via the matcher.
    pub fn accepts_allocation(&self) -> bool {
        !self.maintenance && self.occupied < self.capacity
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            number: self.number.clone(),
            floor: self.floor,
            room_type: self.room_type,
            capacity: self.capacity,
            occupied: self.occupied,
            status: self.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    pub registered_at: Ms,
    /// Denormalized pointer to the currently allocated room. A read cache
    /// of the allocation store; validated against it before any decision.
    pub room_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub preferred_type: Option<RoomType>,
    pub preferred_floor: Option<i32>,
    pub priority_score: i64,
    pub status: RequestStatus,
    pub created_at: Ms,
    pub expires_at: Option<Ms>,
    pub processed_at: Option<Ms>,
    pub processed_by: Option<Ulid>,
    pub allocated_room_id: Option<Ulid>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub room_id: Ulid,
    pub kind: AllocationKind,
    pub status: AllocationStatus,
    pub allocated_at: Ms,
    pub allocated_by: Option<Ulid>,
    pub ended_at: Option<Ms>,
    pub ended_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub request_id: Ulid,
    pub requester_id: Ulid,
    pub preferred_type: Option<RoomType>,
    pub preferred_floor: Option<i32>,
    pub priority_score: i64,
    /// 1-based; contiguous across the whole waitlist in priority order.
    pub position: u32,
    pub added_at: Ms,
    pub expires_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub request_id: Ulid,
    pub error: String,
}

/// Outcome of one batch allocation sweep. Persisted so past runs can be
/// inspected after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Ulid,
    pub label: String,
    pub run_by: Ulid,
    pub total_considered: u32,
    pub allocated: u32,
    pub waitlisted: u32,
    pub failures: Vec<BatchFailure>,
    pub started_at: Ms,
    pub completed_at: Ms,
}

// ── Journal event format ─────────────────────────────────────────

/// The event types — flat, no nesting. Each variant is one single-record
/// atomic write; multi-record operations are sequences of these with
/// explicit compensation. Occupancy carries absolute values so replay is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomAdded {
        id: Ulid,
        number: String,
        floor: i32,
        room_type: RoomType,
        capacity: u32,
    },
    RoomUpdated {
        id: Ulid,
        number: String,
        floor: i32,
        room_type: RoomType,
        capacity: u32,
    },
    RoomMaintenanceSet {
        id: Ulid,
        maintenance: bool,
    },
    RoomOccupancySet {
        id: Ulid,
        occupied: u32,
    },
    RoomRemoved {
        id: Ulid,
    },
    RequesterRegistered {
        id: Ulid,
        name: String,
        role: Role,
        registered_at: Ms,
    },
    RequesterPointerSet {
        id: Ulid,
        room_id: Option<Ulid>,
    },
    RequestSubmitted {
        id: Ulid,
        requester_id: Ulid,
        preferred_type: Option<RoomType>,
        preferred_floor: Option<i32>,
        priority_score: i64,
        created_at: Ms,
        expires_at: Option<Ms>,
        note: Option<String>,
    },
    RequestRescored {
        id: Ulid,
        priority_score: i64,
    },
    /// Overwrites status and all processing fields, including back to
    /// `None` — compensation reverts are expressed as plain transitions.
    RequestTransitioned {
        id: Ulid,
        requester_id: Ulid,
        status: RequestStatus,
        processed_at: Option<Ms>,
        processed_by: Option<Ulid>,
        room_id: Option<Ulid>,
        note: Option<String>,
    },
    AllocationOpened {
        id: Ulid,
        requester_id: Ulid,
        room_id: Ulid,
        kind: AllocationKind,
        opened_at: Ms,
        opened_by: Option<Ulid>,
    },
    AllocationClosed {
        id: Ulid,
        requester_id: Ulid,
        room_id: Ulid,
        status: AllocationStatus,
        ended_at: Ms,
        reason: String,
    },
    /// Compensation inverse of `AllocationClosed`.
    AllocationReopened {
        id: Ulid,
        requester_id: Ulid,
        room_id: Ulid,
    },
    /// Compensation inverse of `AllocationOpened` — the record never
    /// committed as part of a completed sequence, so it is erased rather
    /// than ended.
    AllocationVoided {
        id: Ulid,
        requester_id: Ulid,
        room_id: Ulid,
    },
    WaitlistJoined {
        request_id: Ulid,
        requester_id: Ulid,
        preferred_type: Option<RoomType>,
        preferred_floor: Option<i32>,
        priority_score: i64,
        position: u32,
        added_at: Ms,
        expires_at: Option<Ms>,
    },
    WaitlistLeft {
        request_id: Ulid,
        requester_id: Ulid,
    },
    BatchRecorded {
        record: BatchRecord,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub number: String,
    pub floor: i32,
    pub room_type: RoomType,
    pub capacity: u32,
    pub occupied: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStatistics {
    pub total: u32,
    pub total_capacity: u32,
    pub total_occupied: u32,
    pub available: u32,
    pub maintenance: u32,
    pub occupancy_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatistics {
    pub pending: u32,
    pub approved: u32,
    pub waitlisted: u32,
    pub allocated: u32,
    pub rejected: u32,
    pub cancelled: u32,
    pub total: u32,
}

/// Read-only rollup for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub rooms: RoomStatistics,
    pub requests: RequestStatistics,
}
