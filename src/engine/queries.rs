use std::time::Instant;

use ulid::Ulid;

use crate::auth::{Actor, Capability, authorize};
use crate::model::*;
use crate::observability::record_operation;

use super::{Engine, EngineError, SharedRequest, SharedRoomState};

impl Engine {
    pub(crate) async fn request_snapshot(&self, id: &Ulid) -> Result<RoomRequest, EngineError> {
        let arc = self.request_arc(id)?;
        let guard = arc.read().await;
        Ok(guard.clone())
    }

    pub async fn get_request(&self, id: &Ulid) -> Option<RoomRequest> {
        self.request_snapshot(id).await.ok()
    }

    /// Requests, optionally filtered by status, ordered the way every
    /// processor consumes them: priority desc, then created_at asc.
    pub async fn list_requests(&self, status: Option<RequestStatus>) -> Vec<RoomRequest> {
        let arcs: Vec<SharedRequest> = self.requests.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            if status.is_none_or(|s| guard.status == s) {
                out.push(guard.clone());
            }
        }
        out.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then(a.created_at.cmp(&b.created_at))
        });
        out
    }

    pub async fn get_room_info(&self, id: &Ulid) -> Option<RoomInfo> {
        let rs = self.get_room(id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    /// All rooms in ascending (floor, number) order — the same order the
    /// auto-matcher walks them in.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let arcs: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            out.push(guard.info());
        }
        out.sort_by(|a, b| a.floor.cmp(&b.floor).then(a.number.cmp(&b.number)));
        out
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<Allocation> {
        self.allocations.get(id).map(|e| e.value().clone())
    }

    /// Full allocation history for a requester, oldest first.
    pub fn allocations_for(&self, requester_id: &Ulid) -> Vec<Allocation> {
        let mut out: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|e| e.value().requester_id == *requester_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| (a.allocated_at, a.id));
        out
    }

    pub fn active_allocation_for(&self, requester_id: &Ulid) -> Option<Allocation> {
        let id = self.active_allocation.get(requester_id).map(|e| *e.value())?;
        self.get_allocation(&id)
    }

    /// Occupancy and request-status rollup for dashboards.
    pub async fn statistics(&self, actor: &Actor) -> Result<Statistics, EngineError> {
        authorize(actor, Capability::ViewReports)?;
        let started = Instant::now();

        let arcs: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = RoomStatistics {
            total: 0,
            total_capacity: 0,
            total_occupied: 0,
            available: 0,
            maintenance: 0,
            occupancy_rate: 0.0,
        };
        for rs in arcs {
            let guard = rs.read().await;
            rooms.total += 1;
            rooms.total_capacity += guard.capacity;
            rooms.total_occupied += guard.occupied;
            match guard.status() {
                RoomStatus::Available | RoomStatus::PartiallyFilled => rooms.available += 1,
                RoomStatus::Maintenance => rooms.maintenance += 1,
                RoomStatus::Full => {}
            }
        }
        if rooms.total_capacity > 0 {
            rooms.occupancy_rate =
                f64::from(rooms.total_occupied) / f64::from(rooms.total_capacity) * 100.0;
        }

        let request_arcs: Vec<SharedRequest> =
            self.requests.iter().map(|e| e.value().clone()).collect();
        let mut requests = RequestStatistics {
            pending: 0,
            approved: 0,
            waitlisted: 0,
            allocated: 0,
            rejected: 0,
            cancelled: 0,
            total: 0,
        };
        for arc in request_arcs {
            let guard = arc.read().await;
            requests.total += 1;
            match guard.status {
                RequestStatus::Pending => requests.pending += 1,
                RequestStatus::Approved => requests.approved += 1,
                RequestStatus::Waitlisted => requests.waitlisted += 1,
                RequestStatus::Allocated => requests.allocated += 1,
                RequestStatus::Rejected => requests.rejected += 1,
                RequestStatus::Cancelled => requests.cancelled += 1,
            }
        }

        record_operation("statistics", started, true);
        Ok(Statistics { rooms, requests })
    }
}
