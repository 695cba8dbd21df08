use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{Actor, Capability, authorize};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

fn validate_room_fields(number: &str, floor: i32, capacity: u32) -> Result<(), EngineError> {
    if number.is_empty() {
        return Err(EngineError::Validation("room number must not be empty"));
    }
    if number.len() > MAX_ROOM_NUMBER_LEN {
        return Err(EngineError::LimitExceeded("room number too long"));
    }
    if !(MIN_FLOOR..=MAX_FLOOR).contains(&floor) {
        return Err(EngineError::Validation("floor out of range"));
    }
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1"));
    }
    if capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// Room with this number already present? Check-then-act like every
    /// other uniqueness guard against this store.
    async fn number_taken(&self, number: &str, except: Option<Ulid>) -> Option<Ulid> {
        let arcs: Vec<_> = self
            .rooms
            .iter()
            .filter(|e| except != Some(*e.key()))
            .map(|e| e.value().clone())
            .collect();
        for rs in arcs {
            let guard = rs.read().await;
            if guard.number == number {
                return Some(guard.id);
            }
        }
        None
    }

    pub async fn add_room(
        &self,
        actor: &Actor,
        id: Ulid,
        number: String,
        floor: i32,
        room_type: RoomType,
        capacity: u32,
    ) -> Result<RoomInfo, EngineError> {
        authorize(actor, Capability::ManageRooms)?;
        validate_room_fields(&number, floor, capacity)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::Conflict(id));
        }
        if let Some(existing) = self.number_taken(&number, None).await {
            return Err(EngineError::Conflict(existing));
        }

        let event = Event::RoomAdded {
            id,
            number,
            floor,
            room_type,
            capacity,
        };
        self.persist_and_apply(&event).await?;
        info!(room = %id, "room added");

        let rs = self.room(&id)?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    pub async fn update_room(
        &self,
        actor: &Actor,
        id: Ulid,
        number: String,
        floor: i32,
        room_type: RoomType,
        capacity: u32,
    ) -> Result<RoomInfo, EngineError> {
        authorize(actor, Capability::ManageRooms)?;
        validate_room_fields(&number, floor, capacity)?;
        if let Some(existing) = self.number_taken(&number, Some(id)).await {
            return Err(EngineError::Conflict(existing));
        }

        let rs = self.room(&id)?;
        let mut guard = rs.write().await;
        if capacity < guard.occupied {
            return Err(EngineError::Validation("capacity below current occupancy"));
        }

        let event = Event::RoomUpdated {
            id,
            number,
            floor,
            room_type,
            capacity,
        };
        self.persist_and_apply_room(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Flip a room in or out of maintenance. Clearing maintenance frees
    /// capacity, so the waitlist is promoted afterwards.
    pub async fn set_maintenance(
        &self,
        actor: &Actor,
        id: Ulid,
        maintenance: bool,
    ) -> Result<RoomInfo, EngineError> {
        authorize(actor, Capability::ManageRooms)?;
        let rs = self.room(&id)?;
        let mut guard = rs.write().await;
        if guard.maintenance == maintenance {
            return Ok(guard.info());
        }
        let event = Event::RoomMaintenanceSet { id, maintenance };
        self.persist_and_apply_room(&mut guard, &event).await?;
        let info = guard.info();
        drop(guard);

        if !maintenance
            && let Err(e) = self.promote_waitlist().await
        {
            warn!(room = %id, "waitlist promotion after maintenance clear failed: {e}");
        }
        Ok(info)
    }

    /// Remove an empty room from the ledger. Occupied rooms conflict with
    /// their active allocations and must be vacated first.
    pub async fn remove_room(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        authorize(actor, Capability::ManageRooms)?;
        let rs = self.room(&id)?;
        let guard = rs.write().await;
        if guard.occupied > 0 {
            return Err(EngineError::Conflict(id));
        }
        let event = Event::RoomRemoved { id };
        self.persist_and_apply(&event).await?;
        info!(room = %id, "room removed");
        Ok(())
    }

    // ── Occupancy guard ──────────────────────────────────────
    //
    // The `occupied` counter is the one truly contended value in the
    // system, and it is mutated only here. Both helpers re-read the
    // counter under the room's write lock immediately before writing, so
    // the availability verdict and the write are a single atomic step —
    // no other allocator can interleave between them.

    pub(crate) async fn occupy_room(&self, room_id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.room(&room_id)?;
        let mut guard = rs.write().await;
        if !self.rooms.contains_key(&room_id) {
            // Removed while we waited for the lock.
            return Err(EngineError::NotFound(room_id));
        }
        if guard.maintenance {
            return Err(EngineError::Unavailable(room_id));
        }
        if guard.occupied >= guard.capacity {
            return Err(EngineError::CapacityExceeded {
                room_id,
                capacity: guard.capacity,
            });
        }
        let event = Event::RoomOccupancySet {
            id: room_id,
            occupied: guard.occupied + 1,
        };
        self.persist_and_apply_room(&mut guard, &event).await?;
        metrics::gauge!(observability::BEDS_OCCUPIED).increment(1.0);
        Ok(guard.info())
    }

    pub(crate) async fn vacate_room(&self, room_id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.room(&room_id)?;
        let mut guard = rs.write().await;
        if guard.occupied == 0 {
            // Counter drift; tolerated on release so a stuck record can
            // still be cleaned up, but worth an operator's attention.
            warn!(room = %room_id, "vacate on a room with zero occupancy");
            return Ok(guard.info());
        }
        let event = Event::RoomOccupancySet {
            id: room_id,
            occupied: guard.occupied - 1,
        };
        self.persist_and_apply_room(&mut guard, &event).await?;
        metrics::gauge!(observability::BEDS_OCCUPIED).decrement(1.0);
        Ok(guard.info())
    }
}
