use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Role;

/// Who is performing an operation. Identity and session handling live in
/// the surrounding application; the engine only sees this.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageRooms,
    ProcessRequests,
    RunBatch,
    ViewReports,
}

fn allows(role: Role, cap: Capability) -> bool {
    match role {
        Role::Admin => true,
        Role::Warden => true,
        Role::OperationsAssistant => matches!(
            cap,
            Capability::ProcessRequests | Capability::ViewReports
        ),
        Role::Student | Role::Guest => false,
    }
}

/// Single capability gate, evaluated once at each admin entry point
/// instead of ad hoc role checks scattered across operations.
pub fn authorize(actor: &Actor, cap: Capability) -> Result<(), EngineError> {
    if allows(actor.role, cap) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(match cap {
            Capability::ManageRooms => "manage rooms",
            Capability::ProcessRequests => "process requests",
            Capability::RunBatch => "run batch allocation",
            Capability::ViewReports => "view reports",
        }))
    }
}
