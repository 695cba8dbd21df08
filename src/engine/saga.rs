use tracing::{error, warn};
use ulid::Ulid;

use crate::model::{Event, RequestStatus};
use crate::observability;

use super::{Engine, EngineError};

/// One entry of the compensation stack. Pushed after the corresponding
/// forward write succeeds; executed in reverse order when a later write
/// fails. Occupancy compensation re-reads under the room lock rather than
/// restoring a captured value, so concurrent allocations on the same room
/// are not clobbered.
pub(crate) enum Undo {
    /// Record-level inverse write.
    Record(Event),
    /// Inverse of a request transition. Skipped (not failed) when another
    /// operation has legally moved the request on in the meantime.
    RevertRequest {
        id: Ulid,
        expected: RequestStatus,
        event: Event,
    },
    /// Inverse of a decrement.
    Occupy(Ulid),
    /// Inverse of an increment.
    Vacate(Ulid),
}

impl Engine {
    /// Execute the undo stack in reverse order, then surface the original
    /// error — or `Inconsistency` if an undo itself fails, which is logged
    /// as a critical condition and left for operator reconciliation.
    pub(crate) async fn unwind(&self, undos: Vec<Undo>, cause: EngineError) -> EngineError {
        metrics::counter!(observability::ROLLBACKS_TOTAL).increment(1);
        warn!(steps = undos.len(), "rolling back multi-record sequence: {cause}");
        for undo in undos.into_iter().rev() {
            let result = match undo {
                Undo::Record(event) => self.persist_and_apply(&event).await,
                Undo::RevertRequest { id, expected, event } => {
                    match self.transition_request(id, &[expected], event).await {
                        Ok(_) => Ok(()),
                        Err(EngineError::InvalidState { status, .. }) => {
                            // Another operation won the request meanwhile
                            // (e.g. a concurrent cancel); its end state is
                            // already consistent.
                            warn!(request = %id, now = %status, "request revert superseded; skipping");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Undo::Occupy(room_id) => self.occupy_room(room_id).await.map(|_| ()),
                Undo::Vacate(room_id) => self.vacate_room(room_id).await.map(|_| ()),
            };
            if let Err(e) = result {
                let msg =
                    format!("compensation failed: {e} (while rolling back after: {cause})");
                error!("{msg}");
                metrics::counter!(observability::INCONSISTENCIES_TOTAL).increment(1);
                return EngineError::Inconsistency(msg);
            }
        }
        cause
    }
}
