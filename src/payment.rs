use async_trait::async_trait;
use ulid::Ulid;

/// Failure reported by the payment collaborator. Logged and counted by the
/// engine, never turned into an operation failure.
#[derive(Debug)]
pub struct PaymentError(pub String);

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payment initiation failed: {}", self.0)
    }
}

impl std::error::Error for PaymentError {}

/// External payment collaborator, invoked after a successful allocation.
/// Best-effort: the allocation stands whatever this returns.
#[async_trait]
pub trait PaymentInitiator: Send + Sync {
    async fn initiate(
        &self,
        requester_id: Ulid,
        room_id: Ulid,
        allocation_id: Ulid,
    ) -> Result<(), PaymentError>;
}

/// Default collaborator for deployments that bill out of band.
pub struct NoopPayments;

#[async_trait]
impl PaymentInitiator for NoopPayments {
    async fn initiate(&self, _: Ulid, _: Ulid, _: Ulid) -> Result<(), PaymentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn noop_always_succeeds() {
        let p = NoopPayments;
        assert_ok!(p.initiate(Ulid::new(), Ulid::new(), Ulid::new()).await);
    }
}
