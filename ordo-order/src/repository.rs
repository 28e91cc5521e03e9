use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordo_catalog::InventoryError;
use ordo_core::payment::GatewayReceipt;
use uuid::Uuid;

use crate::attempt::{AttemptState, CancellationAttempt};
use crate::models::{Order, OrderError};

/// Result of claiming a cancellation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Fresh (or re-armed) attempt; the refund still has to be issued.
    Claimed(CancellationAttempt),
    /// An earlier attempt with the same key already got its refund through.
    Resumed(CancellationAttempt),
}

/// Persistence for orders and their cancellation attempts.
///
/// `claim` and `commit` each run in their own short transaction holding the
/// order's row lock; nothing holds a lock across the gateway call.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Lock the order, check it is still at `attempt.plan.expected_version` and that
    /// no other attempt is in flight, then persist the attempt as PENDING.
    async fn claim(&self, attempt: CancellationAttempt) -> Result<ClaimOutcome, StoreError>;

    /// PENDING → REFUNDED, keeping whatever the processor returned.
    async fn record_refund(
        &self,
        idempotency_key: Uuid,
        receipt: Option<GatewayReceipt>,
    ) -> Result<(), StoreError>;

    /// PENDING → FAILED. The order is left exactly as it was.
    async fn release(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError>;

    /// REFUNDED → UNRECONCILED when the commit can never succeed. Frees the order
    /// for other cancellations; the refund is left for manual reconciliation.
    async fn escalate(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError>;

    /// Apply a REFUNDED attempt: status, line marks, payment bookkeeping and
    /// stock restoration in one transaction; the attempt becomes COMPLETED.
    async fn commit(&self, idempotency_key: Uuid) -> Result<Order, StoreError>;

    async fn attempt(&self, idempotency_key: Uuid)
        -> Result<Option<CancellationAttempt>, StoreError>;

    async fn attempts_in_state(
        &self,
        state: AttemptState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<CancellationAttempt>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Cancellation attempt not found: {0}")]
    AttemptNotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error("Order invariant violated: {0}")]
    Invariant(#[from] OrderError),

    #[error("Inventory update failed: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Retrying the same commit cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::OrderNotFound(_) | StoreError::Invariant(_) => true,
            StoreError::Inventory(e) => !matches!(e, InventoryError::Backend(_)),
            _ => false,
        }
    }
}

/// Shared claim rules for every store implementation.
///
/// Returns the earlier attempt when it should be resumed instead of claiming anew.
pub fn resolve_claim(
    order_version: i64,
    attempt: &CancellationAttempt,
    same_key: Option<&CancellationAttempt>,
    other_in_flight: bool,
) -> Result<Option<CancellationAttempt>, StoreError> {
    if let Some(existing) = same_key {
        match existing.state {
            AttemptState::Refunded => return Ok(Some(existing.clone())),
            AttemptState::Pending => {
                return Err(StoreError::Conflict(format!(
                    "cancellation {} is already in flight",
                    existing.idempotency_key
                )))
            }
            AttemptState::Completed => {
                return Err(StoreError::Conflict(format!(
                    "cancellation {} already completed",
                    existing.idempotency_key
                )))
            }
            AttemptState::Unreconciled => {
                return Err(StoreError::Conflict(format!(
                    "cancellation {} is awaiting manual reconciliation",
                    existing.idempotency_key
                )))
            }
            AttemptState::Failed => {}
        }
    }

    if order_version != attempt.plan.expected_version {
        return Err(StoreError::Conflict(format!(
            "order {} changed while the cancellation was being prepared",
            attempt.order_id
        )));
    }
    if other_in_flight {
        return Err(StoreError::Conflict(format!(
            "another cancellation of order {} is in flight",
            attempt.order_id
        )));
    }

    Ok(None)
}

pub fn ensure_state(attempt: &CancellationAttempt, expected: AttemptState) -> Result<(), StoreError> {
    if attempt.state != expected {
        return Err(StoreError::Conflict(format!(
            "cancellation {} is {}, expected {}",
            attempt.idempotency_key,
            attempt.state.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}
