use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::attempt::AttemptState;
use crate::repository::{OrderStore, StoreError};

/// What a single relay pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// REFUNDED attempts whose local commit was finished.
    pub completed: usize,
    /// Stale PENDING attempts marked FAILED.
    pub abandoned: usize,
    /// REFUNDED attempts whose commit can never succeed, parked as UNRECONCILED.
    pub escalated: usize,
    /// Attempts the pass could not move forward; retried on the next pass.
    pub failed: usize,
}

/// Drives attempts left behind by a crash between the refund and the commit.
///
/// Only attempts untouched for `stale_after` are considered, so a request still
/// finishing its own commit is never raced. A REFUNDED attempt has its money back
/// with the customer, so its commit is always safe to finish; if the order can no
/// longer take it, the attempt is escalated. A PENDING attempt never learned its
/// gateway outcome; it is released for operator review and never re-sent.
pub struct RecoveryRelay {
    store: Arc<dyn OrderStore>,
    stale_after: Duration,
}

impl RecoveryRelay {
    pub fn new(store: Arc<dyn OrderStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        let cutoff = now - self.stale_after;

        for attempt in self.store.attempts_in_state(AttemptState::Refunded, cutoff).await? {
            match self.store.commit(attempt.idempotency_key).await {
                Ok(order) => {
                    info!(
                        order_id = %order.id,
                        idempotency_key = %attempt.idempotency_key,
                        status = order.status.as_str(),
                        "Recovered settled cancellation"
                    );
                    report.completed += 1;
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        order_id = %attempt.order_id,
                        idempotency_key = %attempt.idempotency_key,
                        amount = %attempt.plan.refund_amount,
                        error = %e,
                        "Refunded cancellation cannot be applied; escalating for manual reconciliation"
                    );
                    match self.store.escalate(attempt.idempotency_key, &e.to_string()).await {
                        Ok(()) => report.escalated += 1,
                        Err(escalate_err) => {
                            warn!(error = %escalate_err, "Failed to escalate cancellation attempt");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        idempotency_key = %attempt.idempotency_key,
                        error = %e,
                        "Could not commit settled cancellation"
                    );
                    report.failed += 1;
                }
            }
        }

        for attempt in self.store.attempts_in_state(AttemptState::Pending, cutoff).await? {
            error!(
                order_id = %attempt.order_id,
                idempotency_key = %attempt.idempotency_key,
                amount = %attempt.plan.refund_amount,
                "Refund outcome unknown for stale attempt; releasing for manual reconciliation"
            );
            match self
                .store
                .release(attempt.idempotency_key, "refund outcome unknown after restart")
                .await
            {
                Ok(()) => report.abandoned += 1,
                Err(e) => {
                    warn!(
                        idempotency_key = %attempt.idempotency_key,
                        error = %e,
                        "Stale attempt moved on before it could be released"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::CancellationAttempt;
    use crate::memory::MemoryOrderStore;
    use crate::models::fixtures::{line, order};
    use crate::models::OrderStatus;
    use crate::plan::{CancellationPlan, CancellationRequest};
    use crate::policy::CancellationPolicy;
    use ordo_catalog::MemoryInventory;
    use ordo_core::identity::RequesterContext;
    use uuid::Uuid;

    async fn claimed(store: &MemoryOrderStore, inventory: &MemoryInventory) -> CancellationAttempt {
        let item = Uuid::new_v4();
        inventory.initialize(item, 5);

        let mut order = order("member-1", vec![line(item, "GOODS", 1, 2000)]);
        order.confirm_payment("pay_1".to_string()).unwrap();
        store.insert(order.clone()).await;

        let owner = RequesterContext::owner("member-1");
        let request = CancellationRequest::full(order.id, "lost in transit");
        let plan =
            CancellationPlan::prepare(&order, &owner, &request, &CancellationPolicy::default())
                .unwrap();
        let attempt = CancellationAttempt::new(plan, request.reason, owner);
        store.claim(attempt.clone()).await.unwrap();
        attempt
    }

    #[tokio::test]
    async fn test_refunded_attempts_are_committed() {
        let inventory = Arc::new(MemoryInventory::new());
        let store = Arc::new(MemoryOrderStore::new(inventory.clone()));
        let attempt = claimed(&store, &inventory).await;
        store.record_refund(attempt.idempotency_key, None).await.unwrap();

        let relay = RecoveryRelay::new(store.clone(), Duration::seconds(60));
        let report = relay.run_once(Utc::now() + Duration::minutes(5)).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.abandoned, 0);
        let order = store.load(attempt.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(inventory.stock_of(&attempt.plan.restorations[0].item_id), Some(6));

        // Nothing left to do on the next pass.
        let again = relay.run_once(Utc::now() + Duration::minutes(5)).await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_fresh_refunded_attempt_is_left_to_its_request() {
        let inventory = Arc::new(MemoryInventory::new());
        let store = Arc::new(MemoryOrderStore::new(inventory.clone()));
        let attempt = claimed(&store, &inventory).await;
        store.record_refund(attempt.idempotency_key, None).await.unwrap();

        let relay = RecoveryRelay::new(store.clone(), Duration::seconds(300));
        let report = relay.run_once(Utc::now()).await.unwrap();

        assert_eq!(report.completed, 0);
        let stored = store.attempt(attempt.idempotency_key).await.unwrap().unwrap();
        assert_eq!(stored.state, AttemptState::Refunded);
        assert_eq!(inventory.stock_of(&attempt.plan.restorations[0].item_id), Some(5));

        // The request can still finish its own commit.
        let order = store.commit(attempt.idempotency_key).await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn test_unappliable_refund_is_escalated_once() {
        let inventory = Arc::new(MemoryInventory::new());
        let store = Arc::new(MemoryOrderStore::new(inventory.clone()));
        let attempt = claimed(&store, &inventory).await;
        store.record_refund(attempt.idempotency_key, None).await.unwrap();

        // The order moved on while the refund was in flight.
        let mut order = store.load(attempt.order_id).await.unwrap().unwrap();
        order.update_status(OrderStatus::Delivered);
        store.insert(order).await;

        let relay = RecoveryRelay::new(store.clone(), Duration::seconds(60));
        let report = relay.run_once(Utc::now() + Duration::minutes(5)).await.unwrap();

        assert_eq!(report.escalated, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 0);

        let stored = store.attempt(attempt.idempotency_key).await.unwrap().unwrap();
        assert_eq!(stored.state, AttemptState::Unreconciled);
        assert!(stored.failure.unwrap().contains("Delivered"));
        assert!(!stored.state.is_in_flight());
        assert_eq!(inventory.stock_of(&attempt.plan.restorations[0].item_id), Some(5));

        let again = relay.run_once(Utc::now() + Duration::minutes(10)).await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_stale_pending_is_released_not_retried() {
        let inventory = Arc::new(MemoryInventory::new());
        let store = Arc::new(MemoryOrderStore::new(inventory.clone()));
        let attempt = claimed(&store, &inventory).await;
        let relay = RecoveryRelay::new(store.clone(), Duration::seconds(60));

        let fresh = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(fresh.abandoned, 0);

        let later = relay.run_once(Utc::now() + Duration::minutes(5)).await.unwrap();
        assert_eq!(later.abandoned, 1);

        let stored = store.attempt(attempt.idempotency_key).await.unwrap().unwrap();
        assert_eq!(stored.state, AttemptState::Failed);
        let order = store.load(attempt.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }
}
