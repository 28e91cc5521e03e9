use chrono::{DateTime, Utc};
use ordo_core::identity::RequesterContext;
use ordo_core::payment::{GatewayError, GatewayReceipt, PaymentGateway, RefundRequest};
use ordo_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attempt::{AttemptState, CancellationAttempt};
use crate::error::CancelError;
use crate::models::{Order, OrderStatus};
use crate::plan::{CancellationPlan, CancellationRequest};
use crate::policy::CancellationPolicy;
use crate::repository::{ClaimOutcome, OrderStore};

const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancellationResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub refund_amount: Decimal,
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

/// Orchestrates full and partial cancellations against the store and the processor.
pub struct CancellationEngine {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: CancellationPolicy,
    gateway_timeout: Duration,
}

impl CancellationEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: CancellationPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }

    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &CancellationPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Cancel a whole order (no line ids) or exactly the listed lines.
    ///
    /// The refund completes, or definitively fails, before any order or stock
    /// mutation is committed.
    #[tracing::instrument(
        skip(self, requester, request),
        fields(order_id = %request.order_id, caller = %requester.caller_id)
    )]
    pub async fn cancel(
        &self,
        requester: &RequesterContext,
        request: CancellationRequest,
    ) -> Result<CancellationResult, CancelError> {
        request.validate()?;

        // Phase 1: read, authorize, plan.
        let order = self
            .store
            .load(request.order_id)
            .await?
            .filter(|order| requester.may_access(&order.owner_id))
            .ok_or(CancelError::NotFound)?;

        let plan = CancellationPlan::prepare(&order, requester, &request, &self.policy)?;
        let attempt = CancellationAttempt::new(
            plan,
            request.reason.trim().to_string(),
            requester.clone(),
        );

        // Claim re-validates under the order lock, then releases it before the refund call.
        let attempt = match self.store.claim(attempt).await? {
            ClaimOutcome::Claimed(attempt) => {
                self.settle_refund(&attempt).await?;
                attempt
            }
            ClaimOutcome::Resumed(attempt) => {
                info!(
                    idempotency_key = %attempt.idempotency_key,
                    "Refund already settled by an earlier attempt, finishing commit"
                );
                attempt
            }
        };

        // Phase 2: commit status, line marks and stock in one transaction.
        let order = self.commit_settled(&attempt).await?;

        info!(
            status = order.status.as_str(),
            amount = %attempt.plan.refund_amount,
            "Order cancellation committed"
        );

        Ok(CancellationResult {
            order_id: order.id,
            status: order.status,
            refund_amount: attempt.plan.refund_amount,
            reason: attempt.reason,
            canceled_at: order.updated_at,
        })
    }

    /// Finish an attempt whose refund is already settled.
    pub async fn complete(&self, idempotency_key: Uuid) -> Result<Order, CancelError> {
        Ok(self.store.commit(idempotency_key).await?)
    }

    /// Commit a settled attempt. A commit finished elsewhere counts as ours.
    async fn commit_settled(&self, attempt: &CancellationAttempt) -> Result<Order, CancelError> {
        let err = match self.store.commit(attempt.idempotency_key).await {
            Ok(order) => return Ok(order),
            Err(e) => e,
        };

        let finished = matches!(
            self.store.attempt(attempt.idempotency_key).await,
            Ok(Some(ref stored)) if stored.state == AttemptState::Completed
        );
        if finished {
            if let Some(order) = self.store.load(attempt.order_id).await? {
                info!(
                    idempotency_key = %attempt.idempotency_key,
                    "Cancellation was committed concurrently"
                );
                return Ok(order);
            }
        }

        error!(
            idempotency_key = %attempt.idempotency_key,
            error = %err,
            "Refund settled but local commit failed; recovery will retry"
        );
        Err(err.into())
    }

    async fn settle_refund(&self, attempt: &CancellationAttempt) -> Result<(), CancelError> {
        let plan = &attempt.plan;

        let receipt = match (plan.refund_required, &plan.payment_key) {
            (true, Some(payment_key)) => {
                let request = RefundRequest {
                    payment_key: payment_key.clone(),
                    amount: plan.gateway_amount,
                    reason: attempt.reason.clone(),
                    idempotency_key: attempt.idempotency_key,
                };

                match self.call_gateway(&request).await {
                    Ok(receipt) => Some(receipt),
                    Err(err) => {
                        if err.is_indeterminate() {
                            warn!(
                                payment_key = ?Masked(payment_key),
                                idempotency_key = %attempt.idempotency_key,
                                error = %err,
                                "Refund outcome unknown; retries reuse the idempotency key"
                            );
                        } else {
                            warn!(error = %err, "Refund rejected by gateway");
                        }

                        if let Err(release_err) =
                            self.store.release(attempt.idempotency_key, &err.to_string()).await
                        {
                            error!(error = %release_err, "Failed to release cancellation attempt");
                        }
                        return Err(CancelError::Gateway(err));
                    }
                }
            }
            (true, None) => {
                warn!(
                    order_id = %plan.order_id,
                    status = plan.from_status.as_str(),
                    amount = %plan.refund_amount,
                    "Refund required but order has no gateway reference; cancelling internally"
                );
                None
            }
            (false, _) => None,
        };

        self.store
            .record_refund(attempt.idempotency_key, receipt)
            .await?;
        Ok(())
    }

    async fn call_gateway(&self, request: &RefundRequest) -> Result<GatewayReceipt, GatewayError> {
        match tokio::time::timeout(self.gateway_timeout, self.gateway.refund(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.gateway_timeout)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use ordo_core::payment::{
        ConfirmRequest, GatewayError, GatewayReceipt, PaymentGateway, RefundRequest,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    pub enum Behaviour {
        Succeed,
        FailWith(u16),
        Hang(Duration),
    }

    /// Records every refund it is asked for.
    pub struct RecordingGateway {
        behaviour: Behaviour,
        pub refunds: Mutex<Vec<RefundRequest>>,
    }

    impl RecordingGateway {
        pub fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                refunds: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.refunds.lock().unwrap().len()
        }

        pub fn last(&self) -> Option<RefundRequest> {
            self.refunds.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        async fn refund(&self, request: &RefundRequest) -> Result<GatewayReceipt, GatewayError> {
            self.refunds.lock().unwrap().push(request.clone());
            match &self.behaviour {
                Behaviour::Succeed => Ok(GatewayReceipt {
                    status: if request.amount.is_none() {
                        "CANCELED".to_string()
                    } else {
                        "PARTIAL_CANCELED".to_string()
                    },
                    transaction_key: Some("txn_1".to_string()),
                    canceled_amount: request.amount,
                    receipt_url: None,
                    raw: serde_json::json!({}),
                }),
                Behaviour::FailWith(status) => Err(GatewayError::Rejected {
                    status: *status,
                    code: "PROVIDER_ERROR".to_string(),
                    message: "internal error".to_string(),
                }),
                Behaviour::Hang(delay) => {
                    tokio::time::sleep(*delay).await;
                    Err(GatewayError::Transport("late".to_string()))
                }
            }
        }

        async fn confirm(&self, _request: &ConfirmRequest) -> Result<GatewayReceipt, GatewayError> {
            unreachable!("cancellation never confirms payments")
        }
    }
}
