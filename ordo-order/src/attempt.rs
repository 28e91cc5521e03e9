use chrono::{DateTime, Utc};
use ordo_core::identity::RequesterContext;
use ordo_core::payment::GatewayReceipt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{CancellationPlan, CancellationScope};

const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f72646f_2d63_616e_6365_6c6c61746e6f);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// Claimed; the refund call may be in flight.
    Pending,
    /// Money is back with the customer (or no refund was needed); local commit outstanding.
    Refunded,
    Completed,
    /// Released after a gateway failure. A retry with the same scope re-arms it.
    Failed,
    /// Refund settled but the order can no longer take the cancellation; needs an operator.
    Unreconciled,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "PENDING",
            AttemptState::Refunded => "REFUNDED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Failed => "FAILED",
            AttemptState::Unreconciled => "UNRECONCILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(AttemptState::Pending),
            "REFUNDED" => Some(AttemptState::Refunded),
            "COMPLETED" => Some(AttemptState::Completed),
            "FAILED" => Some(AttemptState::Failed),
            "UNRECONCILED" => Some(AttemptState::Unreconciled),
            _ => None,
        }
    }

    /// Blocks any other cancellation of the same order.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, AttemptState::Pending | AttemptState::Refunded)
    }
}

/// Persisted record of one cancellation, written before the gateway is called.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancellationAttempt {
    pub idempotency_key: Uuid,
    pub order_id: Uuid,
    pub plan: CancellationPlan,
    pub reason: String,
    pub requested_by: RequesterContext,
    pub state: AttemptState,
    pub receipt: Option<GatewayReceipt>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CancellationAttempt {
    pub fn new(plan: CancellationPlan, reason: String, requested_by: RequesterContext) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: idempotency_key(plan.order_id, plan.scope, &plan.line_ids),
            order_id: plan.order_id,
            plan,
            reason,
            requested_by,
            state: AttemptState::Pending,
            receipt: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic per (order, scope): a client retry of the same request maps
/// onto the same key, so the processor can de-duplicate the refund.
pub fn idempotency_key(order_id: Uuid, scope: CancellationScope, line_ids: &[Uuid]) -> Uuid {
    let name = match scope {
        CancellationScope::Full => format!("{}:full", order_id),
        CancellationScope::Partial => {
            let mut ids = line_ids.to_vec();
            ids.sort();
            let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            format!("{}:partial:{}", order_id, ids.join(","))
        }
    };
    Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_line_order() {
        let order_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            idempotency_key(order_id, CancellationScope::Partial, &[a, b]),
            idempotency_key(order_id, CancellationScope::Partial, &[b, a]),
        );
    }

    #[test]
    fn test_key_distinguishes_scope_and_order() {
        let order_id = Uuid::new_v4();
        let line = Uuid::new_v4();

        let full = idempotency_key(order_id, CancellationScope::Full, &[line]);
        let partial = idempotency_key(order_id, CancellationScope::Partial, &[line]);
        let other = idempotency_key(Uuid::new_v4(), CancellationScope::Full, &[line]);

        assert_ne!(full, partial);
        assert_ne!(full, other);
    }
}
