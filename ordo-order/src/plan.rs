use ordo_catalog::StockRestoration;
use ordo_core::identity::RequesterContext;
use ordo_shared::money::to_minor_units;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::CancelError;
use crate::models::{LineStatus, Order, OrderLine, OrderStatus};
use crate::policy::CancellationPolicy;

/// Caller's intent. An empty `line_ids` cancels everything still active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancellationRequest {
    pub order_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub line_ids: Vec<Uuid>,
}

impl CancellationRequest {
    pub fn full(order_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
            line_ids: Vec::new(),
        }
    }

    pub fn lines(order_id: Uuid, reason: impl Into<String>, line_ids: Vec<Uuid>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
            line_ids,
        }
    }

    pub fn validate(&self) -> Result<(), CancelError> {
        if self.reason.trim().is_empty() {
            return Err(CancelError::validation("cancellation reason must not be blank"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationScope {
    Full,
    Partial,
}

/// Everything decided before any side effect: which lines go, how much money
/// goes back, where the order lands and which stock is restored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancellationPlan {
    pub order_id: Uuid,
    pub scope: CancellationScope,
    pub line_ids: Vec<Uuid>,
    pub refund_amount: Decimal,
    /// Amount for the processor in minor units; `None` means "everything left".
    pub gateway_amount: Option<i64>,
    pub refund_required: bool,
    /// Present only when a refund is required and the order has a gateway reference.
    pub payment_key: Option<String>,
    pub from_status: OrderStatus,
    pub next_status: OrderStatus,
    pub restorations: Vec<StockRestoration>,
    /// Order version the plan was computed from.
    pub expected_version: i64,
}

impl CancellationPlan {
    pub fn prepare(
        order: &Order,
        requester: &RequesterContext,
        request: &CancellationRequest,
        policy: &CancellationPolicy,
    ) -> Result<Self, CancelError> {
        request.validate()?;

        if order.status.is_cancellation_terminal() {
            return Err(CancelError::validation(format!(
                "order {} is {} and can no longer be cancelled",
                order.id,
                order.status.as_str()
            )));
        }
        if !order.status.cancelable_by(requester.role) {
            return Err(CancelError::validation(format!(
                "order {} in status {} cannot be cancelled by {:?}",
                order.id,
                order.status.as_str(),
                requester.role
            )));
        }

        let (scope, targets) = if request.line_ids.is_empty() {
            (CancellationScope::Full, Self::full_targets(order)?)
        } else {
            (
                CancellationScope::Partial,
                Self::partial_targets(order, &request.line_ids, policy)?,
            )
        };

        let refund_amount: Decimal = targets.iter().map(|l| l.line_total).sum();
        if refund_amount <= Decimal::ZERO {
            return Err(CancelError::validation(format!(
                "refund amount {} must be positive",
                refund_amount
            )));
        }

        let (gateway_amount, next_status) = match scope {
            CancellationScope::Full => (None, OrderStatus::Canceled),
            CancellationScope::Partial => {
                let minor = to_minor_units(refund_amount, policy.currency_exponent)
                    .map_err(|e| CancelError::validation(e.to_string()))?;
                let exhaustive = targets.len() == order.active_lines().count();
                let next = if exhaustive && policy.promote_exhaustive_partial {
                    OrderStatus::Canceled
                } else {
                    OrderStatus::PartiallyCanceled
                };
                (Some(minor), next)
            }
        };

        // A partial cancel before payment leaves PARTIALLY_CANCELED with nothing to refund.
        let unpaid_remainder =
            order.status == OrderStatus::PartiallyCanceled && order.payment.is_none();
        let refund_required = policy.requires_refund(order.status) && !unpaid_remainder;
        let payment_key = match (&order.payment, refund_required) {
            (Some(payment), true) => {
                payment
                    .ensure_refundable(refund_amount)
                    .map_err(|e| CancelError::validation(e.to_string()))?;
                Some(payment.payment_key.clone())
            }
            _ => None,
        };

        let restorations = StockRestoration::aggregate(
            targets.iter().map(|l| (l.item_id, i64::from(l.quantity))),
        );

        Ok(Self {
            order_id: order.id,
            scope,
            line_ids: targets.iter().map(|l| l.id).collect(),
            refund_amount,
            gateway_amount,
            refund_required,
            payment_key,
            from_status: order.status,
            next_status,
            restorations,
            expected_version: order.version,
        })
    }

    pub fn calls_gateway(&self) -> bool {
        self.refund_required && self.payment_key.is_some()
    }

    fn full_targets(order: &Order) -> Result<Vec<&OrderLine>, CancelError> {
        let targets: Vec<&OrderLine> = order.active_lines().collect();
        if targets.is_empty() {
            return Err(CancelError::validation(format!(
                "order {} has no active lines left",
                order.id
            )));
        }
        Ok(targets)
    }

    /// All-or-nothing: one foreign, repeated, cancelled or ineligible id rejects the request.
    fn partial_targets<'a>(
        order: &'a Order,
        line_ids: &[Uuid],
        policy: &CancellationPolicy,
    ) -> Result<Vec<&'a OrderLine>, CancelError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(line_ids.len());

        for line_id in line_ids {
            if !seen.insert(*line_id) {
                return Err(CancelError::validation(format!(
                    "line {} listed more than once",
                    line_id
                )));
            }

            let line = order.line(line_id).ok_or_else(|| {
                CancelError::validation(format!(
                    "line {} does not belong to order {}",
                    line_id, order.id
                ))
            })?;

            if line.status != LineStatus::Active {
                return Err(CancelError::validation(format!(
                    "line {} is already cancelled",
                    line_id
                )));
            }
            if !policy.partial_cancel.allows_partial(&line.category) {
                return Err(CancelError::validation(format!(
                    "line {} in category {} cannot be cancelled individually",
                    line_id, line.category
                )));
            }
            if line.line_total <= Decimal::ZERO {
                return Err(CancelError::validation(format!(
                    "line {} has non-positive total {}",
                    line_id, line.line_total
                )));
            }

            targets.push(line);
        }

        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{line, order};

    fn paid_order(lines: Vec<crate::models::NewOrderLine>) -> Order {
        let mut order = order("member-1", lines);
        order.confirm_payment("pay_key_1".to_string()).unwrap();
        order
    }

    fn owner() -> RequesterContext {
        RequesterContext::owner("member-1")
    }

    #[test]
    fn test_full_plan_refunds_remaining_total() {
        let order = paid_order(vec![
            line(Uuid::new_v4(), "GOODS", 1, 10000),
            line(Uuid::new_v4(), "GOODS", 1, 5000),
        ]);

        let plan = CancellationPlan::prepare(
            &order,
            &owner(),
            &CancellationRequest::full(order.id, "changed my mind"),
            &CancellationPolicy::default(),
        )
        .unwrap();

        assert_eq!(plan.scope, CancellationScope::Full);
        assert_eq!(plan.refund_amount, Decimal::from(15000));
        assert_eq!(plan.gateway_amount, None);
        assert_eq!(plan.next_status, OrderStatus::Canceled);
        assert!(plan.calls_gateway());
        assert_eq!(plan.restorations.len(), 2);
    }

    #[test]
    fn test_partial_plan_sums_targets_only() {
        let order = paid_order(vec![
            line(Uuid::new_v4(), "GOODS", 2, 1000),
            line(Uuid::new_v4(), "GOODS", 1, 3000),
            line(Uuid::new_v4(), "GOODS", 1, 500),
        ]);
        let target = order.lines[1].id;

        let plan = CancellationPlan::prepare(
            &order,
            &owner(),
            &CancellationRequest::lines(order.id, "wrong size", vec![target]),
            &CancellationPolicy::default(),
        )
        .unwrap();

        assert_eq!(plan.refund_amount, Decimal::from(3000));
        assert_eq!(plan.gateway_amount, Some(3000));
        assert_eq!(plan.line_ids, vec![target]);
        assert_eq!(plan.next_status, OrderStatus::PartiallyCanceled);
    }

    #[test]
    fn test_exhaustive_partial_stays_partial_unless_promoted() {
        let order = paid_order(vec![line(Uuid::new_v4(), "GOODS", 1, 700)]);
        let request = CancellationRequest::lines(order.id, "duplicate", vec![order.lines[0].id]);

        let plan =
            CancellationPlan::prepare(&order, &owner(), &request, &CancellationPolicy::default())
                .unwrap();
        assert_eq!(plan.next_status, OrderStatus::PartiallyCanceled);

        let policy = CancellationPolicy {
            promote_exhaustive_partial: true,
            ..CancellationPolicy::default()
        };
        let plan = CancellationPlan::prepare(&order, &owner(), &request, &policy).unwrap();
        assert_eq!(plan.next_status, OrderStatus::Canceled);
        assert_eq!(plan.gateway_amount, Some(700));
    }

    #[test]
    fn test_blank_reason_rejected() {
        let order = paid_order(vec![line(Uuid::new_v4(), "GOODS", 1, 700)]);
        let result = CancellationPlan::prepare(
            &order,
            &owner(),
            &CancellationRequest::full(order.id, "   "),
            &CancellationPolicy::default(),
        );
        assert!(matches!(result, Err(CancelError::Validation(_))));
    }

    #[test]
    fn test_role_gates_processing_orders() {
        let mut order = paid_order(vec![line(Uuid::new_v4(), "GOODS", 1, 700)]);
        order.update_status(OrderStatus::Processing);
        let request = CancellationRequest::full(order.id, "out of stock");
        let policy = CancellationPolicy::default();

        let as_owner = CancellationPlan::prepare(&order, &owner(), &request, &policy);
        assert!(matches!(as_owner, Err(CancelError::Validation(_))));

        let as_admin =
            CancellationPlan::prepare(&order, &RequesterContext::admin("ops-1"), &request, &policy);
        assert!(as_admin.is_ok());
    }

    #[test]
    fn test_ineligible_category_and_duplicates_rejected() {
        let order = paid_order(vec![
            line(Uuid::new_v4(), "MEMBERSHIP", 1, 9900),
            line(Uuid::new_v4(), "GOODS", 1, 1000),
        ]);
        let policy = CancellationPolicy::default();

        let membership = CancellationRequest::lines(order.id, "no", vec![order.lines[0].id]);
        assert!(matches!(
            CancellationPlan::prepare(&order, &owner(), &membership, &policy),
            Err(CancelError::Validation(_))
        ));

        let goods = order.lines[1].id;
        let repeated = CancellationRequest::lines(order.id, "no", vec![goods, goods]);
        assert!(matches!(
            CancellationPlan::prepare(&order, &owner(), &repeated, &policy),
            Err(CancelError::Validation(_))
        ));
    }

    #[test]
    fn test_non_integral_partial_amount_rejected() {
        let mut input = line(Uuid::new_v4(), "GOODS", 1, 0);
        input.unit_price = Decimal::new(10005, 1);
        let order = paid_order(vec![input, line(Uuid::new_v4(), "GOODS", 1, 1000)]);

        let request = CancellationRequest::lines(order.id, "typo", vec![order.lines[0].id]);
        let result =
            CancellationPlan::prepare(&order, &owner(), &request, &CancellationPolicy::default());
        assert!(matches!(result, Err(CancelError::Validation(_))));
    }

    #[test]
    fn test_pending_payment_needs_no_refund() {
        let order = order("member-1", vec![line(Uuid::new_v4(), "GOODS", 1, 700)]);
        let plan = CancellationPlan::prepare(
            &order,
            &owner(),
            &CancellationRequest::full(order.id, "abandoned"),
            &CancellationPolicy::default(),
        )
        .unwrap();

        assert!(!plan.refund_required);
        assert!(!plan.calls_gateway());
    }

    #[test]
    fn test_unpaid_partially_canceled_remainder_needs_no_refund() {
        let mut order = order(
            "member-1",
            vec![line(Uuid::new_v4(), "GOODS", 1, 700), line(Uuid::new_v4(), "GOODS", 1, 300)],
        );
        let admin = RequesterContext::admin("ops-1");
        let policy = CancellationPolicy::default();

        let first = CancellationRequest::lines(order.id, "split", vec![order.lines[0].id]);
        let partial = CancellationPlan::prepare(&order, &admin, &first, &policy).unwrap();
        order.apply_cancellation(&partial, chrono::Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyCanceled);

        let rest = CancellationRequest::full(order.id, "never paid");
        let plan = CancellationPlan::prepare(&order, &admin, &rest, &policy).unwrap();

        assert!(!plan.refund_required);
        assert!(plan.payment_key.is_none());
        assert_eq!(plan.refund_amount, Decimal::from(300));
    }
}
