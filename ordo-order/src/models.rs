use chrono::{DateTime, Utc};
use ordo_core::identity::RequesterRole;
use ordo_core::payment::{PaymentRecord, PaymentRecordError};
use ordo_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{CancellationPlan, CancellationScope};

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PaymentPending,
    Paid,
    PaymentFailed,
    PaymentExpired,
    Processing,
    ShipmentReady,
    Shipped,
    Delivered,
    Canceled,
    PartiallyCanceled,
    Returned,
    Refunded,
}

impl OrderStatus {
    pub fn cancelable_by_owner(&self) -> bool {
        matches!(self, OrderStatus::PaymentPending | OrderStatus::Paid)
    }

    pub fn cancelable_by_admin(&self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentPending
                | OrderStatus::Paid
                | OrderStatus::Processing
                | OrderStatus::ShipmentReady
                | OrderStatus::PartiallyCanceled
        )
    }

    pub fn cancelable_by(&self, role: RequesterRole) -> bool {
        match role {
            RequesterRole::Owner => self.cancelable_by_owner(),
            RequesterRole::Admin => self.cancelable_by_admin(),
        }
    }

    /// No caller may cancel from these states.
    pub fn is_cancellation_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled
                | OrderStatus::Delivered
                | OrderStatus::Returned
                | OrderStatus::Refunded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PaymentPending => "PAYMENT_PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::PaymentExpired => "PAYMENT_EXPIRED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::ShipmentReady => "SHIPMENT_READY",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::PartiallyCanceled => "PARTIALLY_CANCELED",
            OrderStatus::Returned => "RETURNED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PAYMENT_PENDING" => OrderStatus::PaymentPending,
            "PAID" => OrderStatus::Paid,
            "PAYMENT_FAILED" => OrderStatus::PaymentFailed,
            "PAYMENT_EXPIRED" => OrderStatus::PaymentExpired,
            "PROCESSING" => OrderStatus::Processing,
            "SHIPMENT_READY" => OrderStatus::ShipmentReady,
            "SHIPPED" => OrderStatus::Shipped,
            "DELIVERED" => OrderStatus::Delivered,
            "CANCELED" => OrderStatus::Canceled,
            "PARTIALLY_CANCELED" => OrderStatus::PartiallyCanceled,
            "RETURNED" => OrderStatus::Returned,
            "REFUNDED" => OrderStatus::Refunded,
            _ => return None,
        })
    }
}

/// Order line status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineStatus {
    Active,
    Canceled,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Active => "ACTIVE",
            LineStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(LineStatus::Active),
            "CANCELED" => Some(LineStatus::Canceled),
            _ => None,
        }
    }
}

/// Receiver details captured when the order was placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippingSnapshot {
    pub receiver_name: Masked<String>,
    pub receiver_phone: Masked<String>,
    pub zip_code: String,
    pub address: Masked<String>,
}

/// The single source of truth for a member's purchase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub owner_id: String,
    pub status: OrderStatus,
    /// Ordered total; equals the sum of line totals at creation and never changes.
    pub total_amount: Decimal,
    pub currency: String,
    pub shipping: ShippingSnapshot,
    pub lines: Vec<OrderLine>,
    pub payment: Option<PaymentRecord>,
    /// Bumped on every committed mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a line at order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub item_id: Uuid,
    pub item_name: String,
    pub category: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl Order {
    pub fn place(
        owner_id: String,
        currency: String,
        shipping: ShippingSnapshot,
        lines: Vec<NewOrderLine>,
    ) -> Result<Self, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::Empty);
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let lines = lines
            .into_iter()
            .map(|line| OrderLine::new(id, line))
            .collect::<Result<Vec<_>, _>>()?;
        let total_amount = lines.iter().map(|l| l.line_total).sum();

        Ok(Self {
            id,
            owner_id,
            status: OrderStatus::PaymentPending,
            total_amount,
            currency,
            shipping,
            lines,
            payment: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Transition: PaymentPending → Paid once the processor confirmed the payment
    pub fn confirm_payment(&mut self, payment_key: String) -> Result<(), OrderError> {
        if let Some(existing) = &self.payment {
            return Err(OrderError::PaymentAlreadyAttached(existing.id));
        }
        if self.status != OrderStatus::PaymentPending {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: OrderStatus::Paid,
            });
        }

        self.payment = Some(PaymentRecord::new(self.id, payment_key, self.total_amount));
        self.update_status(OrderStatus::Paid);
        Ok(())
    }

    /// Update order status
    pub fn update_status(&mut self, new_status: OrderStatus) {
        self.status = new_status;
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn line(&self, line_id: &Uuid) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.id == *line_id)
    }

    pub fn active_lines(&self) -> impl Iterator<Item = &OrderLine> {
        self.lines.iter().filter(|l| l.status == LineStatus::Active)
    }

    /// Sum of line totals not yet cancelled; what a full cancellation still refunds.
    pub fn remaining_total(&self) -> Decimal {
        self.active_lines().map(|l| l.line_total).sum()
    }

    /// Apply a prepared cancellation to the aggregate.
    ///
    /// Re-checks the guards against the current state, so a plan prepared from a
    /// stale read cannot cancel a line twice.
    pub fn apply_cancellation(
        &mut self,
        plan: &CancellationPlan,
        at: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if self.status.is_cancellation_terminal() {
            return Err(OrderError::AlreadyFinal(self.status));
        }
        for line_id in &plan.line_ids {
            let line = self.line(line_id).ok_or(OrderError::LineNotFound(*line_id))?;
            if line.status != LineStatus::Active {
                return Err(OrderError::LineNotActive(*line_id));
            }
        }

        if plan.refund_required {
            if let Some(payment) = self.payment.as_mut() {
                let full = plan.scope == CancellationScope::Full;
                payment.apply_refund(plan.refund_amount, full)?;
            }
        }

        for line in self.lines.iter_mut() {
            if plan.line_ids.contains(&line.id) {
                line.status = LineStatus::Canceled;
                line.canceled_at = Some(at);
            }
        }

        self.status = plan.next_status;
        self.version += 1;
        self.updated_at = at;
        Ok(())
    }
}

/// One priced, quantified entry. Only `status` and `canceled_at` change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub item_id: Uuid,
    pub item_name: String,
    pub category: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub status: LineStatus,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl OrderLine {
    fn new(order_id: Uuid, input: NewOrderLine) -> Result<Self, OrderError> {
        if input.quantity <= 0 {
            return Err(OrderError::InvalidLine {
                item_id: input.item_id,
                reason: format!("quantity {} must be positive", input.quantity),
            });
        }

        let line_total = input.unit_price * Decimal::from(input.quantity);
        if line_total <= Decimal::ZERO {
            return Err(OrderError::InvalidLine {
                item_id: input.item_id,
                reason: format!("line total {} must be positive", line_total),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            order_id,
            item_id: input.item_id,
            item_name: input.item_name,
            category: input.category,
            quantity: input.quantity,
            unit_price: input.unit_price,
            line_total,
            status: LineStatus::Active,
            canceled_at: None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order must contain at least one line")]
    Empty,

    #[error("Invalid line for item {item_id}: {reason}")]
    InvalidLine { item_id: Uuid, reason: String },

    #[error("Order already has payment record {0}")]
    PaymentAlreadyAttached(Uuid),

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order is {0:?}; no further cancellation possible")]
    AlreadyFinal(OrderStatus),

    #[error("Line not found: {0}")]
    LineNotFound(Uuid),

    #[error("Line already cancelled: {0}")]
    LineNotActive(Uuid),

    #[error(transparent)]
    Payment(#[from] PaymentRecordError),
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_place_computes_totals() {
        let order = order(
            "member-1",
            vec![
                line(Uuid::new_v4(), "GOODS", 2, 1000),
                line(Uuid::new_v4(), "GOODS", 1, 3000),
            ],
        );

        assert_eq!(order.status, OrderStatus::PaymentPending);
        assert_eq!(order.lines[0].line_total, Decimal::from(2000));
        assert_eq!(order.total_amount, Decimal::from(5000));
        assert_eq!(order.remaining_total(), order.total_amount);
    }

    #[test]
    fn test_place_rejects_non_positive_lines() {
        let zero_qty = Order::place(
            "member-1".to_string(),
            "KRW".to_string(),
            shipping(),
            vec![line(Uuid::new_v4(), "GOODS", 0, 1000)],
        );
        assert!(matches!(zero_qty, Err(OrderError::InvalidLine { .. })));

        let free = Order::place(
            "member-1".to_string(),
            "KRW".to_string(),
            shipping(),
            vec![line(Uuid::new_v4(), "GOODS", 1, 0)],
        );
        assert!(matches!(free, Err(OrderError::InvalidLine { .. })));
    }

    #[test]
    fn test_confirm_payment_attaches_single_record() {
        let mut order = order("member-1", vec![line(Uuid::new_v4(), "GOODS", 1, 1000)]);

        order.confirm_payment("pay_1".to_string()).unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment.as_ref().unwrap().authorized_amount, Decimal::from(1000));

        let second = order.confirm_payment("pay_2".to_string());
        assert!(matches!(second, Err(OrderError::PaymentAlreadyAttached(_))));
        assert_eq!(order.payment.as_ref().unwrap().payment_key, "pay_1");
    }

    #[test]
    fn test_eligibility_tables() {
        use OrderStatus::*;

        for status in [PaymentPending, Paid] {
            assert!(status.cancelable_by_owner());
        }
        for status in [Processing, ShipmentReady, PartiallyCanceled, Shipped] {
            assert!(!status.cancelable_by_owner());
        }
        for status in [PaymentPending, Paid, Processing, ShipmentReady, PartiallyCanceled] {
            assert!(status.cancelable_by_admin());
        }
        for status in [Canceled, Delivered, Returned, Refunded] {
            assert!(status.is_cancellation_terminal());
            assert!(!status.cancelable_by_admin());
            assert!(!status.cancelable_by_owner());
        }
    }

    #[test]
    fn test_status_text_round_trip() {
        let all = [
            OrderStatus::PaymentPending,
            OrderStatus::Paid,
            OrderStatus::PaymentFailed,
            OrderStatus::PaymentExpired,
            OrderStatus::Processing,
            OrderStatus::ShipmentReady,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Canceled,
            OrderStatus::PartiallyCanceled,
            OrderStatus::Returned,
            OrderStatus::Refunded,
        ];
        for status in all {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
    }
}
