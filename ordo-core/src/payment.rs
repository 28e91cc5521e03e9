use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of the payment at the processor, independent of the order status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Done,
    Canceled,
    PartialCanceled,
    Aborted,
    Expired,
    Failed,
}

impl PaymentStatus {
    /// Money is held and can still (partly) be returned.
    pub fn is_refundable(&self) -> bool {
        matches!(self, PaymentStatus::Done | PaymentStatus::PartialCanceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Done => "DONE",
            PaymentStatus::Canceled => "CANCELED",
            PaymentStatus::PartialCanceled => "PARTIAL_CANCELED",
            PaymentStatus::Aborted => "ABORTED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PENDING" => PaymentStatus::Pending,
            "DONE" => PaymentStatus::Done,
            "CANCELED" => PaymentStatus::Canceled,
            "PARTIAL_CANCELED" => PaymentStatus::PartialCanceled,
            "ABORTED" => PaymentStatus::Aborted,
            "EXPIRED" => PaymentStatus::Expired,
            "FAILED" => PaymentStatus::Failed,
            _ => return None,
        })
    }
}

/// Local record of a confirmed payment. Created at confirmation, mutated only by refunds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Processor's reference for the authorized payment. Unique, never rewritten.
    pub payment_key: String,
    pub authorized_amount: Decimal,
    pub canceled_amount: Decimal,
    pub status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(order_id: Uuid, payment_key: String, authorized_amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            payment_key,
            authorized_amount,
            canceled_amount: Decimal::ZERO,
            status: PaymentStatus::Done,
            updated_at: Utc::now(),
        }
    }

    pub fn refundable_balance(&self) -> Decimal {
        self.authorized_amount - self.canceled_amount
    }

    /// Check that `amount` may be returned without touching the record.
    pub fn ensure_refundable(&self, amount: Decimal) -> Result<(), PaymentRecordError> {
        if !self.status.is_refundable() {
            return Err(PaymentRecordError::NotRefundable(self.status));
        }
        if amount > self.refundable_balance() {
            return Err(PaymentRecordError::ExceedsBalance {
                requested: amount,
                balance: self.refundable_balance(),
            });
        }
        Ok(())
    }

    /// Book a successful refund. `full` closes the payment regardless of the residual balance.
    pub fn apply_refund(&mut self, amount: Decimal, full: bool) -> Result<(), PaymentRecordError> {
        self.ensure_refundable(amount)?;

        self.canceled_amount += amount;
        self.status = if full || self.canceled_amount == self.authorized_amount {
            PaymentStatus::Canceled
        } else {
            PaymentStatus::PartialCanceled
        };
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PaymentRecordError {
    #[error("Payment is {0:?} and cannot be refunded")]
    NotRefundable(PaymentStatus),

    #[error("Refund of {requested} exceeds remaining balance {balance}")]
    ExceedsBalance { requested: Decimal, balance: Decimal },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_key: String,
    /// `None` refunds the full remaining amount; otherwise an exact amount in minor units.
    pub amount: Option<i64>,
    pub reason: String,
    /// Sent to the processor so a retried attempt is de-duplicated on their side.
    pub idempotency_key: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub payment_key: String,
    pub order_ref: String,
    pub amount: i64,
}

/// What the processor reported back. Kept on the cancellation attempt for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayReceipt {
    pub status: String,
    pub transaction_key: Option<String>,
    pub canceled_amount: Option<i64>,
    pub receipt_url: Option<String>,
    pub raw: serde_json::Value,
}

/// Every variant surfaces as a retryable bad-gateway failure; none implies success.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway rejected request with HTTP {status}: {code} {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Gateway transport failure: {0}")]
    Transport(String),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway response unreadable: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// The request may or may not have reached the processor.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Transport(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Return money for an authorized payment.
    async fn refund(&self, request: &RefundRequest) -> Result<GatewayReceipt, GatewayError>;

    /// Confirm an authorized payment against the order it belongs to.
    async fn confirm(&self, request: &ConfirmRequest) -> Result<GatewayReceipt, GatewayError>;
}
