use ordo_catalog::CategoryEligibility;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::OrderStatus;

/// Tunables for the cancellation engine, loaded from the `cancellation` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationPolicy {
    /// Statuses in which money is held at the processor and must be returned.
    #[serde(default = "default_refund_required")]
    pub refund_required_statuses: HashSet<OrderStatus>,

    /// Which line categories may be cancelled individually.
    #[serde(default)]
    pub partial_cancel: CategoryEligibility,

    /// A partial cancellation that hits every remaining line closes the order as
    /// CANCELED instead of leaving it PARTIALLY_CANCELED.
    #[serde(default)]
    pub promote_exhaustive_partial: bool,

    /// Minor-unit digits of the order currency (0 for KRW).
    #[serde(default)]
    pub currency_exponent: u32,
}

fn default_refund_required() -> HashSet<OrderStatus> {
    [
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::ShipmentReady,
        OrderStatus::PartiallyCanceled,
    ]
    .into_iter()
    .collect()
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            refund_required_statuses: default_refund_required(),
            partial_cancel: CategoryEligibility::default(),
            promote_exhaustive_partial: false,
            currency_exponent: 0,
        }
    }
}

impl CancellationPolicy {
    pub fn requires_refund(&self, status: OrderStatus) -> bool {
        self.refund_required_statuses.contains(&status)
    }
}
