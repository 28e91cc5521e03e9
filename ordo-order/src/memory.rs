use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordo_catalog::{InventoryAdjuster, InventoryError, MemoryInventory};
use ordo_core::payment::GatewayReceipt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::attempt::{AttemptState, CancellationAttempt};
use crate::models::Order;
use crate::repository::{ensure_state, resolve_claim, ClaimOutcome, OrderStore, StoreError};

#[derive(Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    attempts: HashMap<Uuid, CancellationAttempt>,
}

/// In-process order store backed by a [`MemoryInventory`].
///
/// One mutex guards all orders and attempts, which serializes cancellations
/// at least as strictly as a per-row lock.
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
    inventory: Arc<MemoryInventory>,
}

impl MemoryOrderStore {
    pub fn new(inventory: Arc<MemoryInventory>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            inventory,
        }
    }

    pub async fn insert(&self, order: Order) {
        let mut state = self.state.lock().await;
        state.orders.insert(order.id, order);
    }

    pub fn inventory(&self) -> &Arc<MemoryInventory> {
        &self.inventory
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn load(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn claim(&self, attempt: CancellationAttempt) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state.lock().await;

        let order = state
            .orders
            .get(&attempt.order_id)
            .ok_or(StoreError::OrderNotFound(attempt.order_id))?;
        let same_key = state.attempts.get(&attempt.idempotency_key);
        let other_in_flight = state.attempts.values().any(|a| {
            a.order_id == attempt.order_id
                && a.idempotency_key != attempt.idempotency_key
                && a.state.is_in_flight()
        });

        if let Some(existing) = resolve_claim(order.version, &attempt, same_key, other_in_flight)? {
            return Ok(ClaimOutcome::Resumed(existing));
        }

        state
            .attempts
            .insert(attempt.idempotency_key, attempt.clone());
        Ok(ClaimOutcome::Claimed(attempt))
    }

    async fn record_refund(
        &self,
        idempotency_key: Uuid,
        receipt: Option<GatewayReceipt>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let attempt = state
            .attempts
            .get_mut(&idempotency_key)
            .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
        ensure_state(attempt, AttemptState::Pending)?;

        attempt.state = AttemptState::Refunded;
        attempt.receipt = receipt;
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn release(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let attempt = state
            .attempts
            .get_mut(&idempotency_key)
            .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
        ensure_state(attempt, AttemptState::Pending)?;

        attempt.state = AttemptState::Failed;
        attempt.failure = Some(failure.to_string());
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn escalate(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let attempt = state
            .attempts
            .get_mut(&idempotency_key)
            .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
        ensure_state(attempt, AttemptState::Refunded)?;

        attempt.state = AttemptState::Unreconciled;
        attempt.failure = Some(failure.to_string());
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn commit(&self, idempotency_key: Uuid) -> Result<Order, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let attempt = state
            .attempts
            .get_mut(&idempotency_key)
            .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
        ensure_state(attempt, AttemptState::Refunded)?;

        let order = state
            .orders
            .get(&attempt.order_id)
            .ok_or(StoreError::OrderNotFound(attempt.order_id))?;

        // Work on a copy so a failed guard leaves the stored order untouched.
        let mut updated = order.clone();
        let now = Utc::now();
        updated.apply_cancellation(&attempt.plan, now)?;

        for restoration in &attempt.plan.restorations {
            if !self.inventory.contains(&restoration.item_id) {
                return Err(StoreError::Inventory(InventoryError::UnknownItem(
                    restoration.item_id,
                )));
            }
        }
        for restoration in &attempt.plan.restorations {
            self.inventory
                .restore(restoration.item_id, restoration.quantity)
                .await?;
        }

        attempt.state = AttemptState::Completed;
        attempt.updated_at = now;
        state.orders.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn attempt(
        &self,
        idempotency_key: Uuid,
    ) -> Result<Option<CancellationAttempt>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(&idempotency_key).cloned())
    }

    async fn attempts_in_state(
        &self,
        attempt_state: AttemptState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<CancellationAttempt>, StoreError> {
        let state = self.state.lock().await;
        let mut attempts: Vec<CancellationAttempt> = state
            .attempts
            .values()
            .filter(|a| a.state == attempt_state && a.updated_at < updated_before)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.updated_at);
        Ok(attempts)
    }
}
