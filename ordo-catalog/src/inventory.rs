use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// One stock increment reversing the debit taken when the order was placed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockRestoration {
    pub item_id: Uuid,
    pub quantity: i64,
}

impl StockRestoration {
    /// Merge per-line quantities into one increment per catalog item.
    ///
    /// Output is ordered by item id so row locks are always taken in the same order.
    pub fn aggregate<I>(lines: I) -> Vec<StockRestoration>
    where
        I: IntoIterator<Item = (Uuid, i64)>,
    {
        let mut merged: BTreeMap<Uuid, i64> = BTreeMap::new();
        for (item_id, quantity) in lines {
            *merged.entry(item_id).or_insert(0) += quantity;
        }

        merged
            .into_iter()
            .map(|(item_id, quantity)| StockRestoration { item_id, quantity })
            .collect()
    }
}

/// Catalog collaborator owning the per-item stock counter.
#[async_trait]
pub trait InventoryAdjuster: Send + Sync {
    /// Atomically add `quantity` back to the item's stock. Returns the new stock.
    async fn restore(&self, item_id: Uuid, quantity: i64) -> Result<i64, InventoryError>;

    async fn stock(&self, item_id: Uuid) -> Result<Option<i64>, InventoryError>;
}

/// In-process stock counters. Increments are lock-free per item so concurrent
/// cancellations against the same item never lose an update.
#[derive(Default)]
pub struct MemoryInventory {
    counters: RwLock<HashMap<Uuid, AtomicI64>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item with its current stock
    pub fn initialize(&self, item_id: Uuid, stock: i64) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.insert(item_id, AtomicI64::new(stock));
    }

    pub fn contains(&self, item_id: &Uuid) -> bool {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters.contains_key(item_id)
    }

    pub fn stock_of(&self, item_id: &Uuid) -> Option<i64> {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters.get(item_id).map(|c| c.load(Ordering::SeqCst))
    }

    fn increment(&self, item_id: Uuid, quantity: i64) -> Result<i64, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity { item_id, quantity });
        }

        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .get(&item_id)
            .ok_or(InventoryError::UnknownItem(item_id))?;

        let stock = counter.fetch_add(quantity, Ordering::SeqCst) + quantity;
        tracing::debug!(%item_id, quantity, stock, "Stock restored");
        Ok(stock)
    }
}

#[async_trait]
impl InventoryAdjuster for MemoryInventory {
    async fn restore(&self, item_id: Uuid, quantity: i64) -> Result<i64, InventoryError> {
        self.increment(item_id, quantity)
    }

    async fn stock(&self, item_id: Uuid) -> Result<Option<i64>, InventoryError> {
        Ok(self.stock_of(&item_id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Unknown catalog item: {0}")]
    UnknownItem(Uuid),

    #[error("Invalid restore quantity {quantity} for item {item_id}")]
    InvalidQuantity { item_id: Uuid, quantity: i64 },

    #[error("Inventory backend failure: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_aggregate_merges_same_item() {
        let mug = Uuid::new_v4();
        let tee = Uuid::new_v4();

        let restorations = StockRestoration::aggregate([(mug, 2), (tee, 1), (mug, 3)]);

        assert_eq!(restorations.len(), 2);
        let mug_total = restorations.iter().find(|r| r.item_id == mug).unwrap();
        assert_eq!(mug_total.quantity, 5);
        assert!(restorations.windows(2).all(|w| w[0].item_id < w[1].item_id));
    }

    #[tokio::test]
    async fn test_restore_rejects_unknown_item_and_bad_quantity() {
        let inventory = MemoryInventory::new();
        let item = Uuid::new_v4();

        assert!(matches!(
            inventory.restore(item, 1).await,
            Err(InventoryError::UnknownItem(_))
        ));

        inventory.initialize(item, 3);
        assert!(matches!(
            inventory.restore(item, 0).await,
            Err(InventoryError::InvalidQuantity { .. })
        ));
        assert_eq!(inventory.stock(item).await.unwrap(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_restores_do_not_lose_updates() {
        let inventory = Arc::new(MemoryInventory::new());
        let item = Uuid::new_v4();
        inventory.initialize(item, 10);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let inventory = inventory.clone();
            handles.push(tokio::spawn(async move {
                inventory.restore(item, 2).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(inventory.stock_of(&item), Some(10 + 64 * 2));
    }
}
