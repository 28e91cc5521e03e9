pub mod category;
pub mod inventory;

pub use category::CategoryEligibility;
pub use inventory::{InventoryAdjuster, InventoryError, MemoryInventory, StockRestoration};
