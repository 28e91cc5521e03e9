pub mod attempt;
pub mod cancellation;
pub mod error;
pub mod memory;
pub mod models;
pub mod plan;
pub mod policy;
pub mod recovery;
pub mod repository;

pub use attempt::{AttemptState, CancellationAttempt};
pub use cancellation::{CancellationEngine, CancellationResult};
pub use error::CancelError;
pub use memory::MemoryOrderStore;
pub use models::{
    LineStatus, NewOrderLine, Order, OrderError, OrderLine, OrderStatus, ShippingSnapshot,
};
pub use plan::{CancellationPlan, CancellationRequest, CancellationScope};
pub use policy::CancellationPolicy;
pub use recovery::{RecoveryRelay, RecoveryReport};
pub use repository::{ClaimOutcome, OrderStore, StoreError};
