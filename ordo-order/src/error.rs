use ordo_core::payment::GatewayError;

use crate::repository::StoreError;

/// Outcome taxonomy of a cancellation call.
///
/// Validation and not-found are detected before any external call; a gateway
/// failure leaves local state untouched so the whole request can be retried.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Absent and not-owned orders look the same to the caller.
    #[error("Order not found")]
    NotFound,

    #[error("Cancellation conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway failure: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Order store failure: {0}")]
    Store(#[source] StoreError),
}

impl CancelError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        CancelError::Validation(message.into())
    }
}

impl From<StoreError> for CancelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(_) => CancelError::NotFound,
            StoreError::Conflict(message) => CancelError::Conflict(message),
            other => CancelError::Store(other),
        }
    }
}
