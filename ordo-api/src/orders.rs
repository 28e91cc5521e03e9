use axum::{
    extract::{rejection::JsonRejection, State},
    middleware,
    routing::post,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use ordo_core::identity::RequesterContext;
use ordo_order::{CancellationRequest, CancellationResult, OrderStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{admin_auth_middleware, customer_auth_middleware};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub order_no: Uuid,
    pub reason: String,
    /// Empty or absent cancels the whole order.
    #[serde(default)]
    pub order_item_nos: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderResponse {
    pub order_no: Uuid,
    pub order_status: OrderStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub cancel_amount: Decimal,
    pub cancel_reason: String,
    pub canceled_at: DateTime<Utc>,
}

impl From<CancellationResult> for CancelOrderResponse {
    fn from(result: CancellationResult) -> Self {
        Self {
            order_no: result.order_id,
            order_status: result.status,
            cancel_amount: result.refund_amount,
            cancel_reason: result.reason,
            canceled_at: result.canceled_at,
        }
    }
}

pub fn routes(state: AppState) -> Router<AppState> {
    let customer = Router::new()
        .route("/order/cancel", post(cancel_order))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            customer_auth_middleware,
        ));

    let admin = Router::new()
        .route("/admin/order/cancel", post(admin_cancel_order))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware));

    customer.merge(admin)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /order/cancel
/// Cancel one of the caller's own orders, fully or by line
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(requester): Extension<RequesterContext>,
    payload: Result<Json<CancelOrderRequest>, JsonRejection>,
) -> Result<Json<CancelOrderResponse>, AppError> {
    let Json(req) = payload?;
    run_cancellation(&state, &requester, req).await
}

/// POST /admin/order/cancel
/// Cancel any order, including ones already in fulfillment
pub async fn admin_cancel_order(
    State(state): State<AppState>,
    Extension(requester): Extension<RequesterContext>,
    payload: Result<Json<CancelOrderRequest>, JsonRejection>,
) -> Result<Json<CancelOrderResponse>, AppError> {
    let Json(req) = payload?;
    tracing::info!(admin = %requester.caller_id, order_no = %req.order_no, "Administrative cancellation");
    run_cancellation(&state, &requester, req).await
}

async fn run_cancellation(
    state: &AppState,
    requester: &RequesterContext,
    req: CancelOrderRequest,
) -> Result<Json<CancelOrderResponse>, AppError> {
    let request = CancellationRequest::lines(req.order_no, req.reason, req.order_item_nos);
    let result = state.engine.cancel(requester, request).await?;
    Ok(Json(result.into()))
}
