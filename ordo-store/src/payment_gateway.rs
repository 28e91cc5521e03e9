//! Payment processor client over its REST API (no SDK dependency)

use async_trait::async_trait;
use ordo_core::payment::{
    ConfirmRequest, GatewayError, GatewayReceipt, PaymentGateway, RefundRequest,
};
use ordo_shared::Masked;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::app_config::GatewayConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody<'a> {
    cancel_reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_amount: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody<'a> {
    payment_key: &'a str,
    order_id: &'a str,
    amount: i64,
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: Masked<String>,
    timeout: Duration,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            timeout,
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<String>,
    ) -> Result<GatewayReceipt, GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(self.secret_key.expose(), Some(""))
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let code = body["code"].as_str().unwrap_or("UNKNOWN").to_string();
            let message = body["message"].as_str().map(String::from).unwrap_or(text);
            warn!(status = status.as_u16(), code = %code, "Gateway returned an error");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        parse_receipt(body)
    }

    fn transport_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Pull the fields worth persisting out of a payment object; keeps the rest as `raw`.
fn parse_receipt(body: Value) -> Result<GatewayReceipt, GatewayError> {
    let status = body["status"]
        .as_str()
        .ok_or_else(|| GatewayError::InvalidResponse(format!("missing status in {}", body)))?
        .to_string();

    // The most recent cancel entry belongs to this call.
    let last_cancel = body["cancels"].as_array().and_then(|c| c.last());
    let transaction_key = last_cancel
        .and_then(|c| c["transactionKey"].as_str())
        .map(String::from);
    let canceled_amount = last_cancel.and_then(|c| c["cancelAmount"].as_i64());
    let receipt_url = body["receipt"]["url"].as_str().map(String::from);

    Ok(GatewayReceipt {
        status,
        transaction_key,
        canceled_amount,
        receipt_url,
        raw: body,
    })
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn refund(&self, request: &RefundRequest) -> Result<GatewayReceipt, GatewayError> {
        debug!(
            payment_key = ?Masked(&request.payment_key),
            amount = ?request.amount,
            "Requesting refund"
        );
        let body = CancelBody {
            cancel_reason: &request.reason,
            cancel_amount: request.amount,
        };
        self.post(
            &format!("/v1/payments/{}/cancel", request.payment_key),
            &body,
            Some(request.idempotency_key.to_string()),
        )
        .await
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<GatewayReceipt, GatewayError> {
        let body = ConfirmBody {
            payment_key: &request.payment_key,
            order_id: &request.order_ref,
            amount: request.amount,
        };
        self.post("/v1/payments/confirm", &body, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Seen {
        calls: Arc<Mutex<Vec<(String, HeaderMap, Value)>>>,
    }

    async fn cancel(
        State(seen): State<Seen>,
        Path(payment_key): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        seen.calls
            .lock()
            .unwrap()
            .push((payment_key.clone(), headers, body.clone()));

        match payment_key.as_str() {
            "pay_broken" => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": "PROVIDER_ERROR", "message": "try again later"})),
            ),
            "pay_slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                (StatusCode::OK, Json(json!({"status": "CANCELED"})))
            }
            _ => {
                let status = if body.get("cancelAmount").is_some() {
                    "PARTIAL_CANCELED"
                } else {
                    "CANCELED"
                };
                (
                    StatusCode::OK,
                    Json(json!({
                        "paymentKey": payment_key,
                        "status": status,
                        "cancels": [
                            {"transactionKey": "txn_old", "cancelAmount": 100},
                            {"transactionKey": "txn_new", "cancelAmount": body["cancelAmount"].as_i64().unwrap_or(15000)}
                        ],
                        "receipt": {"url": "https://receipts.example/1"}
                    })),
                )
            }
        }
    }

    async fn confirm(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
        seen.calls
            .lock()
            .unwrap()
            .push(("confirm".to_string(), HeaderMap::new(), body));
        Json(json!({"status": "DONE"}))
    }

    async fn gateway(timeout_ms: u64) -> (HttpPaymentGateway, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route("/v1/payments/confirm", post(confirm))
            .route("/v1/payments/{payment_key}/cancel", post(cancel))
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = GatewayConfig {
            base_url: format!("http://{}/", addr),
            secret_key: Masked("test_sk_123".to_string()),
            timeout_ms,
        };
        (HttpPaymentGateway::new(&config).unwrap(), seen)
    }

    fn refund(payment_key: &str, amount: Option<i64>) -> RefundRequest {
        RefundRequest {
            payment_key: payment_key.to_string(),
            amount,
            reason: "customer request".to_string(),
            idempotency_key: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_partial_refund_sends_amount_and_headers() {
        let (gateway, seen) = gateway(1000).await;
        let request = refund("pay_1", Some(3000));

        let receipt = gateway.refund(&request).await.unwrap();

        assert_eq!(receipt.status, "PARTIAL_CANCELED");
        assert_eq!(receipt.transaction_key.as_deref(), Some("txn_new"));
        assert_eq!(receipt.canceled_amount, Some(3000));
        assert_eq!(receipt.receipt_url.as_deref(), Some("https://receipts.example/1"));

        let calls = seen.calls.lock().unwrap();
        let (key, headers, body) = &calls[0];
        assert_eq!(key, "pay_1");
        assert_eq!(
            body,
            &json!({"cancelReason": "customer request", "cancelAmount": 3000})
        );
        assert_eq!(
            headers["idempotency-key"].to_str().unwrap(),
            request.idempotency_key.to_string()
        );
        assert!(headers["authorization"]
            .to_str()
            .unwrap()
            .starts_with("Basic "));
    }

    #[tokio::test]
    async fn test_full_refund_omits_amount() {
        let (gateway, seen) = gateway(1000).await;

        let receipt = gateway.refund(&refund("pay_2", None)).await.unwrap();

        assert_eq!(receipt.status, "CANCELED");
        let calls = seen.calls.lock().unwrap();
        assert_eq!(calls[0].2, json!({"cancelReason": "customer request"}));
    }

    #[tokio::test]
    async fn test_error_status_maps_to_rejected() {
        let (gateway, _) = gateway(1000).await;

        let err = gateway.refund(&refund("pay_broken", None)).await.unwrap_err();

        match err {
            GatewayError::Rejected { status, code, message } => {
                assert_eq!(status, 500);
                assert_eq!(code, "PROVIDER_ERROR");
                assert_eq!(message, "try again later");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let (gateway, _) = gateway(100).await;

        let err = gateway.refund(&refund("pay_slow", None)).await.unwrap_err();

        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(err.is_indeterminate());
    }

    #[tokio::test]
    async fn test_confirm_posts_order_reference() {
        let (gateway, seen) = gateway(1000).await;

        let receipt = gateway
            .confirm(&ConfirmRequest {
                payment_key: "pay_3".to_string(),
                order_ref: "ORD-20240101-0001".to_string(),
                amount: 15000,
            })
            .await
            .unwrap();

        assert_eq!(receipt.status, "DONE");
        assert_eq!(receipt.transaction_key, None);
        let calls = seen.calls.lock().unwrap();
        assert_eq!(
            calls[0].2,
            json!({"paymentKey": "pay_3", "orderId": "ORD-20240101-0001", "amount": 15000})
        );
    }

    #[test]
    fn test_receipt_without_status_is_invalid() {
        let result = parse_receipt(json!({"cancels": []}));
        assert!(matches!(result, Err(GatewayError::InvalidResponse(_))));
    }
}
