use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordo_catalog::InventoryError;
use ordo_core::identity::RequesterContext;
use ordo_core::payment::{GatewayReceipt, PaymentRecord, PaymentStatus};
use ordo_order::attempt::{AttemptState, CancellationAttempt};
use ordo_order::models::{LineStatus, Order, OrderLine, OrderStatus, ShippingSnapshot};
use ordo_order::plan::CancellationPlan;
use ordo_order::repository::{ensure_state, resolve_claim, ClaimOutcome, OrderStore, StoreError};
use ordo_shared::Masked;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, owner_id, status, total_amount, currency, receiver_name, \
     receiver_phone, zip_code, address, version, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "idempotency_key, order_id, state, reason, requested_by, plan, \
     receipt, failure, created_at, updated_at";

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a freshly placed order with its lines and payment record.
    pub async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, owner_id, status, total_amount, currency, receiver_name,
                                receiver_phone, zip_code, address, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id)
        .bind(&order.owner_id)
        .bind(order.status.as_str())
        .bind(order.total_amount)
        .bind(&order.currency)
        .bind(order.shipping.receiver_name.expose())
        .bind(order.shipping.receiver_phone.expose())
        .bind(&order.shipping.zip_code)
        .bind(order.shipping.address.expose())
        .bind(order.version)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        for (position, line) in order.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_lines (id, order_id, line_no, item_id, item_name, category,
                                         quantity, unit_price, line_total, status, canceled_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(line.id)
            .bind(order.id)
            .bind(position as i32)
            .bind(line.item_id)
            .bind(&line.item_name)
            .bind(&line.category)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.line_total)
            .bind(line.status.as_str())
            .bind(line.canceled_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        if let Some(payment) = &order.payment {
            sqlx::query(
                r#"
                INSERT INTO payments (id, order_id, payment_key, authorized_amount,
                                      canceled_amount, status, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(payment.id)
            .bind(order.id)
            .bind(&payment.payment_key)
            .bind(payment.authorized_amount)
            .bind(payment.canceled_amount)
            .bind(payment.status.as_str())
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn transition(
        &self,
        idempotency_key: Uuid,
        from: AttemptState,
        to: AttemptState,
        receipt: Option<GatewayReceipt>,
        failure: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cancellation_attempts
            SET state = $2, receipt = COALESCE($3, receipt), failure = COALESCE($4, failure),
                updated_at = NOW()
            WHERE idempotency_key = $1 AND state = $5
            "#,
        )
        .bind(idempotency_key)
        .bind(to.as_str())
        .bind(receipt.map(Json))
        .bind(failure)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            // Explain why nothing moved.
            let mut conn = self.pool.acquire().await.map_err(backend)?;
            let attempt = fetch_attempt(&mut conn, idempotency_key, false)
                .await?
                .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
            ensure_state(&attempt, from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn load(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        fetch_order(&mut conn, order_id, false).await
    }

    async fn claim(&self, attempt: CancellationAttempt) -> Result<ClaimOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM orders WHERE id = $1 FOR UPDATE")
                .bind(attempt.order_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
        let version = version.ok_or(StoreError::OrderNotFound(attempt.order_id))?;

        let same_key = fetch_attempt(&mut tx, attempt.idempotency_key, true).await?;
        let other_in_flight: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM cancellation_attempts
                WHERE order_id = $1 AND idempotency_key <> $2
                  AND state IN ('PENDING', 'REFUNDED')
            )
            "#,
        )
        .bind(attempt.order_id)
        .bind(attempt.idempotency_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        if let Some(existing) =
            resolve_claim(version, &attempt, same_key.as_ref(), other_in_flight)?
        {
            tx.rollback().await.map_err(backend)?;
            return Ok(ClaimOutcome::Resumed(existing));
        }

        sqlx::query(
            r#"
            INSERT INTO cancellation_attempts (idempotency_key, order_id, state, reason,
                                               requested_by, plan, receipt, failure,
                                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, $7, $8)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET state = EXCLUDED.state, reason = EXCLUDED.reason,
                requested_by = EXCLUDED.requested_by, plan = EXCLUDED.plan,
                receipt = NULL, failure = NULL, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(attempt.idempotency_key)
        .bind(attempt.order_id)
        .bind(AttemptState::Pending.as_str())
        .bind(&attempt.reason)
        .bind(Json(&attempt.requested_by))
        .bind(Json(&attempt.plan))
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        debug!(idempotency_key = %attempt.idempotency_key, "Cancellation attempt claimed");
        Ok(ClaimOutcome::Claimed(attempt))
    }

    async fn record_refund(
        &self,
        idempotency_key: Uuid,
        receipt: Option<GatewayReceipt>,
    ) -> Result<(), StoreError> {
        self.transition(
            idempotency_key,
            AttemptState::Pending,
            AttemptState::Refunded,
            receipt,
            None,
        )
        .await
    }

    async fn release(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError> {
        self.transition(
            idempotency_key,
            AttemptState::Pending,
            AttemptState::Failed,
            None,
            Some(failure),
        )
        .await
    }

    async fn escalate(&self, idempotency_key: Uuid, failure: &str) -> Result<(), StoreError> {
        self.transition(
            idempotency_key,
            AttemptState::Refunded,
            AttemptState::Unreconciled,
            None,
            Some(failure),
        )
        .await
    }

    async fn commit(&self, idempotency_key: Uuid) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let attempt = fetch_attempt(&mut tx, idempotency_key, true)
            .await?
            .ok_or(StoreError::AttemptNotFound(idempotency_key))?;
        ensure_state(&attempt, AttemptState::Refunded)?;

        let order = fetch_order(&mut tx, attempt.order_id, true)
            .await?
            .ok_or(StoreError::OrderNotFound(attempt.order_id))?;

        let now = Utc::now();
        let mut updated = order.clone();
        updated.apply_cancellation(&attempt.plan, now)?;

        let result = sqlx::query(
            "UPDATE orders SET status = $1, version = $2, updated_at = $3 WHERE id = $4 AND version = $5",
        )
        .bind(updated.status.as_str())
        .bind(updated.version)
        .bind(now)
        .bind(updated.id)
        .bind(order.version)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Conflict(format!(
                "order {} changed during commit",
                updated.id
            )));
        }

        for line in updated.lines.iter().filter(|l| attempt.plan.line_ids.contains(&l.id)) {
            sqlx::query("UPDATE order_lines SET status = $1, canceled_at = $2 WHERE id = $3")
                .bind(line.status.as_str())
                .bind(line.canceled_at)
                .bind(line.id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        if let Some(payment) = &updated.payment {
            sqlx::query(
                "UPDATE payments SET canceled_amount = $1, status = $2, updated_at = $3 WHERE id = $4",
            )
            .bind(payment.canceled_amount)
            .bind(payment.status.as_str())
            .bind(payment.updated_at)
            .bind(payment.id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        // Restorations are sorted by item id, so concurrent commits lock items in one order.
        for restoration in &attempt.plan.restorations {
            restore_stock(&mut tx, restoration.item_id, restoration.quantity).await?;
        }

        sqlx::query(
            "UPDATE cancellation_attempts SET state = $1, updated_at = $2 WHERE idempotency_key = $3",
        )
        .bind(AttemptState::Completed.as_str())
        .bind(now)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(updated)
    }

    async fn attempt(
        &self,
        idempotency_key: Uuid,
    ) -> Result<Option<CancellationAttempt>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        fetch_attempt(&mut conn, idempotency_key, false).await
    }

    async fn attempts_in_state(
        &self,
        state: AttemptState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<CancellationAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cancellation_attempts WHERE state = $1 AND updated_at < $2 ORDER BY updated_at",
            ATTEMPT_COLUMNS
        ))
        .bind(state.as_str())
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("unrecognised {} '{}' in storage", what, value).into())
}

async fn fetch_order(
    conn: &mut PgConnection,
    order_id: Uuid,
    lock: bool,
) -> Result<Option<Order>, StoreError> {
    let sql = format!(
        "SELECT {} FROM orders WHERE id = $1{}",
        ORDER_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    let Some(row) = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
    else {
        return Ok(None);
    };

    let lines: Vec<LineRow> = sqlx::query_as(
        r#"
        SELECT id, order_id, item_id, item_name, category, quantity, unit_price, line_total,
               status, canceled_at
        FROM order_lines WHERE order_id = $1 ORDER BY line_no
        "#,
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(backend)?;

    let payment: Option<PaymentRow> = sqlx::query_as(
        r#"
        SELECT id, order_id, payment_key, authorized_amount, canceled_amount, status, updated_at
        FROM payments WHERE order_id = $1
        "#,
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(backend)?;

    row.into_order(lines, payment).map(Some)
}

async fn fetch_attempt(
    conn: &mut PgConnection,
    idempotency_key: Uuid,
    lock: bool,
) -> Result<Option<CancellationAttempt>, StoreError> {
    let sql = format!(
        "SELECT {} FROM cancellation_attempts WHERE idempotency_key = $1{}",
        ATTEMPT_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, AttemptRow>(&sql)
        .bind(idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
        .map(AttemptRow::into_attempt)
        .transpose()
}

async fn restore_stock(
    conn: &mut PgConnection,
    item_id: Uuid,
    quantity: i64,
) -> Result<i64, StoreError> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidQuantity { item_id, quantity }.into());
    }

    let stock: Option<i64> =
        sqlx::query_scalar("UPDATE items SET stock = stock + $1 WHERE id = $2 RETURNING stock")
            .bind(quantity)
            .bind(item_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(backend)?;

    let stock = stock.ok_or(InventoryError::UnknownItem(item_id))?;
    debug!(item_id = %item_id, quantity, stock, "Stock restored");
    Ok(stock)
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    owner_id: String,
    status: String,
    total_amount: Decimal,
    currency: String,
    receiver_name: String,
    receiver_phone: String,
    zip_code: String,
    address: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    order_id: Uuid,
    item_id: Uuid,
    item_name: String,
    category: String,
    quantity: i32,
    unit_price: Decimal,
    line_total: Decimal,
    status: String,
    canceled_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    payment_key: String,
    authorized_amount: Decimal,
    canceled_amount: Decimal,
    status: String,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    idempotency_key: Uuid,
    order_id: Uuid,
    state: String,
    reason: String,
    requested_by: Json<RequesterContext>,
    plan: Json<CancellationPlan>,
    receipt: Option<Json<GatewayReceipt>>,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(
        self,
        lines: Vec<LineRow>,
        payment: Option<PaymentRow>,
    ) -> Result<Order, StoreError> {
        let status =
            OrderStatus::parse(&self.status).ok_or_else(|| corrupt("order status", &self.status))?;
        let lines = lines
            .into_iter()
            .map(LineRow::into_line)
            .collect::<Result<Vec<_>, _>>()?;
        let payment = payment.map(PaymentRow::into_record).transpose()?;

        Ok(Order {
            id: self.id,
            owner_id: self.owner_id,
            status,
            total_amount: self.total_amount,
            currency: self.currency,
            shipping: ShippingSnapshot {
                receiver_name: Masked(self.receiver_name),
                receiver_phone: Masked(self.receiver_phone),
                zip_code: self.zip_code,
                address: Masked(self.address),
            },
            lines,
            payment,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl LineRow {
    fn into_line(self) -> Result<OrderLine, StoreError> {
        let status =
            LineStatus::parse(&self.status).ok_or_else(|| corrupt("line status", &self.status))?;
        Ok(OrderLine {
            id: self.id,
            order_id: self.order_id,
            item_id: self.item_id,
            item_name: self.item_name,
            category: self.category,
            quantity: self.quantity,
            unit_price: self.unit_price,
            line_total: self.line_total,
            status,
            canceled_at: self.canceled_at,
        })
    }
}

impl PaymentRow {
    fn into_record(self) -> Result<PaymentRecord, StoreError> {
        let status = PaymentStatus::parse(&self.status)
            .ok_or_else(|| corrupt("payment status", &self.status))?;
        Ok(PaymentRecord {
            id: self.id,
            order_id: self.order_id,
            payment_key: self.payment_key,
            authorized_amount: self.authorized_amount,
            canceled_amount: self.canceled_amount,
            status,
            updated_at: self.updated_at,
        })
    }
}

impl AttemptRow {
    fn into_attempt(self) -> Result<CancellationAttempt, StoreError> {
        let state = AttemptState::parse(&self.state)
            .ok_or_else(|| corrupt("attempt state", &self.state))?;
        Ok(CancellationAttempt {
            idempotency_key: self.idempotency_key,
            order_id: self.order_id,
            plan: self.plan.0,
            reason: self.reason,
            requested_by: self.requested_by.0,
            state,
            receipt: self.receipt.map(|r| r.0),
            failure: self.failure,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
