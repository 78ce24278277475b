//! PostgreSQL implementation of `PaymentLedger`.
//!
//! Every state transition runs in one transaction that first locks the
//! affected row with `SELECT ... FOR UPDATE`. Uniqueness invariants are
//! enforced by the schema:
//!
//! - `payments_gateway_payment_id_key`: a payment settles at most one order
//! - `payments_one_per_order`: an order is settled at most once, by gateway
//!   or by cash
//! - `user_subscriptions_one_live_per_user`: partial unique index over
//!   `pending`/`active` rows
//! - `subscription_charges_pkey`: a payment renews at most one subscription
//!   term

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pay_core::{
    default_pending_ttl, CashReceipt, Currency, MinorUnits, NewSubscription, Order, OrderStatus,
    PaymentError, PaymentLedger, PaymentMethod, PaymentRecord, PaymentResult, Settlement,
    Subscription, SubscriptionStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ORDER_COLUMNS: &str = "internal_id, gateway_order_id, amount_minor_units, currency, status, \
     payment_id, signature, payment_method, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, internal_order_id, method, gateway_order_id, gateway_payment_id, \
     amount_minor_units, currency, status, recorded_by, notes, created_at";

const SUBSCRIPTION_COLUMNS: &str = "internal_id, user_id, plan_id, gateway_subscription_id, \
     gateway_plan_id, status, start_date, end_date, payment_id, signature, created_at, updated_at";

/// Constraint names mapped to `Conflict`
pub(crate) const ORDERS_PKEY: &str = "orders_pkey";
pub(crate) const ORDERS_GATEWAY_ORDER_ID_KEY: &str = "orders_gateway_order_id_key";
pub(crate) const PAYMENTS_GATEWAY_PAYMENT_ID_KEY: &str = "payments_gateway_payment_id_key";
pub(crate) const PAYMENTS_ONE_PER_ORDER: &str = "payments_one_per_order";
pub(crate) const SUBSCRIPTION_CHARGES_PKEY: &str = "subscription_charges_pkey";
pub(crate) const SUBSCRIPTIONS_GATEWAY_ID_KEY: &str =
    "user_subscriptions_gateway_subscription_id_key";
pub(crate) const ONE_LIVE_SUBSCRIPTION_PER_USER: &str = "user_subscriptions_one_live_per_user";

/// PostgreSQL implementation of the PaymentLedger port.
pub struct PostgresLedger {
    pool: PgPool,
    pending_ttl: Duration,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pending_ttl: default_pending_ttl(),
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> PaymentResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(StdDuration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| PaymentError::Configuration(format!("Failed to connect to database: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Builder: override how long a pending subscription blocks new ones
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> PaymentResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaymentError::Storage(format!("Migration failed: {}", e)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> PaymentResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| storage_error("begin transaction", e))
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrderRow {
    pub internal_id: String,
    pub gateway_order_id: Option<String>,
    pub amount_minor_units: i64,
    pub currency: String,
    pub status: String,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = PaymentError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            amount_minor_units: MinorUnits::from_i64(row.amount_minor_units).map_err(corrupt)?,
            currency: row.currency.parse::<Currency>().map_err(corrupt)?,
            status: row.status.parse::<OrderStatus>().map_err(corrupt)?,
            payment_method: row
                .payment_method
                .as_deref()
                .map(str::parse::<PaymentMethod>)
                .transpose()
                .map_err(corrupt)?,
            internal_id: row.internal_id,
            gateway_order_id: row.gateway_order_id,
            payment_id: row.payment_id,
            signature: row.signature,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PaymentRow {
    pub id: Uuid,
    pub internal_order_id: String,
    pub method: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub amount_minor_units: i64,
    pub currency: String,
    pub status: String,
    pub recorded_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = PaymentError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            amount_minor_units: MinorUnits::from_i64(row.amount_minor_units).map_err(corrupt)?,
            currency: row.currency.parse::<Currency>().map_err(corrupt)?,
            method: row.method.parse::<PaymentMethod>().map_err(corrupt)?,
            id: row.id,
            internal_order_id: row.internal_order_id,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            status: row.status,
            recorded_by: row.recorded_by,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub internal_id: Uuid,
    pub user_id: String,
    pub plan_id: String,
    pub gateway_subscription_id: String,
    pub gateway_plan_id: String,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = PaymentError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            status: row.status.parse::<SubscriptionStatus>().map_err(corrupt)?,
            internal_id: row.internal_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            gateway_subscription_id: row.gateway_subscription_id,
            gateway_plan_id: row.gateway_plan_id,
            start_date: row.start_date,
            end_date: row.end_date,
            payment_id: row.payment_id,
            signature: row.signature,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt(err: PaymentError) -> PaymentError {
    PaymentError::Storage(format!("Corrupt ledger row: {}", err))
}

/// Map a sqlx error, turning known constraint violations into `Conflict`.
pub(crate) fn storage_error(context: &str, err: sqlx::Error) -> PaymentError {
    if let sqlx::Error::Database(db_err) = &err {
        let conflict = match db_err.constraint() {
            Some(ORDERS_PKEY) => Some("Order already exists"),
            Some(ORDERS_GATEWAY_ORDER_ID_KEY) => {
                Some("Gateway order is already bound to another order")
            }
            Some(PAYMENTS_GATEWAY_PAYMENT_ID_KEY) => {
                Some("Payment is already recorded against another order")
            }
            Some(PAYMENTS_ONE_PER_ORDER) => Some("Order already has a settled payment"),
            Some(SUBSCRIPTION_CHARGES_PKEY) => {
                Some("Payment is already charged to another subscription")
            }
            Some(SUBSCRIPTIONS_GATEWAY_ID_KEY) => Some("Gateway subscription is already recorded"),
            Some(ONE_LIVE_SUBSCRIPTION_PER_USER) => {
                Some("User already has a pending or active subscription")
            }
            _ => None,
        };
        if let Some(message) = conflict {
            return PaymentError::Conflict(message.to_string());
        }
    }

    error!(context, error = %err, "ledger query failed");
    PaymentError::Storage(format!("Failed to {}: {}", context, err))
}

async fn lock_order(
    tx: &mut Transaction<'_, Postgres>,
    internal_id: &str,
) -> PaymentResult<Order> {
    let row: Option<OrderRow> = sqlx::query_as(&format!(
        "SELECT {} FROM orders WHERE internal_id = $1 FOR UPDATE",
        ORDER_COLUMNS
    ))
    .bind(internal_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| storage_error("lock order", e))?;

    row.ok_or_else(|| PaymentError::not_found("order", internal_id))?
        .try_into()
}

async fn store_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> PaymentResult<()> {
    sqlx::query(
        r#"
        UPDATE orders SET
            gateway_order_id = $2,
            status = $3,
            payment_id = $4,
            signature = $5,
            payment_method = $6,
            updated_at = $7
        WHERE internal_id = $1
        "#,
    )
    .bind(&order.internal_id)
    .bind(&order.gateway_order_id)
    .bind(order.status.as_str())
    .bind(&order.payment_id)
    .bind(&order.signature)
    .bind(order.payment_method.map(|m| m.as_str()))
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("update order", e))?;

    Ok(())
}

async fn store_subscription(
    tx: &mut Transaction<'_, Postgres>,
    sub: &Subscription,
) -> PaymentResult<()> {
    sqlx::query(
        r#"
        UPDATE user_subscriptions SET
            status = $2,
            end_date = $3,
            payment_id = $4,
            signature = $5,
            updated_at = $6
        WHERE internal_id = $1
        "#,
    )
    .bind(sub.internal_id)
    .bind(sub.status.as_str())
    .bind(sub.end_date)
    .bind(&sub.payment_id)
    .bind(&sub.signature)
    .bind(sub.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("update subscription", e))?;

    Ok(())
}

async fn insert_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment: &PaymentRecord,
) -> PaymentResult<()> {
    sqlx::query(&format!(
        "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        PAYMENT_COLUMNS
    ))
    .bind(payment.id)
    .bind(&payment.internal_order_id)
    .bind(payment.method.as_str())
    .bind(&payment.gateway_order_id)
    .bind(&payment.gateway_payment_id)
    .bind(payment.amount_minor_units.as_i64())
    .bind(payment.currency.as_str())
    .bind(&payment.status)
    .bind(&payment.recorded_by)
    .bind(&payment.notes)
    .bind(payment.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("insert payment", e))?;

    Ok(())
}

async fn lock_subscription(
    tx: &mut Transaction<'_, Postgres>,
    gateway_subscription_id: &str,
) -> PaymentResult<Subscription> {
    let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM user_subscriptions WHERE gateway_subscription_id = $1 FOR UPDATE",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(gateway_subscription_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| storage_error("lock subscription", e))?;

    row.ok_or_else(|| PaymentError::not_found("subscription", gateway_subscription_id))?
        .try_into()
}

/// Gateway subscription a payment was charged to, if any
async fn charged_to(
    tx: &mut Transaction<'_, Postgres>,
    gateway_payment_id: &str,
) -> PaymentResult<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT gateway_subscription_id FROM subscription_charges WHERE gateway_payment_id = $1",
    )
    .bind(gateway_payment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| storage_error("load subscription charge", e))
}

async fn insert_charge(
    tx: &mut Transaction<'_, Postgres>,
    gateway_subscription_id: &str,
    gateway_payment_id: &str,
) -> PaymentResult<()> {
    sqlx::query(
        "INSERT INTO subscription_charges (gateway_payment_id, gateway_subscription_id) \
         VALUES ($1, $2)",
    )
    .bind(gateway_payment_id)
    .bind(gateway_subscription_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("insert subscription charge", e))?;

    Ok(())
}

async fn expire_lapsed<'e, E>(executor: E, user_id: Option<&str>, now: DateTime<Utc>) -> PaymentResult<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE user_subscriptions SET status = 'expired', updated_at = $2
        WHERE status = 'active'
          AND end_date <= $2
          AND ($1::TEXT IS NULL OR user_id = $1)
        "#,
    )
    .bind(user_id)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| storage_error("expire subscriptions", e))?;

    Ok(result.rows_affected())
}

async fn commit(tx: Transaction<'_, Postgres>) -> PaymentResult<()> {
    tx.commit()
        .await
        .map_err(|e| storage_error("commit transaction", e))
}

#[async_trait]
impl PaymentLedger for PostgresLedger {
    async fn insert_order(&self, order: Order) -> PaymentResult<Order> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                internal_id, gateway_order_id, amount_minor_units, currency, status,
                payment_id, signature, payment_method, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&order.internal_id)
        .bind(&order.gateway_order_id)
        .bind(order.amount_minor_units.as_i64())
        .bind(order.currency.as_str())
        .bind(order.status.as_str())
        .bind(&order.payment_id)
        .bind(&order.signature)
        .bind(order.payment_method.map(|m| m.as_str()))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("insert order", e))?;

        Ok(order)
    }

    async fn get_order(&self, internal_id: &str) -> PaymentResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE internal_id = $1",
            ORDER_COLUMNS
        ))
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("load order", e))?;

        row.ok_or_else(|| PaymentError::not_found("order", internal_id))?
            .try_into()
    }

    async fn find_order_by_gateway_id(
        &self,
        gateway_order_id: &str,
    ) -> PaymentResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE gateway_order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("load order", e))?;

        row.map(Order::try_from).transpose()
    }

    async fn record_pending_order(
        &self,
        internal_id: &str,
        gateway_order_id: &str,
        currency: Currency,
    ) -> PaymentResult<()> {
        let mut tx = self.begin().await?;
        let mut order = lock_order(&mut tx, internal_id).await?;

        if order.currency != currency {
            return Err(PaymentError::Validation(format!(
                "Order {} is in {}, not {}",
                internal_id, order.currency, currency
            )));
        }

        match order.status {
            OrderStatus::Uninitiated => {
                order.gateway_order_id = Some(gateway_order_id.to_string());
                order.status = OrderStatus::Pending;
                order.updated_at = Utc::now();
                store_order(&mut tx, &order).await?;
                commit(tx).await?;
                debug!(internal_id, gateway_order_id, "order pending");
                Ok(())
            }
            OrderStatus::Pending if order.gateway_order_id.as_deref() == Some(gateway_order_id) => {
                Ok(())
            }
            OrderStatus::Pending => Err(PaymentError::Conflict(format!(
                "Order {} is already pending on another gateway order",
                internal_id
            ))),
            terminal => Err(PaymentError::Conflict(format!(
                "Order {} is already {}",
                internal_id, terminal
            ))),
        }
    }

    async fn mark_order_paid(
        &self,
        internal_id: &str,
        gateway_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<Settlement> {
        let mut tx = self.begin().await?;
        let mut order = lock_order(&mut tx, internal_id).await?;

        match order.status {
            OrderStatus::Paid => {
                if order.payment_id.as_deref() == Some(gateway_payment_id) {
                    Ok(Settlement::Replayed)
                } else {
                    Err(PaymentError::Conflict(format!(
                        "Order {} is already paid by a different payment",
                        internal_id
                    )))
                }
            }
            OrderStatus::Pending => {
                let gateway_order_id = order.gateway_order_id.clone().ok_or_else(|| {
                    PaymentError::Internal(format!("Pending order {} has no gateway id", internal_id))
                })?;

                order.status = OrderStatus::Paid;
                order.payment_id = Some(gateway_payment_id.to_string());
                order.signature = signature.map(str::to_string);
                order.payment_method = Some(PaymentMethod::Gateway);
                order.updated_at = Utc::now();
                store_order(&mut tx, &order).await?;

                let payment = PaymentRecord::captured(&order, &gateway_order_id, gateway_payment_id);
                insert_payment(&mut tx, &payment).await?;

                commit(tx).await?;
                info!(internal_id, gateway_payment_id, "order paid");
                Ok(Settlement::Applied)
            }
            OrderStatus::Uninitiated => Err(PaymentError::InvalidState {
                id: internal_id.to_string(),
                status: order.status.to_string(),
            }),
            OrderStatus::Failed | OrderStatus::Cancelled => {
                warn!(
                    internal_id,
                    gateway_payment_id,
                    status = %order.status,
                    "payment captured for a closed order"
                );
                Err(PaymentError::Conflict(format!(
                    "Order {} is {}",
                    internal_id, order.status
                )))
            }
        }
    }

    async fn mark_order_paid_cash(
        &self,
        internal_id: &str,
        receipt: &CashReceipt,
    ) -> PaymentResult<Settlement> {
        let mut tx = self.begin().await?;
        let mut order = lock_order(&mut tx, internal_id).await?;

        if receipt.amount != order.amount_minor_units {
            return Err(PaymentError::Validation(format!(
                "Cash amount {} does not match order amount {}",
                receipt.amount, order.amount_minor_units
            )));
        }

        match order.status {
            OrderStatus::Paid if order.payment_method == Some(PaymentMethod::Cash) => {
                Ok(Settlement::Replayed)
            }
            OrderStatus::Paid => Err(PaymentError::Conflict(format!(
                "Order {} is already paid through the gateway",
                internal_id
            ))),
            OrderStatus::Uninitiated | OrderStatus::Pending => {
                order.status = OrderStatus::Paid;
                order.payment_method = Some(PaymentMethod::Cash);
                order.updated_at = Utc::now();
                store_order(&mut tx, &order).await?;
                insert_payment(&mut tx, &PaymentRecord::cash(&order, receipt)).await?;

                commit(tx).await?;
                info!(internal_id, staff_id = %receipt.staff_id, "order paid in cash");
                Ok(Settlement::Applied)
            }
            OrderStatus::Failed | OrderStatus::Cancelled => Err(PaymentError::Conflict(format!(
                "Order {} is {}",
                internal_id, order.status
            ))),
        }
    }

    async fn close_order(&self, internal_id: &str, status: OrderStatus) -> PaymentResult<Order> {
        if !matches!(status, OrderStatus::Failed | OrderStatus::Cancelled) {
            return Err(PaymentError::Validation(format!(
                "Orders can only be closed as failed or cancelled, not {}",
                status
            )));
        }

        let mut tx = self.begin().await?;
        let mut order = lock_order(&mut tx, internal_id).await?;

        if order.status == status {
            return Ok(order);
        }
        if !order.status.can_transition_to(status) {
            return Err(PaymentError::InvalidState {
                id: internal_id.to_string(),
                status: order.status.to_string(),
            });
        }

        order.status = status;
        order.updated_at = Utc::now();
        store_order(&mut tx, &order).await?;
        commit(tx).await?;
        Ok(order)
    }

    async fn payments_for_order(&self, internal_id: &str) -> PaymentResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE internal_order_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(internal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("load payments", e))?;

        rows.into_iter().map(PaymentRecord::try_from).collect()
    }

    async fn has_active_subscription(&self, user_id: &str) -> PaymentResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_subscriptions
                WHERE user_id = $1 AND status = 'active' AND end_date > $2
            )
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("check active subscription", e))
    }

    async fn create_pending_subscription(
        &self,
        subscription: NewSubscription,
    ) -> PaymentResult<Subscription> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        expire_lapsed(&mut *tx, Some(&subscription.user_id), now).await?;

        let abandoned = sqlx::query(
            r#"
            UPDATE user_subscriptions SET status = 'cancelled', updated_at = $2
            WHERE user_id = $1 AND status = 'pending' AND created_at <= $3
            "#,
        )
        .bind(&subscription.user_id)
        .bind(now)
        .bind(now - self.pending_ttl)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("cancel abandoned subscriptions", e))?;

        if abandoned.rows_affected() > 0 {
            info!(
                user_id = %subscription.user_id,
                count = abandoned.rows_affected(),
                "cancelled abandoned pending subscriptions"
            );
        }

        let created = subscription.into_pending();
        sqlx::query(&format!(
            "INSERT INTO user_subscriptions ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(created.internal_id)
        .bind(&created.user_id)
        .bind(&created.plan_id)
        .bind(&created.gateway_subscription_id)
        .bind(&created.gateway_plan_id)
        .bind(created.status.as_str())
        .bind(created.start_date)
        .bind(created.end_date)
        .bind(&created.payment_id)
        .bind(&created.signature)
        .bind(created.created_at)
        .bind(created.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("insert subscription", e))?;

        commit(tx).await?;
        Ok(created)
    }

    async fn activate_subscription(
        &self,
        gateway_subscription_id: &str,
        user_id: &str,
        gateway_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<Settlement> {
        let mut tx = self.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions \
             WHERE gateway_subscription_id = $1 AND user_id = $2 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(gateway_subscription_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_error("lock subscription", e))?;

        let mut sub: Subscription = row
            .ok_or_else(|| PaymentError::not_found("subscription", gateway_subscription_id))?
            .try_into()?;

        match sub.status {
            SubscriptionStatus::Pending => {
                sub.status = SubscriptionStatus::Active;
                sub.payment_id = Some(gateway_payment_id.to_string());
                sub.signature = signature.map(str::to_string);
                sub.updated_at = Utc::now();
                store_subscription(&mut tx, &sub).await?;
                insert_charge(&mut tx, gateway_subscription_id, gateway_payment_id).await?;
                commit(tx).await?;
                info!(user_id, gateway_subscription_id, "subscription active");
                Ok(Settlement::Applied)
            }
            SubscriptionStatus::Active => {
                if charged_to(&mut tx, gateway_payment_id).await?.as_deref()
                    == Some(gateway_subscription_id)
                {
                    Ok(Settlement::Replayed)
                } else {
                    Err(PaymentError::Conflict(format!(
                        "Subscription {} is already active with a different payment",
                        gateway_subscription_id
                    )))
                }
            }
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled => Err(
                PaymentError::not_found("pending subscription", gateway_subscription_id),
            ),
        }
    }

    async fn record_subscription_charge(
        &self,
        gateway_subscription_id: &str,
        gateway_payment_id: &str,
        extend_by: Duration,
    ) -> PaymentResult<Settlement> {
        let mut tx = self.begin().await?;
        let mut sub = lock_subscription(&mut tx, gateway_subscription_id).await?;

        if let Some(charged) = charged_to(&mut tx, gateway_payment_id).await? {
            return if charged == gateway_subscription_id {
                Ok(Settlement::Replayed)
            } else {
                Err(PaymentError::Conflict(format!(
                    "Payment {} is already charged to another subscription",
                    gateway_payment_id
                )))
            };
        }
        if sub.status != SubscriptionStatus::Active {
            return Err(PaymentError::InvalidState {
                id: gateway_subscription_id.to_string(),
                status: sub.status.to_string(),
            });
        }

        sub.end_date = sub.end_date + extend_by;
        sub.payment_id = Some(gateway_payment_id.to_string());
        sub.updated_at = Utc::now();
        store_subscription(&mut tx, &sub).await?;
        insert_charge(&mut tx, gateway_subscription_id, gateway_payment_id).await?;
        commit(tx).await?;

        info!(
            gateway_subscription_id,
            gateway_payment_id,
            end_date = %sub.end_date,
            "subscription renewed"
        );
        Ok(Settlement::Applied)
    }

    async fn close_subscription(
        &self,
        gateway_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> PaymentResult<Subscription> {
        if !matches!(status, SubscriptionStatus::Expired | SubscriptionStatus::Cancelled) {
            return Err(PaymentError::Validation(format!(
                "Subscriptions can only be closed as expired or cancelled, not {}",
                status
            )));
        }

        let mut tx = self.begin().await?;
        let mut sub = lock_subscription(&mut tx, gateway_subscription_id).await?;

        if sub.status == status {
            return Ok(sub);
        }
        if !sub.status.can_transition_to(status) {
            return Err(PaymentError::InvalidState {
                id: gateway_subscription_id.to_string(),
                status: sub.status.to_string(),
            });
        }

        sub.status = status;
        sub.updated_at = Utc::now();
        store_subscription(&mut tx, &sub).await?;
        commit(tx).await?;
        Ok(sub)
    }

    async fn find_subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> PaymentResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions WHERE gateway_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(gateway_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("load subscription", e))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn active_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PaymentResult<Option<Subscription>> {
        expire_lapsed(&self.pool, Some(user_id), now).await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1 AND status = 'active'",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("load subscription", e))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn expire_lapsed_subscriptions(&self, now: DateTime<Utc>) -> PaymentResult<u64> {
        let expired = expire_lapsed(&self.pool, None, now).await?;
        if expired > 0 {
            info!(expired, "expired lapsed subscriptions");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_row(status: &str, amount: i64) -> OrderRow {
        let now = Utc::now();
        OrderRow {
            internal_id: "ORD123".into(),
            gateway_order_id: Some("order_abc".into()),
            amount_minor_units: amount,
            currency: "INR".into(),
            status: status.into(),
            payment_id: None,
            signature: None,
            payment_method: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_order_row_conversion() {
        let order = Order::try_from(order_row("pending", 25000)).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.amount_minor_units.get(), 25000);
        assert_eq!(order.currency, Currency::INR);
    }

    #[test]
    fn test_corrupt_rows_are_storage_errors() {
        assert!(matches!(
            Order::try_from(order_row("shipped", 25000)),
            Err(PaymentError::Storage(_))
        ));
        assert!(matches!(
            Order::try_from(order_row("pending", 0)),
            Err(PaymentError::Storage(_))
        ));
    }

    #[test]
    fn test_cash_payment_row_conversion() {
        let row = PaymentRow {
            id: Uuid::new_v4(),
            internal_order_id: "ORD123".into(),
            method: "cash".into(),
            gateway_order_id: None,
            gateway_payment_id: None,
            amount_minor_units: 25000,
            currency: "INR".into(),
            status: "collected".into(),
            recorded_by: Some("staff_7".into()),
            notes: None,
            created_at: Utc::now(),
        };
        let payment = PaymentRecord::try_from(row).unwrap();
        assert_eq!(payment.method, PaymentMethod::Cash);
        assert!(payment.gateway_payment_id.is_none());

        let mut row = order_row("paid", 25000);
        row.payment_method = Some("cash".into());
        let order = Order::try_from(row).unwrap();
        assert_eq!(order.payment_method, Some(PaymentMethod::Cash));

        let mut row = order_row("paid", 25000);
        row.payment_method = Some("cheque".into());
        assert!(matches!(Order::try_from(row), Err(PaymentError::Storage(_))));
    }

    #[test]
    fn test_subscription_row_conversion() {
        let now = Utc::now();
        let sub = Subscription::try_from(SubscriptionRow {
            internal_id: Uuid::new_v4(),
            user_id: "user_a".into(),
            plan_id: "starter".into(),
            gateway_subscription_id: "sub_1".into(),
            gateway_plan_id: "plan_starter".into(),
            status: "active".into(),
            start_date: now,
            end_date: now + Duration::days(30),
            payment_id: Some("pay_1".into()),
            signature: None,
            created_at: now,
            updated_at: now,
        })
        .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_plain_errors_are_storage() {
        let err = storage_error("load order", sqlx::Error::RowNotFound);
        assert!(matches!(err, PaymentError::Storage(_)));
    }
}
