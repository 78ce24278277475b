//! # Payment Ledger Port
//!
//! The ledger is the only writer of order and subscription status. Every
//! implementation must make each method atomic at the storage layer:
//! check-then-write sequences are never split across two round-trips.

use crate::error::PaymentResult;
use crate::money::Currency;
use crate::order::{CashReceipt, Order, OrderStatus, PaymentRecord, Settlement};
use crate::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// How long a pending subscription blocks a new one before it is treated
/// as abandoned.
pub fn default_pending_ttl() -> Duration {
    Duration::minutes(30)
}

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    // ---------------------------------------------------------------------
    // Orders
    // ---------------------------------------------------------------------

    /// Register a merchant order. Fails with `Conflict` if the id exists.
    async fn insert_order(&self, order: Order) -> PaymentResult<Order>;

    /// Fails with `NotFound` for an unknown id.
    async fn get_order(&self, internal_id: &str) -> PaymentResult<Order>;

    async fn find_order_by_gateway_id(&self, gateway_order_id: &str)
        -> PaymentResult<Option<Order>>;

    /// `uninitiated -> pending`, binding the gateway order id.
    ///
    /// Re-recording the same gateway order id is a no-op; a different id on
    /// a pending order, or any terminal order, is a `Conflict`.
    async fn record_pending_order(
        &self,
        internal_id: &str,
        gateway_order_id: &str,
        currency: Currency,
    ) -> PaymentResult<()>;

    /// `pending -> paid`, writing exactly one `PaymentRecord`.
    ///
    /// Same payment id on a paid order returns `Replayed`; a different one
    /// is a `Conflict`. `signature` is the checkout callback signature, and
    /// is `None` when the capture is learned from a webhook.
    async fn mark_order_paid(
        &self,
        internal_id: &str,
        gateway_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<Settlement>;

    /// `uninitiated | pending -> paid` for cash taken at the counter,
    /// writing one `cash` `PaymentRecord`.
    ///
    /// The receipt amount must equal the order amount (`Validation`). A
    /// repeat on an order already paid in cash returns `Replayed`; an order
    /// paid through the gateway, or closed, is a `Conflict`.
    async fn mark_order_paid_cash(
        &self,
        internal_id: &str,
        receipt: &CashReceipt,
    ) -> PaymentResult<Settlement>;

    /// Move an order to `failed` or `cancelled`. Closing to the status the
    /// order already has is a no-op.
    async fn close_order(&self, internal_id: &str, status: OrderStatus) -> PaymentResult<Order>;

    async fn payments_for_order(&self, internal_id: &str) -> PaymentResult<Vec<PaymentRecord>>;

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// True if the user holds an `active`, unexpired subscription.
    async fn has_active_subscription(&self, user_id: &str) -> PaymentResult<bool>;

    /// Atomic check-and-insert: fails with `Conflict` if the user already
    /// has a live (pending within TTL, or active) subscription.
    async fn create_pending_subscription(
        &self,
        subscription: NewSubscription,
    ) -> PaymentResult<Subscription>;

    /// `pending -> active` for the exact `(gateway_subscription_id, user_id)`
    /// pair; `NotFound` for any other pairing. The payment counts as the
    /// first charge of the subscription.
    async fn activate_subscription(
        &self,
        gateway_subscription_id: &str,
        user_id: &str,
        gateway_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<Settlement>;

    /// Renew an `active` subscription: a payment id not yet charged to it
    /// moves `end_date` forward by `extend_by`.
    ///
    /// A payment id already charged to this subscription returns `Replayed`;
    /// one charged to another subscription is a `Conflict`. Non-active
    /// subscriptions are `InvalidState`.
    async fn record_subscription_charge(
        &self,
        gateway_subscription_id: &str,
        gateway_payment_id: &str,
        extend_by: Duration,
    ) -> PaymentResult<Settlement>;

    /// Move a subscription to `expired` or `cancelled`.
    async fn close_subscription(
        &self,
        gateway_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> PaymentResult<Subscription>;

    async fn find_subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> PaymentResult<Option<Subscription>>;

    /// The user's active subscription, after expiring any that lapsed.
    async fn active_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PaymentResult<Option<Subscription>>;

    /// Expire every active subscription whose end date is at or before `now`.
    async fn expire_lapsed_subscriptions(&self, now: DateTime<Utc>) -> PaymentResult<u64>;
}

pub type BoxedPaymentLedger = Arc<dyn PaymentLedger>;
