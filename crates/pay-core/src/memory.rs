//! # In-Memory Ledger
//!
//! `PaymentLedger` backed by process memory. Each operation runs inside a
//! single critical section, which is what makes check-and-insert atomic.
//! Used for tests and for running the API without a database.

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{default_pending_ttl, PaymentLedger};
use crate::money::Currency;
use crate::order::{CashReceipt, Order, OrderStatus, PaymentMethod, PaymentRecord, Settlement};
use crate::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct LedgerState {
    orders: HashMap<String, Order>,
    payments: Vec<PaymentRecord>,
    subscriptions: Vec<Subscription>,
    /// gateway payment id -> gateway subscription id it was charged to
    charges: HashMap<String, String>,
}

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    pending_ttl: Duration,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            pending_ttl: default_pending_ttl(),
        }
    }

    /// Builder: override how long a pending subscription blocks new ones
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn expire_lapsed(subscriptions: &mut [Subscription], user_id: Option<&str>, now: DateTime<Utc>) -> u64 {
    let mut expired = 0;
    for sub in subscriptions
        .iter_mut()
        .filter(|s| user_id.map_or(true, |u| s.user_id == u))
        .filter(|s| s.is_lapsed(now))
    {
        sub.status = SubscriptionStatus::Expired;
        sub.updated_at = now;
        expired += 1;
    }
    expired
}

#[async_trait]
impl PaymentLedger for InMemoryLedger {
    async fn insert_order(&self, order: Order) -> PaymentResult<Order> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.internal_id) {
            return Err(PaymentError::Conflict(format!(
                "Order {} already exists",
                order.internal_id
            )));
        }
        state.orders.insert(order.internal_id.clone(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, internal_id: &str) -> PaymentResult<Order> {
        let state = self.state.lock().await;
        state
            .orders
            .get(internal_id)
            .cloned()
            .ok_or_else(|| PaymentError::not_found("order", internal_id))
    }

    async fn find_order_by_gateway_id(
        &self,
        gateway_order_id: &str,
    ) -> PaymentResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.gateway_order_id.as_deref() == Some(gateway_order_id))
            .cloned())
    }

    async fn record_pending_order(
        &self,
        internal_id: &str,
        gateway_order_id: &str,
        currency: Currency,
    ) -> PaymentResult<()> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(internal_id)
            .ok_or_else(|| PaymentError::not_found("order", internal_id))?;

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
        let mut guard = self.state.lock().await;
        let LedgerState {
            orders, payments, ..
        } = &mut *guard;

        let order = orders
            .get_mut(internal_id)
            .ok_or_else(|| PaymentError::not_found("order", internal_id))?;

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
                if payments
                    .iter()
                    .any(|p| p.gateway_payment_id.as_deref() == Some(gateway_payment_id))
                {
                    return Err(PaymentError::Conflict(format!(
                        "Payment {} is already recorded against another order",
                        gateway_payment_id
                    )));
                }
                let gateway_order_id = order.gateway_order_id.clone().ok_or_else(|| {
                    PaymentError::Internal(format!("Pending order {} has no gateway id", internal_id))
                })?;

                order.status = OrderStatus::Paid;
                order.payment_id = Some(gateway_payment_id.to_string());
                order.signature = signature.map(str::to_string);
                order.payment_method = Some(PaymentMethod::Gateway);
                order.updated_at = Utc::now();
                payments.push(PaymentRecord::captured(
                    order,
                    &gateway_order_id,
                    gateway_payment_id,
                ));
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
        let mut guard = self.state.lock().await;
        let LedgerState {
            orders, payments, ..
        } = &mut *guard;

        let order = orders
            .get_mut(internal_id)
            .ok_or_else(|| PaymentError::not_found("order", internal_id))?;

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
                payments.push(PaymentRecord::cash(order, receipt));
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

        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(internal_id)
            .ok_or_else(|| PaymentError::not_found("order", internal_id))?;

        if order.status == status {
            return Ok(order.clone());
        }
        if !order.status.can_transition_to(status) {
            return Err(PaymentError::InvalidState {
                id: internal_id.to_string(),
                status: order.status.to_string(),
            });
        }
        order.status = status;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn payments_for_order(&self, internal_id: &str) -> PaymentResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.internal_order_id == internal_id)
            .cloned()
            .collect())
    }

    async fn has_active_subscription(&self, user_id: &str) -> PaymentResult<bool> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state.subscriptions.iter().any(|s| {
            s.user_id == user_id && s.status == SubscriptionStatus::Active && !s.is_lapsed(now)
        }))
    }

    async fn create_pending_subscription(
        &self,
        subscription: NewSubscription,
    ) -> PaymentResult<Subscription> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        expire_lapsed(&mut state.subscriptions, Some(&subscription.user_id), now);

        for stale in state.subscriptions.iter_mut().filter(|s| {
            s.user_id == subscription.user_id
                && s.status == SubscriptionStatus::Pending
                && now - s.created_at >= self.pending_ttl
        }) {
            info!(
                user_id = %stale.user_id,
                gateway_subscription_id = %stale.gateway_subscription_id,
                "cancelling abandoned pending subscription"
            );
            stale.status = SubscriptionStatus::Cancelled;
            stale.updated_at = now;
        }

        if let Some(live) = state
            .subscriptions
            .iter()
            .find(|s| s.user_id == subscription.user_id && s.status.is_live())
        {
            return Err(PaymentError::Conflict(format!(
                "User {} already has a {} subscription",
                subscription.user_id, live.status
            )));
        }
        if state
            .subscriptions
            .iter()
            .any(|s| s.gateway_subscription_id == subscription.gateway_subscription_id)
        {
            return Err(PaymentError::Conflict(format!(
                "Gateway subscription {} is already recorded",
                subscription.gateway_subscription_id
            )));
        }

        let created = subscription.into_pending();
        state.subscriptions.push(created.clone());
        Ok(created)
    }

    async fn activate_subscription(
        &self,
        gateway_subscription_id: &str,
        user_id: &str,
        gateway_payment_id: &str,
        signature: Option<&str>,
    ) -> PaymentResult<Settlement> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let idx = state
            .subscriptions
            .iter()
            .position(|s| s.gateway_subscription_id == gateway_subscription_id && s.user_id == user_id)
            .ok_or_else(|| PaymentError::not_found("subscription", gateway_subscription_id))?;

        match state.subscriptions[idx].status {
            SubscriptionStatus::Pending => {
                let other_active = state.subscriptions.iter().enumerate().any(|(i, s)| {
                    i != idx && s.user_id == user_id && s.status == SubscriptionStatus::Active
                });
                if other_active {
                    return Err(PaymentError::Conflict(format!(
                        "User {} already has an active subscription",
                        user_id
                    )));
                }
                if state.charges.contains_key(gateway_payment_id) {
                    return Err(PaymentError::Conflict(format!(
                        "Payment {} is already charged to another subscription",
                        gateway_payment_id
                    )));
                }
                let sub = &mut state.subscriptions[idx];
                sub.status = SubscriptionStatus::Active;
                sub.payment_id = Some(gateway_payment_id.to_string());
                sub.signature = signature.map(str::to_string);
                sub.updated_at = now;
                state
                    .charges
                    .insert(gateway_payment_id.to_string(), gateway_subscription_id.to_string());
                info!(user_id, gateway_subscription_id, "subscription active");
                Ok(Settlement::Applied)
            }
            SubscriptionStatus::Active => {
                if state.charges.get(gateway_payment_id).map(String::as_str)
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
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled => {
                Err(PaymentError::not_found("pending subscription", gateway_subscription_id))
            }
        }
    }

    async fn record_subscription_charge(
        &self,
        gateway_subscription_id: &str,
        gateway_payment_id: &str,
        extend_by: Duration,
    ) -> PaymentResult<Settlement> {
        let mut guard = self.state.lock().await;
        let LedgerState {
            subscriptions,
            charges,
            ..
        } = &mut *guard;

        let sub = subscriptions
            .iter_mut()
            .find(|s| s.gateway_subscription_id == gateway_subscription_id)
            .ok_or_else(|| PaymentError::not_found("subscription", gateway_subscription_id))?;

        if let Some(charged_to) = charges.get(gateway_payment_id) {
            return if charged_to == gateway_subscription_id {
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
        charges.insert(gateway_payment_id.to_string(), gateway_subscription_id.to_string());
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

        let mut state = self.state.lock().await;
        let sub = state
            .subscriptions
            .iter_mut()
            .find(|s| s.gateway_subscription_id == gateway_subscription_id)
            .ok_or_else(|| PaymentError::not_found("subscription", gateway_subscription_id))?;

        if sub.status == status {
            return Ok(sub.clone());
        }
        if !sub.status.can_transition_to(status) {
            return Err(PaymentError::InvalidState {
                id: gateway_subscription_id.to_string(),
                status: sub.status.to_string(),
            });
        }
        sub.status = status;
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

    async fn find_subscription_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> PaymentResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.gateway_subscription_id == gateway_subscription_id)
            .cloned())
    }

    async fn active_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PaymentResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        expire_lapsed(&mut state.subscriptions, Some(user_id), now);
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn expire_lapsed_subscriptions(&self, now: DateTime<Utc>) -> PaymentResult<u64> {
        let mut state = self.state.lock().await;
        Ok(expire_lapsed(&mut state.subscriptions, None, now))
    }
}
