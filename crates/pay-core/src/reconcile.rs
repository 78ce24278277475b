//! # Reconciliation Service
//!
//! Orchestrates gateway, verifier and ledger into the payment state machine:
//!
//! ```text
//! order:         uninitiated ──initiate──► pending ──confirm──► paid
//!                uninitiated | pending ──cash──► paid
//! subscription:  (none) ──initiate──► pending ──confirm──► active ──► expired | cancelled
//!                active ──charged──► active (end date extended)
//! ```
//!
//! The service holds no mutable state of its own and never holds a lock
//! across a gateway call; every invariant is enforced by the ledger.

use crate::error::{PaymentError, PaymentResult};
use crate::event::{GatewayEvent, GatewayEventKind};
use crate::gateway::{
    BoxedPaymentGateway, CreateOrderRequest, CreateSubscriptionRequest, GatewayOrder,
    GatewaySubscription, Notes, INTERNAL_ORDER_ID_NOTE, USER_ID_NOTE,
};
use crate::ledger::BoxedPaymentLedger;
use crate::money::{Currency, MinorUnits};
use crate::order::{CashReceipt, Order, OrderStatus, Settlement};
use crate::subscription::{NewSubscription, Plan, PlanCatalog, Subscription, SubscriptionStatus};
use crate::verifier::BoxedCallbackVerifier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

/// Input for [`ReconciliationService::initiate_order_payment`]
#[derive(Debug, Clone)]
pub struct InitiateOrderPayment {
    pub internal_order_id: String,
    pub amount: MinorUnits,
    pub currency: Currency,
    /// Defaults to the internal order id
    pub receipt: Option<String>,
    pub notes: Notes,
}

/// Input for [`ReconciliationService::confirm_order_payment`]
#[derive(Debug, Clone)]
pub struct ConfirmOrderPayment {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
    pub internal_order_id: String,
    /// When present, must equal the stored order amount
    pub amount: Option<MinorUnits>,
}

/// Input for [`ReconciliationService::confirm_cash_payment`]
#[derive(Debug, Clone)]
pub struct ConfirmCashPayment {
    pub internal_order_id: String,
    /// Staff member who took the cash
    pub staff_id: String,
    pub amount: MinorUnits,
    pub notes: Option<String>,
}

/// Input for [`ReconciliationService::initiate_subscription`]
#[derive(Debug, Clone)]
pub struct InitiateSubscription {
    pub user_id: String,
    pub plan_id: String,
    pub notify_customer: bool,
    pub total_cycles: u32,
    pub notes: Notes,
}

/// Input for [`ReconciliationService::confirm_subscription_payment`]
#[derive(Debug, Clone)]
pub struct ConfirmSubscriptionPayment {
    pub gateway_subscription_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
    pub user_id: String,
}

/// What the front-end needs to open the provider checkout for an order
#[derive(Debug, Clone, Serialize)]
pub struct PaymentInitiation {
    /// Public gateway key id (the client token)
    pub key_id: String,
    pub gateway_order: GatewayOrder,
}

/// What the front-end needs to open the provider checkout for a subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInitiation {
    pub key_id: String,
    pub gateway_subscription: GatewaySubscription,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    pub subscription: Option<Subscription>,
    pub plan: Option<Plan>,
    pub has_active: bool,
}

/// A gateway order that no local order is bound to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedOrder {
    pub gateway_order_id: String,
    /// Merchant order named in the gateway order notes, if any
    pub internal_order_id: Option<String>,
    /// Status of that merchant order, if it exists
    pub local_status: Option<OrderStatus>,
    pub amount: u64,
    pub currency: String,
    pub created_at: Option<i64>,
}

/// Result of a reconciliation sweep
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub orphans: Vec<OrphanedOrder>,
    pub expired_subscriptions: u64,
}

/// What applying a webhook event did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Settled(Settlement),
    Closed,
    Ignored,
}

pub struct ReconciliationService {
    gateway: BoxedPaymentGateway,
    verifier: BoxedCallbackVerifier,
    ledger: BoxedPaymentLedger,
    plans: PlanCatalog,
}

impl ReconciliationService {
    pub fn new(
        gateway: BoxedPaymentGateway,
        verifier: BoxedCallbackVerifier,
        ledger: BoxedPaymentLedger,
        plans: PlanCatalog,
    ) -> Self {
        Self {
            gateway,
            verifier,
            ledger,
            plans,
        }
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn key_id(&self) -> &str {
        self.gateway.key_id()
    }

    pub fn provider_name(&self) -> &'static str {
        self.gateway.provider_name()
    }

    /// Hand a merchant order to the payment core in `uninitiated` state.
    #[instrument(skip(self), fields(internal_order_id = %internal_order_id))]
    pub async fn register_order(
        &self,
        internal_order_id: &str,
        amount: MinorUnits,
        currency: Currency,
    ) -> PaymentResult<Order> {
        if internal_order_id.trim().is_empty() {
            return Err(PaymentError::Validation(
                "internalOrderId must not be empty".to_string(),
            ));
        }
        self.ledger
            .insert_order(Order::new(internal_order_id, amount, currency))
            .await
    }

    pub async fn get_order(&self, internal_order_id: &str) -> PaymentResult<Order> {
        self.ledger.get_order(internal_order_id).await
    }

    /// Mint a gateway order for an `uninitiated` merchant order and move it
    /// to `pending`.
    #[instrument(skip(self, request), fields(internal_order_id = %request.internal_order_id))]
    pub async fn initiate_order_payment(
        &self,
        request: InitiateOrderPayment,
    ) -> PaymentResult<PaymentInitiation> {
        let order = self.ledger.get_order(&request.internal_order_id).await?;

        if order.status != OrderStatus::Uninitiated {
            return Err(PaymentError::InvalidState {
                id: order.internal_id,
                status: order.status.to_string(),
            });
        }
        if order.amount_minor_units != request.amount {
            return Err(PaymentError::Validation(format!(
                "Amount {} does not match order amount {}",
                request.amount, order.amount_minor_units
            )));
        }
        if order.currency != request.currency {
            return Err(PaymentError::Validation(format!(
                "Currency {} does not match order currency {}",
                request.currency, order.currency
            )));
        }

        let mut notes = request.notes;
        notes.insert(INTERNAL_ORDER_ID_NOTE.to_string(), order.internal_id.clone());

        let gateway_request = CreateOrderRequest {
            amount: order.amount_minor_units,
            currency: order.currency,
            receipt: request
                .receipt
                .unwrap_or_else(|| order.internal_id.clone()),
            notes,
        };

        let gateway_order = self.gateway.create_order(&gateway_request).await?;

        if let Err(e) = self
            .ledger
            .record_pending_order(&order.internal_id, &gateway_order.id, order.currency)
            .await
        {
            error!(
                gateway_order_id = %gateway_order.id,
                error = %e,
                "gateway order created but not recorded; left for the reconciliation sweep"
            );
            return Err(e);
        }

        info!(
            gateway_order_id = %gateway_order.id,
            total = %order.total().display(),
            "order payment initiated"
        );

        Ok(PaymentInitiation {
            key_id: self.gateway.key_id().to_string(),
            gateway_order,
        })
    }

    /// Verify a checkout callback and mark the order paid.
    ///
    /// A bad signature fails only this attempt; the order stays `pending`.
    #[instrument(
        skip(self, request),
        fields(
            internal_order_id = %request.internal_order_id,
            gateway_order_id = %request.gateway_order_id,
            gateway_payment_id = %request.gateway_payment_id
        )
    )]
    pub async fn confirm_order_payment(
        &self,
        request: ConfirmOrderPayment,
    ) -> PaymentResult<Settlement> {
        if !self.verifier.verify_order_payment(
            &request.gateway_order_id,
            &request.gateway_payment_id,
            &request.signature,
        ) {
            warn!("order payment signature mismatch; possible forged callback");
            return Err(PaymentError::SignatureMismatch);
        }

        let order = self.ledger.get_order(&request.internal_order_id).await?;

        if order.gateway_order_id.as_deref() != Some(request.gateway_order_id.as_str()) {
            warn!("verified gateway order does not belong to this order");
            return Err(PaymentError::Conflict(format!(
                "Gateway order {} does not belong to order {}",
                request.gateway_order_id, request.internal_order_id
            )));
        }
        if let Some(amount) = request.amount {
            if amount != order.amount_minor_units {
                return Err(PaymentError::Validation(format!(
                    "Amount {} does not match order amount {}",
                    amount, order.amount_minor_units
                )));
            }
        }

        let settlement = self
            .ledger
            .mark_order_paid(
                &request.internal_order_id,
                &request.gateway_payment_id,
                Some(&request.signature),
            )
            .await?;

        match settlement {
            Settlement::Applied => info!("order payment confirmed"),
            Settlement::Replayed => debug!("duplicate order confirmation"),
        }
        Ok(settlement)
    }

    /// Record cash collected at the counter for an unpaid order.
    #[instrument(
        skip(self, request),
        fields(internal_order_id = %request.internal_order_id, staff_id = %request.staff_id)
    )]
    pub async fn confirm_cash_payment(
        &self,
        request: ConfirmCashPayment,
    ) -> PaymentResult<Settlement> {
        if request.staff_id.trim().is_empty() {
            return Err(PaymentError::Validation(
                "staffId must not be empty".to_string(),
            ));
        }

        let receipt = CashReceipt {
            staff_id: request.staff_id,
            amount: request.amount,
            notes: request.notes.filter(|n| !n.trim().is_empty()),
        };
        let settlement = self
            .ledger
            .mark_order_paid_cash(&request.internal_order_id, &receipt)
            .await?;

        match settlement {
            Settlement::Applied => info!(amount = %receipt.amount, "cash payment recorded"),
            Settlement::Replayed => debug!("duplicate cash payment"),
        }
        Ok(settlement)
    }

    /// Close an order as `failed` or `cancelled`.
    #[instrument(skip(self))]
    pub async fn close_order(
        &self,
        internal_order_id: &str,
        status: OrderStatus,
    ) -> PaymentResult<Order> {
        let order = self.ledger.close_order(internal_order_id, status).await?;
        info!(status = %order.status, "order closed");
        Ok(order)
    }

    /// Create a gateway subscription against the plan's pre-provisioned
    /// gateway plan and record it as `pending`.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, plan_id = %request.plan_id))]
    pub async fn initiate_subscription(
        &self,
        request: InitiateSubscription,
    ) -> PaymentResult<SubscriptionInitiation> {
        if request.total_cycles == 0 {
            return Err(PaymentError::Validation(
                "totalCycles must be at least 1".to_string(),
            ));
        }

        if self.ledger.has_active_subscription(&request.user_id).await? {
            return Err(PaymentError::Conflict(format!(
                "User {} already has an active subscription",
                request.user_id
            )));
        }

        let plan = self
            .plans
            .get(&request.plan_id)
            .filter(|p| p.active)
            .ok_or_else(|| PaymentError::not_found("plan", &request.plan_id))?;

        let gateway_plan_id = plan.gateway_plan_id.clone().ok_or_else(|| {
            PaymentError::Configuration(format!(
                "Plan {} has no provisioned gateway plan",
                plan.id
            ))
        })?;

        let mut notes = request.notes;
        notes.insert(USER_ID_NOTE.to_string(), request.user_id.clone());
        notes.insert("plan_name".to_string(), plan.name.clone());

        let gateway_subscription = self
            .gateway
            .create_subscription(&CreateSubscriptionRequest {
                gateway_plan_id: gateway_plan_id.clone(),
                notify_customer: request.notify_customer,
                total_cycles: request.total_cycles,
                notes,
            })
            .await?;

        let start_date = Utc::now();
        let subscription = self
            .ledger
            .create_pending_subscription(NewSubscription {
                user_id: request.user_id.clone(),
                plan_id: plan.id.clone(),
                gateway_subscription_id: gateway_subscription.id.clone(),
                gateway_plan_id,
                start_date,
                end_date: plan.end_date_from(start_date),
            })
            .await
            .map_err(|e| {
                warn!(
                    gateway_subscription_id = %gateway_subscription.id,
                    error = %e,
                    "gateway subscription created but not recorded"
                );
                e
            })?;

        info!(
            gateway_subscription_id = %gateway_subscription.id,
            price = %plan.price().display(),
            "subscription initiated"
        );

        Ok(SubscriptionInitiation {
            key_id: self.gateway.key_id().to_string(),
            gateway_subscription,
            subscription,
        })
    }

    /// Verify a subscription checkout callback and activate it.
    #[instrument(
        skip(self, request),
        fields(
            user_id = %request.user_id,
            gateway_subscription_id = %request.gateway_subscription_id
        )
    )]
    pub async fn confirm_subscription_payment(
        &self,
        request: ConfirmSubscriptionPayment,
    ) -> PaymentResult<Settlement> {
        if !self.verifier.verify_subscription_payment(
            &request.gateway_subscription_id,
            &request.gateway_payment_id,
            &request.signature,
        ) {
            warn!("subscription payment signature mismatch; possible forged callback");
            return Err(PaymentError::SignatureMismatch);
        }

        let settlement = self
            .ledger
            .activate_subscription(
                &request.gateway_subscription_id,
                &request.user_id,
                &request.gateway_payment_id,
                Some(&request.signature),
            )
            .await?;

        match settlement {
            Settlement::Applied => info!("subscription activated"),
            Settlement::Replayed => debug!("duplicate subscription confirmation"),
        }
        Ok(settlement)
    }

    /// The user's active subscription (if any) with its plan.
    pub async fn subscription_status(&self, user_id: &str) -> PaymentResult<SubscriptionStatusView> {
        let subscription = self.ledger.active_subscription(user_id, Utc::now()).await?;
        let plan = subscription
            .as_ref()
            .and_then(|s| self.plans.get(&s.plan_id).cloned());

        Ok(SubscriptionStatusView {
            has_active: subscription.is_some(),
            subscription,
            plan,
        })
    }

    /// Gateway orders created since `since` that no local order is bound to.
    ///
    /// These come from a crash or ledger failure between the gateway call
    /// and `record_pending_order`, or from a timed-out initiation.
    #[instrument(skip(self))]
    pub async fn find_orphaned_orders(
        &self,
        since: DateTime<Utc>,
    ) -> PaymentResult<Vec<OrphanedOrder>> {
        let remote = self.gateway.list_orders(since).await?;
        let mut orphans = Vec::new();

        for gateway_order in remote {
            if self
                .ledger
                .find_order_by_gateway_id(&gateway_order.id)
                .await?
                .is_some()
            {
                continue;
            }

            let internal_order_id = gateway_order.internal_order_id().map(str::to_string);
            let local_status = match internal_order_id.as_deref() {
                Some(id) => match self.ledger.get_order(id).await {
                    Ok(order) => Some(order.status),
                    Err(PaymentError::NotFound { .. }) => None,
                    Err(e) => return Err(e),
                },
                None => None,
            };

            warn!(
                gateway_order_id = %gateway_order.id,
                internal_order_id = ?internal_order_id,
                "orphaned gateway order"
            );

            orphans.push(OrphanedOrder {
                gateway_order_id: gateway_order.id,
                internal_order_id,
                local_status,
                amount: gateway_order.amount,
                currency: gateway_order.currency,
                created_at: gateway_order.created_at,
            });
        }

        Ok(orphans)
    }

    /// Orphan detection plus subscription expiry in one pass.
    pub async fn sweep(&self, since: DateTime<Utc>) -> PaymentResult<SweepReport> {
        let orphans = self.find_orphaned_orders(since).await?;
        let expired_subscriptions = self.ledger.expire_lapsed_subscriptions(Utc::now()).await?;
        info!(
            orphans = orphans.len(),
            expired_subscriptions, "reconciliation sweep finished"
        );
        Ok(SweepReport {
            orphans,
            expired_subscriptions,
        })
    }

    /// Apply a webhook event whose signature has already been verified.
    ///
    /// The webhook signature authenticates the delivery only, so nothing
    /// settled here stores a checkout signature.
    #[instrument(skip(self, event), fields(event_id = ?event.event_id))]
    pub async fn apply_gateway_event(&self, event: GatewayEvent) -> PaymentResult<EventOutcome> {
        match event.kind {
            GatewayEventKind::OrderPaid {
                gateway_order_id,
                gateway_payment_id,
            } => {
                let order = self
                    .ledger
                    .find_order_by_gateway_id(&gateway_order_id)
                    .await?
                    .ok_or_else(|| PaymentError::not_found("gateway order", &gateway_order_id))?;
                let settlement = self
                    .ledger
                    .mark_order_paid(&order.internal_id, &gateway_payment_id, None)
                    .await?;
                Ok(EventOutcome::Settled(settlement))
            }
            GatewayEventKind::PaymentFailed {
                gateway_order_id,
                gateway_payment_id,
                reason,
            } => {
                // The payer may retry on the same gateway order, so the
                // order itself stays pending.
                info!(
                    gateway_order_id = ?gateway_order_id,
                    gateway_payment_id = %gateway_payment_id,
                    reason = ?reason,
                    "payment attempt failed"
                );
                Ok(EventOutcome::Ignored)
            }
            GatewayEventKind::SubscriptionActivated {
                gateway_subscription_id,
                gateway_payment_id,
                user_id,
            } => {
                let Some(gateway_payment_id) = gateway_payment_id else {
                    debug!(%gateway_subscription_id, "activation event without payment");
                    return Ok(EventOutcome::Ignored);
                };
                let user_id = match user_id {
                    Some(user_id) => user_id,
                    None => self
                        .ledger
                        .find_subscription_by_gateway_id(&gateway_subscription_id)
                        .await?
                        .map(|s| s.user_id)
                        .ok_or_else(|| {
                            PaymentError::not_found("subscription", &gateway_subscription_id)
                        })?,
                };
                let settlement = self
                    .ledger
                    .activate_subscription(
                        &gateway_subscription_id,
                        &user_id,
                        &gateway_payment_id,
                        None,
                    )
                    .await?;
                Ok(EventOutcome::Settled(settlement))
            }
            GatewayEventKind::SubscriptionCharged {
                gateway_subscription_id,
                gateway_payment_id,
                user_id,
            } => {
                let sub = self
                    .ledger
                    .find_subscription_by_gateway_id(&gateway_subscription_id)
                    .await?
                    .filter(|s| user_id.as_deref().map_or(true, |u| u == s.user_id))
                    .ok_or_else(|| PaymentError::not_found("subscription", &gateway_subscription_id))?;

                // The first charge can beat the activation event
                if sub.status == SubscriptionStatus::Pending {
                    let settlement = self
                        .ledger
                        .activate_subscription(
                            &gateway_subscription_id,
                            &sub.user_id,
                            &gateway_payment_id,
                            None,
                        )
                        .await?;
                    return Ok(EventOutcome::Settled(settlement));
                }

                let plan = self.plans.get(&sub.plan_id).ok_or_else(|| {
                    PaymentError::Configuration(format!(
                        "Subscription {} is on unknown plan {}",
                        gateway_subscription_id, sub.plan_id
                    ))
                })?;
                let settlement = self
                    .ledger
                    .record_subscription_charge(
                        &gateway_subscription_id,
                        &gateway_payment_id,
                        plan.term(),
                    )
                    .await?;
                Ok(EventOutcome::Settled(settlement))
            }
            GatewayEventKind::SubscriptionCancelled {
                gateway_subscription_id,
            } => {
                self.ledger
                    .close_subscription(&gateway_subscription_id, SubscriptionStatus::Cancelled)
                    .await?;
                Ok(EventOutcome::Closed)
            }
            GatewayEventKind::SubscriptionCompleted {
                gateway_subscription_id,
            } => {
                self.ledger
                    .close_subscription(&gateway_subscription_id, SubscriptionStatus::Expired)
                    .await?;
                Ok(EventOutcome::Closed)
            }
            GatewayEventKind::Unknown { event: name } => {
                debug!(event = %name, "unhandled gateway event");
                Ok(EventOutcome::Ignored)
            }
        }
    }
}
