//! # Payment Gateway Port
//!
//! Trait implemented by payment providers. The reconciliation service only
//! talks to the provider through this trait, so a fake can stand in during
//! tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PaymentGateway (trait)                     │
//! │  ├── create_order()                                         │
//! │  ├── create_subscription()                                  │
//! │  ├── create_plan()          (catalog setup only)            │
//! │  └── list_orders()          (reconciliation sweep)          │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                 ┌──────────┴──────────┐
//!         ┌───────┴───────┐     ┌───────┴───────┐
//!         │RazorpayClient │     │  test fakes   │
//!         └───────────────┘     └───────────────┘
//! ```

use crate::error::PaymentResult;
use crate::money::{Currency, MinorUnits};
use crate::subscription::BillingPeriod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Free-form key/value notes attached to gateway entities
pub type Notes = BTreeMap<String, String>;

/// Request to mint a provider-side order
#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub amount: MinorUnits,
    pub currency: Currency,
    /// Unique per attempt
    pub receipt: String,
    pub notes: Notes,
}

/// Request to create a provider-side subscription
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub gateway_plan_id: String,
    pub notify_customer: bool,
    pub total_cycles: u32,
    pub notes: Notes,
}

/// Line item of a gateway plan
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub name: String,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub description: Option<String>,
}

/// Request to create a billing plan (catalog setup only)
#[derive(Debug, Clone)]
pub struct CreatePlanRequest {
    pub period: BillingPeriod,
    pub interval: u32,
    pub item: PlanItem,
    pub notes: Notes,
}

/// Provider order as returned to the front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub notes: Notes,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl GatewayOrder {
    /// Internal order id stamped into the notes at creation
    pub fn internal_order_id(&self) -> Option<&str> {
        self.notes
            .get(INTERNAL_ORDER_ID_NOTE)
            .map(String::as_str)
            .or(self.receipt.as_deref())
    }
}

/// Provider subscription as returned to the front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub plan_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total_count: Option<u32>,
    #[serde(default)]
    pub short_url: Option<String>,
    #[serde(default)]
    pub notes: Notes,
}

/// Provider plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPlan {
    pub id: String,
    pub period: String,
    pub interval: u32,
}

/// Note key carrying the merchant order id on gateway orders
pub const INTERNAL_ORDER_ID_NOTE: &str = "internal_order_id";

/// Note key carrying the user id on gateway subscriptions
pub const USER_ID_NOTE: &str = "user_id";

/// Core trait for payment provider clients.
///
/// Implementations never touch local state; every method is a single
/// request/response round-trip with a bounded timeout.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Mint a provider order. On any error the caller must not assume the
    /// order was or was not created remotely.
    async fn create_order(&self, request: &CreateOrderRequest) -> PaymentResult<GatewayOrder>;

    /// Create a provider subscription against a pre-provisioned plan.
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<GatewaySubscription>;

    /// Create a billing plan. Not used on the request path.
    async fn create_plan(&self, request: &CreatePlanRequest) -> PaymentResult<GatewayPlan>;

    /// Orders created at or after `since`, for reconciliation sweeps.
    async fn list_orders(&self, since: DateTime<Utc>) -> PaymentResult<Vec<GatewayOrder>>;

    /// Public key id the front-end needs to open the provider checkout.
    fn key_id(&self) -> &str;

    /// Provider name (for logging).
    fn provider_name(&self) -> &'static str;
}

/// Type alias for a shared gateway (dynamic dispatch)
pub type BoxedPaymentGateway = Arc<dyn PaymentGateway>;
