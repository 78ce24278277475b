//! # Subscription Types
//!
//! Recurring purchases and the immutable plan catalog they reference.
//! Plans are loaded from `config/plans.toml`.

use crate::error::PaymentError;
use crate::money::{Currency, MinorUnits, Money};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Gateway subscription created, awaiting first payment
    #[default]
    Pending,
    /// Paid and within its period
    Active,
    /// Period elapsed
    Expired,
    /// Cancelled (or abandoned while pending)
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and active subscriptions count against the one-per-user limit
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Pending | SubscriptionStatus::Active)
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Cancelled) | (Active, Expired) | (Active, Cancelled)
        )
    }
}

impl FromStr for SubscriptionStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(PaymentError::Validation(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's subscription to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub internal_id: Uuid,
    pub user_id: String,
    pub plan_id: String,
    pub gateway_subscription_id: String,
    pub gateway_plan_id: String,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active but past its end date
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date <= now
    }
}

/// Input for `PaymentLedger::create_pending_subscription`
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: String,
    pub plan_id: String,
    pub gateway_subscription_id: String,
    pub gateway_plan_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl NewSubscription {
    pub fn into_pending(self) -> Subscription {
        let now = Utc::now();
        Subscription {
            internal_id: Uuid::new_v4(),
            user_id: self.user_id,
            plan_id: self.plan_id,
            gateway_subscription_id: self.gateway_subscription_id,
            gateway_plan_id: self.gateway_plan_id,
            status: SubscriptionStatus::Pending,
            start_date: self.start_date,
            end_date: self.end_date,
            payment_id: None,
            signature: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Billing period understood by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Daily => "daily",
            BillingPeriod::Weekly => "weekly",
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }
}

/// A subscription plan in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Catalog identifier (e.g., "restaurant-pro")
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Price per billing cycle in minor units
    pub price: MinorUnits,

    #[serde(default)]
    pub currency: Currency,

    /// Length of one subscription term
    pub duration_days: u32,

    #[serde(default)]
    pub period: BillingPeriod,

    #[serde(default = "default_interval")]
    pub interval: u32,

    /// Order cap for this plan, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_orders: Option<u32>,

    #[serde(default)]
    pub features: serde_json::Map<String, serde_json::Value>,

    /// Pre-provisioned gateway plan id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_plan_id: Option<String>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_interval() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Plan {
    pub fn price(&self) -> Money {
        Money::new(self.price, self.currency)
    }

    /// Length of one paid term
    pub fn term(&self) -> Duration {
        Duration::days(i64::from(self.duration_days))
    }

    /// Term end for a subscription starting at `start`
    pub fn end_date_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.term()
    }
}

/// Plan catalog (loaded from config)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCatalog {
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self { plans: Vec::new() }
    }

    pub fn add(&mut self, plan: Plan) {
        self.plans.push(plan);
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.add(plan);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn active_plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.iter().filter(|p| p.active)
    }

    /// Load catalog from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[[plans]]
id = "starter"
name = "Starter"
description = "Single outlet"
price = 99900
currency = "INR"
durationDays = 30
maxOrders = 500
gatewayPlanId = "plan_starter_001"

[plans.features]
kitchenDisplay = true
outlets = 1

[[plans]]
id = "legacy"
name = "Legacy"
price = 49900
durationDays = 30
active = false
"#;

    #[test]
    fn test_catalog_from_toml() {
        let catalog = PlanCatalog::from_toml(CATALOG).unwrap();
        assert_eq!(catalog.plans.len(), 2);

        let starter = catalog.get("starter").unwrap();
        assert_eq!(starter.price.get(), 99900);
        assert_eq!(starter.currency, Currency::INR);
        assert_eq!(starter.period, BillingPeriod::Monthly);
        assert_eq!(starter.interval, 1);
        assert_eq!(starter.max_orders, Some(500));
        assert_eq!(starter.gateway_plan_id.as_deref(), Some("plan_starter_001"));
        assert_eq!(starter.features.get("outlets"), Some(&serde_json::json!(1)));

        assert_eq!(catalog.active_plans().count(), 1);
        assert!(catalog.get("legacy").unwrap().gateway_plan_id.is_none());
    }

    #[test]
    fn test_catalog_rejects_fractional_price() {
        let bad = r#"
[[plans]]
id = "odd"
name = "Odd"
price = 999.5
durationDays = 30
"#;
        assert!(PlanCatalog::from_toml(bad).is_err());
    }

    #[test]
    fn test_end_date_from_duration() {
        let catalog = PlanCatalog::from_toml(CATALOG).unwrap();
        let plan = catalog.get("starter").unwrap();
        let start = Utc::now();
        assert_eq!(plan.end_date_from(start) - start, Duration::days(30));
        assert_eq!(plan.term(), Duration::days(30));
    }

    #[test]
    fn test_subscription_transitions() {
        use SubscriptionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Expired.can_transition_to(Active));
        assert!(Pending.is_live() && Active.is_live());
        assert!(!Expired.is_live() && !Cancelled.is_live());
    }
}
