//! # Gateway Events
//!
//! Provider-neutral form of verified webhook deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a verified webhook tells us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GatewayEventKind {
    /// Payment captured against a gateway order
    OrderPaid {
        gateway_order_id: String,
        gateway_payment_id: String,
    },
    /// A payment attempt failed; the order may still be retried by the payer
    PaymentFailed {
        gateway_order_id: Option<String>,
        gateway_payment_id: String,
        reason: Option<String>,
    },
    /// First charge of a subscription went through
    SubscriptionActivated {
        gateway_subscription_id: String,
        gateway_payment_id: Option<String>,
        user_id: Option<String>,
    },
    /// A billing cycle was paid; renews an active subscription
    SubscriptionCharged {
        gateway_subscription_id: String,
        gateway_payment_id: String,
        user_id: Option<String>,
    },
    /// Subscription cancelled at the provider
    SubscriptionCancelled { gateway_subscription_id: String },
    /// All billing cycles consumed
    SubscriptionCompleted { gateway_subscription_id: String },
    /// Anything we do not act on
    Unknown { event: String },
}

/// A verified webhook event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Provider event id (for deduplication in logs)
    pub event_id: Option<String>,
    pub provider: String,
    pub kind: GatewayEventKind,
    /// Signature header the event arrived with. Authenticates the delivery
    /// only; it is never stored as a checkout signature.
    pub signature: String,
    pub received_at: DateTime<Utc>,
}
