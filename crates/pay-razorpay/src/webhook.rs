//! # Razorpay Webhook Handling
//!
//! Verifies `X-Razorpay-Signature` over the raw body and maps Razorpay
//! events onto provider-neutral [`GatewayEvent`]s.

use crate::client::deserialize_notes;
use chrono::Utc;
use pay_core::{
    CallbackVerifier, GatewayEvent, GatewayEventKind, Notes, PaymentError, PaymentResult,
    USER_ID_NOTE,
};
use serde::Deserialize;
use std::io::{self, Write};
use tracing::{debug, warn};

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";
pub const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

/// Verify the signature, then parse. Nothing is parsed from an unverified body.
pub fn verify_and_parse(
    verifier: &dyn CallbackVerifier,
    body: &[u8],
    signature: &str,
    event_id: Option<String>,
) -> PaymentResult<GatewayEvent> {
    if signature.is_empty() {
        return Err(PaymentError::WebhookVerificationFailed(
            "Missing signature header".to_string(),
        ));
    }
    if !verifier.verify_webhook(body, signature) {
        warn!(event_id = ?event_id, "webhook signature mismatch");
        return Err(PaymentError::WebhookVerificationFailed(
            "Signature mismatch".to_string(),
        ));
    }
    parse_event(body, signature, event_id)
}

/// Map a verified webhook body onto a [`GatewayEvent`].
pub fn parse_event(
    body: &[u8],
    signature: &str,
    event_id: Option<String>,
) -> PaymentResult<GatewayEvent> {
    let envelope: WebhookEnvelope = serde_json::from_slice(body)
        .map_err(|e| PaymentError::WebhookParse(format!("Failed to parse webhook: {}", e)))?;

    debug!(event = %envelope.event, "Verified Razorpay webhook");

    let payload = envelope.payload;
    let payment = payload.payment.map(|p| p.entity);
    let subscription = payload.subscription.map(|s| s.entity);

    let kind = match envelope.event.as_str() {
        "payment.captured" | "order.paid" => {
            let payment = payment.ok_or_else(|| missing("payment"))?;
            let order_id = payment
                .order_id
                .or_else(|| payload.order.map(|o| o.entity.id));
            match order_id {
                Some(gateway_order_id) => GatewayEventKind::OrderPaid {
                    gateway_order_id,
                    gateway_payment_id: payment.id,
                },
                // Captures without an order (e.g. subscription charges) are
                // settled through the subscription events.
                None => GatewayEventKind::Unknown {
                    event: envelope.event,
                },
            }
        }
        "payment.failed" => {
            let payment = payment.ok_or_else(|| missing("payment"))?;
            GatewayEventKind::PaymentFailed {
                gateway_order_id: payment.order_id,
                gateway_payment_id: payment.id,
                reason: payment.error_description,
            }
        }
        "subscription.activated" => {
            let subscription = subscription.ok_or_else(|| missing("subscription"))?;
            GatewayEventKind::SubscriptionActivated {
                user_id: subscription.notes.get(USER_ID_NOTE).cloned(),
                gateway_subscription_id: subscription.id,
                gateway_payment_id: payment.map(|p| p.id),
            }
        }
        // Sent for every billing cycle, the first one included
        "subscription.charged" => {
            let subscription = subscription.ok_or_else(|| missing("subscription"))?;
            let payment = payment.ok_or_else(|| missing("payment"))?;
            GatewayEventKind::SubscriptionCharged {
                user_id: subscription.notes.get(USER_ID_NOTE).cloned(),
                gateway_subscription_id: subscription.id,
                gateway_payment_id: payment.id,
            }
        }
        "subscription.cancelled" => GatewayEventKind::SubscriptionCancelled {
            gateway_subscription_id: subscription.ok_or_else(|| missing("subscription"))?.id,
        },
        "subscription.completed" => GatewayEventKind::SubscriptionCompleted {
            gateway_subscription_id: subscription.ok_or_else(|| missing("subscription"))?.id,
        },
        _ => GatewayEventKind::Unknown {
            event: envelope.event,
        },
    };

    Ok(GatewayEvent {
        event_id,
        provider: "razorpay".to_string(),
        kind,
        signature: signature.to_string(),
        received_at: Utc::now(),
    })
}

fn missing(entity: &str) -> PaymentError {
    PaymentError::WebhookParse(format!("Missing {} entity in payload", entity))
}

/// Events that should be enabled in the Razorpay Dashboard
pub const REQUIRED_WEBHOOK_EVENTS: &[&str] = &[
    "payment.captured",
    "payment.failed",
    "order.paid",
    "subscription.activated",
    "subscription.charged",
    "subscription.cancelled",
    "subscription.completed",
];

/// Write instructions for setting up webhooks.
///
/// Takes the writer explicitly so callers that print a catalog on stdout can
/// send this to stderr.
pub fn write_webhook_setup_instructions<W: Write>(out: &mut W, endpoint_url: &str) -> io::Result<()> {
    writeln!(out, "=== Razorpay Webhook Setup ===\n")?;
    writeln!(out, "1. Go to: https://dashboard.razorpay.com/app/webhooks\n")?;
    writeln!(out, "2. Click 'Add New Webhook'\n")?;
    writeln!(out, "3. Enter webhook URL: {}\n", endpoint_url)?;
    writeln!(out, "4. Select these events:")?;
    for event in REQUIRED_WEBHOOK_EVENTS {
        writeln!(out, "   - {}", event)?;
    }
    writeln!(out, "\n5. Set a secret and copy it to RZP_WEBHOOK_SECRET in your .env file")
}

// =============================================================================
// Razorpay Webhook Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    payment: Option<Wrapped<PaymentEntity>>,
    #[serde(default)]
    order: Option<Wrapped<OrderEntity>>,
    #[serde(default)]
    subscription: Option<Wrapped<SubscriptionEntity>>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEntity {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEntity {
    id: String,
    #[serde(default, deserialize_with = "deserialize_notes")]
    notes: Notes,
}
