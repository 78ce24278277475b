//! # pay-razorpay
//!
//! Razorpay gateway for tablepay.
//!
//! This crate provides:
//!
//! 1. **RazorpayClient** - `PaymentGateway` over the Orders, Subscriptions
//!    and Plans REST APIs (HTTP Basic auth, per-request timeout)
//! 2. **SignatureVerifier** - `CallbackVerifier` for checkout callbacks and
//!    webhooks (HMAC-SHA256, constant-time comparison)
//! 3. **webhook** - maps verified Razorpay webhook bodies to `GatewayEvent`s
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pay_razorpay::{RazorpayClient, RazorpayConfig, SignatureVerifier};
//!
//! let config = RazorpayConfig::from_env()?;
//! let verifier = SignatureVerifier::from_config(&config);
//! let client = RazorpayClient::new(config)?;
//!
//! let order = client.create_order(&request).await?;
//! // Hand order.id and client.key_id() to the checkout widget, then later:
//! let ok = verifier.verify_order_payment(&order.id, &payment_id, &signature);
//! ```

pub mod client;
pub mod config;
pub mod signature;
pub mod webhook;

// Re-exports
pub use client::RazorpayClient;
pub use config::RazorpayConfig;
pub use signature::SignatureVerifier;
pub use webhook::{
    parse_event, verify_and_parse, write_webhook_setup_instructions, EVENT_ID_HEADER,
    REQUIRED_WEBHOOK_EVENTS, SIGNATURE_HEADER,
};
