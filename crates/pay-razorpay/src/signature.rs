//! # Razorpay Signature Verification
//!
//! Checkout callbacks carry `HMAC-SHA256(key_secret, message)` as lowercase
//! hex, where the message is:
//!
//! | Callback     | Message                              |
//! |--------------|--------------------------------------|
//! | order        | `order_id + "|" + payment_id`        |
//! | subscription | `subscription_id + "|" + payment_id` |
//!
//! Webhooks carry `HMAC-SHA256(webhook_secret, raw_body)` in
//! `X-Razorpay-Signature`.

use crate::config::RazorpayConfig;
use hmac::{Hmac, Mac};
use pay_core::CallbackVerifier;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `message` under `secret`.
pub fn compute_hmac_sha256(secret: &[u8], message: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
        // HMAC accepts keys of any length
        Err(_) => String::new(),
    }
}

/// Constant-time check of a hex signature. Malformed hex is a mismatch.
pub fn verify_hmac_sha256(secret: &[u8], message: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

pub fn order_payment_message(order_id: &str, payment_id: &str) -> String {
    format!("{}|{}", order_id, payment_id)
}

pub fn subscription_payment_message(subscription_id: &str, payment_id: &str) -> String {
    format!("{}|{}", subscription_id, payment_id)
}

/// Stateless verifier over the key secret and optional webhook secret
pub struct SignatureVerifier {
    key_secret: Secret<String>,
    webhook_secret: Option<Secret<String>>,
}

impl SignatureVerifier {
    pub fn new(key_secret: impl Into<String>) -> Self {
        Self {
            key_secret: Secret::new(key_secret.into()),
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(Secret::new(secret.into()));
        self
    }

    pub fn from_config(config: &RazorpayConfig) -> Self {
        let verifier = Self::new(config.key_secret().expose_secret().clone());
        match config.webhook_secret() {
            Some(secret) => verifier.with_webhook_secret(secret.expose_secret().clone()),
            None => verifier,
        }
    }

    /// Signature Razorpay would attach to an order checkout callback
    pub fn sign_order_payment(&self, order_id: &str, payment_id: &str) -> String {
        compute_hmac_sha256(
            self.key_secret.expose_secret().as_bytes(),
            order_payment_message(order_id, payment_id).as_bytes(),
        )
    }

    /// Signature Razorpay would attach to a subscription checkout callback
    pub fn sign_subscription_payment(&self, subscription_id: &str, payment_id: &str) -> String {
        compute_hmac_sha256(
            self.key_secret.expose_secret().as_bytes(),
            subscription_payment_message(subscription_id, payment_id).as_bytes(),
        )
    }

    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.is_some()
    }
}

impl CallbackVerifier for SignatureVerifier {
    fn verify_order_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_hmac_sha256(
            self.key_secret.expose_secret().as_bytes(),
            order_payment_message(order_id, payment_id).as_bytes(),
            signature,
        )
    }

    fn verify_subscription_payment(
        &self,
        subscription_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> bool {
        verify_hmac_sha256(
            self.key_secret.expose_secret().as_bytes(),
            subscription_payment_message(subscription_id, payment_id).as_bytes(),
            signature,
        )
    }

    fn verify_webhook(&self, body: &[u8], signature: &str) -> bool {
        match &self.webhook_secret {
            Some(secret) => verify_hmac_sha256(secret.expose_secret().as_bytes(), body, signature),
            None => false,
        }
    }
}
