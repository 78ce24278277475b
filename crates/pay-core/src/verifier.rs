//! # Callback Verification Port
//!
//! The only trust boundary between a client-reported "payment succeeded"
//! and a ledger write. Implementations must be pure.

use std::sync::Arc;

/// Verifies provider callback signatures.
///
/// Every method returns `false` on mismatch or malformed input; a mismatch
/// is an expected outcome, not an error.
pub trait CallbackVerifier: Send + Sync {
    /// Checks a checkout callback for a one-shot order.
    fn verify_order_payment(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> bool;

    /// Checks a checkout callback for a subscription.
    fn verify_subscription_payment(
        &self,
        gateway_subscription_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> bool;

    /// Checks a server-to-server webhook body. `false` when no webhook
    /// secret is configured.
    fn verify_webhook(&self, body: &[u8], signature: &str) -> bool;
}

pub type BoxedCallbackVerifier = Arc<dyn CallbackVerifier>;
