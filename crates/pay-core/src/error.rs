//! # Payment Error Types
//!
//! Typed error handling for the tablepay payment core.
//! All payment operations return `Result<T, PaymentError>`.

use thiserror::Error;

/// Core error type for all payment operations
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Configuration errors (missing keys, unprovisioned plans)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing or malformed request data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced order, subscription or plan does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Record is not in a state that allows the requested operation
    #[error("Invalid state for {id}: {status}")]
    InvalidState { id: String, status: String },

    /// Invariant violation (duplicate live subscription, conflicting payment id)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Callback signature did not verify
    #[error("Signature verification failed")]
    SignatureMismatch,

    /// Payment provider rejected or failed the request
    #[error("Gateway error [{provider}] HTTP {status}: {body}")]
    Gateway {
        provider: String,
        status: u16,
        body: String,
    },

    /// Network/HTTP error communicating with the provider
    #[error("Network error: {0}")]
    Network(String),

    /// Provider call timed out; remote outcome is unknown
    #[error("Gateway timed out: {0}")]
    GatewayTimeout(String),

    /// Webhook signature verification failed
    #[error("Webhook verification failed: {0}")]
    WebhookVerificationFailed(String),

    /// Webhook payload parsing error
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Ledger storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        PaymentError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns true if the caller may retry the initiation step with backoff.
    /// Confirmation steps are never retried on these.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Network(_) | PaymentError::GatewayTimeout(_) => true,
            PaymentError::Gateway { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::Configuration(_) => 500,
            PaymentError::Validation(_) => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::InvalidState { .. } => 409,
            PaymentError::Conflict(_) => 409,
            PaymentError::SignatureMismatch => 400,
            PaymentError::Gateway { .. } => 502,
            PaymentError::Network(_) => 503,
            PaymentError::GatewayTimeout(_) => 504,
            PaymentError::WebhookVerificationFailed(_) => 401,
            PaymentError::WebhookParse(_) => 400,
            PaymentError::Storage(_) => 500,
            PaymentError::Serialization(_) => 500,
            PaymentError::Internal(_) => 500,
        }
    }

    /// Message that is safe to return to an API client.
    ///
    /// Server-side failures collapse to generic text so provider bodies,
    /// credentials and storage details never leave the process.
    pub fn client_message(&self) -> String {
        match self {
            PaymentError::Gateway { .. } | PaymentError::Network(_) => {
                "Payment gateway request failed".to_string()
            }
            PaymentError::GatewayTimeout(_) => {
                "Payment gateway did not respond; the request outcome is unknown".to_string()
            }
            PaymentError::WebhookVerificationFailed(_) => "Webhook verification failed".to_string(),
            PaymentError::Configuration(_)
            | PaymentError::Storage(_)
            | PaymentError::Serialization(_)
            | PaymentError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(PaymentError::Network("reset".into()).is_retryable());
        assert!(PaymentError::GatewayTimeout("15s".into()).is_retryable());
        assert!(PaymentError::Gateway {
            provider: "razorpay".into(),
            status: 503,
            body: String::new(),
        }
        .is_retryable());
        assert!(!PaymentError::Gateway {
            provider: "razorpay".into(),
            status: 400,
            body: String::new(),
        }
        .is_retryable());
        assert!(!PaymentError::SignatureMismatch.is_retryable());
        assert!(!PaymentError::Validation("bad data".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(PaymentError::Validation("x".into()).status_code(), 400);
        assert_eq!(PaymentError::SignatureMismatch.status_code(), 400);
        assert_eq!(PaymentError::not_found("order", "ORD1").status_code(), 404);
        assert_eq!(PaymentError::Conflict("dup".into()).status_code(), 409);
        assert_eq!(
            PaymentError::InvalidState {
                id: "ORD1".into(),
                status: "pending".into()
            }
            .status_code(),
            409
        );
        assert_eq!(PaymentError::GatewayTimeout("t".into()).status_code(), 504);
    }

    #[test]
    fn test_client_message_hides_provider_details() {
        let err = PaymentError::Gateway {
            provider: "razorpay".into(),
            status: 401,
            body: "{\"error\":{\"description\":\"Authentication failed for rzp_test_key\"}}".into(),
        };
        let message = err.client_message();
        assert!(!message.contains("rzp_test_key"));
        assert_eq!(message, "Payment gateway request failed");

        let err = PaymentError::Storage("connection refused to 10.0.0.3".into());
        assert_eq!(err.client_message(), "Internal server error");

        let err = PaymentError::not_found("order", "ORD123");
        assert_eq!(err.client_message(), "order not found: ORD123");
    }
}
