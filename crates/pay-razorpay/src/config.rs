//! # Razorpay Configuration
//!
//! Configuration management for the Razorpay integration.
//! All secrets are loaded from environment variables and held as
//! [`secrecy::Secret`] so they never reach a log line.

use pay_core::PaymentError;
use secrecy::{ExposeSecret, Secret};
use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.razorpay.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Razorpay API configuration
pub struct RazorpayConfig {
    /// Public key id (rzp_test_... or rzp_live_...), also handed to the checkout widget
    pub key_id: String,

    key_secret: Secret<String>,

    /// Webhook signing secret; webhooks are refused when unset
    webhook_secret: Option<Secret<String>>,

    /// API base URL (for testing/mocking)
    pub api_base_url: String,

    /// Per-request timeout
    pub timeout: Duration,
}

impl RazorpayConfig {
    /// Load configuration from environment variables.
    ///
    /// Required env vars:
    /// - `RZP_KEY_ID`
    /// - `RZP_KEY_SECRET`
    ///
    /// Optional: `RZP_WEBHOOK_SECRET`, `RZP_API_BASE_URL`, `RZP_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, PaymentError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load and validate configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PaymentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key_id = lookup("RZP_KEY_ID")
            .ok_or_else(|| PaymentError::Configuration("RZP_KEY_ID not set".to_string()))?;

        let key_secret = lookup("RZP_KEY_SECRET")
            .ok_or_else(|| PaymentError::Configuration("RZP_KEY_SECRET not set".to_string()))?;

        if !key_id.starts_with("rzp_test_") && !key_id.starts_with("rzp_live_") {
            return Err(PaymentError::Configuration(
                "RZP_KEY_ID must start with rzp_test_ or rzp_live_".to_string(),
            ));
        }

        if key_secret.trim().is_empty() {
            return Err(PaymentError::Configuration(
                "RZP_KEY_SECRET must not be empty".to_string(),
            ));
        }

        let timeout_secs = match lookup("RZP_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                PaymentError::Configuration(format!("RZP_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let mut config = Self::new(key_id, key_secret)
            .with_timeout(Duration::from_secs(timeout_secs));

        if let Some(secret) = lookup("RZP_WEBHOOK_SECRET").filter(|s| !s.is_empty()) {
            config = config.with_webhook_secret(secret);
        }
        if let Some(url) = lookup("RZP_API_BASE_URL") {
            config = config.with_api_base_url(url);
        }

        Ok(config)
    }

    /// Create config with explicit values (for testing)
    pub fn new(key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key_secret: Secret::new(key_secret.into()),
            webhook_secret: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Check if using test keys
    pub fn is_test_mode(&self) -> bool {
        self.key_id.starts_with("rzp_test_")
    }

    pub fn key_secret(&self) -> &Secret<String> {
        &self.key_secret
    }

    pub fn webhook_secret(&self) -> Option<&Secret<String>> {
        self.webhook_secret.as_ref()
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(Secret::new(secret.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    pub(crate) fn expose_key_secret(&self) -> &str {
        self.key_secret.expose_secret()
    }
}

impl fmt::Debug for RazorpayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RazorpayConfig")
            .field("key_id", &self.key_id)
            .field("key_secret", &"[REDACTED]")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("api_base_url", &self.api_base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}
