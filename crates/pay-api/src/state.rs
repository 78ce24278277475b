//! # Application State
//!
//! Shared state for the Axum application.
//! Wires the Razorpay gateway, signature verifier, ledger and plan catalog
//! into one `ReconciliationService`.

use anyhow::Context;
use chrono::Duration;
use pay_core::{
    BoxedCallbackVerifier, BoxedPaymentLedger, InMemoryLedger, PlanCatalog, ReconciliationService,
};
use pay_postgres::PostgresLedger;
use pay_razorpay::{RazorpayClient, RazorpayConfig, SignatureVerifier};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_PENDING_TTL_MINUTES: i64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Environment (development, staging, production)
    pub environment: String,
    /// Explicit plan catalog path; searched for when unset
    pub plans_path: Option<String>,
    /// Minutes a pending subscription blocks a new one
    pub pending_ttl_minutes: i64,
}

impl AppConfig {
    /// Load from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let pending_ttl_minutes = match std::env::var("SUBSCRIPTION_PENDING_TTL_MINUTES") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("SUBSCRIPTION_PENDING_TTL_MINUTES is not a number: {}", raw))?,
            Err(_) => DEFAULT_PENDING_TTL_MINUTES,
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            plans_path: std::env::var("PLANS_PATH").ok().filter(|p| !p.is_empty()),
            pending_ttl_minutes,
        })
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid socket address {}:{}", self.host, self.port))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::minutes(self.pending_ttl_minutes)
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Order and subscription state machine
    pub service: Arc<ReconciliationService>,
    /// Webhook signature verification
    pub verifier: BoxedCallbackVerifier,
    /// Application config
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        service: Arc<ReconciliationService>,
        verifier: BoxedCallbackVerifier,
        config: AppConfig,
    ) -> Self {
        Self {
            service,
            verifier,
            config,
        }
    }

    /// Build the full stack from environment variables.
    ///
    /// Uses PostgreSQL when `DATABASE_URL` is set, the in-memory ledger otherwise.
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        let plans = load_plan_catalog(config.plans_path.as_deref())?;

        let razorpay = RazorpayConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to initialize Razorpay: {}", e))?;
        if razorpay.is_test_mode() {
            info!("Razorpay running with test keys");
        }

        let signature_verifier = SignatureVerifier::from_config(&razorpay);
        if !signature_verifier.has_webhook_secret() {
            warn!("RZP_WEBHOOK_SECRET not set; webhooks will be rejected");
        }
        let verifier: BoxedCallbackVerifier = Arc::new(signature_verifier);
        let gateway = Arc::new(RazorpayClient::new(razorpay)?);

        let ledger = build_ledger(&config).await?;

        let service = Arc::new(ReconciliationService::new(
            gateway,
            verifier.clone(),
            ledger,
            plans,
        ));

        Ok(Self::new(service, verifier, config))
    }
}

async fn build_ledger(config: &AppConfig) -> anyhow::Result<BoxedPaymentLedger> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let ledger = PostgresLedger::connect(&url, DEFAULT_DB_MAX_CONNECTIONS)
                .await?
                .with_pending_ttl(config.pending_ttl());
            ledger.migrate().await?;
            info!("Using PostgreSQL ledger");
            Ok(Arc::new(ledger))
        }
        _ => {
            if config.is_production() {
                warn!("DATABASE_URL not set in production; ledger state is lost on restart");
            } else {
                info!("Using in-memory ledger");
            }
            Ok(Arc::new(
                InMemoryLedger::new().with_pending_ttl(config.pending_ttl()),
            ))
        }
    }
}

/// Load plan catalog from config file
pub fn load_plan_catalog(explicit_path: Option<&str>) -> anyhow::Result<PlanCatalog> {
    if let Some(path) = explicit_path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan catalog {}", path))?;
        let catalog = PlanCatalog::from_toml(&content)
            .with_context(|| format!("Failed to parse {}", path))?;
        info!("Loaded {} plans from {}", catalog.plans.len(), path);
        return Ok(catalog);
    }

    let config_paths = [
        "config/plans.toml",
        "../config/plans.toml",
        "../../config/plans.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            let catalog = PlanCatalog::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", path))?;
            info!("Loaded {} plans from {}", catalog.plans.len(), path);
            return Ok(catalog);
        }
    }

    warn!("No plan catalog found, using empty catalog");
    Ok(PlanCatalog::new())
}
