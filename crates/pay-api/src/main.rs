//! # tablepay
//!
//! Razorpay payment service for restaurant orders and SaaS subscriptions.
//!
//! ## Usage
//!
//! ```bash
//! # Set environment variables
//! export RZP_KEY_ID=rzp_test_...
//! export RZP_KEY_SECRET=...
//! export RZP_WEBHOOK_SECRET=...
//! export DATABASE_URL=postgres://localhost/tablepay   # optional
//!
//! # Run the server
//! tablepay
//! ```

use pay_api::{routes, state::AppState};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    print_banner();

    let state = AppState::from_env().await?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    info!(
        "Plans loaded: {} ({} active)",
        state.service.plans().plans.len(),
        state.service.plans().active_plans().count()
    );
    info!("Payment provider: {}", state.service.provider_name());

    let app = routes::create_router(state);

    info!("tablepay starting on http://{}", addr);

    if !is_prod {
        info!("Health: http://{}/health", addr);
        info!("Orders: POST http://{}/payments/orders", addr);
        info!("Subscriptions: POST http://{}/subscriptions", addr);
        info!("Webhook: POST http://{}/webhook/razorpay", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  tablepay
  ━━━━━━━━━━━━━━━━━━━━━━━
  Razorpay orders and subscriptions
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
