//! # provision-plans
//!
//! One-off setup: creates a Razorpay plan for every active catalog plan that
//! has no `gatewayPlanId` yet, then prints the updated catalog. Progress and
//! webhook setup instructions go to stderr.
//!
//! ```bash
//! provision-plans [webhook-url] > config/plans.toml.new
//! ```

use pay_api::state::load_plan_catalog;
use pay_core::{CreatePlanRequest, Notes, PaymentGateway, PlanItem};
use pay_razorpay::{write_webhook_setup_instructions, RazorpayClient};
use std::io::Write;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid TOML
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    dotenvy::dotenv().ok();

    let plans_path = std::env::var("PLANS_PATH").ok();
    let mut catalog = load_plan_catalog(plans_path.as_deref())?;
    let client = RazorpayClient::from_env()?;

    let mut created = 0;
    for plan in catalog.plans.iter_mut().filter(|p| p.active) {
        if plan.gateway_plan_id.is_some() {
            info!(plan_id = %plan.id, "already provisioned");
            continue;
        }

        let mut notes = Notes::new();
        notes.insert("catalog_plan_id".to_string(), plan.id.clone());

        let request = CreatePlanRequest {
            period: plan.period,
            interval: plan.interval,
            item: PlanItem {
                name: plan.name.clone(),
                amount: plan.price,
                currency: plan.currency,
                description: Some(plan.description.clone()).filter(|d| !d.is_empty()),
            },
            notes,
        };

        let gateway_plan = client.create_plan(&request).await?;
        info!(plan_id = %plan.id, gateway_plan_id = %gateway_plan.id, "plan created");
        plan.gateway_plan_id = Some(gateway_plan.id);
        created += 1;
    }

    eprintln!("Created {} gateway plan(s)\n", created);
    println!("{}", toml::to_string_pretty(&catalog)?);

    if let Some(url) = std::env::args().nth(1) {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr)?;
        write_webhook_setup_instructions(&mut stderr, &url)?;
    }

    Ok(())
}
