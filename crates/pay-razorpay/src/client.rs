//! # Razorpay REST Client
//!
//! Implementation of [`PaymentGateway`] over the Razorpay Orders,
//! Subscriptions and Plans APIs. The client never touches local state.

use crate::config::RazorpayConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pay_core::{
    CreateOrderRequest, CreatePlanRequest, CreateSubscriptionRequest, GatewayOrder, GatewayPlan,
    GatewaySubscription, Notes, PaymentError, PaymentGateway, PaymentResult,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info, instrument};

const PROVIDER: &str = "razorpay";

/// Page size for `GET /v1/orders` (Razorpay maximum)
const LIST_PAGE_SIZE: usize = 100;

/// Razorpay gateway client
///
/// Constructed once at startup and shared; there is no global instance.
pub struct RazorpayClient {
    config: RazorpayConfig,
    client: Client,
}

impl RazorpayClient {
    /// Create a new client; every request inherits the configured timeout.
    pub fn new(config: RazorpayConfig) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> PaymentResult<Self> {
        Self::new(RazorpayConfig::from_env()?)
    }

    pub fn config(&self) -> &RazorpayConfig {
        &self.config
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> PaymentResult<T> {
        let response = request
            .basic_auth(&self.config.key_id, Some(self.config.expose_key_secret()))
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(operation, e))?;

        if !status.is_success() {
            let description = serde_json::from_str::<RazorpayErrorResponse>(&body)
                .map(|r| r.error.description)
                .unwrap_or_default();
            error!(
                operation,
                status = status.as_u16(),
                description = %description,
                "Razorpay API error"
            );
            return Err(PaymentError::Gateway {
                provider: PROVIDER.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            PaymentError::Serialization(format!(
                "Failed to parse Razorpay {} response: {}",
                operation, e
            ))
        })
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> PaymentError {
    if err.is_timeout() {
        error!(operation, "Razorpay request timed out; outcome unknown");
        PaymentError::GatewayTimeout(format!("{} timed out", operation))
    } else {
        error!(operation, error = %err, "Razorpay request failed");
        PaymentError::Network(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self, request), fields(receipt = %request.receipt, amount = request.amount.get()))]
    async fn create_order(&self, request: &CreateOrderRequest) -> PaymentResult<GatewayOrder> {
        let body = OrderBody {
            amount: request.amount.get(),
            currency: request.currency.as_str(),
            receipt: &request.receipt,
            payment_capture: 1,
            notes: &request.notes,
        };

        let order: RazorpayOrder = self
            .send(
                self.client.post(self.config.endpoint("/v1/orders")).json(&body),
                "create_order",
            )
            .await?;

        info!(gateway_order_id = %order.id, "Created Razorpay order");
        Ok(order.into())
    }

    #[instrument(skip(self, request), fields(gateway_plan_id = %request.gateway_plan_id))]
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<GatewaySubscription> {
        let body = SubscriptionBody {
            plan_id: &request.gateway_plan_id,
            total_count: request.total_cycles,
            customer_notify: u8::from(request.notify_customer),
            notes: &request.notes,
        };

        let subscription: RazorpaySubscription = self
            .send(
                self.client
                    .post(self.config.endpoint("/v1/subscriptions"))
                    .json(&body),
                "create_subscription",
            )
            .await?;

        info!(gateway_subscription_id = %subscription.id, "Created Razorpay subscription");
        Ok(subscription.into())
    }

    #[instrument(skip(self, request), fields(plan = %request.item.name))]
    async fn create_plan(&self, request: &CreatePlanRequest) -> PaymentResult<GatewayPlan> {
        let body = PlanBody {
            period: request.period.as_str(),
            interval: request.interval,
            item: PlanItemBody {
                name: &request.item.name,
                amount: request.item.amount.get(),
                currency: request.item.currency.as_str(),
                description: request.item.description.as_deref(),
            },
            notes: &request.notes,
        };

        let plan: RazorpayPlan = self
            .send(
                self.client.post(self.config.endpoint("/v1/plans")).json(&body),
                "create_plan",
            )
            .await?;

        info!(gateway_plan_id = %plan.id, "Created Razorpay plan");
        Ok(GatewayPlan {
            id: plan.id,
            period: plan.period,
            interval: plan.interval,
        })
    }

    #[instrument(skip(self))]
    async fn list_orders(&self, since: DateTime<Utc>) -> PaymentResult<Vec<GatewayOrder>> {
        let mut orders = Vec::new();
        let mut skip = 0usize;

        loop {
            let query = [
                ("from", since.timestamp().to_string()),
                ("count", LIST_PAGE_SIZE.to_string()),
                ("skip", skip.to_string()),
            ];
            let page: RazorpayCollection<RazorpayOrder> = self
                .send(
                    self.client
                        .get(self.config.endpoint("/v1/orders"))
                        .query(&query),
                    "list_orders",
                )
                .await?;

            let fetched = page.items.len();
            orders.extend(page.items.into_iter().map(GatewayOrder::from));
            if fetched < LIST_PAGE_SIZE {
                break;
            }
            skip += fetched;
        }

        debug!(count = orders.len(), "Listed Razorpay orders");
        Ok(orders)
    }

    fn key_id(&self) -> &str {
        &self.config.key_id
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

// =============================================================================
// Razorpay API Types
// =============================================================================

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    /// Auto-capture on authorization
    payment_capture: u8,
    notes: &'a Notes,
}

#[derive(Debug, Serialize)]
struct SubscriptionBody<'a> {
    plan_id: &'a str,
    total_count: u32,
    customer_notify: u8,
    notes: &'a Notes,
}

#[derive(Debug, Serialize)]
struct PlanBody<'a> {
    period: &'a str,
    interval: u32,
    item: PlanItemBody<'a>,
    notes: &'a Notes,
}

#[derive(Debug, Serialize)]
struct PlanItemBody<'a> {
    name: &'a str,
    amount: u64,
    currency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: u64,
    currency: String,
    #[serde(default)]
    receipt: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "deserialize_notes")]
    notes: Notes,
    #[serde(default)]
    created_at: Option<i64>,
}

impl From<RazorpayOrder> for GatewayOrder {
    fn from(order: RazorpayOrder) -> Self {
        GatewayOrder {
            id: order.id,
            amount: order.amount,
            currency: order.currency,
            receipt: order.receipt,
            status: order.status,
            notes: order.notes,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RazorpaySubscription {
    id: String,
    plan_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    total_count: Option<u32>,
    #[serde(default)]
    short_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_notes")]
    notes: Notes,
}

impl From<RazorpaySubscription> for GatewaySubscription {
    fn from(sub: RazorpaySubscription) -> Self {
        GatewaySubscription {
            id: sub.id,
            plan_id: sub.plan_id,
            status: sub.status,
            total_count: sub.total_count,
            short_url: sub.short_url,
            notes: sub.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RazorpayPlan {
    id: String,
    period: String,
    interval: u32,
}

#[derive(Debug, Deserialize)]
struct RazorpayCollection<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorResponse {
    error: RazorpayError,
}

#[derive(Debug, Deserialize)]
struct RazorpayError {
    #[serde(default)]
    description: String,
}

/// Razorpay sends `"notes": []` when no notes were set, and note values
/// may be numbers.
pub(crate) fn deserialize_notes<'de, D>(deserializer: D) -> Result<Notes, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawNotes {
        Map(serde_json::Map<String, serde_json::Value>),
        List(Vec<serde_json::Value>),
        Null(()),
    }

    Ok(match RawNotes::deserialize(deserializer)? {
        RawNotes::Map(map) => map
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect(),
        RawNotes::List(_) | RawNotes::Null(_) => Notes::new(),
    })
}
