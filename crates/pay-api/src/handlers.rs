//! # Request Handlers
//!
//! Axum request handlers for the payment API.
//! All request and response bodies use camelCase field names.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use pay_core::{
    ConfirmCashPayment, ConfirmOrderPayment, ConfirmSubscriptionPayment, Currency, EventOutcome,
    GatewayOrder, GatewaySubscription, InitiateOrderPayment, InitiateSubscription, MinorUnits,
    Notes, Order, OrderStatus, OrphanedOrder, PaymentError, Plan, Settlement, Subscription,
};
use pay_razorpay::{verify_and_parse, EVENT_ID_HEADER, SIGNATURE_HEADER};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Merchant order intake
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOrderRequest {
    pub internal_order_id: String,
    pub amount: MinorUnits,
    #[serde(default)]
    pub currency: Option<Currency>,
}

/// Create a gateway order for a registered merchant order
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderPaymentRequest {
    pub amount: MinorUnits,
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(default)]
    pub receipt: Option<String>,
    pub internal_order_id: String,
    #[serde(default)]
    pub notes: Notes,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderPaymentResponse {
    /// Public key the checkout widget is opened with
    pub gateway_key_id: String,
    pub gateway_order: GatewayOrder,
}

/// Checkout callback for an order
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOrderPaymentRequest {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
    pub internal_order_id: String,
    #[serde(default)]
    pub amount: Option<MinorUnits>,
}

/// Cash collected at the counter
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashPaymentRequest {
    pub internal_order_id: String,
    pub staff_id: String,
    pub amount: MinorUnits,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashPaymentResponse {
    pub success: bool,
    pub settlement: Settlement,
    pub order: Order,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOrderRequest {
    pub internal_order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub user_id: String,
    pub plan_id: String,
    #[serde(default = "default_notify_customer")]
    pub notify_customer: bool,
    #[serde(default = "default_total_cycles")]
    pub total_cycles: u32,
    #[serde(default)]
    pub notes: Notes,
}

fn default_notify_customer() -> bool {
    true
}

fn default_total_cycles() -> u32 {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionResponse {
    pub gateway_key_id: String,
    pub gateway_subscription: GatewaySubscription,
    pub local_subscription: Subscription,
}

/// Checkout callback for a subscription
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySubscriptionRequest {
    pub gateway_subscription_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusResponse {
    pub subscription: Option<Subscription>,
    pub plan: Option<Plan>,
    pub has_active: bool,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    /// RFC 3339 lower bound; defaults to 24 hours ago
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub orphans: Vec<OrphanedOrder>,
    pub count: usize,
    pub expired_subscriptions: u64,
}

/// Single-endpoint form of the payment operations, selected by `action`
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PaymentAction {
    CreateOrder(CreateOrderPaymentRequest),
    VerifyPayment(VerifyOrderPaymentRequest),
    CreateSubscription(CreateSubscriptionRequest),
    VerifySubscriptionPayment(VerifySubscriptionRequest),
    GetSubscriptionStatus(SubscriptionStatusQuery),
}

impl PaymentAction {
    pub const NAMES: &'static [&'static str] = &[
        "create_order",
        "verify_payment",
        "create_subscription",
        "verify_subscription_payment",
        "get_subscription_status",
    ];
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn payment_error_to_response(err: PaymentError) -> ApiError {
    let code = err.status_code();
    if code >= 500 {
        error!(error = %err, "request failed");
    }
    let response = ErrorResponse::new(err.client_message(), code);
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(response),
    )
}

fn bad_request(message: impl Into<String>, details: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(message, 400).with_details(details)),
    )
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    bad_request("Invalid request body", rejection.body_text())
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    bad_request("Invalid query parameters", rejection.body_text())
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(payment_error_to_response(PaymentError::Validation(format!(
            "{} must not be empty",
            field
        ))));
    }
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tablepay",
        "provider": state.service.provider_name(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Active subscription plans
pub async fn list_plans(State(state): State<AppState>) -> impl IntoResponse {
    let plans: Vec<_> = state.service.plans().active_plans().collect();
    Json(serde_json::json!({
        "plans": plans,
        "count": plans.len()
    }))
}

/// Register a merchant order in `uninitiated` state
#[instrument(skip(state, payload))]
pub async fn register_order(
    State(state): State<AppState>,
    payload: Result<Json<RegisterOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;

    let order = state
        .service
        .register_order(
            &request.internal_order_id,
            request.amount,
            request.currency.unwrap_or_default(),
        )
        .await
        .map_err(payment_error_to_response)?;

    info!(internal_order_id = %order.internal_id, "order registered");
    Ok((StatusCode::CREATED, Json(order)))
}

#[instrument(skip(state, payload))]
pub async fn create_order_payment(
    State(state): State<AppState>,
    payload: Result<Json<CreateOrderPaymentRequest>, JsonRejection>,
) -> Result<Json<CreateOrderPaymentResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    do_create_order_payment(&state, request).await.map(Json)
}

async fn do_create_order_payment(
    state: &AppState,
    request: CreateOrderPaymentRequest,
) -> Result<CreateOrderPaymentResponse, ApiError> {
    require("internalOrderId", &request.internal_order_id)?;

    let initiation = state
        .service
        .initiate_order_payment(InitiateOrderPayment {
            internal_order_id: request.internal_order_id,
            amount: request.amount,
            currency: request.currency.unwrap_or_default(),
            receipt: request.receipt,
            notes: request.notes,
        })
        .await
        .map_err(payment_error_to_response)?;

    Ok(CreateOrderPaymentResponse {
        gateway_key_id: initiation.key_id,
        gateway_order: initiation.gateway_order,
    })
}

#[instrument(skip(state, payload))]
pub async fn verify_order_payment(
    State(state): State<AppState>,
    payload: Result<Json<VerifyOrderPaymentRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    do_verify_order_payment(&state, request).await.map(Json)
}

async fn do_verify_order_payment(
    state: &AppState,
    request: VerifyOrderPaymentRequest,
) -> Result<VerifyResponse, ApiError> {
    require("gatewayOrderId", &request.gateway_order_id)?;
    require("gatewayPaymentId", &request.gateway_payment_id)?;
    require("signature", &request.signature)?;
    require("internalOrderId", &request.internal_order_id)?;

    state
        .service
        .confirm_order_payment(ConfirmOrderPayment {
            gateway_order_id: request.gateway_order_id,
            gateway_payment_id: request.gateway_payment_id,
            signature: request.signature,
            internal_order_id: request.internal_order_id,
            amount: request.amount,
        })
        .await
        .map_err(payment_error_to_response)?;

    Ok(VerifyResponse { success: true })
}

/// Record a cash payment taken by staff
#[instrument(skip(state, payload))]
pub async fn record_cash_payment(
    State(state): State<AppState>,
    payload: Result<Json<CashPaymentRequest>, JsonRejection>,
) -> Result<Json<CashPaymentResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    require("internalOrderId", &request.internal_order_id)?;
    require("staffId", &request.staff_id)?;

    let settlement = state
        .service
        .confirm_cash_payment(ConfirmCashPayment {
            internal_order_id: request.internal_order_id.clone(),
            staff_id: request.staff_id,
            amount: request.amount,
            notes: request.notes,
        })
        .await
        .map_err(payment_error_to_response)?;

    let order = state
        .service
        .get_order(&request.internal_order_id)
        .await
        .map_err(payment_error_to_response)?;

    Ok(Json(CashPaymentResponse {
        success: true,
        settlement,
        order,
    }))
}

/// Close an order as `failed` or `cancelled`
#[instrument(skip(state, payload))]
pub async fn close_order(
    State(state): State<AppState>,
    payload: Result<Json<CloseOrderRequest>, JsonRejection>,
) -> Result<Json<Order>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    require("internalOrderId", &request.internal_order_id)?;

    let order = state
        .service
        .close_order(&request.internal_order_id, request.status)
        .await
        .map_err(payment_error_to_response)?;

    Ok(Json(order))
}

#[instrument(skip(state, payload))]
pub async fn create_subscription(
    State(state): State<AppState>,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> Result<Json<CreateSubscriptionResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    do_create_subscription(&state, request).await.map(Json)
}

async fn do_create_subscription(
    state: &AppState,
    request: CreateSubscriptionRequest,
) -> Result<CreateSubscriptionResponse, ApiError> {
    require("userId", &request.user_id)?;
    require("planId", &request.plan_id)?;

    let initiation = state
        .service
        .initiate_subscription(InitiateSubscription {
            user_id: request.user_id,
            plan_id: request.plan_id,
            notify_customer: request.notify_customer,
            total_cycles: request.total_cycles,
            notes: request.notes,
        })
        .await
        .map_err(payment_error_to_response)?;

    Ok(CreateSubscriptionResponse {
        gateway_key_id: initiation.key_id,
        gateway_subscription: initiation.gateway_subscription,
        local_subscription: initiation.subscription,
    })
}

#[instrument(skip(state, payload))]
pub async fn verify_subscription(
    State(state): State<AppState>,
    payload: Result<Json<VerifySubscriptionRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(request) = payload.map_err(json_rejection)?;
    do_verify_subscription(&state, request).await.map(Json)
}

async fn do_verify_subscription(
    state: &AppState,
    request: VerifySubscriptionRequest,
) -> Result<VerifyResponse, ApiError> {
    require("gatewaySubscriptionId", &request.gateway_subscription_id)?;
    require("gatewayPaymentId", &request.gateway_payment_id)?;
    require("signature", &request.signature)?;
    require("userId", &request.user_id)?;

    state
        .service
        .confirm_subscription_payment(ConfirmSubscriptionPayment {
            gateway_subscription_id: request.gateway_subscription_id,
            gateway_payment_id: request.gateway_payment_id,
            signature: request.signature,
            user_id: request.user_id,
        })
        .await
        .map_err(payment_error_to_response)?;

    Ok(VerifyResponse { success: true })
}

pub async fn subscription_status(
    State(state): State<AppState>,
    query: Result<Query<SubscriptionStatusQuery>, QueryRejection>,
) -> Result<Json<SubscriptionStatusResponse>, ApiError> {
    let Query(query) = query.map_err(query_rejection)?;
    do_subscription_status(&state, query).await.map(Json)
}

async fn do_subscription_status(
    state: &AppState,
    query: SubscriptionStatusQuery,
) -> Result<SubscriptionStatusResponse, ApiError> {
    require("userId", &query.user_id)?;

    let view = state
        .service
        .subscription_status(&query.user_id)
        .await
        .map_err(payment_error_to_response)?;

    Ok(SubscriptionStatusResponse {
        subscription: view.subscription,
        plan: view.plan,
        has_active: view.has_active,
    })
}

/// `POST /payments` with an `action` discriminator
#[instrument(skip(state, payload))]
pub async fn dispatch_payment_action(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload.map_err(json_rejection)?;

    let action = body
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or_else(|| bad_request("Missing action", "Body must carry a string 'action' field"))?;

    if !PaymentAction::NAMES.contains(&action) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("Unknown action: {}", action), 404)),
        ));
    }

    let action: PaymentAction = serde_json::from_value(body)
        .map_err(|e| bad_request("Invalid request body", e.to_string()))?;

    let response = match action {
        PaymentAction::CreateOrder(request) => {
            to_json(do_create_order_payment(&state, request).await?)
        }
        PaymentAction::VerifyPayment(request) => {
            to_json(do_verify_order_payment(&state, request).await?)
        }
        PaymentAction::CreateSubscription(request) => {
            to_json(do_create_subscription(&state, request).await?)
        }
        PaymentAction::VerifySubscriptionPayment(request) => {
            to_json(do_verify_subscription(&state, request).await?)
        }
        PaymentAction::GetSubscriptionStatus(query) => {
            to_json(do_subscription_status(&state, query).await?)
        }
    }?;

    Ok(Json(response))
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| {
        payment_error_to_response(PaymentError::Serialization(e.to_string()))
    })
}

/// Orphan detection and subscription expiry
#[instrument(skip(state, query))]
pub async fn reconcile(
    State(state): State<AppState>,
    query: Result<Query<ReconcileQuery>, QueryRejection>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let Query(query) = query.map_err(query_rejection)?;
    let since = query
        .since
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));

    let report = state
        .service
        .sweep(since)
        .await
        .map_err(payment_error_to_response)?;

    Ok(Json(ReconcileResponse {
        count: report.orphans.len(),
        orphans: report.orphans,
        expired_subscriptions: report.expired_subscriptions,
    }))
}

/// Handle Razorpay webhook
#[instrument(skip(state, headers, body))]
pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let event_id = headers
        .get(EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let event = verify_and_parse(state.verifier.as_ref(), &body, signature, event_id)
        .map_err(|e| {
            warn!("Webhook rejected: {}", e);
            payment_error_to_response(e)
        })?;

    info!(event_id = ?event.event_id, kind = ?event.kind, "Received webhook");

    match state.service.apply_gateway_event(event).await {
        Ok(outcome) => Ok(Json(serde_json::json!({
            "received": true,
            "outcome": outcome_label(outcome)
        }))),
        // Redelivery cannot fix these; acknowledge so the provider stops retrying.
        Err(
            e @ (PaymentError::NotFound { .. }
            | PaymentError::Conflict(_)
            | PaymentError::InvalidState { .. }
            | PaymentError::Validation(_)),
        ) => {
            warn!(error = %e, "Webhook event not applied");
            Ok(Json(serde_json::json!({
                "received": true,
                "outcome": "rejected"
            })))
        }
        Err(e) => Err(payment_error_to_response(e)),
    }
}

fn outcome_label(outcome: EventOutcome) -> &'static str {
    match outcome {
        EventOutcome::Settled(Settlement::Applied) => "applied",
        EventOutcome::Settled(Settlement::Replayed) => "replayed",
        EventOutcome::Closed => "closed",
        EventOutcome::Ignored => "ignored",
    }
}

/// Fallback for unknown routes
pub async fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("Not found", 404)),
    )
}
