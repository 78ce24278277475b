//! # Routes
//!
//! Axum router configuration for the payment API.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - Orders:
///   - POST /orders - Register a merchant order
///   - POST /payments/orders - Create gateway order
///   - POST /payments/orders/verify - Verify checkout callback
///   - POST /payments/orders/close - Mark order failed/cancelled
///   - POST /payments/orders/cash - Record cash taken by staff
///   - GET  /payments/reconcile - Orphan sweep
///   - POST /payments - Action dispatch
///
/// - Subscriptions:
///   - GET  /plans - Active plans
///   - POST /subscriptions - Create subscription
///   - POST /subscriptions/verify - Verify subscription callback
///   - GET  /subscriptions/status?userId= - Active subscription for a user
///
/// - Webhooks:
///   - POST /webhook/razorpay - Razorpay webhook handler
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let order_routes = Router::new()
        .route("/orders", post(handlers::register_order))
        .route("/payments", post(handlers::dispatch_payment_action))
        .route("/payments/orders", post(handlers::create_order_payment))
        .route("/payments/orders/verify", post(handlers::verify_order_payment))
        .route("/payments/orders/close", post(handlers::close_order))
        .route("/payments/orders/cash", post(handlers::record_cash_payment))
        .route("/payments/reconcile", get(handlers::reconcile));

    let subscription_routes = Router::new()
        .route("/plans", get(handlers::list_plans))
        .route("/subscriptions", post(handlers::create_subscription))
        .route("/subscriptions/verify", post(handlers::verify_subscription))
        .route("/subscriptions/status", get(handlers::subscription_status));

    // Raw body, signature checked in the handler
    let webhook_routes = Router::new().route("/webhook/razorpay", post(handlers::razorpay_webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::health))
        .merge(order_routes)
        .merge(subscription_routes)
        .merge(webhook_routes)
        .fallback(handlers::not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Utc};
    use pay_core::{BoxedCallbackVerifier, InMemoryLedger, PlanCatalog, ReconciliationService};
    use pay_razorpay::signature::compute_hmac_sha256;
    use pay_razorpay::{RazorpayClient, RazorpayConfig, SignatureVerifier, SIGNATURE_HEADER};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY_SECRET: &str = "test_secret";
    const WEBHOOK_SECRET: &str = "whsec_test";

    const PLANS: &str = r#"
[[plans]]
id = "pro"
name = "Pro"
price = 99900
currency = "INR"
durationDays = 30
gatewayPlanId = "plan_pro"

[[plans]]
id = "legacy"
name = "Legacy"
price = 49900
durationDays = 30
active = false
"#;

    fn signer() -> SignatureVerifier {
        SignatureVerifier::new(KEY_SECRET).with_webhook_secret(WEBHOOK_SECRET)
    }

    fn test_app(server: &MockServer) -> Router {
        let config = RazorpayConfig::new("rzp_test_key", KEY_SECRET).with_api_base_url(server.uri());
        let gateway = Arc::new(RazorpayClient::new(config).unwrap());
        let verifier: BoxedCallbackVerifier = Arc::new(signer());
        let plans = PlanCatalog::from_toml(PLANS).unwrap();
        let service = Arc::new(ReconciliationService::new(
            gateway,
            verifier.clone(),
            Arc::new(InMemoryLedger::new()),
            plans,
        ));
        let config = AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            plans_path: None,
            pending_ttl_minutes: 30,
        };
        create_router(AppState::new(service, verifier, config))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    async fn get_uri(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn mount_order(server: &MockServer, id: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "amount": 25000,
                "currency": "INR",
                "receipt": "ORD123",
                "status": "created",
                "notes": {"internal_order_id": "ORD123"},
                "created_at": 1700000000
            })))
            .mount(server)
            .await;
    }

    /// Register ORD123 and mint `order_abc` for it
    async fn initiated_order(app: &Router, server: &MockServer) {
        mount_order(server, "order_abc").await;
        let (status, _) = post_json(
            app,
            "/orders",
            json!({"internalOrderId": "ORD123", "amount": 25000, "currency": "INR"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = post_json(
            app,
            "/payments/orders",
            json!({"internalOrderId": "ORD123", "amount": 25000}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["gatewayKeyId"], "rzp_test_key");
        assert_eq!(body["gatewayOrder"]["id"], "order_abc");
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        let (status, body) = get_uri(&test_app(&server), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["provider"], "razorpay");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let server = MockServer::start().await;
        let (status, body) = get_uri(&test_app(&server), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_list_plans_hides_inactive() {
        let server = MockServer::start().await;
        let (status, body) = get_uri(&test_app(&server), "/plans").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["plans"][0]["id"], "pro");
    }

    #[tokio::test]
    async fn test_order_payment_flow() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        let signature = signer().sign_order_payment("order_abc", "pay_xyz");
        let callback = json!({
            "gatewayOrderId": "order_abc",
            "gatewayPaymentId": "pay_xyz",
            "signature": signature,
            "internalOrderId": "ORD123"
        });

        let (status, body) = post_json(&app, "/payments/orders/verify", callback.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        // Duplicate delivery is a no-op
        let (status, body) = post_json(&app, "/payments/orders/verify", callback).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let other = json!({
            "gatewayOrderId": "order_abc",
            "gatewayPaymentId": "pay_other",
            "signature": signer().sign_order_payment("order_abc", "pay_other"),
            "internalOrderId": "ORD123"
        });
        let (status, _) = post_json(&app, "/payments/orders/verify", other).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_bad_signature_keeps_order_payable() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        let (status, body) = post_json(
            &app,
            "/payments/orders/verify",
            json!({
                "gatewayOrderId": "order_abc",
                "gatewayPaymentId": "pay_xyz",
                "signature": "00".repeat(32),
                "internalOrderId": "ORD123"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);

        let (status, _) = post_json(
            &app,
            "/payments/orders/verify",
            json!({
                "gatewayOrderId": "order_abc",
                "gatewayPaymentId": "pay_xyz",
                "signature": signer().sign_order_payment("order_abc", "pay_xyz"),
                "internalOrderId": "ORD123"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reinitiation_is_conflict() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        let (status, _) = post_json(
            &app,
            "/payments/orders",
            json!({"internalOrderId": "ORD123", "amount": 25000}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_amounts_are_rejected() {
        let server = MockServer::start().await;
        let app = test_app(&server);

        for amount in [json!(0), json!(-5), json!(1050.5), json!("25000")] {
            let (status, body) = post_json(
                &app,
                "/orders",
                json!({"internalOrderId": "ORD1", "amount": amount}),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "amount {}", amount);
            assert_eq!(body["code"], 400);
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        let request = Request::post("/payments/orders")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(&app, "/payments/orders/verify", json!({"gatewayOrderId": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_502_without_provider_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"code": "BAD_REQUEST_ERROR", "description": "Authentication failed"}
            })))
            .mount(&server)
            .await;
        let app = test_app(&server);

        post_json(&app, "/orders", json!({"internalOrderId": "ORD9", "amount": 100})).await;
        let (status, body) = post_json(
            &app,
            "/payments/orders",
            json!({"internalOrderId": "ORD9", "amount": 100}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body.to_string().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_close_order() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        post_json(&app, "/orders", json!({"internalOrderId": "ORD5", "amount": 100})).await;

        let (status, body) = post_json(
            &app,
            "/payments/orders/close",
            json!({"internalOrderId": "ORD5", "status": "cancelled"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, _) = post_json(
            &app,
            "/payments/orders/close",
            json!({"internalOrderId": "ORD5", "status": "paid"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cash_payment() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        post_json(&app, "/orders", json!({"internalOrderId": "ORD7", "amount": 100})).await;

        let (status, _) = post_json(
            &app,
            "/payments/orders/cash",
            json!({"internalOrderId": "ORD7", "staffId": "staff_1", "amount": 99}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(
            &app,
            "/payments/orders/cash",
            json!({"internalOrderId": "ORD7", "staffId": "", "amount": 100}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let cash = json!({
            "internalOrderId": "ORD7",
            "staffId": "staff_1",
            "amount": 100,
            "notes": "table 4"
        });
        let (status, body) = post_json(&app, "/payments/orders/cash", cash.clone()).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["settlement"], "applied");
        assert_eq!(body["order"]["status"], "paid");
        assert_eq!(body["order"]["paymentMethod"], "cash");

        let (status, body) = post_json(&app, "/payments/orders/cash", cash).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settlement"], "replayed");

        let (status, _) = post_json(
            &app,
            "/payments/orders/cash",
            json!({"internalOrderId": "ORD404", "staffId": "staff_1", "amount": 100}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cash_refused_after_gateway_payment() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        let callback = json!({
            "gatewayOrderId": "order_abc",
            "gatewayPaymentId": "pay_xyz",
            "signature": signer().sign_order_payment("order_abc", "pay_xyz"),
            "internalOrderId": "ORD123"
        });
        let (status, _) = post_json(&app, "/payments/orders/verify", callback).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(
            &app,
            "/payments/orders/cash",
            json!({"internalOrderId": "ORD123", "staffId": "staff_1", "amount": 25000}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_action_dispatch() {
        let server = MockServer::start().await;
        mount_order(&server, "order_abc").await;
        let app = test_app(&server);

        let (status, _) = post_json(&app, "/payments", json!({"action": "refund"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post_json(&app, "/payments", json!({"amount": 1})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        post_json(&app, "/orders", json!({"internalOrderId": "ORD123", "amount": 25000})).await;
        let (status, body) = post_json(
            &app,
            "/payments",
            json!({"action": "create_order", "internalOrderId": "ORD123", "amount": 25000}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["gatewayOrder"]["id"], "order_abc");

        let (status, body) = post_json(
            &app,
            "/payments",
            json!({"action": "get_subscription_status", "userId": "user_a"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasActive"], false);
    }

    #[tokio::test]
    async fn test_subscription_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_123",
                "plan_id": "plan_pro",
                "status": "created",
                "total_count": 1,
                "notes": {"user_id": "user_a"}
            })))
            .mount(&server)
            .await;
        let app = test_app(&server);

        let (status, body) = post_json(
            &app,
            "/subscriptions",
            json!({"userId": "user_a", "planId": "pro"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["gatewaySubscription"]["id"], "sub_123");
        assert_eq!(body["localSubscription"]["status"], "pending");

        // A second live subscription is refused
        let (status, _) = post_json(
            &app,
            "/subscriptions",
            json!({"userId": "user_a", "planId": "pro"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Another user cannot activate it
        let (status, _) = post_json(
            &app,
            "/subscriptions/verify",
            json!({
                "gatewaySubscriptionId": "sub_123",
                "gatewayPaymentId": "pay_1",
                "signature": signer().sign_subscription_payment("sub_123", "pay_1"),
                "userId": "user_b"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = post_json(
            &app,
            "/subscriptions/verify",
            json!({
                "gatewaySubscriptionId": "sub_123",
                "gatewayPaymentId": "pay_1",
                "signature": signer().sign_subscription_payment("sub_123", "pay_1"),
                "userId": "user_a"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = get_uri(&app, "/subscriptions/status?userId=user_a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasActive"], true);
        assert_eq!(body["plan"]["id"], "pro");
        assert_eq!(body["subscription"]["status"], "active");
    }

    #[tokio::test]
    async fn test_unknown_plan_is_404() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        let (status, _) = post_json(
            &app,
            "/subscriptions",
            json!({"userId": "user_a", "planId": "legacy"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_requires_user_id() {
        let server = MockServer::start().await;
        let (status, _) = get_uri(&test_app(&server), "/subscriptions/status").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn webhook_request(body: &Value, signature: &str) -> Request<Body> {
        Request::post("/webhook/razorpay")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_settles_order() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        let event = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_xyz", "order_id": "order_abc"}}}
        });
        let signature = compute_hmac_sha256(WEBHOOK_SECRET.as_bytes(), event.to_string().as_bytes());

        let (status, body) = send(&app, webhook_request(&event, &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");

        // Redelivery
        let (status, body) = send(&app, webhook_request(&event, &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "replayed");
    }

    #[tokio::test]
    async fn test_webhook_charge_renews_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_123",
                "plan_id": "plan_pro",
                "status": "created",
                "notes": {"user_id": "user_a"}
            })))
            .mount(&server)
            .await;
        let app = test_app(&server);

        let (status, _) = post_json(
            &app,
            "/subscriptions",
            json!({"userId": "user_a", "planId": "pro"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(
            &app,
            "/subscriptions/verify",
            json!({
                "gatewaySubscriptionId": "sub_123",
                "gatewayPaymentId": "pay_1",
                "signature": signer().sign_subscription_payment("sub_123", "pay_1"),
                "userId": "user_a"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = get_uri(&app, "/subscriptions/status?userId=user_a").await;
        let first_end: DateTime<Utc> =
            serde_json::from_value(body["subscription"]["endDate"].clone()).unwrap();

        let charged = |payment: &str| {
            json!({
                "event": "subscription.charged",
                "payload": {
                    "subscription": {"entity": {"id": "sub_123", "notes": {"user_id": "user_a"}}},
                    "payment": {"entity": {"id": payment}}
                }
            })
        };

        for (payment, outcome) in [("pay_1", "replayed"), ("pay_2", "applied"), ("pay_2", "replayed")] {
            let event = charged(payment);
            let signature =
                compute_hmac_sha256(WEBHOOK_SECRET.as_bytes(), event.to_string().as_bytes());
            let (status, body) = send(&app, webhook_request(&event, &signature)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["outcome"], outcome, "{}", payment);
        }

        let (_, body) = get_uri(&app, "/subscriptions/status?userId=user_a").await;
        let renewed_end: DateTime<Utc> =
            serde_json::from_value(body["subscription"]["endDate"].clone()).unwrap();
        assert_eq!(renewed_end - first_end, chrono::Duration::days(30));
        assert_eq!(body["subscription"]["status"], "active");
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        let event = json!({"event": "order.paid", "payload": {}});

        let (status, _) = send(&app, webhook_request(&event, "deadbeef")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_order_is_acknowledged() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        let event = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_1", "order_id": "order_unknown"}}}
        });
        let signature = compute_hmac_sha256(WEBHOOK_SECRET.as_bytes(), event.to_string().as_bytes());

        let (status, body) = send(&app, webhook_request(&event, &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "rejected");
    }

    #[tokio::test]
    async fn test_reconcile_reports_orphans() {
        let server = MockServer::start().await;
        let app = test_app(&server);
        initiated_order(&app, &server).await;

        Mock::given(method("GET"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entity": "collection",
                "count": 2,
                "items": [
                    {"id": "order_abc", "amount": 25000, "currency": "INR", "notes": {"internal_order_id": "ORD123"}},
                    {"id": "order_lost", "amount": 500, "currency": "INR", "notes": {"internal_order_id": "ORD404"}}
                ]
            })))
            .mount(&server)
            .await;

        let (status, body) = get_uri(&app, "/payments/reconcile?since=2023-11-14T00:00:00Z").await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["count"], 1);
        assert_eq!(body["orphans"][0]["gatewayOrderId"], "order_lost");
        assert_eq!(body["orphans"][0]["internalOrderId"], "ORD404");
        assert_eq!(body["expiredSubscriptions"], 0);

        let (status, _) = get_uri(&app, "/payments/reconcile?since=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
