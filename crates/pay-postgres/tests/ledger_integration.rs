//! Ledger tests against a live PostgreSQL.
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p pay-postgres -- --ignored

use chrono::{Duration, Utc};
use pay_core::{
    CashReceipt, Currency, MinorUnits, NewSubscription, Order, OrderStatus, PaymentError,
    PaymentLedger, PaymentMethod, Settlement,
};
use pay_postgres::PostgresLedger;
use std::sync::Arc;
use uuid::Uuid;

async fn ledger() -> PostgresLedger {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let ledger = PostgresLedger::connect(&url, 5).await.unwrap();
    ledger.migrate().await.unwrap();
    ledger
}

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

fn new_subscription(user_id: &str) -> NewSubscription {
    let now = Utc::now();
    NewSubscription {
        user_id: user_id.to_string(),
        plan_id: "starter".to_string(),
        gateway_subscription_id: unique("sub"),
        gateway_plan_id: "plan_starter".to_string(),
        start_date: now,
        end_date: now + Duration::days(30),
    }
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_order_settles_once() {
    let ledger = ledger().await;
    let internal_id = unique("ORD");
    let gateway_order_id = unique("order");
    let payment_id = unique("pay");

    ledger
        .insert_order(Order::new(&internal_id, MinorUnits::new(25000).unwrap(), Currency::INR))
        .await
        .unwrap();
    ledger
        .record_pending_order(&internal_id, &gateway_order_id, Currency::INR)
        .await
        .unwrap();
    // Re-recording the same gateway order is a no-op
    ledger
        .record_pending_order(&internal_id, &gateway_order_id, Currency::INR)
        .await
        .unwrap();

    assert_eq!(
        ledger.mark_order_paid(&internal_id, &payment_id, Some("sig")).await.unwrap(),
        Settlement::Applied
    );
    assert_eq!(
        ledger.mark_order_paid(&internal_id, &payment_id, None).await.unwrap(),
        Settlement::Replayed
    );
    assert!(matches!(
        ledger.mark_order_paid(&internal_id, "pay_other", Some("sig")).await,
        Err(PaymentError::Conflict(_))
    ));
    assert_eq!(ledger.payments_for_order(&internal_id).await.unwrap().len(), 1);

    let order = ledger
        .find_order_by_gateway_id(&gateway_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert!(matches!(
        ledger.close_order(&internal_id, OrderStatus::Cancelled).await,
        Err(PaymentError::InvalidState { .. })
    ));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_duplicate_order_is_conflict() {
    let ledger = ledger().await;
    let internal_id = unique("ORD");
    let order = Order::new(&internal_id, MinorUnits::new(100).unwrap(), Currency::INR);

    ledger.insert_order(order.clone()).await.unwrap();
    assert!(matches!(
        ledger.insert_order(order).await,
        Err(PaymentError::Conflict(_))
    ));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_one_live_subscription_under_concurrency() {
    let ledger = Arc::new(ledger().await);
    let user_id = unique("user");

    let a = {
        let ledger = ledger.clone();
        let sub = new_subscription(&user_id);
        tokio::spawn(async move { ledger.create_pending_subscription(sub).await })
    };
    let b = {
        let ledger = ledger.clone();
        let sub = new_subscription(&user_id);
        tokio::spawn(async move { ledger.create_pending_subscription(sub).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PaymentError::Conflict(_)))));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_activation_requires_owner() {
    let ledger = ledger().await;
    let user_id = unique("user");
    let created = ledger
        .create_pending_subscription(new_subscription(&user_id))
        .await
        .unwrap();
    let gsid = created.gateway_subscription_id;
    let payment_id = unique("pay");

    assert!(matches!(
        ledger.activate_subscription(&gsid, "someone_else", &payment_id, Some("sig")).await,
        Err(PaymentError::NotFound { .. })
    ));
    assert_eq!(
        ledger.activate_subscription(&gsid, &user_id, &payment_id, Some("sig")).await.unwrap(),
        Settlement::Applied
    );
    assert!(ledger.has_active_subscription(&user_id).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_lapsed_subscription_expires() {
    let ledger = ledger().await;
    let user_id = unique("user");
    let mut sub = new_subscription(&user_id);
    sub.start_date = Utc::now() - Duration::days(31);
    sub.end_date = Utc::now() - Duration::days(1);
    let created = ledger.create_pending_subscription(sub).await.unwrap();
    ledger
        .activate_subscription(&created.gateway_subscription_id, &user_id, &unique("pay"), None)
        .await
        .unwrap();

    assert!(!ledger.has_active_subscription(&user_id).await.unwrap());
    assert!(ledger
        .active_subscription(&user_id, Utc::now())
        .await
        .unwrap()
        .is_none());

    // The lapsed row no longer blocks a new subscription
    ledger
        .create_pending_subscription(new_subscription(&user_id))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_cash_settlement() {
    let ledger = ledger().await;
    let internal_id = unique("ORD");
    ledger
        .insert_order(Order::new(&internal_id, MinorUnits::new(25000).unwrap(), Currency::INR))
        .await
        .unwrap();

    let receipt = CashReceipt {
        staff_id: "staff_7".to_string(),
        amount: MinorUnits::new(25000).unwrap(),
        notes: Some("table 4".to_string()),
    };
    assert_eq!(
        ledger.mark_order_paid_cash(&internal_id, &receipt).await.unwrap(),
        Settlement::Applied
    );
    assert_eq!(
        ledger.mark_order_paid_cash(&internal_id, &receipt).await.unwrap(),
        Settlement::Replayed
    );

    let payments = ledger.payments_for_order(&internal_id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].method, PaymentMethod::Cash);
    assert_eq!(payments[0].recorded_by.as_deref(), Some("staff_7"));

    let order = ledger.get_order(&internal_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.payment_method, Some(PaymentMethod::Cash));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL (set DATABASE_URL)"]
async fn test_subscription_charge_extends_term_once() {
    let ledger = ledger().await;
    let user_id = unique("user");
    let created = ledger
        .create_pending_subscription(new_subscription(&user_id))
        .await
        .unwrap();
    let gsid = created.gateway_subscription_id.clone();
    let first = unique("pay");
    let second = unique("pay");

    ledger
        .activate_subscription(&gsid, &user_id, &first, Some("sig"))
        .await
        .unwrap();
    assert_eq!(
        ledger.record_subscription_charge(&gsid, &first, Duration::days(30)).await.unwrap(),
        Settlement::Replayed
    );
    assert_eq!(
        ledger.record_subscription_charge(&gsid, &second, Duration::days(30)).await.unwrap(),
        Settlement::Applied
    );
    assert_eq!(
        ledger.record_subscription_charge(&gsid, &second, Duration::days(30)).await.unwrap(),
        Settlement::Replayed
    );

    let renewed = ledger.find_subscription_by_gateway_id(&gsid).await.unwrap().unwrap();
    // TIMESTAMPTZ keeps microseconds
    let drift = renewed.end_date - (created.end_date + Duration::days(30));
    assert!(drift.num_milliseconds().abs() < 1);
    assert_eq!(renewed.payment_id.as_deref(), Some(second.as_str()));
}
