//! # pay-core
//!
//! Core types and traits for the tablepay payment engine.
//!
//! This crate provides:
//! - `PaymentGateway` trait for provider clients
//! - `CallbackVerifier` trait for checkout and webhook signature checks
//! - `PaymentLedger` trait, plus `InMemoryLedger` for tests and local runs
//! - `Order`, `Subscription` and `PlanCatalog` domain types
//! - `ReconciliationService`, the order and subscription state machine
//! - `PaymentError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use pay_core::{Currency, InitiateOrderPayment, MinorUnits, ReconciliationService};
//!
//! let service = ReconciliationService::new(gateway, verifier, ledger, plans);
//!
//! service.register_order("ORD123", MinorUnits::new(25000)?, Currency::INR).await?;
//! let initiation = service.initiate_order_payment(InitiateOrderPayment {
//!     internal_order_id: "ORD123".into(),
//!     amount: MinorUnits::new(25000)?,
//!     currency: Currency::INR,
//!     receipt: None,
//!     notes: Default::default(),
//! }).await?;
//!
//! // Hand initiation.key_id and initiation.gateway_order to the checkout widget
//! ```

pub mod error;
pub mod event;
pub mod gateway;
pub mod ledger;
pub mod memory;
pub mod money;
pub mod order;
pub mod reconcile;
pub mod subscription;
pub mod verifier;

// Re-exports for convenience
pub use error::{PaymentError, PaymentResult};
pub use event::{GatewayEvent, GatewayEventKind};
pub use gateway::{
    BoxedPaymentGateway, CreateOrderRequest, CreatePlanRequest, CreateSubscriptionRequest,
    GatewayOrder, GatewayPlan, GatewaySubscription, Notes, PaymentGateway, PlanItem,
    INTERNAL_ORDER_ID_NOTE, USER_ID_NOTE,
};
pub use ledger::{default_pending_ttl, BoxedPaymentLedger, PaymentLedger};
pub use memory::InMemoryLedger;
pub use money::{Currency, MinorUnits, Money};
pub use order::{CashReceipt, Order, OrderStatus, PaymentMethod, PaymentRecord, Settlement};
pub use reconcile::{
    ConfirmCashPayment, ConfirmOrderPayment, ConfirmSubscriptionPayment, EventOutcome,
    InitiateOrderPayment, InitiateSubscription, OrphanedOrder, PaymentInitiation,
    ReconciliationService, SubscriptionInitiation, SubscriptionStatusView, SweepReport,
};
pub use subscription::{
    BillingPeriod, NewSubscription, Plan, PlanCatalog, Subscription, SubscriptionStatus,
};
pub use verifier::{BoxedCallbackVerifier, CallbackVerifier};
