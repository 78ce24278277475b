//! # pay-api
//!
//! HTTP API layer for tablepay.
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - REST endpoints for order payments, subscriptions and reconciliation
//! - Razorpay webhook handler
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check |
//! | GET | `/plans` | List active plans |
//! | POST | `/orders` | Register merchant order |
//! | POST | `/payments` | Action dispatch (`create_order`, `verify_payment`, ...) |
//! | POST | `/payments/orders` | Create gateway order |
//! | POST | `/payments/orders/verify` | Verify order payment |
//! | POST | `/payments/orders/close` | Fail or cancel order |
//! | GET | `/payments/reconcile` | Orphaned gateway orders |
//! | POST | `/subscriptions` | Create subscription |
//! | POST | `/subscriptions/verify` | Verify subscription payment |
//! | GET | `/subscriptions/status` | Active subscription for a user |
//! | POST | `/webhook/razorpay` | Razorpay webhook |

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppConfig, AppState};
