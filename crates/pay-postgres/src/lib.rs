//! # pay-postgres
//!
//! PostgreSQL-backed `PaymentLedger` for tablepay.
//!
//! ```rust,ignore
//! use pay_postgres::PostgresLedger;
//!
//! let ledger = PostgresLedger::connect(&database_url, 10).await?;
//! ledger.migrate().await?;
//! ```

pub mod ledger;

pub use ledger::PostgresLedger;
