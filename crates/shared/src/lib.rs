// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CreditGate shared types
//!
//! Data model and the Account Store used by the billing and API crates.

pub mod db;
pub mod models;
pub mod store;

pub use db::{create_pool, run_migrations};
pub use models::{
    normalize_email, Account, Balance, ConsumeOutcome, CreditSource, Device, NewPayment,
    PaymentOutcome, PaymentRecord, Registration,
};
pub use store::{AccountStore, InMemoryAccountStore, PgAccountStore, StoreError, StoreResult};
