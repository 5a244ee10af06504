// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CreditGate API Library
//!
//! HTTP surface for device registration, balances, activation codes, the
//! PayPal webhook and the credit-charging completion proxy.

pub mod completion;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;


pub use config::Config;
pub use error::{ApiError, ApiMessage, ApiResult};
pub use routes::create_router;
pub use state::AppState;
