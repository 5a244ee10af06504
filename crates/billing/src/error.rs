//! Billing error taxonomy
//!
//! Every variant except `Database` and `Config` is a business-level outcome
//! that the API turns into a `success: false` body rather than a 5xx.

use creditgate_shared::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("malformed payment event: {0}")]
    MalformedEvent(String),

    #[error("account not found")]
    AccountNotFound,

    #[error("no credits left")]
    Depleted,

    #[error("invalid activation code format")]
    FormatError,

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("notification failed: {0}")]
    Notification(String),
}

impl From<StoreError> for BillingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unreachable(msg) | StoreError::Unavailable(msg) => {
                BillingError::StoreUnavailable(msg)
            }
            StoreError::Database(msg) | StoreError::Corrupt(msg) => BillingError::Database(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
