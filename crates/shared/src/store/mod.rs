//! Account Store
//!
//! Persistent mapping from account email to balance state, plus the device
//! registry and the append-only payment log. Every mutating operation is
//! atomic with respect to a single account; callers never read-then-write.
//!
//! Two backends implement the same contract:
//! - [`PgAccountStore`]: Postgres via sqlx, atomicity from conditional updates
//!   and short transactions
//! - [`InMemoryAccountStore`]: one mutex around all maps, used when no
//!   database is configured and as the test fake

mod memory;
mod postgres;

pub use memory::InMemoryAccountStore;
pub use postgres::PgAccountStore;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::models::{
    Account, ConsumeOutcome, CreditSource, NewPayment, PaymentOutcome, PaymentRecord, Registration,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// No connection could be obtained, so nothing reached the database.
    /// Any call may be retried.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The connection failed while a call was in flight. The statement may or
    /// may not have been applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    /// A row violated an invariant the store relies on
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connection-class failure of either kind
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Unavailable(_))
    }

    /// True only when the call is known not to have reached the database
    pub fn nothing_sent(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unreachable(e.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Bind `device_id` to `email`, granting `free_grant` free credits if the
    /// device has never been seen. A known device returns its owner's paid
    /// balance with nothing granted; the bound email is never rewritten.
    async fn register_device(
        &self,
        email: &str,
        device_id: &str,
        free_grant: i64,
    ) -> StoreResult<Registration>;

    async fn account(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Upsert: add `amount` paid credits, mark active, and extend the expiry
    /// when one is given
    async fn grant_paid(
        &self,
        email: &str,
        amount: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<Account>;

    /// Grant and log a payment in one step. Replays of the same provider
    /// event id return [`PaymentOutcome::Duplicate`] and change nothing.
    async fn apply_payment(
        &self,
        payment: NewPayment,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<PaymentOutcome>;

    /// Deduct one credit, paid pool first. Check and deduct are one atomic step.
    async fn consume_one(&self, email: &str) -> StoreResult<ConsumeOutcome>;

    /// Put one credit back into `source`. Returns `None` for unknown accounts.
    async fn refund_one(&self, email: &str, source: CreditSource)
        -> StoreResult<Option<Account>>;

    /// Full payment log, newest first
    async fn payments(&self) -> StoreResult<Vec<PaymentRecord>>;

    async fn ping(&self) -> StoreResult<()>;
}
