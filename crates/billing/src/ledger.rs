//! Credit Ledger
//!
//! The only component allowed to mutate account balances and the payment log.
//! It layers business rules (free grant size, entitlement window, deduction
//! precedence) over an [`AccountStore`] and retries connection failures once
//! when repeating the call cannot apply a write twice.

use std::future::Future;
use std::sync::Arc;

use creditgate_shared::{
    Account, AccountStore, Balance, ConsumeOutcome, CreditSource, NewPayment, PaymentOutcome,
    PaymentRecord, Registration, StoreError, StoreResult,
};
use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Free credits handed to every newly registered device
pub const DEFAULT_FREE_CREDITS: i64 = 50;

/// Paid entitlement window, counted from the purchase
pub const DEFAULT_VALIDITY_DAYS: i64 = 30;

/// Days before expiry at which clients should start nagging for renewal
pub const RENEWAL_REMINDER_DAYS: i64 = 7;

const STORE_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    pub free_credits: i64,
    /// `None` disables expiry entirely
    pub validity_days: Option<i64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            free_credits: DEFAULT_FREE_CREDITS,
            validity_days: Some(DEFAULT_VALIDITY_DAYS),
        }
    }
}

/// A successful single-credit deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub source: CreditSource,
    pub balance: Balance,
}

/// Renewal state of a paid entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    /// Account has never had an expiry set
    NoExpiry,
    Expired,
    ExpiringSoon { days_left: i64 },
    Active { days_left: i64 },
}

impl ExpiryStatus {
    pub fn from_deadline(expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        let Some(expires_at) = expires_at else {
            return ExpiryStatus::NoExpiry;
        };
        let days_left = ceil_days(expires_at - now);
        if days_left <= 0 {
            ExpiryStatus::Expired
        } else if days_left <= RENEWAL_REMINDER_DAYS {
            ExpiryStatus::ExpiringSoon { days_left }
        } else {
            ExpiryStatus::Active { days_left }
        }
    }
}

fn ceil_days(remaining: Duration) -> i64 {
    let secs = remaining.whole_seconds();
    let day = Duration::DAY.whole_seconds();
    if secs <= 0 {
        // Truncation toward zero is the ceiling for negatives
        secs / day
    } else {
        (secs + day - 1) / day
    }
}

/// Whether a store call may be repeated after a connection failure that
/// left its outcome unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads, and writes the store deduplicates
    Safe,
    /// Bare increments and decrements
    Unsafe,
}

impl Replay {
    fn allows_retry(self, e: &StoreError) -> bool {
        e.nothing_sent() || (self == Replay::Safe && e.is_unavailable())
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn AccountStore>,
    config: LedgerConfig,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    /// Expiry a purchase made at `now` would carry
    pub fn entitlement_expiry(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.config
            .validity_days
            .map(|days| now + Duration::days(days))
    }

    /// Run a store call, retrying exactly once on a connection failure.
    ///
    /// A failure that may have hit the database after the statement ran is
    /// only retried for [`Replay::Safe`] calls; retrying a bare decrement
    /// there could charge twice. The pool reconnects on the next acquire, so
    /// the retry gets a fresh connection.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        replay: Replay,
        action: F,
    ) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let strategy = FixedInterval::from_millis(STORE_RETRY_DELAY_MS).take(1);
        RetryIf::spawn(strategy, action, |e: &StoreError| {
            let retry = replay.allows_retry(e);
            if retry {
                tracing::warn!(operation, error = %e, "Account store unavailable, retrying once");
            }
            retry
        })
        .await
        .map_err(|e| {
            if e.is_unavailable() && !e.nothing_sent() {
                tracing::error!(
                    operation,
                    error = %e,
                    "Account store connection lost mid-call, outcome unknown"
                );
            } else {
                tracing::error!(operation, error = %e, "Account store operation failed");
            }
            BillingError::from(e)
        })
    }

    /// Register a device. Idempotent per device id: only the first call grants
    /// free credits, and later calls never rebind the device to another email.
    pub async fn register_device(
        &self,
        email: &str,
        device_id: &str,
    ) -> BillingResult<Registration> {
        let free = self.config.free_credits;
        let registration = self
            // Safe: the device row claims the free grant at most once
            .with_retry("register_device", Replay::Safe, || {
                self.store.register_device(email, device_id, free)
            })
            .await?;

        if registration.is_new_device {
            tracing::info!(
                email = %email,
                device_id = %device_id,
                free_granted = registration.free_granted,
                "New device registered"
            );
        } else {
            tracing::info!(device_id = %device_id, "Known device re-registered, no grant");
        }
        Ok(registration)
    }

    pub async fn account(&self, email: &str) -> BillingResult<Option<Account>> {
        self.with_retry("account", Replay::Safe, || self.store.account(email)).await
    }

    pub async fn get_balance(&self, email: &str) -> BillingResult<Balance> {
        self.account(email)
            .await?
            .map(|a| a.balance())
            .ok_or(BillingError::AccountNotFound)
    }

    /// Add paid credits, creating the account if a payment beats registration
    pub async fn grant_credits(&self, email: &str, amount: u32) -> BillingResult<Account> {
        let expires_at = self.entitlement_expiry(OffsetDateTime::now_utc());
        let account = self
            .with_retry("grant_credits", Replay::Unsafe, || {
                self.store.grant_paid(email, i64::from(amount), expires_at)
            })
            .await?;

        tracing::info!(
            email = %email,
            amount = amount,
            paid_balance = account.paid_credits,
            "Credits granted"
        );
        Ok(account)
    }

    /// Grant credits for a provider payment and log it, exactly once per
    /// provider event id
    pub async fn apply_payment(&self, payment: NewPayment) -> BillingResult<PaymentOutcome> {
        let expires_at = self.entitlement_expiry(OffsetDateTime::now_utc());
        // Without an event id the store cannot recognise a replay
        let replay = if payment.provider_event_id.is_some() {
            Replay::Safe
        } else {
            Replay::Unsafe
        };
        let outcome = self
            .with_retry("apply_payment", replay, || {
                self.store.apply_payment(payment.clone(), expires_at)
            })
            .await?;

        match &outcome {
            PaymentOutcome::Applied { account, record } => tracing::info!(
                email = %account.email,
                payment_id = %record.id,
                credits_added = record.credits_added,
                paid_balance = account.paid_credits,
                "Payment applied"
            ),
            PaymentOutcome::Duplicate => tracing::info!(
                provider_event_id = ?payment.provider_event_id,
                "Duplicate payment event ignored"
            ),
        }
        Ok(outcome)
    }

    /// Deduct one credit, paid before free
    pub async fn consume_one_credit(&self, email: &str) -> BillingResult<Consumed> {
        let outcome = self
            .with_retry("consume_one_credit", Replay::Unsafe, || self.store.consume_one(email))
            .await?;

        match outcome {
            ConsumeOutcome::Consumed { source, balance } => {
                tracing::debug!(
                    email = %email,
                    source = %source,
                    free = balance.free,
                    paid = balance.paid,
                    "Credit consumed"
                );
                Ok(Consumed { source, balance })
            }
            ConsumeOutcome::Depleted => Err(BillingError::Depleted),
            ConsumeOutcome::NotFound => Err(BillingError::AccountNotFound),
        }
    }

    /// Return a consumed credit to the pool it came from
    pub async fn refund_credit(
        &self,
        email: &str,
        source: CreditSource,
    ) -> BillingResult<Account> {
        let account = self
            .with_retry("refund_credit", Replay::Unsafe, || {
                self.store.refund_one(email, source)
            })
            .await?
            .ok_or(BillingError::AccountNotFound)?;

        tracing::info!(email = %email, source = %source, "Credit refunded");
        Ok(account)
    }

    pub async fn payments(&self) -> BillingResult<Vec<PaymentRecord>> {
        self.with_retry("payments", Replay::Safe, || self.store.payments()).await
    }

    pub async fn check_expiry(
        &self,
        email: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ExpiryStatus> {
        let account = self
            .account(email)
            .await?
            .ok_or(BillingError::AccountNotFound)?;
        Ok(ExpiryStatus::from_deadline(account.expires_at, now))
    }

    pub async fn ping(&self) -> BillingResult<()> {
        self.with_retry("ping", Replay::Safe, || self.store.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use creditgate_shared::InMemoryAccountStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::macros::datetime;

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(InMemoryAccountStore::new()), LedgerConfig::default())
    }

    #[tokio::test]
    async fn test_register_twice_is_idempotent() {
        let ledger = ledger();
        let first = ledger.register_device("a@x.com", "dev1").await.unwrap();
        assert!(first.is_new_device);
        assert_eq!(first.free_granted, 50);

        let second = ledger.register_device("a@x.com", "dev1").await.unwrap();
        assert!(!second.is_new_device);
        assert_eq!(second.free_granted, 0);
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 50);
    }

    #[tokio::test]
    async fn test_balance_of_unknown_account() {
        assert!(matches!(
            ledger().get_balance("ghost@x.com").await,
            Err(BillingError::AccountNotFound)
        ));
    }

    #[tokio::test]
    async fn test_grant_before_registration_creates_account() {
        let ledger = ledger();
        let account = ledger.grant_credits("early@x.com", 2000).await.unwrap();
        assert_eq!(account.paid_credits, 2000);
        assert_eq!(account.free_credits, 0);
        assert!(account.is_active);
        assert!(account.expires_at.is_some());

        // Registering afterwards still grants the free credits
        let reg = ledger.register_device("early@x.com", "dev9").await.unwrap();
        assert_eq!(reg.paid_balance, 2000);
        assert_eq!(reg.free_granted, 50);
    }

    #[tokio::test]
    async fn test_consume_paid_then_free_then_depleted() {
        let ledger = ledger();
        ledger.register_device("a@x.com", "dev1").await.unwrap();
        ledger.grant_credits("a@x.com", 2).await.unwrap();

        let c = ledger.consume_one_credit("a@x.com").await.unwrap();
        assert_eq!(c.source, CreditSource::Paid);
        assert_eq!(c.balance, Balance { free: 50, paid: 1 });

        ledger.consume_one_credit("a@x.com").await.unwrap();
        let c = ledger.consume_one_credit("a@x.com").await.unwrap();
        assert_eq!(c.source, CreditSource::Free);
        assert_eq!(c.balance, Balance { free: 49, paid: 0 });
    }

    #[tokio::test]
    async fn test_consume_without_validity_window() {
        let ledger = CreditLedger::new(
            Arc::new(InMemoryAccountStore::new()),
            LedgerConfig {
                free_credits: 0,
                validity_days: None,
            },
        );
        let account = ledger.grant_credits("a@x.com", 1).await.unwrap();
        assert_eq!(account.expires_at, None);

        ledger.consume_one_credit("a@x.com").await.unwrap();
        assert!(matches!(
            ledger.consume_one_credit("a@x.com").await,
            Err(BillingError::Depleted)
        ));
    }

    #[test]
    fn test_expiry_status_thresholds() {
        let now = datetime!(2025-06-01 12:00 UTC);
        assert_eq!(ExpiryStatus::from_deadline(None, now), ExpiryStatus::NoExpiry);
        assert_eq!(
            ExpiryStatus::from_deadline(Some(now - Duration::hours(1)), now),
            ExpiryStatus::Expired
        );
        assert_eq!(
            ExpiryStatus::from_deadline(Some(now), now),
            ExpiryStatus::Expired
        );
        // Partial days round up
        assert_eq!(
            ExpiryStatus::from_deadline(Some(now + Duration::hours(1)), now),
            ExpiryStatus::ExpiringSoon { days_left: 1 }
        );
        assert_eq!(
            ExpiryStatus::from_deadline(Some(now + Duration::days(7)), now),
            ExpiryStatus::ExpiringSoon { days_left: 7 }
        );
        assert_eq!(
            ExpiryStatus::from_deadline(Some(now + Duration::days(7) + Duration::minutes(1)), now),
            ExpiryStatus::Active { days_left: 8 }
        );
    }

    /// Store that fails a fixed number of times before reaching the inner
    /// store, like a pool that cannot hand out a connection
    struct FlakyStore {
        inner: InMemoryAccountStore,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryAccountStore::new(),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.failures_left) {
                return Err(StoreError::Unreachable("pool timed out".to_string()));
            }
            Ok(())
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl AccountStore for FlakyStore {
        async fn register_device(&self, e: &str, d: &str, f: i64) -> StoreResult<Registration> {
            self.trip()?;
            self.inner.register_device(e, d, f).await
        }
        async fn account(&self, e: &str) -> StoreResult<Option<Account>> {
            self.trip()?;
            self.inner.account(e).await
        }
        async fn grant_paid(
            &self,
            e: &str,
            a: i64,
            x: Option<OffsetDateTime>,
        ) -> StoreResult<Account> {
            self.trip()?;
            self.inner.grant_paid(e, a, x).await
        }
        async fn apply_payment(
            &self,
            p: NewPayment,
            x: Option<OffsetDateTime>,
        ) -> StoreResult<PaymentOutcome> {
            self.trip()?;
            self.inner.apply_payment(p, x).await
        }
        async fn consume_one(&self, e: &str) -> StoreResult<ConsumeOutcome> {
            self.trip()?;
            self.inner.consume_one(e).await
        }
        async fn refund_one(&self, e: &str, s: CreditSource) -> StoreResult<Option<Account>> {
            self.trip()?;
            self.inner.refund_one(e, s).await
        }
        async fn payments(&self) -> StoreResult<Vec<PaymentRecord>> {
            self.trip()?;
            self.inner.payments().await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.trip()
        }
    }

    /// Store whose writes are applied but whose reply is lost a fixed number
    /// of times, like a connection reset after the server committed
    struct LostAckStore {
        inner: InMemoryAccountStore,
        lost_acks: AtomicU32,
        calls: AtomicU32,
    }

    impl LostAckStore {
        fn new(lost_acks: u32) -> Self {
            Self {
                inner: InMemoryAccountStore::new(),
                lost_acks: AtomicU32::new(lost_acks),
                calls: AtomicU32::new(0),
            }
        }

        fn reply<T>(&self, applied: StoreResult<T>) -> StoreResult<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = applied?;
            if take_one(&self.lost_acks) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            Ok(value)
        }
    }

    #[async_trait]
    impl AccountStore for LostAckStore {
        async fn register_device(&self, e: &str, d: &str, f: i64) -> StoreResult<Registration> {
            self.reply(self.inner.register_device(e, d, f).await)
        }
        async fn account(&self, e: &str) -> StoreResult<Option<Account>> {
            self.inner.account(e).await
        }
        async fn grant_paid(
            &self,
            e: &str,
            a: i64,
            x: Option<OffsetDateTime>,
        ) -> StoreResult<Account> {
            self.reply(self.inner.grant_paid(e, a, x).await)
        }
        async fn apply_payment(
            &self,
            p: NewPayment,
            x: Option<OffsetDateTime>,
        ) -> StoreResult<PaymentOutcome> {
            self.reply(self.inner.apply_payment(p, x).await)
        }
        async fn consume_one(&self, e: &str) -> StoreResult<ConsumeOutcome> {
            self.reply(self.inner.consume_one(e).await)
        }
        async fn refund_one(&self, e: &str, s: CreditSource) -> StoreResult<Option<Account>> {
            self.reply(self.inner.refund_one(e, s).await)
        }
        async fn payments(&self) -> StoreResult<Vec<PaymentRecord>> {
            self.inner.payments().await
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    async fn paid(store: &LostAckStore, email: &str) -> i64 {
        store.inner.account(email).await.unwrap().unwrap().paid_credits
    }

    #[tokio::test]
    async fn test_store_unavailable_retried_once() {
        let store = Arc::new(FlakyStore::new(1));
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        ledger.ping().await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_unavailable_twice_fails_request() {
        let store = Arc::new(FlakyStore::new(2));
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let result = ledger.get_balance("a@x.com").await;
        assert!(matches!(result, Err(BillingError::StoreUnavailable(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_consume_retried() {
        let store = Arc::new(FlakyStore::new(1));
        store.inner.grant_paid("a@x.com", 5, None).await.unwrap();
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let consumed = ledger.consume_one_credit("a@x.com").await.unwrap();
        assert_eq!(consumed.balance.paid, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    // =========================================================================
    // Connection lost after the write landed: counters must not move twice
    // =========================================================================

    #[tokio::test]
    async fn test_lost_ack_consume_charges_once() {
        let store = Arc::new(LostAckStore::new(1));
        store.inner.grant_paid("a@x.com", 5, None).await.unwrap();
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let result = ledger.consume_one_credit("a@x.com").await;
        assert!(matches!(result, Err(BillingError::StoreUnavailable(_))));
        assert_eq!(paid(&store, "a@x.com").await, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_grant_applies_once() {
        let store = Arc::new(LostAckStore::new(1));
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let result = ledger.grant_credits("a@x.com", 2000).await;
        assert!(matches!(result, Err(BillingError::StoreUnavailable(_))));
        assert_eq!(paid(&store, "a@x.com").await, 2000);
    }

    #[tokio::test]
    async fn test_lost_ack_refund_applies_once() {
        let store = Arc::new(LostAckStore::new(0));
        store.inner.grant_paid("a@x.com", 5, None).await.unwrap();
        store.lost_acks.store(1, Ordering::SeqCst);
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        assert!(ledger.refund_credit("a@x.com", CreditSource::Paid).await.is_err());
        assert_eq!(paid(&store, "a@x.com").await, 6);
    }

    #[tokio::test]
    async fn test_lost_ack_payment_with_event_id_is_retried_safely() {
        let store = Arc::new(LostAckStore::new(1));
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let outcome = ledger
            .apply_payment(NewPayment {
                provider_event_id: Some("WH-1".to_string()),
                email: "a@x.com".to_string(),
                amount_cents: Some(500),
                credits_added: 2000,
                activation_code: None,
            })
            .await
            .unwrap();

        // The retry finds the first attempt's record
        assert_eq!(outcome, PaymentOutcome::Duplicate);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(paid(&store, "a@x.com").await, 2000);
        assert_eq!(ledger.payments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_registration_grants_once() {
        let store = Arc::new(LostAckStore::new(1));
        let ledger = CreditLedger::new(store.clone(), LedgerConfig::default());

        let reg = ledger.register_device("a@x.com", "dev1").await.unwrap();
        assert!(!reg.is_new_device);
        assert_eq!(
            store.inner.account("a@x.com").await.unwrap().unwrap().free_credits,
            50
        );
    }
}
