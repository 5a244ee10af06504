use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{AccountStore, StoreResult};
use crate::models::{
    Account, ConsumeOutcome, CreditSource, Device, NewPayment, PaymentOutcome, PaymentRecord,
    Registration,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    devices: HashMap<String, Device>,
    payments: Vec<PaymentRecord>,
    seen_events: HashSet<String>,
}

impl Inner {
    fn upsert_paid(
        &mut self,
        email: &str,
        amount: i64,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Account {
        let account = self
            .accounts
            .entry(email.to_string())
            .or_insert_with(|| Account::new(email, now));
        account.paid_credits += amount;
        account.is_active = true;
        if let Some(expiry) = expires_at {
            account.expires_at = Some(account.expires_at.map_or(expiry, |e| e.max(expiry)));
        }
        account.updated_at = now;
        account.clone()
    }
}

/// Account store held entirely in process memory.
///
/// All state sits behind one mutex, so each trait call observes and mutates
/// a consistent snapshot. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryAccountStore {
    inner: Mutex<Inner>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered device, if any (test and diagnostics helper)
    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.lock().await.devices.get(device_id).cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn register_device(
        &self,
        email: &str,
        device_id: &str,
        free_grant: i64,
    ) -> StoreResult<Registration> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;

        if let Some(device) = inner.devices.get(device_id) {
            let paid_balance = inner
                .accounts
                .get(&device.email)
                .map_or(0, |a| a.paid_credits);
            return Ok(Registration {
                free_granted: 0,
                paid_balance,
                is_new_device: false,
            });
        }

        inner.devices.insert(
            device_id.to_string(),
            Device {
                device_id: device_id.to_string(),
                email: email.to_string(),
                registered_at: now,
            },
        );
        let account = inner
            .accounts
            .entry(email.to_string())
            .or_insert_with(|| Account::new(email, now));
        account.free_credits += free_grant;
        account.updated_at = now;

        Ok(Registration {
            free_granted: free_grant,
            paid_balance: account.paid_credits,
            is_new_device: true,
        })
    }

    async fn account(&self, email: &str) -> StoreResult<Option<Account>> {
        Ok(self.inner.lock().await.accounts.get(email).cloned())
    }

    async fn grant_paid(
        &self,
        email: &str,
        amount: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<Account> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .inner
            .lock()
            .await
            .upsert_paid(email, amount, expires_at, now))
    }

    async fn apply_payment(
        &self,
        payment: NewPayment,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<PaymentOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;

        if let Some(event_id) = &payment.provider_event_id {
            if !inner.seen_events.insert(event_id.clone()) {
                return Ok(PaymentOutcome::Duplicate);
            }
        }

        let account = inner.upsert_paid(&payment.email, payment.credits_added, expires_at, now);
        let record = payment.into_record(now);
        inner.payments.push(record.clone());

        Ok(PaymentOutcome::Applied { account, record })
    }

    async fn consume_one(&self, email: &str) -> StoreResult<ConsumeOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.get_mut(email) else {
            return Ok(ConsumeOutcome::NotFound);
        };

        let source = if account.paid_credits > 0 {
            account.paid_credits -= 1;
            CreditSource::Paid
        } else if account.free_credits > 0 {
            account.free_credits -= 1;
            CreditSource::Free
        } else {
            return Ok(ConsumeOutcome::Depleted);
        };
        account.updated_at = OffsetDateTime::now_utc();

        Ok(ConsumeOutcome::Consumed {
            source,
            balance: account.balance(),
        })
    }

    async fn refund_one(
        &self,
        email: &str,
        source: CreditSource,
    ) -> StoreResult<Option<Account>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.accounts.get_mut(email).map(|account| {
            match source {
                CreditSource::Paid => account.paid_credits += 1,
                CreditSource::Free => account.free_credits += 1,
            }
            account.updated_at = OffsetDateTime::now_utc();
            account.clone()
        }))
    }

    async fn payments(&self) -> StoreResult<Vec<PaymentRecord>> {
        let inner = self.inner.lock().await;
        let mut payments = inner.payments.clone();
        // Stable sort keeps insertion order among equal timestamps; reverse it
        payments.reverse();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
