use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use super::{AccountStore, StoreError, StoreResult};
use crate::models::{
    Account, Balance, ConsumeOutcome, CreditSource, NewPayment, PaymentOutcome, PaymentRecord,
    Registration,
};

const ACCOUNT_COLUMNS: &str =
    "email, free_credits, paid_credits, is_active, expires_at, created_at, updated_at";

/// Account store backed by Postgres.
///
/// Deductions are a single conditional `UPDATE`, so concurrent requests can
/// never drive a pool below zero. Multi-row operations (device registration,
/// payment application) run in a short transaction.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn register_device(
        &self,
        email: &str,
        device_id: &str,
        free_grant: i64,
    ) -> StoreResult<Registration> {
        let mut tx = self.pool.begin().await?;

        // The device row references the account, so make sure it exists first
        sqlx::query("INSERT INTO accounts (email) VALUES ($1) ON CONFLICT (email) DO NOTHING")
            .bind(email)
            .execute(&mut *tx)
            .await?;

        // Concurrent registrations of the same device serialize on the primary
        // key; the loser gets no row back and falls through to the lookup
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO devices (device_id, email)
            VALUES ($1, $2)
            ON CONFLICT (device_id) DO NOTHING
            RETURNING device_id
            "#,
        )
        .bind(device_id)
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;

            let paid_balance: Option<(i64,)> = sqlx::query_as(
                r#"
                SELECT a.paid_credits
                FROM devices d
                JOIN accounts a ON a.email = d.email
                WHERE d.device_id = $1
                "#,
            )
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

            let (paid_balance,) = paid_balance.ok_or_else(|| {
                StoreError::Corrupt(format!("device {device_id} has no owning account"))
            })?;

            return Ok(Registration {
                free_granted: 0,
                paid_balance,
                is_new_device: false,
            });
        }

        let (paid_balance,): (i64,) = sqlx::query_as(
            r#"
            UPDATE accounts
            SET free_credits = free_credits + $2, updated_at = NOW()
            WHERE email = $1
            RETURNING paid_credits
            "#,
        )
        .bind(email)
        .bind(free_grant)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(email = %email, device_id = %device_id, "Device registered");

        Ok(Registration {
            free_granted: free_grant,
            paid_balance,
            is_new_device: true,
        })
    }

    async fn account(&self, email: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn grant_paid(
        &self,
        email: &str,
        amount: i64,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<Account> {
        let account = sqlx::query_as::<_, Account>(&upsert_paid_sql())
            .bind(email)
            .bind(amount)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(account)
    }

    async fn apply_payment(
        &self,
        payment: NewPayment,
        expires_at: Option<OffsetDateTime>,
    ) -> StoreResult<PaymentOutcome> {
        let mut tx = self.pool.begin().await?;
        let email = payment.email.clone();
        let credits = payment.credits_added;
        let draft = payment.into_record(OffsetDateTime::now_utc());

        // NULL event ids never conflict, so only identified events are deduplicated
        let record: Option<PaymentRecord> = sqlx::query_as(
            r#"
            INSERT INTO payments
                (id, provider_event_id, email, amount_cents, credits_added, activation_code, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id, provider_event_id, email, amount_cents, credits_added, activation_code, created_at
            "#,
        )
        .bind(draft.id)
        .bind(&draft.provider_event_id)
        .bind(&draft.email)
        .bind(draft.amount_cents)
        .bind(draft.credits_added)
        .bind(&draft.activation_code)
        .bind(draft.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(PaymentOutcome::Duplicate);
        };

        let account = sqlx::query_as::<_, Account>(&upsert_paid_sql())
            .bind(&email)
            .bind(credits)
            .bind(expires_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PaymentOutcome::Applied { account, record })
    }

    async fn consume_one(&self, email: &str) -> StoreResult<ConsumeOutcome> {
        // Row lock plus a floor check in the same statement: two requests
        // racing for the last credit cannot both see it
        let consumed: Option<(bool, i64, i64)> = sqlx::query_as(
            r#"
            WITH prior AS (
                SELECT email, paid_credits
                FROM accounts
                WHERE email = $1
                FOR UPDATE
            )
            UPDATE accounts a
            SET paid_credits = CASE WHEN prior.paid_credits > 0
                                    THEN a.paid_credits - 1 ELSE a.paid_credits END,
                free_credits = CASE WHEN prior.paid_credits > 0
                                    THEN a.free_credits ELSE a.free_credits - 1 END,
                updated_at = NOW()
            FROM prior
            WHERE a.email = prior.email
              AND (a.paid_credits > 0 OR a.free_credits > 0)
            RETURNING prior.paid_credits > 0, a.free_credits, a.paid_credits
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((from_paid, free, paid)) = consumed {
            let source = if from_paid {
                CreditSource::Paid
            } else {
                CreditSource::Free
            };
            return Ok(ConsumeOutcome::Consumed {
                source,
                balance: Balance { free, paid },
            });
        }

        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM accounts WHERE email = $1)")
                .bind(email)
                .fetch_one(&self.pool)
                .await?;

        Ok(if exists {
            ConsumeOutcome::Depleted
        } else {
            ConsumeOutcome::NotFound
        })
    }

    async fn refund_one(
        &self,
        email: &str,
        source: CreditSource,
    ) -> StoreResult<Option<Account>> {
        let column = match source {
            CreditSource::Paid => "paid_credits",
            CreditSource::Free => "free_credits",
        };
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET {column} = {column} + 1, updated_at = NOW() \
             WHERE email = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn payments(&self) -> StoreResult<Vec<PaymentRecord>> {
        let payments = sqlx::query_as::<_, PaymentRecord>(
            r#"
            SELECT id, provider_event_id, email, amount_cents, credits_added, activation_code, created_at
            FROM payments
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Upsert that adds paid credits, activates, and only ever moves the expiry
/// forward (GREATEST skips NULLs)
fn upsert_paid_sql() -> String {
    format!(
        r#"
        INSERT INTO accounts (email, paid_credits, is_active, expires_at)
        VALUES ($1, $2, TRUE, $3)
        ON CONFLICT (email) DO UPDATE SET
            paid_credits = accounts.paid_credits + EXCLUDED.paid_credits,
            is_active = TRUE,
            expires_at = GREATEST(accounts.expires_at, EXCLUDED.expires_at),
            updated_at = NOW()
        RETURNING {ACCOUNT_COLUMNS}
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::db::{create_pool, run_migrations};

    // Run with: DATABASE_URL=postgres://... cargo test -p creditgate-shared -- --ignored
    async fn store() -> Arc<PgAccountStore> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url, None).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(PgAccountStore::new(pool))
    }

    /// Tests share one database, so every key is unique per run
    fn unique(prefix: &str) -> String {
        format!("{}-{prefix}", Uuid::new_v4())
    }

    fn payment(event_id: Option<String>, email: &str, credits: i64) -> NewPayment {
        NewPayment {
            provider_event_id: event_id,
            email: email.to_string(),
            amount_cents: Some(500),
            credits_added: credits,
            activation_code: None,
        }
    }

    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_consume_paid_then_free_then_depleted() {
        let store = store().await;
        let email = unique("order@test.local");
        store.register_device(&email, &unique("dev"), 1).await.unwrap();
        store.grant_paid(&email, 1, None).await.unwrap();

        assert!(matches!(
            store.consume_one(&email).await.unwrap(),
            ConsumeOutcome::Consumed {
                source: CreditSource::Paid,
                balance: Balance { free: 1, paid: 0 },
            }
        ));
        assert!(matches!(
            store.consume_one(&email).await.unwrap(),
            ConsumeOutcome::Consumed {
                source: CreditSource::Free,
                balance: Balance { free: 0, paid: 0 },
            }
        ));
        assert_eq!(store.consume_one(&email).await.unwrap(), ConsumeOutcome::Depleted);
        assert_eq!(
            store.consume_one(&unique("ghost@test.local")).await.unwrap(),
            ConsumeOutcome::NotFound
        );
    }

    // =========================================================================
    // 12 concurrent consumes against 4 credits - the CHECK floor never trips
    // =========================================================================
    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_concurrent_consume_never_overspends() {
        let store = store().await;
        let email = unique("race@test.local");
        store.register_device(&email, &unique("dev"), 2).await.unwrap();
        store.grant_paid(&email, 2, None).await.unwrap();

        let barrier = Arc::new(Barrier::new(12));
        let mut handles = vec![];
        for _ in 0..12 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let email = email.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.consume_one(&email).await
            }));
        }

        let mut consumed = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ConsumeOutcome::Consumed { .. } => consumed += 1,
                ConsumeOutcome::Depleted => {}
                ConsumeOutcome::NotFound => panic!("account vanished"),
            }
        }

        assert_eq!(consumed, 4);
        let account = store.account(&email).await.unwrap().unwrap();
        assert_eq!(account.balance(), Balance { free: 0, paid: 0 });
    }

    // =========================================================================
    // Same provider event applied concurrently - one grant, one record
    // =========================================================================
    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_concurrent_payment_redelivery_applies_once() {
        let store = store().await;
        let email = unique("payer@test.local");
        let event_id = unique("WH");

        let barrier = Arc::new(Barrier::new(6));
        let mut handles = vec![];
        for _ in 0..6 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let new_payment = payment(Some(event_id.clone()), &email, 2000);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.apply_payment(new_payment, None).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if let PaymentOutcome::Applied { .. } = handle.await.unwrap().unwrap() {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        let account = store.account(&email).await.unwrap().unwrap();
        assert_eq!(account.paid_credits, 2000);
        assert!(account.is_active);

        let records = store.payments().await.unwrap();
        let matching = records
            .iter()
            .filter(|r| r.provider_event_id.as_deref() == Some(event_id.as_str()))
            .count();
        assert_eq!(matching, 1);
    }

    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_payments_without_event_id_are_not_deduplicated() {
        let store = store().await;
        let email = unique("anon@test.local");

        for _ in 0..2 {
            let outcome = store.apply_payment(payment(None, &email, 100), None).await.unwrap();
            assert!(matches!(outcome, PaymentOutcome::Applied { .. }));
        }
        assert_eq!(store.account(&email).await.unwrap().unwrap().paid_credits, 200);
    }

    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_device_binding_is_permanent() {
        let store = store().await;
        let owner = unique("owner@test.local");
        let other = unique("other@test.local");
        let device = unique("dev");

        let first = store.register_device(&owner, &device, 50).await.unwrap();
        assert!(first.is_new_device);

        let again = store.register_device(&other, &device, 50).await.unwrap();
        assert!(!again.is_new_device);
        assert_eq!(again.free_granted, 0);

        // The rolled-back claim leaves no account behind for the new email
        assert!(store.account(&other).await.unwrap().is_none());
        assert_eq!(store.account(&owner).await.unwrap().unwrap().free_credits, 50);
    }

    #[tokio::test]
    #[ignore = "requires database (DATABASE_URL)"]
    async fn test_refund_and_expiry_only_moves_forward() {
        let store = store().await;
        let email = unique("refund@test.local");
        let later = OffsetDateTime::now_utc() + time::Duration::days(30);
        let sooner = OffsetDateTime::now_utc() + time::Duration::days(5);

        store.grant_paid(&email, 1, Some(later)).await.unwrap();
        let account = store.grant_paid(&email, 1, Some(sooner)).await.unwrap();
        assert_eq!(account.paid_credits, 2);
        assert_eq!(
            account.expires_at.map(|t| t.unix_timestamp()),
            Some(later.unix_timestamp())
        );

        let refunded = store.refund_one(&email, CreditSource::Free).await.unwrap().unwrap();
        assert_eq!(refunded.free_credits, 1);
        assert!(store
            .refund_one(&unique("ghost@test.local"), CreditSource::Paid)
            .await
            .unwrap()
            .is_none());
    }
}
