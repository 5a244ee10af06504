//! Account and payment data model shared by the store, ledger and API.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Canonical form of an account email: trimmed and lowercased, so a PayPal
/// payer address and a client-supplied address land on the same account
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Persistent credit balance for one account (keyed by email)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    /// One-time grant, handed out once per newly registered device
    pub free_credits: i64,
    /// Purchased credits, incremented by completed payments
    pub paid_credits: i64,
    /// Set once the account has received a paid grant
    pub is_active: bool,
    /// End of the paid entitlement window, if any payment set one
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Immutable after insert
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// Fresh account with zero balances
    pub fn new(email: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            email: email.into(),
            free_credits: 0,
            paid_credits: 0,
            is_active: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance(&self) -> Balance {
        Balance {
            free: self.free_credits,
            paid: self.paid_credits,
        }
    }

    /// True when an expiry is set and has passed
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expiry| now > expiry)
    }
}

/// Device registration row. A device id belongs to exactly one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub free: i64,
    pub paid: i64,
}

impl Balance {
    pub fn total(&self) -> i64 {
        self.free + self.paid
    }
}

/// Which pool a consumed credit came out of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditSource {
    Paid,
    Free,
}

impl std::fmt::Display for CreditSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreditSource::Paid => write!(f, "paid"),
            CreditSource::Free => write!(f, "free"),
        }
    }
}

/// Result of registering a device against an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub free_granted: i64,
    pub paid_balance: i64,
    pub is_new_device: bool,
}

/// Outcome of an atomic single-credit deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { source: CreditSource, balance: Balance },
    Depleted,
    NotFound,
}

/// Append-only payment log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    #[serde(rename = "paymentId")]
    pub id: Uuid,
    /// Provider event id, used to reject replays
    pub provider_event_id: Option<String>,
    pub email: String,
    pub amount_cents: Option<i64>,
    pub credits_added: i64,
    pub activation_code: Option<String>,
    #[serde(rename = "date", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Insert shape for a payment grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub provider_event_id: Option<String>,
    pub email: String,
    pub amount_cents: Option<i64>,
    pub credits_added: i64,
    pub activation_code: Option<String>,
}

impl NewPayment {
    pub fn into_record(self, now: OffsetDateTime) -> PaymentRecord {
        PaymentRecord {
            id: Uuid::new_v4(),
            provider_event_id: self.provider_event_id,
            email: self.email,
            amount_cents: self.amount_cents,
            credits_added: self.credits_added,
            activation_code: self.activation_code,
            created_at: now,
        }
    }
}

/// Result of applying a payment exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Applied {
        account: Account,
        record: PaymentRecord,
    },
    /// The provider event was already applied; nothing changed
    Duplicate,
}
