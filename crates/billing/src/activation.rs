//! Activation codes
//!
//! An activation code is a self-contained, reversible encoding of an
//! [`Entitlement`]: anyone holding the code can read its fields, nothing is
//! encrypted or signed. Being decodable is therefore never enough to redeem a
//! code; [`redeem`] additionally requires an active account for its email.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use creditgate_shared::normalize_email;

use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedger;

/// Entitlement data carried by an activation code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Entitlement {
    pub email: String,
    pub tokens: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub purchase_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    pub is_active: bool,
}

impl Entitlement {
    /// Active entitlement purchased at `now`, valid for `validity_days`
    pub fn issue(
        email: impl Into<String>,
        tokens: u32,
        now: OffsetDateTime,
        validity_days: i64,
    ) -> Self {
        Self {
            email: email.into(),
            tokens,
            purchase_date: now,
            expiry_date: now + Duration::days(validity_days),
            is_active: true,
        }
    }
}

pub trait ActivationCodec: Send + Sync {
    fn encode(&self, entitlement: &Entitlement) -> BillingResult<String>;

    /// Never panics; any malformed input is [`BillingError::FormatError`]
    fn decode(&self, code: &str) -> BillingResult<Entitlement>;
}

/// Standard base64 over compact JSON, the format existing codes were issued in
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64JsonCodec;

impl ActivationCodec for Base64JsonCodec {
    fn encode(&self, entitlement: &Entitlement) -> BillingResult<String> {
        let json = serde_json::to_vec(entitlement)
            .map_err(|e| BillingError::Config(format!("entitlement not serializable: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    fn decode(&self, code: &str) -> BillingResult<Entitlement> {
        let bytes = STANDARD.decode(code.trim()).map_err(|e| {
            tracing::debug!(error = %e, "Activation code is not valid base64");
            BillingError::FormatError
        })?;
        let entitlement: Entitlement = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::debug!(error = %e, "Activation code payload is not an entitlement");
            BillingError::FormatError
        })?;
        if entitlement.email.trim().is_empty() {
            return Err(BillingError::FormatError);
        }
        Ok(entitlement)
    }
}

/// Result of presenting an activation code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    Accepted {
        entitlement: Entitlement,
        /// The backing account's expiry, which is authoritative over the
        /// date carried in the code. `None` when the account never expires.
        expires_at: Option<OffsetDateTime>,
    },
    /// Decodable, but no active account backs it
    Rejected,
}

/// Decode `code` and accept it iff an account with the code's email exists
/// and is active. One-time use is not tracked.
pub async fn redeem(
    codec: &dyn ActivationCodec,
    ledger: &CreditLedger,
    code: &str,
) -> BillingResult<Redemption> {
    let entitlement = codec.decode(code)?;
    let email = normalize_email(&entitlement.email);
    let account = ledger.account(&email).await?.filter(|a| a.is_active);

    match account {
        Some(account) => {
            tracing::info!(email = %email, tokens = entitlement.tokens, "Activation code redeemed");
            Ok(Redemption::Accepted {
                entitlement,
                expires_at: account.expires_at,
            })
        }
        None => {
            tracing::info!(email = %email, "Activation code rejected: no active account");
            Ok(Redemption::Rejected)
        }
    }
}
