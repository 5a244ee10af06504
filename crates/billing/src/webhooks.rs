//! PayPal webhook handling
//!
//! Turns a completed-payment notification into a credit grant, a payment log
//! entry and a queued activation email. The provider's retry contract means
//! every outcome, including internal failures, is acknowledged with 200; the
//! [`WebhookOutcome`] only decides the status text and what gets logged.

use std::sync::Arc;

use creditgate_shared::{normalize_email, NewPayment, PaymentOutcome};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activation::{ActivationCodec, Entitlement};
use crate::email::{ActivationNotice, NotificationDispatcher};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{CreditLedger, DEFAULT_VALIDITY_DAYS};
use crate::packages::{parse_amount_cents, CreditPolicy};
use crate::verify::{EventVerifier, TransmissionHeaders};

/// Event types that mean money has actually moved
pub const COMPLETED_EVENT_TYPES: [&str; 2] =
    ["PAYMENT.SALE.COMPLETED", "PAYMENT.CAPTURE.COMPLETED"];

/// The parts of a PayPal webhook event the handler reads
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalEvent {
    #[serde(default)]
    pub id: Option<String>,
    /// Empty when the payload carries none; such events are ignored
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub resource: Value,
}

impl PayPalEvent {
    pub fn is_payment_completed(&self) -> bool {
        COMPLETED_EVENT_TYPES.contains(&self.event_type.as_str())
    }

    /// Payer email; sale, capture and legacy IPN-style resources keep it in
    /// different places
    pub fn payer_email(&self) -> Option<String> {
        let r = &self.resource;
        [
            &r["payer"]["email_address"],
            &r["payer"]["payer_info"]["email"],
            &r["payer_email"],
        ]
        .into_iter()
        .find_map(|v| v.as_str())
        .map(normalize_email)
        .filter(|email| !email.is_empty())
    }

    /// Paid amount in cents. `Ok(None)` when absent, an error when present
    /// but not a valid amount.
    pub fn amount_cents(&self) -> BillingResult<Option<i64>> {
        let amount = &self.resource["amount"];
        let raw = match (&amount["total"], &amount["value"]) {
            (Value::Null, Value::Null) => return Ok(None),
            (Value::Null, v) | (v, _) => v,
        };
        let parsed = match raw {
            Value::String(s) => parse_amount_cents(s),
            Value::Number(n) => parse_amount_cents(&n.to_string()),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| BillingError::MalformedEvent(format!("invalid amount: {raw}")))
    }

    /// Key used to apply each payment at most once
    pub fn dedupe_key(&self) -> Option<String> {
        self.id
            .clone()
            .or_else(|| self.resource["id"].as_str().map(str::to_string))
    }
}

/// What happened to one webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Not a payment completion; nothing changed
    Ignored,
    Credited {
        email: String,
        credits: u32,
        payment_id: Uuid,
    },
    /// Already applied earlier
    Duplicate,
    /// Failed authenticity verification
    Rejected,
    Malformed(String),
    /// Internal failure, logged and swallowed
    Failed(String),
}

impl WebhookOutcome {
    /// Short body for the 200 acknowledgement
    pub fn status_text(&self) -> &'static str {
        match self {
            WebhookOutcome::Credited { .. } => "OK",
            WebhookOutcome::Ignored => "Event ignored",
            WebhookOutcome::Duplicate => "Duplicate event",
            WebhookOutcome::Rejected => "Event rejected",
            WebhookOutcome::Malformed(_) => "Malformed event",
            WebhookOutcome::Failed(_) => "Error logged",
        }
    }
}

/// Payment Event Handler
pub struct WebhookHandler {
    ledger: CreditLedger,
    policy: CreditPolicy,
    codec: Arc<dyn ActivationCodec>,
    verifier: Arc<dyn EventVerifier>,
    notifications: NotificationDispatcher,
}

impl WebhookHandler {
    pub fn new(
        ledger: CreditLedger,
        policy: CreditPolicy,
        codec: Arc<dyn ActivationCodec>,
        verifier: Arc<dyn EventVerifier>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            ledger,
            policy,
            codec,
            verifier,
            notifications,
        }
    }

    pub fn policy(&self) -> &CreditPolicy {
        &self.policy
    }

    /// Process one raw delivery. Never fails; see [`WebhookOutcome`].
    pub async fn handle(&self, headers: &TransmissionHeaders, body: &[u8]) -> WebhookOutcome {
        let outcome = self.handle_inner(headers, body).await;
        match &outcome {
            WebhookOutcome::Credited {
                email,
                credits,
                payment_id,
            } => tracing::info!(
                email = %email,
                credits = credits,
                payment_id = %payment_id,
                "Payment webhook processed"
            ),
            WebhookOutcome::Ignored => tracing::debug!("Payment webhook ignored"),
            WebhookOutcome::Duplicate => tracing::info!("Duplicate payment webhook acknowledged"),
            WebhookOutcome::Rejected => {
                tracing::warn!(
                    transmission_id = ?headers.transmission_id,
                    "Payment webhook failed verification"
                )
            }
            WebhookOutcome::Malformed(reason) => {
                tracing::warn!(reason = %reason, "Malformed payment webhook")
            }
            WebhookOutcome::Failed(error) => {
                tracing::error!(
                    error = %error,
                    "Payment webhook processing failed, acknowledged anyway"
                )
            }
        }
        outcome
    }

    async fn handle_inner(&self, headers: &TransmissionHeaders, body: &[u8]) -> WebhookOutcome {
        let raw: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return WebhookOutcome::Malformed(format!("invalid JSON: {e}")),
        };
        let event: PayPalEvent = match serde_json::from_value(raw.clone()) {
            Ok(e) => e,
            Err(e) => return WebhookOutcome::Malformed(format!("not a PayPal event: {e}")),
        };

        tracing::info!(
            event_id = ?event.id,
            event_type = %event.event_type,
            "Payment webhook received"
        );

        if !event.is_payment_completed() {
            return WebhookOutcome::Ignored;
        }

        match self.verifier.verify(headers, &raw).await {
            Ok(true) => {}
            Ok(false) => return WebhookOutcome::Rejected,
            Err(e) => return WebhookOutcome::Failed(e.to_string()),
        }

        match self.credit(&event).await {
            Ok(outcome) => outcome,
            Err(BillingError::MalformedEvent(reason)) => WebhookOutcome::Malformed(reason),
            Err(e) => WebhookOutcome::Failed(e.to_string()),
        }
    }

    async fn credit(&self, event: &PayPalEvent) -> BillingResult<WebhookOutcome> {
        let email = event
            .payer_email()
            .ok_or_else(|| BillingError::MalformedEvent("missing payer email".to_string()))?;
        let amount_cents = event.amount_cents()?;
        let grant = self.policy.grant_for(amount_cents).ok_or_else(|| {
            BillingError::MalformedEvent("missing amount for tiered packages".to_string())
        })?;

        // Codes always carry an expiry date. With expiry disabled the account
        // has none and redemption reports the account's, so the date here is
        // only a nominal one.
        let now = OffsetDateTime::now_utc();
        let validity_days = self
            .ledger
            .config()
            .validity_days
            .unwrap_or(DEFAULT_VALIDITY_DAYS);
        let entitlement = Entitlement::issue(email.clone(), grant.credits, now, validity_days);
        let activation_code = self.codec.encode(&entitlement)?;

        let outcome = self
            .ledger
            .apply_payment(NewPayment {
                provider_event_id: event.dedupe_key(),
                email: email.clone(),
                amount_cents,
                credits_added: i64::from(grant.credits),
                activation_code: Some(activation_code.clone()),
            })
            .await?;

        let (account, record) = match outcome {
            PaymentOutcome::Applied { account, record } => (account, record),
            PaymentOutcome::Duplicate => return Ok(WebhookOutcome::Duplicate),
        };

        tracing::info!(
            email = %email,
            package = %grant.package,
            amount_cents = ?amount_cents,
            "Payment received"
        );

        self.notifications.enqueue(ActivationNotice {
            email: email.clone(),
            activation_code,
            credits: grant.credits,
            expires_at: account.expires_at,
        });

        Ok(WebhookOutcome::Credited {
            email,
            credits: grant.credits,
            payment_id: record.id,
        })
    }
}
