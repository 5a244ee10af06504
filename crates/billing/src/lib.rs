// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries upstream error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CreditGate Billing Module
//!
//! Credit accounting and PayPal payment intake.
//!
//! ## Features
//!
//! - **Credit Ledger**: Device registration, free grants, atomic per-request deduction
//! - **Packages**: Paid amount to credit grant mapping (tiered or fixed pack)
//! - **Webhooks**: Exactly-once handling of PayPal payment completions
//! - **Activation Codes**: Portable, decodable entitlement codes
//! - **Email Notifications**: Best-effort activation code delivery

pub mod activation;
pub mod email;
pub mod error;
pub mod ledger;
pub mod packages;
pub mod verify;
pub mod webhooks;


// Activation
pub use activation::{redeem, ActivationCodec, Base64JsonCodec, Entitlement, Redemption};

// Email
pub use email::{
    ActivationNotice, EmailConfig, LogNotifier, NotificationDispatcher, NotificationFailure,
    Notifier, SendGridNotifier,
};

// Error
pub use error::{BillingError, BillingResult};

// Ledger
pub use ledger::{
    Consumed, CreditLedger, ExpiryStatus, LedgerConfig, DEFAULT_FREE_CREDITS,
    DEFAULT_VALIDITY_DAYS, RENEWAL_REMINDER_DAYS,
};

// Packages
pub use packages::{parse_amount_cents, CreditGrant, CreditPolicy, Package};

// Verification
pub use verify::{
    AcceptAllVerifier, EventVerifier, PayPalConfig, PayPalVerifier, TransmissionHeaders,
};

// Webhooks
pub use webhooks::{PayPalEvent, WebhookHandler, WebhookOutcome, COMPLETED_EVENT_TYPES};
