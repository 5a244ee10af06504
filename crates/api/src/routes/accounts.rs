//! Registration, balance and renewal endpoints

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use creditgate_billing::ExpiryStatus;
use creditgate_shared::normalize_email;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ApiJson, ApiMessage, ApiResult};
use crate::state::AppState;

/// Below this many tokens the client is told to top up
const LOW_TOKEN_THRESHOLD: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub free_credits: i64,
    pub paid_credits: i64,
    pub is_new_device: bool,
    pub message: String,
}

/// POST /api/register
pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ApiResult<Response> {
    let email = normalize_email(&req.email);
    let device_id = req.device_id.trim();
    if email.is_empty() || device_id.is_empty() {
        return Ok(ApiMessage::failure("Email and deviceId are required").into_response());
    }

    let registration = state.ledger.register_device(&email, device_id).await?;
    let message = if registration.is_new_device {
        format!(
            "Welcome! {} free credits granted",
            registration.free_granted
        )
    } else {
        "Device already registered".to_string()
    };

    Ok(Json(RegisterResponse {
        success: true,
        free_credits: registration.free_granted,
        paid_credits: registration.paid_balance,
        is_new_device: registration.is_new_device,
        message,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRequest {
    pub email: String,
    /// Client-side token count; the server balance is used when absent
    #[serde(default)]
    pub token_balance: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub success: bool,
    pub status: &'static str,
    pub free: i64,
    pub paid: i64,
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiry_date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub show_payment_link: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusMessage {
    success: bool,
    status: &'static str,
    message: String,
    show_payment_link: bool,
}

/// POST /api/balance
pub async fn balance(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<BalanceRequest>,
) -> ApiResult<Response> {
    let email = normalize_email(&req.email);
    let Some(account) = state.ledger.account(&email).await? else {
        return Ok(Json(StatusMessage {
            success: false,
            status: "no_subscription",
            message: "No active subscription".to_string(),
            show_payment_link: true,
        })
        .into_response());
    };

    if account.is_expired(OffsetDateTime::now_utc()) {
        return Ok(Json(StatusMessage {
            success: false,
            status: "expired",
            message: "Your credits have expired. Buy credits again.".to_string(),
            show_payment_link: true,
        })
        .into_response());
    }

    let balance = account.balance();
    let tokens = req.token_balance.unwrap_or_else(|| balance.total());
    let (status, message) = if tokens < LOW_TOKEN_THRESHOLD {
        ("low_tokens", Some(format!("Only {tokens} tokens left! Buy more?")))
    } else {
        ("active", None)
    };

    Ok(Json(BalanceResponse {
        success: true,
        status,
        free: balance.free,
        paid: balance.paid,
        balance: balance.total(),
        expiry_date: account.expires_at,
        show_payment_link: message.is_some(),
        message,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryResponse {
    pub success: bool,
    pub needs_renewal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_reminder: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_left: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExpiryResponse {
    fn from_status(status: ExpiryStatus) -> Self {
        match status {
            ExpiryStatus::NoExpiry => Self {
                success: true,
                show_reminder: Some(false),
                ..Self::default()
            },
            ExpiryStatus::Expired => Self {
                success: true,
                needs_renewal: true,
                days_left: Some(0),
                message: Some("Your credits expired! Purchase again to continue.".to_string()),
                ..Self::default()
            },
            ExpiryStatus::ExpiringSoon { days_left } => Self {
                success: true,
                show_reminder: Some(true),
                days_left: Some(days_left),
                message: Some(format!("{days_left} days left! Renew soon.")),
                ..Self::default()
            },
            ExpiryStatus::Active { days_left } => Self {
                success: true,
                show_reminder: Some(false),
                days_left: Some(days_left),
                ..Self::default()
            },
        }
    }
}

/// POST /api/check-expiry
pub async fn check_expiry(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<EmailRequest>,
) -> ApiResult<Response> {
    let email = normalize_email(&req.email);
    let response = match state.ledger.check_expiry(&email, OffsetDateTime::now_utc()).await {
        Ok(status) => ExpiryResponse::from_status(status),
        Err(creditgate_billing::BillingError::AccountNotFound) => ExpiryResponse {
            message: Some("User not found".to_string()),
            ..ExpiryResponse::default()
        },
        Err(e) => return Err(e.into()),
    };
    Ok(Json(response).into_response())
}
