//! Activation code endpoints

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use creditgate_billing::{redeem, Entitlement, Redemption, DEFAULT_VALIDITY_DAYS};
use creditgate_shared::normalize_email;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ApiJson, ApiMessage, ApiResult};
use crate::state::AppState;

const DEFAULT_MANUAL_TOKENS: u32 = 2000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub activation_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub success: bool,
    pub tokens: u32,
    /// Null when the account never expires
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiry_date: Option<OffsetDateTime>,
    pub message: String,
}

/// POST /api/activate
pub async fn activate(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ActivateRequest>,
) -> ApiResult<Response> {
    match redeem(state.codec.as_ref(), &state.ledger, &req.activation_code).await? {
        Redemption::Accepted {
            entitlement,
            expires_at,
        } => {
            let validity = match expires_at {
                Some(expiry) => format!("Valid until {}", expiry.date()),
                None => "No expiry".to_string(),
            };
            Ok(Json(ActivateResponse {
                success: true,
                tokens: entitlement.tokens,
                expiry_date: expires_at,
                message: format!("{} tokens activated! {validity}", entitlement.tokens),
            })
            .into_response())
        }
        Redemption::Rejected => {
            Ok(ApiMessage::failure("Invalid or expired activation code").into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ManualActivateRequest {
    pub email: String,
    #[serde(default)]
    pub tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualActivateResponse {
    pub success: bool,
    pub activation_code: String,
    pub message: String,
}

/// POST /api/manual-activate, mounted only when manual activation is enabled.
/// Issues a code without granting credits.
pub async fn manual_activate(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ManualActivateRequest>,
) -> ApiResult<Response> {
    let email = normalize_email(&req.email);
    if email.is_empty() {
        return Ok(ApiMessage::failure("Email is required").into_response());
    }

    let tokens = req.tokens.unwrap_or(DEFAULT_MANUAL_TOKENS);
    // Nominal date when expiry is disabled; redemption reports the account's
    let validity_days = state.config.validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS);
    let entitlement = Entitlement::issue(email, tokens, OffsetDateTime::now_utc(), validity_days);
    let code = state.codec.encode(&entitlement)?;

    tracing::info!(email = %entitlement.email, tokens, "Manual activation code issued");

    Ok(Json(ManualActivateResponse {
        success: true,
        message: format!("Use this code in the extension: {code}"),
        activation_code: code,
    })
    .into_response())
}
