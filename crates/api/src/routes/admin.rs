//! Admin payment log

use axum::{extract::State, http::HeaderMap, Json};
use creditgate_shared::PaymentRecord;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub total: usize,
    pub payments: Vec<PaymentRecord>,
}

/// GET /api/admin/payments, newest first
pub async fn payments(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<PaymentsResponse>> {
    if let Some(expected) = &state.config.admin_token {
        let provided = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !token_matches(provided, expected) {
            tracing::warn!("Admin payments request with invalid token");
            return Err(ApiError::Unauthorized);
        }
    }

    let payments = state.ledger.payments().await?;
    Ok(Json(PaymentsResponse {
        total: payments.len(),
        payments,
    }))
}

fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
