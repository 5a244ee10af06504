//! PayPal webhook endpoint
//!
//! Always answers 200 so PayPal stops retrying; the body is a short status.

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};
use creditgate_billing::TransmissionHeaders;

use crate::state::AppState;

pub async fn paypal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let transmission = TransmissionHeaders::from_header_map(&headers);
    let outcome = state.webhooks.handle(&transmission, &body).await;
    (StatusCode::OK, outcome.status_text())
}
