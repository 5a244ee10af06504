use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "creditgate",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// Liveness including the account store
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok", "store": "ok"}))),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "store": "unavailable"})),
            )
        }
    }
}
