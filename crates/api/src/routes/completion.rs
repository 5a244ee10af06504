use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use creditgate_shared::{normalize_email, CreditSource};
use serde::{Deserialize, Serialize};

use crate::completion::ProxyOutcome;
use crate::error::{ApiJson, ApiMessage, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub email: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub success: bool,
    pub response: String,
    pub credit_source: CreditSource,
    pub free_credits: i64,
    pub paid_credits: i64,
}

/// POST /api/openai
pub async fn openai(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CompletionBody>,
) -> ApiResult<Response> {
    let email = normalize_email(&body.email);
    let outcome = state
        .completion
        .handle(&email, &body.prompt, body.model.as_deref())
        .await?;

    let response = match outcome {
        ProxyOutcome::Completed {
            response,
            source,
            balance,
        } => Json(CompletionResponse {
            success: true,
            response,
            credit_source: source,
            free_credits: balance.free,
            paid_credits: balance.paid,
        })
        .into_response(),
        ProxyOutcome::NotRegistered => {
            ApiMessage::failure("User not registered. Please register first.").into_response()
        }
        ProxyOutcome::Depleted => {
            ApiMessage::failure("No credits left. Please purchase more credits.").into_response()
        }
        ProxyOutcome::Unconfigured => {
            ApiMessage::failure("AI service is not configured").into_response()
        }
        ProxyOutcome::Invalid(reason) => ApiMessage::failure(reason).into_response(),
        ProxyOutcome::UpstreamFailed { message, .. } => {
            ApiMessage::failure(format!("AI request failed: {message}")).into_response()
        }
    };
    Ok(response)
}
