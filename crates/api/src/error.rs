//! API error handling
//!
//! Credit and balance failures are business outcomes: they go out as HTTP 200
//! with `success: false` and a human-readable message. Only malformed requests
//! and admin authentication use non-200 statuses.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use creditgate_billing::BillingError;
use serde::Serialize;

const FALLBACK_FAILURE_MESSAGE: &str = "Request failed";

/// `{success, message}` body. A failure always carries a non-empty message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            FALLBACK_FAILURE_MESSAGE.to_string()
        } else {
            message
        };
        Self {
            success: false,
            message,
        }
    }
}

impl IntoResponse for ApiMessage {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl ApiError {
    /// Message shown to the client. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::AccountNotFound => "User not registered".to_string(),
                BillingError::Depleted => {
                    "No credits left. Please purchase more credits.".to_string()
                }
                BillingError::FormatError => "Invalid activation code format".to_string(),
                BillingError::MalformedEvent(reason) => format!("Malformed event: {reason}"),
                BillingError::Upstream(message) => message.clone(),
                BillingError::StoreUnavailable(_) => {
                    "Service temporarily unavailable, please try again".to_string()
                }
                BillingError::Database(_)
                | BillingError::Config(_)
                | BillingError::Notification(_) => "Internal error".to_string(),
            },
            ApiError::InvalidRequest(reason) => reason.clone(),
            ApiError::Unauthorized => "Unauthorized".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(_) => StatusCode::OK,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Billing(
                BillingError::Database(_)
                | BillingError::Config(_)
                | BillingError::Notification(_)
                | BillingError::StoreUnavailable(_),
            ) => tracing::error!(error = %self, "Request failed"),
            _ => tracing::debug!(error = %self, "Request rejected"),
        }
        (self.status(), ApiMessage::failure(self.user_message())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// JSON body extractor whose rejections use the `{success, message}` shape
#[derive(Debug, Clone, axum::extract::FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_never_empty() {
        assert_eq!(ApiMessage::failure("").message, "Request failed");
        assert_eq!(ApiMessage::failure("  ").message, "Request failed");
        assert_eq!(ApiMessage::failure("nope").message, "nope");
        assert!(!ApiMessage::failure("nope").success);
    }

    #[test]
    fn test_business_errors_are_200() {
        for e in [
            BillingError::AccountNotFound,
            BillingError::Depleted,
            BillingError::FormatError,
            BillingError::StoreUnavailable("down".to_string()),
            BillingError::Upstream("timeout".to_string()),
        ] {
            let err = ApiError::from(e);
            assert_eq!(err.status(), StatusCode::OK);
            assert!(!err.user_message().is_empty());
        }
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ApiError::from(BillingError::Database(
            "relation accounts does not exist".to_string(),
        ));
        assert_eq!(err.user_message(), "Internal error");
    }
}
