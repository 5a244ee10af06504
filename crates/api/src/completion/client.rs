//! OpenAI chat completions client

use std::time::Duration;

use async_trait::async_trait;
use creditgate_billing::{BillingError, BillingResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionRequest, CompletionService};
use crate::config::OpenAiConfig;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    system_prompt: String,
    max_tokens: u32,
}

impl OpenAiClient {
    /// `None` when no API key is configured
    pub fn from_config(config: &OpenAiConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(Self {
            http,
            api_key,
            base_url: config.base_url.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
        }))
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> BillingResult<String> {
        let body = ChatRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BillingError::Upstream("AI service timed out".to_string())
                } else {
                    BillingError::Upstream(format!("AI service unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("AI service returned {status}"));
            tracing::warn!(status = %status, message = %message, "Completion request failed");
            return Err(BillingError::Upstream(message));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Upstream(format!("invalid AI service response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BillingError::Upstream("AI service returned no completion".to_string()))
    }
}
