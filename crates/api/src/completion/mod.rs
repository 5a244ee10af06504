//! Completion Proxy
//!
//! Forwards user prompts to an external chat completion service, charging one
//! credit per request through the ledger.

mod client;
mod proxy;

use async_trait::async_trait;
use creditgate_billing::BillingResult;

pub use client::OpenAiClient;
pub use proxy::{CompletionProxy, ProxyOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Completion text, or [`creditgate_billing::BillingError::Upstream`]
    async fn complete(&self, request: &CompletionRequest) -> BillingResult<String>;
}
