//! Application state

use std::sync::Arc;

use creditgate_billing::{
    AcceptAllVerifier, ActivationCodec, Base64JsonCodec, CreditLedger, EventVerifier,
    NotificationDispatcher, PayPalVerifier, WebhookHandler,
};
use creditgate_shared::AccountStore;
use reqwest::Client;

use crate::{
    completion::{CompletionProxy, CompletionService, OpenAiClient},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: CreditLedger,
    pub webhooks: Arc<WebhookHandler>,
    pub codec: Arc<dyn ActivationCodec>,
    pub completion: Arc<CompletionProxy>,
}

impl AppState {
    /// Build the state, choosing each collaborator from the configuration
    pub fn new(
        store: Arc<dyn AccountStore>,
        config: Config,
        notifications: NotificationDispatcher,
        http_client: Client,
    ) -> anyhow::Result<Self> {
        let verifier: Arc<dyn EventVerifier> = match config.paypal_config() {
            Some(paypal) => {
                tracing::info!(api_url = %paypal.api_url, "PayPal webhook verification enabled");
                Arc::new(PayPalVerifier::new(paypal, http_client))
            }
            None => {
                tracing::warn!(
                    "PayPal webhook verification not configured (missing PAYPAL_* credentials)"
                );
                Arc::new(AcceptAllVerifier)
            }
        };

        let completion: Option<Arc<dyn CompletionService>> =
            match OpenAiClient::from_config(&config.openai)? {
                Some(client) => {
                    tracing::info!(
                        base_url = %config.openai.base_url,
                        model = %config.openai.default_model,
                        timeout_secs = config.openai.timeout_secs,
                        "Completion service enabled"
                    );
                    Some(Arc::new(client))
                }
                None => {
                    tracing::warn!("Completion service not configured (missing OPENAI_API_KEY)");
                    None
                }
            };

        Ok(Self::from_parts(store, config, notifications, verifier, completion))
    }

    /// Build the state from explicit collaborators
    pub fn from_parts(
        store: Arc<dyn AccountStore>,
        config: Config,
        notifications: NotificationDispatcher,
        verifier: Arc<dyn EventVerifier>,
        completion: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        let ledger = CreditLedger::new(store, config.ledger_config());
        let codec: Arc<dyn ActivationCodec> = Arc::new(Base64JsonCodec);

        let webhooks = Arc::new(WebhookHandler::new(
            ledger.clone(),
            config.credit_policy.clone(),
            codec.clone(),
            verifier,
            notifications,
        ));
        tracing::info!(policy = ?config.credit_policy, "Payment webhook handler initialized");

        let completion = Arc::new(CompletionProxy::new(
            ledger.clone(),
            completion,
            config.openai.default_model.clone(),
            config.refund_on_upstream_error,
        ));
        if config.refund_on_upstream_error {
            tracing::info!("Credits are refunded when the completion service fails");
        }

        if config.enable_manual_activation {
            tracing::warn!("Manual activation endpoint enabled (ENABLE_MANUAL_ACTIVATION=true)");
        }

        Self {
            config: Arc::new(config),
            ledger,
            webhooks,
            codec,
            completion,
        }
    }
}
