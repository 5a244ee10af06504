use std::sync::Arc;

use creditgate_billing::{BillingError, BillingResult, CreditLedger};
use creditgate_shared::{Balance, CreditSource};

use super::{CompletionRequest, CompletionService};

/// Result of one proxied completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    Completed {
        response: String,
        source: CreditSource,
        balance: Balance,
    },
    NotRegistered,
    Depleted,
    /// No completion service configured; nothing was charged
    Unconfigured,
    Invalid(String),
    /// The credit stays spent unless refunds are enabled
    UpstreamFailed { message: String, refunded: bool },
}

pub struct CompletionProxy {
    ledger: CreditLedger,
    service: Option<Arc<dyn CompletionService>>,
    default_model: String,
    refund_on_error: bool,
}

impl CompletionProxy {
    pub fn new(
        ledger: CreditLedger,
        service: Option<Arc<dyn CompletionService>>,
        default_model: impl Into<String>,
        refund_on_error: bool,
    ) -> Self {
        Self {
            ledger,
            service,
            default_model: default_model.into(),
            refund_on_error,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.service.is_some()
    }

    /// Check and charge the account, then forward the prompt. Store failures
    /// are the only errors; everything else is a [`ProxyOutcome`].
    pub async fn handle(
        &self,
        email: &str,
        prompt: &str,
        model: Option<&str>,
    ) -> BillingResult<ProxyOutcome> {
        if email.is_empty() {
            return Ok(ProxyOutcome::Invalid("Email is required".to_string()));
        }
        if prompt.trim().is_empty() {
            return Ok(ProxyOutcome::Invalid("Prompt is required".to_string()));
        }
        let Some(service) = &self.service else {
            return Ok(ProxyOutcome::Unconfigured);
        };

        if self.ledger.account(email).await?.is_none() {
            return Ok(ProxyOutcome::NotRegistered);
        }

        let consumed = match self.ledger.consume_one_credit(email).await {
            Ok(consumed) => consumed,
            Err(BillingError::Depleted) => {
                tracing::info!(email = %email, "Completion refused, no credits left");
                return Ok(ProxyOutcome::Depleted);
            }
            Err(BillingError::AccountNotFound) => return Ok(ProxyOutcome::NotRegistered),
            Err(e) => return Err(e),
        };

        let request = CompletionRequest {
            model: model
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(&self.default_model)
                .to_string(),
            prompt: prompt.to_string(),
        };

        match service.complete(&request).await {
            Ok(response) => {
                tracing::debug!(email = %email, model = %request.model, "Completion served");
                Ok(ProxyOutcome::Completed {
                    response,
                    source: consumed.source,
                    balance: consumed.balance,
                })
            }
            Err(e) => {
                let message = match e {
                    BillingError::Upstream(message) => message,
                    other => other.to_string(),
                };
                let refunded = self.refund_on_error && self.refund(email, consumed.source).await;
                tracing::warn!(
                    email = %email,
                    error = %message,
                    refunded,
                    "Completion service failed"
                );
                Ok(ProxyOutcome::UpstreamFailed { message, refunded })
            }
        }
    }

    async fn refund(&self, email: &str, source: CreditSource) -> bool {
        match self.ledger.refund_credit(email, source).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(email = %email, error = %e, "Failed to refund credit");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use creditgate_billing::LedgerConfig;
    use creditgate_shared::InMemoryAccountStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Echoes the prompt, or fails when the prompt says so
    #[derive(Default)]
    struct EchoService {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionService for EchoService {
        async fn complete(&self, request: &CompletionRequest) -> BillingResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt == "fail" {
                return Err(BillingError::Upstream("model overloaded".to_string()));
            }
            Ok(format!("{}: {}", request.model, request.prompt))
        }
    }

    async fn setup(refund: bool) -> (CompletionProxy, CreditLedger, Arc<EchoService>) {
        let ledger = CreditLedger::new(
            Arc::new(InMemoryAccountStore::new()),
            LedgerConfig {
                free_credits: 2,
                validity_days: Some(30),
            },
        );
        ledger.register_device("a@x.com", "dev1").await.unwrap();
        let service = Arc::new(EchoService::default());
        let proxy = CompletionProxy::new(
            ledger.clone(),
            Some(service.clone()),
            "gpt-3.5-turbo",
            refund,
        );
        (proxy, ledger, service)
    }

    #[tokio::test]
    async fn test_completion_charges_one_credit() {
        let (proxy, ledger, _) = setup(false).await;
        let outcome = proxy.handle("a@x.com", "hi", None).await.unwrap();
        assert_eq!(
            outcome,
            ProxyOutcome::Completed {
                response: "gpt-3.5-turbo: hi".to_string(),
                source: CreditSource::Free,
                balance: Balance { free: 1, paid: 0 },
            }
        );
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 1);
    }

    #[tokio::test]
    async fn test_requested_model_is_forwarded() {
        let (proxy, _, _) = setup(false).await;
        match proxy.handle("a@x.com", "hi", Some("gpt-4o")).await.unwrap() {
            ProxyOutcome::Completed { response, .. } => assert_eq!(response, "gpt-4o: hi"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_not_forwarded() {
        let (proxy, _, service) = setup(false).await;
        assert_eq!(
            proxy.handle("ghost@x.com", "hi", None).await.unwrap(),
            ProxyOutcome::NotRegistered
        );
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_depleted_not_forwarded() {
        let (proxy, _, service) = setup(false).await;
        proxy.handle("a@x.com", "one", None).await.unwrap();
        proxy.handle("a@x.com", "two", None).await.unwrap();
        assert_eq!(
            proxy.handle("a@x.com", "three", None).await.unwrap(),
            ProxyOutcome::Depleted
        );
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_credit_spent_by_default() {
        let (proxy, ledger, _) = setup(false).await;
        let outcome = proxy.handle("a@x.com", "fail", None).await.unwrap();
        assert_eq!(
            outcome,
            ProxyOutcome::UpstreamFailed {
                message: "model overloaded".to_string(),
                refunded: false,
            }
        );
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_refunded_when_enabled() {
        let (proxy, ledger, _) = setup(true).await;
        let outcome = proxy.handle("a@x.com", "fail", None).await.unwrap();
        assert!(matches!(outcome, ProxyOutcome::UpstreamFailed { refunded: true, .. }));
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 2);
    }

    #[tokio::test]
    async fn test_unconfigured_charges_nothing() {
        let ledger =
            CreditLedger::new(Arc::new(InMemoryAccountStore::new()), LedgerConfig::default());
        ledger.register_device("a@x.com", "dev1").await.unwrap();
        let proxy = CompletionProxy::new(ledger.clone(), None, "gpt-3.5-turbo", false);

        assert!(!proxy.is_configured());
        assert_eq!(
            proxy.handle("a@x.com", "hi", None).await.unwrap(),
            ProxyOutcome::Unconfigured
        );
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 50);
    }

    #[tokio::test]
    async fn test_blank_prompt_is_invalid() {
        let (proxy, ledger, _) = setup(false).await;
        assert!(matches!(
            proxy.handle("a@x.com", "   ", None).await.unwrap(),
            ProxyOutcome::Invalid(_)
        ));
        assert_eq!(ledger.get_balance("a@x.com").await.unwrap().free, 2);
    }
}
