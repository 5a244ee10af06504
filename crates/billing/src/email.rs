//! Activation email delivery
//!
//! Notification is best-effort: a payment is acknowledged and credited no
//! matter what happens here. Notices are queued onto a
//! [`NotificationDispatcher`], delivered by a background task, and failures
//! are logged and published on a broadcast channel instead of reaching the
//! request that queued them.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{BillingError, BillingResult};

const SENDGRID_API_URL: &str = "https://api.sendgrid.com";
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Everything needed to tell a buyer about their credits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationNotice {
    pub email: String,
    pub activation_code: String,
    pub credits: u32,
    pub expires_at: Option<OffsetDateTime>,
}

impl ActivationNotice {
    pub fn subject(&self) -> String {
        format!("Your activation code - {} tokens", self.credits)
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "Thank you for your purchase!\n\n\
             Your activation code:\n\n{}\n\n\
             Tokens: {}\n",
            self.activation_code, self.credits
        );
        if let Some(expiry) = self.expires_at {
            body.push_str(&format!("Valid until: {}\n", expiry.date()));
        }
        body.push_str("\nPaste the code into the extension to activate your tokens.\n");
        body
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_activation(&self, notice: &ActivationNotice) -> BillingResult<()>;
}

/// Email configuration for SendGrid delivery
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
    /// Override for tests and regional endpoints
    pub api_url: String,
}

impl EmailConfig {
    pub fn new(api_key: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from_address: from_address.into(),
            api_url: SENDGRID_API_URL.to_string(),
        }
    }
}

/// Sends activation emails through the SendGrid v3 mail API
#[derive(Clone)]
pub struct SendGridNotifier {
    config: EmailConfig,
    http: Client,
}

impl SendGridNotifier {
    pub fn new(config: EmailConfig, http: Client) -> Self {
        Self { config, http }
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    async fn send_activation(&self, notice: &ActivationNotice) -> BillingResult<()> {
        let payload = json!({
            "personalizations": [{ "to": [{ "email": notice.email }] }],
            "from": { "email": self.config.from_address },
            "subject": notice.subject(),
            "content": [{ "type": "text/plain", "value": notice.body() }],
        });

        let response = self
            .http
            .post(format!("{}/v3/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "SendGrid returned {status}: {body}"
            )));
        }

        tracing::info!(email = %notice.email, "Activation email sent");
        Ok(())
    }
}

/// Fallback when no email transport is configured: log the code so an
/// operator can deliver it by hand
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_activation(&self, notice: &ActivationNotice) -> BillingResult<()> {
        tracing::warn!(
            email = %notice.email,
            activation_code = %notice.activation_code,
            credits = notice.credits,
            "Email not configured - deliver activation code manually"
        );
        Ok(())
    }
}

/// A notice that could not be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFailure {
    pub email: String,
    pub error: String,
}

/// Queue in front of a [`Notifier`], drained by one background task
#[derive(Clone)]
pub struct NotificationDispatcher {
    queue: mpsc::Sender<ActivationNotice>,
    failures: broadcast::Sender<NotificationFailure>,
}

impl NotificationDispatcher {
    pub fn spawn(notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(notifier, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<ActivationNotice>(capacity);
        let (failures, _) = broadcast::channel(capacity);

        let failure_tx = failures.clone();
        let handle = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                if let Err(e) = notifier.send_activation(&notice).await {
                    tracing::error!(
                        email = %notice.email,
                        error = %e,
                        "Failed to send activation email"
                    );
                    // No subscribers is fine; the log line above is the record
                    let _ = failure_tx.send(NotificationFailure {
                        email: notice.email.clone(),
                        error: e.to_string(),
                    });
                }
            }
            tracing::debug!("Notification queue closed, dispatcher exiting");
        });

        (Self { queue, failures }, handle)
    }

    /// Queue a notice without waiting. Returns false if it could not be
    /// queued; that is reported like any other delivery failure.
    pub fn enqueue(&self, notice: ActivationNotice) -> bool {
        match self.queue.try_send(notice) {
            Ok(()) => true,
            Err(e) => {
                let (reason, notice) = match e {
                    mpsc::error::TrySendError::Full(n) => ("queue full", n),
                    mpsc::error::TrySendError::Closed(n) => ("dispatcher stopped", n),
                };
                tracing::error!(email = %notice.email, reason, "Activation email not queued");
                let _ = self.failures.send(NotificationFailure {
                    email: notice.email,
                    error: reason.to_string(),
                });
                false
            }
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<NotificationFailure> {
        self.failures.subscribe()
    }
}
