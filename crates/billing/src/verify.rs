//! Webhook authenticity
//!
//! PayPal signs webhook deliveries; checking the signature is delegated to
//! PayPal's own verification endpoint. The handler always consults an
//! [`EventVerifier`] before touching the ledger.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

/// The `paypal-*` transmission headers of one webhook delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmissionHeaders {
    pub transmission_id: Option<String>,
    pub transmission_time: Option<String>,
    pub transmission_sig: Option<String>,
    pub cert_url: Option<String>,
    pub auth_algo: Option<String>,
}

impl TransmissionHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            transmission_id: get("paypal-transmission-id"),
            transmission_time: get("paypal-transmission-time"),
            transmission_sig: get("paypal-transmission-sig"),
            cert_url: get("paypal-cert-url"),
            auth_algo: get("paypal-auth-algo"),
        }
    }
}

#[async_trait]
pub trait EventVerifier: Send + Sync {
    /// `Ok(false)` means the delivery is not authentic and must not be applied
    async fn verify(
        &self,
        headers: &TransmissionHeaders,
        event: &serde_json::Value,
    ) -> BillingResult<bool>;
}

/// Accepts every delivery. Used when PayPal credentials are not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllVerifier;

#[async_trait]
impl EventVerifier for AcceptAllVerifier {
    async fn verify(
        &self,
        headers: &TransmissionHeaders,
        _event: &serde_json::Value,
    ) -> BillingResult<bool> {
        tracing::warn!(
            transmission_id = ?headers.transmission_id,
            "Webhook signature not verified (PayPal credentials not configured)"
        );
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_url: String,
}

impl PayPalConfig {
    /// `mode` is "live" or anything else for sandbox
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        webhook_id: impl Into<String>,
        mode: &str,
    ) -> Self {
        let api_url = if mode == "live" {
            "https://api-m.paypal.com"
        } else {
            "https://api-m.sandbox.paypal.com"
        };
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            webhook_id: webhook_id.into(),
            api_url: api_url.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

/// Verifies deliveries through PayPal's verify-webhook-signature API
pub struct PayPalVerifier {
    config: PayPalConfig,
    http: Client,
    token: RwLock<Option<(String, Instant)>>,
}

impl PayPalVerifier {
    pub fn new(config: PayPalConfig, http: Client) -> Self {
        Self {
            config,
            http,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> BillingResult<String> {
        {
            let cached = self.token.read().await;
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Instant::now() {
                    return Ok(token.clone());
                }
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| BillingError::Upstream(format!("PayPal auth request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Upstream(format!(
                "PayPal auth failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Upstream(format!("PayPal auth response invalid: {e}")))?;

        // Refresh a minute early so a token never expires mid-request
        let ttl = Duration::from_secs(token.expires_in.saturating_sub(60));
        *self.token.write().await = Some((token.access_token.clone(), Instant::now() + ttl));
        Ok(token.access_token)
    }
}

#[async_trait]
impl EventVerifier for PayPalVerifier {
    async fn verify(
        &self,
        headers: &TransmissionHeaders,
        event: &serde_json::Value,
    ) -> BillingResult<bool> {
        let (Some(id), Some(time), Some(sig), Some(cert), Some(algo)) = (
            headers.transmission_id.as_deref(),
            headers.transmission_time.as_deref(),
            headers.transmission_sig.as_deref(),
            headers.cert_url.as_deref(),
            headers.auth_algo.as_deref(),
        ) else {
            tracing::warn!("Webhook missing PayPal transmission headers");
            return Ok(false);
        };

        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.api_url
            ))
            .bearer_auth(token)
            .json(&VerifyRequest {
                auth_algo: algo,
                cert_url: cert,
                transmission_id: id,
                transmission_sig: sig,
                transmission_time: time,
                webhook_id: &self.config.webhook_id,
                webhook_event: event,
            })
            .send()
            .await
            .map_err(|e| BillingError::Upstream(format!("PayPal verify request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Upstream(format!(
                "PayPal verify failed: {}",
                response.status()
            )));
        }

        let result: VerifyResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Upstream(format!("PayPal verify response invalid: {e}")))?;

        let verified = result.verification_status == "SUCCESS";
        tracing::info!(
            transmission_id = %id,
            status = %result.verification_status,
            "PayPal webhook signature checked"
        );
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn signed_headers() -> TransmissionHeaders {
        TransmissionHeaders {
            transmission_id: Some("tx-1".to_string()),
            transmission_time: Some("2025-01-01T00:00:00Z".to_string()),
            transmission_sig: Some("sig".to_string()),
            cert_url: Some("https://api.paypal.com/cert".to_string()),
            auth_algo: Some("SHA256withRSA".to_string()),
        }
    }

    fn verifier_for(server: &mockito::ServerGuard) -> PayPalVerifier {
        let mut config = PayPalConfig::new("client", "secret", "WH-ID", "sandbox");
        config.api_url = server.url();
        PayPalVerifier::new(config, Client::new())
    }

    #[test]
    fn test_headers_from_map() {
        let mut map = HeaderMap::new();
        map.insert("paypal-transmission-id", HeaderValue::from_static("tx-9"));
        map.insert("paypal-auth-algo", HeaderValue::from_static("SHA256withRSA"));
        let headers = TransmissionHeaders::from_header_map(&map);
        assert_eq!(headers.transmission_id.as_deref(), Some("tx-9"));
        assert_eq!(headers.auth_algo.as_deref(), Some("SHA256withRSA"));
        assert_eq!(headers.transmission_sig, None);
    }

    #[test]
    fn test_mode_selects_api_host() {
        assert_eq!(
            PayPalConfig::new("a", "b", "c", "live").api_url,
            "https://api-m.paypal.com"
        );
        assert_eq!(
            PayPalConfig::new("a", "b", "c", "sandbox").api_url,
            "https://api-m.sandbox.paypal.com"
        );
    }

    #[tokio::test]
    async fn test_verification_success_and_token_cached() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A21","expires_in":32400}"#)
            .expect(1)
            .create_async()
            .await;
        let verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .match_header("authorization", "Bearer A21")
            .match_body(mockito::Matcher::PartialJson(json!({
                "webhook_id": "WH-ID",
                "transmission_id": "tx-1",
            })))
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .expect(2)
            .create_async()
            .await;

        let verifier = verifier_for(&server);
        let event = json!({"id": "WH-1"});
        assert!(verifier.verify(&signed_headers(), &event).await.unwrap());
        assert!(verifier.verify(&signed_headers(), &event).await.unwrap());

        token.assert_async().await;
        verify.assert_async().await;
    }

    #[tokio::test]
    async fn test_verification_failure_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A21","expires_in":32400}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"FAILURE"}"#)
            .create_async()
            .await;

        let verifier = verifier_for(&server);
        assert!(!verifier
            .verify(&signed_headers(), &json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_headers_rejected_without_calling_paypal() {
        let server = mockito::Server::new_async().await;
        let verifier = verifier_for(&server);
        assert!(!verifier
            .verify(&TransmissionHeaders::default(), &json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auth_failure_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(401)
            .create_async()
            .await;

        let verifier = verifier_for(&server);
        assert!(matches!(
            verifier.verify(&signed_headers(), &json!({})).await,
            Err(BillingError::Upstream(_))
        ));
    }
}
