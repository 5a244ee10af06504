//! Server configuration, read from the process environment

use std::str::FromStr;

use anyhow::Context;
use creditgate_billing::{
    CreditPolicy, EmailConfig, LedgerConfig, Package, PayPalConfig, DEFAULT_FREE_CREDITS,
    DEFAULT_VALIDITY_DAYS,
};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_OPENAI_MAX_TOKENS: u32 = 500;
const DEFAULT_OPENAI_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_EMAIL_FROM: &str = "noreply@creditgate.local";

/// Completion service settings
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// `None` leaves the completion proxy unconfigured
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: Option<String>,
    pub database_name: Option<String>,
    pub openai: OpenAiConfig,
    pub sendgrid_api_key: Option<String>,
    pub email_from: String,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub paypal_webhook_id: Option<String>,
    pub paypal_mode: String,
    pub credit_policy: CreditPolicy,
    pub free_credits: i64,
    /// `None` disables entitlement expiry
    pub validity_days: Option<i64>,
    pub refund_on_upstream_error: bool,
    pub enable_manual_activation: bool,
    pub admin_token: Option<String>,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port: u16 = parse_or(&get, "PORT", DEFAULT_PORT)?;
        let bind_address = get("BIND_ADDRESS").unwrap_or_else(|| format!("0.0.0.0:{port}"));

        let openai = OpenAiConfig {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            max_tokens: parse_or(&get, "OPENAI_MAX_TOKENS", DEFAULT_OPENAI_MAX_TOKENS)?,
            timeout_secs: parse_or(&get, "OPENAI_TIMEOUT_SECS", DEFAULT_OPENAI_TIMEOUT_SECS)?,
            system_prompt: get("OPENAI_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let credit_policy = match parse_opt::<u32>(&get, "CREDIT_PACK_SIZE")? {
            Some(credits) => CreditPolicy::Fixed { credits },
            None => {
                let CreditPolicy::Tiered { basic, premium } = CreditPolicy::default() else {
                    anyhow::bail!("default credit policy is not tiered");
                };
                CreditPolicy::Tiered {
                    basic: Package::new(
                        basic.name,
                        parse_or(&get, "BASIC_PRICE_CENTS", basic.price_cents)?,
                        parse_or(&get, "BASIC_CREDITS", basic.credits)?,
                    ),
                    premium: Package::new(
                        premium.name,
                        parse_or(&get, "PREMIUM_PRICE_CENTS", premium.price_cents)?,
                        parse_or(&get, "PREMIUM_CREDITS", premium.credits)?,
                    ),
                }
            }
        };

        let free_credits: i64 = parse_or(&get, "FREE_CREDITS", DEFAULT_FREE_CREDITS)?;
        if free_credits < 0 {
            anyhow::bail!("FREE_CREDITS must not be negative");
        }

        // 0 turns expiry off
        let validity_days: i64 =
            parse_or(&get, "ACTIVATION_VALIDITY_DAYS", DEFAULT_VALIDITY_DAYS)?;
        let validity_days = match validity_days {
            days if days > 0 => Some(days),
            0 => None,
            _ => anyhow::bail!("ACTIVATION_VALIDITY_DAYS must not be negative"),
        };

        Ok(Self {
            bind_address,
            database_url: get("DATABASE_URL"),
            database_name: get("DATABASE_NAME"),
            openai,
            sendgrid_api_key: get("SENDGRID_API_KEY"),
            email_from: get("EMAIL_FROM").unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string()),
            paypal_client_id: get("PAYPAL_CLIENT_ID"),
            paypal_client_secret: get("PAYPAL_CLIENT_SECRET"),
            paypal_webhook_id: get("PAYPAL_WEBHOOK_ID"),
            paypal_mode: get("PAYPAL_MODE").unwrap_or_else(|| "sandbox".to_string()),
            credit_policy,
            free_credits,
            validity_days,
            refund_on_upstream_error: parse_flag(&get, "REFUND_ON_UPSTREAM_ERROR"),
            enable_manual_activation: parse_flag(&get, "ENABLE_MANUAL_ACTIVATION"),
            admin_token: get("ADMIN_TOKEN"),
            allowed_origins: get("ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty() && s != "*")
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            free_credits: self.free_credits,
            validity_days: self.validity_days,
        }
    }

    pub fn email_config(&self) -> Option<EmailConfig> {
        self.sendgrid_api_key
            .as_ref()
            .map(|key| EmailConfig::new(key.clone(), self.email_from.clone()))
    }

    /// Present only when all three PayPal values are set
    pub fn paypal_config(&self) -> Option<PayPalConfig> {
        match (
            &self.paypal_client_id,
            &self.paypal_client_secret,
            &self.paypal_webhook_id,
        ) {
            (Some(id), Some(secret), Some(webhook)) => Some(PayPalConfig::new(
                id.clone(),
                secret.clone(),
                webhook.clone(),
                &self.paypal_mode,
            )),
            _ => None,
        }
    }

    /// Optional integrations that are switched off, with the variables that
    /// would enable them
    pub fn missing_components(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.database_url.is_none() {
            missing.push(
                "persistent store (DATABASE_URL): using in-memory store, data is lost on restart",
            );
        }
        if self.openai.api_key.is_none() {
            missing.push("completion service (OPENAI_API_KEY): /api/openai will refuse requests");
        }
        if self.sendgrid_api_key.is_none() {
            missing.push("email delivery (SENDGRID_API_KEY): activation codes are only logged");
        }
        if self.paypal_config().is_none() {
            missing.push(
                "webhook verification (PAYPAL_CLIENT_ID, PAYPAL_CLIENT_SECRET, PAYPAL_WEBHOOK_ID): events are not verified",
            );
        }
        if self.admin_token.is_none() {
            missing.push("admin token (ADMIN_TOKEN): /api/admin/payments is unauthenticated");
        }
        missing
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}: {raw:?}")))
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    get(key).is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
