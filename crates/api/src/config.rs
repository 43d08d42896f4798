//! Server configuration loaded from the environment

use std::time::Duration;

use doclib_billing::{BillingConfig, CheckoutUrls, Credentials, DEFAULT_PROCESSOR_TIMEOUT};

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";
const DEFAULT_SUCCESS_URL: &str = "http://localhost:3000/billing/success";
const DEFAULT_CANCEL_URL: &str = "http://localhost:3000/billing/cancel";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    /// Endpoint receiving activation notices; notices are disabled when unset
    pub notify_webhook_url: Option<String>,
    /// Used only when no credential row is active in the database
    pub fallback_credentials: Option<Credentials>,
    pub stripe_timeout: Duration,
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = optional_env("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let allowed_origins = optional_env("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let stripe_timeout = match optional_env("STRIPE_TIMEOUT_SECONDS") {
            Some(_) => {
                let secs: u64 = parse_env("STRIPE_TIMEOUT_SECONDS", 0)?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: "STRIPE_TIMEOUT_SECONDS",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_PROCESSOR_TIMEOUT,
        };

        let fallback_credentials = Credentials::from_env().map_err(|e| ConfigError::Invalid {
            name: "STRIPE_SECRET_KEY",
            reason: e.to_string(),
        })?;

        Ok(Self {
            database_url,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            bind_address: optional_env("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            allowed_origins,
            checkout_success_url: optional_env("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|| DEFAULT_SUCCESS_URL.to_string()),
            checkout_cancel_url: optional_env("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|| DEFAULT_CANCEL_URL.to_string()),
            notify_webhook_url: optional_env("NOTIFY_WEBHOOK_URL"),
            fallback_credentials,
            stripe_timeout,
        })
    }

    /// Settings handed to the billing service
    pub fn billing(&self) -> BillingConfig {
        BillingConfig {
            checkout_urls: CheckoutUrls::new(&self.checkout_success_url, &self.checkout_cancel_url),
            fallback_credentials: self.fallback_credentials.clone(),
            notify_endpoint: self.notify_webhook_url.clone(),
            processor_timeout: self.stripe_timeout,
        }
    }
}
