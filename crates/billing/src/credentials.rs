//! Processor credentials and account-mode classification

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Processor account mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Live => "live",
        }
    }

    pub fn other(&self) -> Environment {
        match self {
            Environment::Test => Environment::Live,
            Environment::Live => Environment::Test,
        }
    }

    /// Mode implied by a processor `livemode` flag
    pub fn from_livemode(livemode: bool) -> Self {
        if livemode {
            Environment::Live
        } else {
            Environment::Test
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "live" => Ok(Environment::Live),
            other => Err(BillingError::Configuration(format!(
                "unknown credential environment '{}'",
                other
            ))),
        }
    }
}

/// Classify a secret key by its prefix.
///
/// Secret (`sk_`) and restricted (`rk_`) keys are accepted; publishable keys are not.
pub fn classify_secret_key(key: &str) -> Option<Environment> {
    if key.starts_with("sk_test_") || key.starts_with("rk_test_") {
        Some(Environment::Test)
    } else if key.starts_with("sk_live_") || key.starts_with("rk_live_") {
        Some(Environment::Live)
    } else {
        None
    }
}

/// Credential row as stored. Every field may be absent in a misconfigured row.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct CredentialRecord {
    pub secret_key: Option<String>,
    pub publishable_key: Option<String>,
    pub webhook_signing_secret: Option<String>,
    pub environment: Option<String>,
}

/// Validated, active processor credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub secret_key: String,
    pub publishable_key: String,
    pub webhook_signing_secret: String,
    pub environment: Environment,
}

// Secrets stay out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("environment", &self.environment)
            .field("has_webhook_secret", &!self.webhook_signing_secret.is_empty())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Build credentials, checking that the declared environment agrees with the key prefix
    pub fn new(
        secret_key: impl Into<String>,
        publishable_key: impl Into<String>,
        webhook_signing_secret: impl Into<String>,
        environment: Environment,
    ) -> BillingResult<Self> {
        let secret_key = secret_key.into();
        let key_mode = classify_secret_key(&secret_key).ok_or_else(|| {
            BillingError::Configuration(
                "secret key must start with sk_test_, sk_live_, rk_test_ or rk_live_".to_string(),
            )
        })?;

        if key_mode != environment {
            return Err(BillingError::Configuration(format!(
                "credentials declare {} environment but the secret key is a {} key",
                environment, key_mode
            )));
        }

        Ok(Self {
            secret_key,
            publishable_key: publishable_key.into(),
            webhook_signing_secret: webhook_signing_secret.into(),
            environment,
        })
    }

    /// Load fallback credentials from `STRIPE_*` environment variables.
    ///
    /// Returns `Ok(None)` when no secret key is configured at all.
    pub fn from_env() -> BillingResult<Option<Self>> {
        let secret_key = match std::env::var("STRIPE_SECRET_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => return Ok(None),
        };

        let environment = match std::env::var("STRIPE_ENVIRONMENT") {
            Ok(env) => env.parse()?,
            Err(_) => classify_secret_key(&secret_key).ok_or_else(|| {
                BillingError::Configuration("STRIPE_SECRET_KEY has an unknown prefix".to_string())
            })?,
        };

        let creds = Self::new(
            secret_key,
            std::env::var("STRIPE_PUBLISHABLE_KEY").unwrap_or_default(),
            std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            environment,
        )?;
        Ok(Some(creds))
    }

    /// Validate a stored row into usable credentials
    pub fn from_record(record: CredentialRecord) -> BillingResult<Self> {
        let secret_key = record
            .secret_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                BillingError::Configuration(
                    "active credential record has no secret key".to_string(),
                )
            })?;

        let environment = match record.environment.as_deref() {
            Some(env) if !env.trim().is_empty() => env.parse()?,
            _ => {
                return Err(BillingError::Configuration(
                    "active credential record has no environment".to_string(),
                ))
            }
        };

        Self::new(
            secret_key,
            record.publishable_key.unwrap_or_default(),
            record.webhook_signing_secret.unwrap_or_default(),
            environment,
        )
    }
}

/// Resolves the single active credential set for a request
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn BillingStore>,
    fallback: Option<Credentials>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn BillingStore>, fallback: Option<Credentials>) -> Self {
        Self { store, fallback }
    }

    /// Resolve active credentials.
    ///
    /// A stored row always wins, even when it is unusable: environment-variable
    /// credentials are only consulted when the store holds no active row.
    pub async fn resolve(&self) -> BillingResult<Credentials> {
        match self.store.active_credentials().await? {
            Some(record) => {
                let creds = Credentials::from_record(record).map_err(|e| {
                    tracing::error!(error = %e, "Active credential record is unusable");
                    e
                })?;
                tracing::debug!(environment = %creds.environment, "Resolved stored credentials");
                Ok(creds)
            }
            None => match &self.fallback {
                Some(creds) => {
                    tracing::info!(
                        environment = %creds.environment,
                        "No stored credentials, using environment fallback"
                    );
                    Ok(creds.clone())
                }
                None => Err(BillingError::Configuration(
                    "no active payment processor credentials configured".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn test_creds() -> Credentials {
        Credentials::new("sk_test_abcdefghijklmnop", "pk_test_x", "whsec_x", Environment::Test)
            .unwrap()
    }

    #[test]
    fn test_classify_secret_key() {
        assert_eq!(classify_secret_key("sk_test_123"), Some(Environment::Test));
        assert_eq!(classify_secret_key("rk_test_123"), Some(Environment::Test));
        assert_eq!(classify_secret_key("sk_live_123"), Some(Environment::Live));
        assert_eq!(classify_secret_key("rk_live_123"), Some(Environment::Live));
        assert_eq!(classify_secret_key("pk_live_123"), None);
        assert_eq!(classify_secret_key(""), None);
    }

    #[test]
    fn test_declared_environment_must_match_key() {
        let err = Credentials::new("sk_live_abcdefghijkl", "", "", Environment::Test).unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", test_creds());
        assert!(!debug.contains("sk_test_abcdefghijklmnop"));
        assert!(!debug.contains("whsec_x"));
        assert!(debug.contains("Test"));
    }

    #[tokio::test]
    async fn test_stored_record_without_key_never_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.set_credentials(CredentialRecord {
            secret_key: None,
            publishable_key: Some("pk_test_x".into()),
            webhook_signing_secret: Some("whsec_x".into()),
            environment: Some("test".into()),
        });

        let resolver = CredentialResolver::new(store, Some(test_creds()));
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_fallback_used_only_without_stored_row() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CredentialResolver::new(store.clone(), Some(test_creds()));
        assert_eq!(resolver.resolve().await.unwrap(), test_creds());

        let resolver = CredentialResolver::new(store, None);
        assert!(matches!(
            resolver.resolve().await.unwrap_err(),
            BillingError::Configuration(_)
        ));
    }
}
