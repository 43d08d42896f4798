//! Checkout session creation

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::{
    CheckoutSessionRequest, NewCustomer, ProcessorFactory, META_PLAN_ID, META_PLAN_NAME,
    META_USER_ID,
};
use crate::credentials::CredentialResolver;
use crate::environment::{check_compatibility, validate_price_ref, validate_product_ref};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Redirect targets used when the caller does not supply its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutUrls {
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub user_id: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
    /// Used only when a processor customer has to be created
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

/// Creates processor checkout sessions. Never writes to the store.
#[derive(Clone)]
pub struct CheckoutService {
    resolver: CredentialResolver,
    factory: Arc<dyn ProcessorFactory>,
    store: Arc<dyn BillingStore>,
    urls: CheckoutUrls,
}

impl CheckoutService {
    pub fn new(
        resolver: CredentialResolver,
        factory: Arc<dyn ProcessorFactory>,
        store: Arc<dyn BillingStore>,
        urls: CheckoutUrls,
    ) -> Self {
        Self {
            resolver,
            factory,
            store,
            urls,
        }
    }

    pub async fn create_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutResponse> {
        let plan_id = request.plan_id.trim();
        let user_id = request.user_id.trim();
        if plan_id.is_empty() {
            return Err(BillingError::Validation("planId is required".to_string()));
        }
        if user_id.is_empty() {
            return Err(BillingError::Validation("userId is required".to_string()));
        }

        let success_url = resolve_redirect(request.success_url.as_deref(), &self.urls.success_url, "successUrl")?;
        let cancel_url = resolve_redirect(request.cancel_url.as_deref(), &self.urls.cancel_url, "cancelUrl")?;

        let credentials = self.resolver.resolve().await?;
        let key_mode = credentials.environment;

        let plan = self
            .store
            .find_plan(plan_id, true)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}' not found or inactive", plan_id)))?;

        if plan.price_cents <= 0 {
            return Err(BillingError::InvalidPlan(format!(
                "plan '{}' is free and cannot be purchased",
                plan.id
            )));
        }

        validate_price_ref(&plan.processor_price_ref)?;
        if let Some(product_ref) = plan.processor_product_ref.as_deref() {
            validate_product_ref(product_ref)?;
        }

        let processor = self.factory.connect(&credentials);
        let verdict = check_compatibility(processor.as_ref(), key_mode, &plan).await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            key_mode = %verdict.key_mode,
            reference_mode = ?verdict.reference_mode,
            confirmed = verdict.confirmed,
            "Creating checkout session"
        );

        let existing_customer = self
            .store
            .subscription_for_user(user_id)
            .await?
            .and_then(|sub| sub.processor_customer_id)
            .filter(|id| !id.is_empty());

        let customer_id = match existing_customer {
            Some(id) => {
                tracing::debug!(user_id = %user_id, "Reusing existing processor customer");
                id
            }
            None => {
                let id = processor
                    .create_customer(NewCustomer {
                        user_id: user_id.to_string(),
                        email: request.email.clone(),
                    })
                    .await
                    .map_err(|e| BillingError::from_processor(e, key_mode))?;
                tracing::info!(user_id = %user_id, customer_id = %id, "Created processor customer");
                id
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), user_id.to_string());
        metadata.insert(META_PLAN_ID.to_string(), plan.id.clone());
        metadata.insert(META_PLAN_NAME.to_string(), plan.name.clone());

        let session = processor
            .create_checkout_session(CheckoutSessionRequest {
                customer_id,
                price_ref: plan.processor_price_ref.clone(),
                quantity: 1,
                success_url,
                cancel_url,
                client_reference_id: user_id.to_string(),
                metadata,
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    plan_id = %plan.id,
                    key_mode = %key_mode,
                    error = %e,
                    "Checkout session creation failed"
                );
                BillingError::from_processor(e, key_mode)
            })?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            url: session.url,
        })
    }
}

fn resolve_redirect(supplied: Option<&str>, default: &str, field: &str) -> BillingResult<String> {
    let candidate = match supplied.map(str::trim).filter(|s| !s.is_empty()) {
        Some(url) => url,
        None => default,
    };

    let parsed = url::Url::parse(candidate)
        .map_err(|e| BillingError::Validation(format!("{} is not a valid URL: {}", field, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(candidate.to_string()),
        other => Err(BillingError::Validation(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceInfo;
    use crate::credentials::{CredentialRecord, Environment};
    use crate::error::{ProcessorError, ProcessorErrorCode};
    use crate::status::SubscriptionStatus;
    use crate::store::{Plan, SubscriptionRecord};
    use crate::testing::{FakeFactory, FakeProcessor, MemoryStore};
    use time::OffsetDateTime;

    const PRICE: &str = "price_1NqXyZabcdef";

    fn pro_plan() -> Plan {
        Plan {
            id: "pro".into(),
            name: "Pro".into(),
            price_cents: 9900,
            processor_price_ref: PRICE.into(),
            processor_product_ref: None,
            is_active: true,
        }
    }

    fn setup(key: &str, env: &str) -> (CheckoutService, Arc<MemoryStore>, Arc<FakeProcessor>) {
        let store = Arc::new(MemoryStore::new());
        store.set_credentials(CredentialRecord {
            secret_key: Some(key.into()),
            publishable_key: Some("pk_x".into()),
            webhook_signing_secret: Some("whsec_x".into()),
            environment: Some(env.into()),
        });
        store.add_plan(pro_plan());

        let processor = Arc::new(FakeProcessor::new(env.parse().unwrap()));
        processor.add_price(PriceInfo {
            id: PRICE.into(),
            active: true,
            livemode: env == "live",
            product_id: None,
        });

        let service = CheckoutService::new(
            CredentialResolver::new(store.clone(), None),
            Arc::new(FakeFactory::new(processor.clone())),
            store.clone(),
            CheckoutUrls::new("https://app.example.com/success", "https://app.example.com/cancel"),
        );
        (service, store, processor)
    }

    fn request(plan_id: &str, user_id: &str) -> CheckoutRequest {
        CheckoutRequest {
            plan_id: plan_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_returns_session() {
        let (service, store, processor) = setup("sk_test_abcdefghij", "test");

        let response = service.create_checkout(request("pro", "u1")).await.unwrap();
        assert!(response.session_id.starts_with("cs_test_"));
        assert!(response.url.starts_with("https://"));

        let sessions = processor.created_sessions();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.quantity, 1);
        assert_eq!(session.price_ref, PRICE);
        assert_eq!(session.client_reference_id, "u1");
        assert_eq!(session.metadata.get(META_USER_ID).map(String::as_str), Some("u1"));
        assert_eq!(session.metadata.get(META_PLAN_ID).map(String::as_str), Some("pro"));
        assert_eq!(session.metadata.get(META_PLAN_NAME).map(String::as_str), Some("Pro"));
        assert_eq!(session.success_url, "https://app.example.com/success");

        // Checkout never writes a subscription row
        assert!(store.subscription("u1").is_none());
    }

    #[tokio::test]
    async fn test_missing_ids_rejected() {
        let (service, _, processor) = setup("sk_test_abcdefghij", "test");
        assert!(matches!(
            service.create_checkout(request("", "u1")).await.unwrap_err(),
            BillingError::Validation(_)
        ));
        assert!(matches!(
            service.create_checkout(request("pro", "  ")).await.unwrap_err(),
            BillingError::Validation(_)
        ));
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_or_inactive_plan_not_found() {
        let (service, store, _) = setup("sk_test_abcdefghij", "test");
        let mut retired = pro_plan();
        retired.id = "legacy".into();
        retired.is_active = false;
        store.add_plan(retired);

        for plan_id in ["missing", "legacy"] {
            assert!(matches!(
                service.create_checkout(request(plan_id, "u1")).await.unwrap_err(),
                BillingError::NotFound(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_free_plan_rejected() {
        let (service, store, processor) = setup("sk_test_abcdefghij", "test");
        let mut free = pro_plan();
        free.id = "free".into();
        free.price_cents = 0;
        store.add_plan(free);

        let err = service.create_checkout(request("free", "u1")).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidPlan(_)));
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_price_ref_rejected() {
        let (service, store, processor) = setup("sk_test_abcdefghij", "test");
        let mut broken = pro_plan();
        broken.id = "broken".into();
        broken.processor_price_ref = "plan_pro".into();
        store.add_plan(broken);

        let err = service.create_checkout(request("broken", "u1")).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidReference(_)));
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_configuration_error() {
        let store = Arc::new(MemoryStore::new());
        store.add_plan(pro_plan());
        let processor = Arc::new(FakeProcessor::new(Environment::Test));
        let service = CheckoutService::new(
            CredentialResolver::new(store.clone(), None),
            Arc::new(FakeFactory::new(processor)),
            store,
            CheckoutUrls::new("https://a.example/s", "https://a.example/c"),
        );

        let err = service.create_checkout(request("pro", "u1")).await.unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_live_key_with_test_price_fails_before_processor() {
        let (service, store, processor) = setup("sk_live_abcdefghij", "live");
        let mut plan = pro_plan();
        plan.id = "testprice".into();
        plan.processor_price_ref = "price_test_basic123".into();
        store.add_plan(plan);

        let err = service.create_checkout(request("testprice", "u1")).await.unwrap_err();
        assert!(matches!(err, BillingError::EnvironmentMismatch { .. }));
        assert!(processor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_customer_reused() {
        let (service, store, processor) = setup("sk_test_abcdefghij", "test");
        let now = OffsetDateTime::now_utc();
        store.put_subscription(SubscriptionRecord {
            user_id: "u1".into(),
            plan_id: "pro".into(),
            processor_subscription_id: "sub_old".into(),
            processor_customer_id: Some("cus_existing".into()),
            status: SubscriptionStatus::Cancelled,
            started_at: now,
            expires_at: now,
        });

        service.create_checkout(request("pro", "u1")).await.unwrap();
        assert!(!processor.calls().contains(&"create_customer".to_string()));
        assert_eq!(processor.created_sessions()[0].customer_id, "cus_existing");
    }

    #[tokio::test]
    async fn test_processor_auth_failure_reclassified() {
        let (service, _, processor) = setup("sk_test_abcdefghij", "test");
        processor.fail_next(
            "create_customer",
            ProcessorError::new("create_customer", ProcessorErrorCode::Authentication, "Invalid API Key"),
        );

        let err = service.create_checkout(request("pro", "u1")).await.unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[test]
    fn test_redirect_urls() {
        assert_eq!(
            resolve_redirect(None, "https://d.example/ok", "successUrl").unwrap(),
            "https://d.example/ok"
        );
        assert_eq!(
            resolve_redirect(Some("http://localhost:3000/x"), "https://d.example", "successUrl").unwrap(),
            "http://localhost:3000/x"
        );
        assert!(resolve_redirect(Some("javascript:alert(1)"), "https://d.example", "successUrl").is_err());
        assert!(resolve_redirect(Some("/relative"), "https://d.example", "successUrl").is_err());
    }
}
