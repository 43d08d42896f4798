//! Payment processor client
//!
//! `PaymentProcessor` is the narrow set of processor calls the billing flows
//! need. `StripeProcessor` implements it with async-stripe; a processor is
//! built per request from the active credentials by a `ProcessorFactory`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCustomer,
    Customer, Expandable, Price, PriceId, StripeError, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus,
};

use crate::credentials::{Credentials, Environment};
use crate::error::{ProcessorError, ProcessorErrorCode};

/// Metadata key carrying the internal user id
pub const META_USER_ID: &str = "userId";
/// Metadata key carrying the internal plan id
pub const META_PLAN_ID: &str = "planId";
/// Metadata key carrying the plan display name
pub const META_PLAN_NAME: &str = "planName";

/// Default per-call timeout for processor requests
pub const DEFAULT_PROCESSOR_TIMEOUT: Duration = Duration::from_secs(20);

/// Price as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceInfo {
    pub id: String,
    pub active: bool,
    pub livemode: bool,
    pub product_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_ref: String,
    pub quantity: u64,
    pub success_url: String,
    pub cancel_url: String,
    pub client_reference_id: String,
    /// Attached to the session and to the subscription it creates
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: String,
}

/// Subscription object as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    /// Raw processor status, mapped by `status::map_processor_status`
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub ended_at: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Processor operations used by checkout and reconciliation
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Mode of the key this processor was built with
    fn environment(&self) -> Environment;

    async fn retrieve_price(&self, price_ref: &str) -> Result<PriceInfo, ProcessorError>;

    /// Create a customer and return its id
    async fn create_customer(&self, customer: NewCustomer) -> Result<String, ProcessorError>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CreatedCheckoutSession, ProcessorError>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError>;
}

/// Builds a processor for the credentials resolved on each request
pub trait ProcessorFactory: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn PaymentProcessor>;
}

/// Factory for live Stripe processors
#[derive(Debug, Clone)]
pub struct StripeProcessorFactory {
    timeout: Duration,
}

impl StripeProcessorFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for StripeProcessorFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSOR_TIMEOUT)
    }
}

impl ProcessorFactory for StripeProcessorFactory {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn PaymentProcessor> {
        Arc::new(StripeProcessor::new(credentials, self.timeout))
    }
}

/// Stripe-backed processor
#[derive(Clone)]
pub struct StripeProcessor {
    client: stripe::Client,
    environment: Environment,
    timeout: Duration,
}

impl std::fmt::Debug for StripeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeProcessor")
            .field("environment", &self.environment)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StripeProcessor {
    pub fn new(credentials: &Credentials, timeout: Duration) -> Self {
        let client = stripe::Client::new(credentials.secret_key.clone());
        Self {
            client,
            environment: credentials.environment,
            timeout,
        }
    }

    /// Run a single processor call under the configured timeout
    async fn call<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, ProcessorError>
    where
        Fut: std::future::Future<Output = Result<T, StripeError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_stripe_error(operation, e)),
            Err(_) => Err(ProcessorError::new(
                operation,
                ProcessorErrorCode::Timeout,
                format!("no response within {} seconds", self.timeout.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    fn environment(&self) -> Environment {
        self.environment
    }

    async fn retrieve_price(&self, price_ref: &str) -> Result<PriceInfo, ProcessorError> {
        let price_id = price_ref.parse::<PriceId>().map_err(|e| {
            ProcessorError::new("retrieve_price", ProcessorErrorCode::InvalidRequest, e.to_string())
                .with_resource(price_ref)
        })?;

        let price = self
            .call("retrieve_price", Price::retrieve(&self.client, &price_id, &[]))
            .await
            .map_err(|e| e.with_resource(price_ref))?;

        Ok(PriceInfo {
            id: price.id.to_string(),
            active: price.active.unwrap_or(false),
            livemode: price.livemode.unwrap_or(false),
            product_id: price.product.as_ref().map(|p| p.id().to_string()),
        })
    }

    async fn create_customer(&self, customer: NewCustomer) -> Result<String, ProcessorError> {
        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), customer.user_id.clone());

        let mut params = CreateCustomer::new();
        params.email = customer.email.as_deref();
        params.metadata = Some(metadata);

        let created = self
            .call("create_customer", Customer::create(&self.client, params))
            .await?;

        Ok(created.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CreatedCheckoutSession, ProcessorError> {
        let customer_id = request.customer_id.parse::<stripe::CustomerId>().map_err(|e| {
            ProcessorError::new(
                "create_checkout_session",
                ProcessorErrorCode::InvalidRequest,
                e.to_string(),
            )
            .with_resource(request.customer_id.clone())
        })?;

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer_id);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.client_reference_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_ref.clone()),
            quantity: Some(request.quantity),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        });

        let session = self
            .call(
                "create_checkout_session",
                StripeCheckoutSession::create(&self.client, params),
            )
            .await?;

        let url = session.url.ok_or_else(|| {
            ProcessorError::new(
                "create_checkout_session",
                ProcessorErrorCode::InvalidRequest,
                "checkout session was created without a redirect URL",
            )
            .with_resource(session.id.to_string())
        })?;

        Ok(CreatedCheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let sub_id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            ProcessorError::new(
                "retrieve_subscription",
                ProcessorErrorCode::InvalidRequest,
                e.to_string(),
            )
            .with_resource(subscription_id)
        })?;

        let subscription = self
            .call(
                "retrieve_subscription",
                Subscription::retrieve(&self.client, &sub_id, &[]),
            )
            .await
            .map_err(|e| e.with_resource(subscription_id))?;

        Ok(map_subscription(subscription))
    }
}

fn map_subscription(subscription: Subscription) -> ProcessorSubscription {
    let status = match subscription.status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    };

    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    ProcessorSubscription {
        id: subscription.id.to_string(),
        customer_id: Some(customer_id),
        status: status.to_string(),
        current_period_start: Some(subscription.current_period_start).filter(|t| *t > 0),
        current_period_end: Some(subscription.current_period_end).filter(|t| *t > 0),
        ended_at: subscription.ended_at,
        metadata: subscription.metadata.clone(),
    }
}

/// Translate an async-stripe error into a typed processor error.
///
/// This is the only place processor message text is inspected: Stripe reports
/// "similar object exists in test/live mode" as a plain not-found.
fn map_stripe_error(operation: &'static str, error: StripeError) -> ProcessorError {
    match error {
        StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "unknown processor error".to_string());
            let code = classify_request_error(status, &message);
            ProcessorError::new(operation, code, message).with_status(status)
        }
        StripeError::Timeout => {
            ProcessorError::new(operation, ProcessorErrorCode::Timeout, "request timed out")
        }
        other => ProcessorError::new(operation, ProcessorErrorCode::Transport, other.to_string()),
    }
}

fn classify_request_error(http_status: u16, message: &str) -> ProcessorErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("exists in test mode") || lower.contains("exists in live mode") {
        return ProcessorErrorCode::ModeMismatch;
    }
    match http_status {
        401 | 403 => ProcessorErrorCode::Authentication,
        404 => ProcessorErrorCode::ResourceMissing,
        429 => ProcessorErrorCode::RateLimited,
        400..=499 => ProcessorErrorCode::InvalidRequest,
        _ => ProcessorErrorCode::Unavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_mode_mismatch_message() {
        let msg = "No such price: 'price_1AbC'; a similar object exists in test mode, \
                   but a live mode key was used to make this request.";
        assert_eq!(classify_request_error(400, msg), ProcessorErrorCode::ModeMismatch);
        assert_eq!(classify_request_error(404, msg), ProcessorErrorCode::ModeMismatch);
    }

    #[test]
    fn test_classify_by_status() {
        assert_eq!(classify_request_error(401, "Invalid API Key"), ProcessorErrorCode::Authentication);
        assert_eq!(classify_request_error(404, "No such price"), ProcessorErrorCode::ResourceMissing);
        assert_eq!(classify_request_error(429, "slow down"), ProcessorErrorCode::RateLimited);
        assert_eq!(classify_request_error(400, "bad param"), ProcessorErrorCode::InvalidRequest);
        assert_eq!(classify_request_error(502, "bad gateway"), ProcessorErrorCode::Unavailable);
    }

    #[test]
    fn test_processor_debug_hides_key() {
        let creds = Credentials::new(
            "sk_test_supersecretvalue123",
            "pk_test_x",
            "whsec_x",
            Environment::Test,
        )
        .unwrap();
        let processor = StripeProcessor::new(&creds, DEFAULT_PROCESSOR_TIMEOUT);
        let debug = format!("{:?}", processor);
        assert!(!debug.contains("supersecretvalue"));
        assert_eq!(processor.environment(), Environment::Test);
    }

    #[test]
    fn test_metadata_keys() {
        assert_eq!(META_USER_ID, "userId");
        assert_eq!(META_PLAN_ID, "planId");
        assert_eq!(META_PLAN_NAME, "planName");
    }
}
