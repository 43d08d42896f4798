// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::EnvironmentMismatch carries both modes and the reference
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DocLib Billing Module
//!
//! Keeps one authoritative subscription row per user in sync with Stripe.
//!
//! ## Features
//!
//! - **Checkout**: Create subscription-mode checkout sessions after checking
//!   credentials, plan pricing and test/live compatibility
//! - **Webhooks**: Verify signatures, deduplicate by event id, route events
//! - **Reconciliation**: Idempotent upsert per user, one-year terms, lazy expiry
//! - **Notifications**: Fire-and-forget activation notices

pub mod checkout;
pub mod client;
pub mod credentials;
pub mod environment;
pub mod error;
pub mod events;
pub mod notify;
pub mod pg_store;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService, CheckoutUrls};

// Client
pub use client::{
    PaymentProcessor, ProcessorFactory, StripeProcessor, StripeProcessorFactory,
    DEFAULT_PROCESSOR_TIMEOUT,
};

// Credentials
pub use credentials::{CredentialResolver, Credentials, Environment};

// Error
pub use error::{BillingError, BillingResult, ProcessorError, ProcessorErrorCode};

// Notifications
pub use notify::{notifier_from_endpoint, ActivationNotice, Notifier};

// Persistence
pub use pg_store::{run_migrations, PgBillingStore};
pub use store::{BillingStore, Plan, SubscriptionRecord};

// Status
pub use status::{map_processor_status, SubscriptionStatus};

// Subscriptions
pub use subscriptions::{
    PollPolicy, ReconcileOutcome, SubscriptionConfirmation, SubscriptionService,
    SUBSCRIPTION_TERM,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Settings the billing flows need from the host application
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub checkout_urls: CheckoutUrls,
    /// Used only when the store holds no credential row
    pub fallback_credentials: Option<Credentials>,
    pub notify_endpoint: Option<String>,
    pub processor_timeout: Duration,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Wire the services over an arbitrary store and processor factory
    pub fn new(
        store: Arc<dyn BillingStore>,
        factory: Arc<dyn ProcessorFactory>,
        fallback_credentials: Option<Credentials>,
        checkout_urls: CheckoutUrls,
        notifier: Notifier,
    ) -> Self {
        let resolver = CredentialResolver::new(store.clone(), fallback_credentials);
        let subscriptions = SubscriptionService::new(store.clone(), notifier);

        Self {
            checkout: CheckoutService::new(
                resolver.clone(),
                factory.clone(),
                store.clone(),
                checkout_urls,
            ),
            webhooks: WebhookHandler::new(resolver, factory, store, subscriptions.clone()),
            subscriptions,
        }
    }

    /// Create the production service: Postgres store and Stripe processors.
    ///
    /// Must be called inside a tokio runtime when a notification endpoint is set.
    pub fn from_pool(pool: PgPool, config: BillingConfig) -> BillingResult<Self> {
        let notifier = notifier_from_endpoint(config.notify_endpoint.as_deref())?;

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(StripeProcessorFactory::new(config.processor_timeout)),
            config.fallback_credentials,
            config.checkout_urls,
            notifier,
        ))
    }
}
