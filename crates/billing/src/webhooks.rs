//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header over the raw body, claims the event
//! id so redeliveries are not applied twice, and routes the event to the
//! subscription reconciler.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::client::{PaymentProcessor, ProcessorFactory};
use crate::credentials::{CredentialResolver, Environment};
use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, WebhookEvent};
use crate::store::{BillingStore, EventClaim, EventResult};
use crate::subscriptions::{ReconcileOutcome, SubscriptionService};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (and clock skew) accepted for a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// How a delivery was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event applied
    Processed,
    /// Event understood but nothing to apply (unhandled type, missing metadata)
    Ignored,
    /// Event id already processed
    Duplicate,
    /// Processing failed in a way a redelivery will not fix
    Rejected,
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Configuration("webhook signing secret is unusable".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header against the raw payload.
///
/// Any one matching `v1` entry is accepted. Comparison is constant time.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    if secret.is_empty() {
        return Err(BillingError::Configuration(
            "webhook signing secret is not configured".to_string(),
        ));
    }

    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| BillingError::Signature("missing timestamp in signature header".to_string()))?;

    if signatures.is_empty() {
        return Err(BillingError::Signature(
            "missing v1 signature in signature header".to_string(),
        ));
    }

    let skew = now.abs_diff(timestamp);
    if skew > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::Signature(
            "timestamp outside the tolerance window".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Configuration("webhook signing secret is unusable".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    let matched = signatures.iter().any(|candidate| match hex::decode(candidate) {
        Ok(bytes) => mac.clone().verify_slice(&bytes).is_ok(),
        Err(_) => false,
    });

    if matched {
        Ok(())
    } else {
        Err(BillingError::Signature("no signature matches the payload".to_string()))
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    resolver: CredentialResolver,
    factory: Arc<dyn ProcessorFactory>,
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(
        resolver: CredentialResolver,
        factory: Arc<dyn ProcessorFactory>,
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            resolver,
            factory,
            store,
            subscriptions,
        }
    }

    /// Verify, deduplicate and apply one delivery.
    ///
    /// Errors returned here should be answered with a non-2xx status: signature
    /// and envelope failures are the sender's fault, the rest are retryable.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let credentials = self.resolver.resolve().await?;

        verify_signature(
            payload,
            signature,
            &credentials.webhook_signing_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .map_err(|e| {
            tracing::warn!(error = %e, payload_len = payload.len(), "Webhook signature rejected");
            e
        })?;

        let event = WebhookEvent::parse(payload)?;

        if Environment::from_livemode(event.livemode) != credentials.environment {
            tracing::warn!(
                event_id = %event.id,
                event_livemode = event.livemode,
                key_mode = %credentials.environment,
                "Webhook event mode differs from the active credentials"
            );
        }

        match self
            .store
            .claim_event(&event.id, &event.event_type, event.created_at())
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            // Not acknowledged: the earlier delivery may never finish
            EventClaim::InFlight => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event is being processed by another delivery, asking for redelivery"
                );
                return Err(BillingError::EventInFlight(event.id));
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let processor = self.factory.connect(&credentials);
        let result = self.process_event_internal(&event, processor.as_ref()).await;

        let (processing_result, error_message) = match &result {
            Ok(ReconcileOutcome::Applied { .. }) | Ok(ReconcileOutcome::Recorded) => {
                (EventResult::Success, None)
            }
            Ok(ReconcileOutcome::Skipped(reason)) => (EventResult::Ignored, Some(reason.to_string())),
            Err(e) => (EventResult::Error, Some(e.to_string())),
        };

        // Retry once; a stale 'processing' row is reclaimed after the timeout anyway
        if let Err(e) = self
            .store
            .finish_event(&event.id, processing_result, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to record webhook result failed, retrying"
            );
            if let Err(retry_err) = self
                .store
                .finish_event(&event.id, processing_result, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    processing_result = %processing_result.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook result after retry"
                );
            }
        }

        match result {
            Ok(ReconcileOutcome::Skipped(_)) => Ok(WebhookOutcome::Ignored),
            Ok(_) => Ok(WebhookOutcome::Processed),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed, asking for redelivery"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed permanently, acknowledging"
                );
                Ok(WebhookOutcome::Rejected)
            }
        }
    }

    async fn process_event_internal(
        &self,
        event: &WebhookEvent,
        processor: &dyn PaymentProcessor,
    ) -> BillingResult<ReconcileOutcome> {
        let source = event.event_type.as_str();

        match event.kind() {
            EventKind::CheckoutSessionCompleted => {
                self.subscriptions
                    .on_checkout_completed(processor, event.object()?, source)
                    .await
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.subscriptions
                    .on_subscription_changed(processor, event.object()?, source)
                    .await
            }
            EventKind::SubscriptionDeleted => {
                self.subscriptions.on_subscription_deleted(event.object()?).await
            }
            EventKind::InvoicePaymentFailed => self.subscriptions.on_invoice_failed(event.object()?).await,
            EventKind::InvoicePaymentSucceeded => {
                self.subscriptions.on_invoice_succeeded(event.object()?).await
            }
            EventKind::Unhandled => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled webhook event type"
                );
                Ok(ReconcileOutcome::Skipped("unhandled event type"))
            }
        }
    }
}
