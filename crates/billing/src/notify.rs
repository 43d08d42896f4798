//! Fire-and-forget activation notifications
//!
//! Notices are queued to a background task that hands them to each provider.
//! Delivery failures are logged and never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{BillingError, BillingResult};
use crate::status::SubscriptionStatus;

/// Timeout for a single notification delivery
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

const QUEUE_CAPACITY: usize = 256;

/// Sent when a subscription becomes active
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationNotice {
    pub user_id: String,
    pub plan_id: String,
    pub plan_name: Option<String>,
    pub processor_subscription_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Event type that triggered the activation
    pub source: String,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn send(&self, notice: &ActivationNotice) -> Result<()>;
    fn provider_name(&self) -> &'static str;
}

/// Handle used by the reconciler to queue notices
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<ActivationNotice>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Notifier {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn new(providers: Vec<Arc<dyn NotificationProvider>>) -> Self {
        if providers.is_empty() {
            return Self::disabled();
        }

        let (tx, mut rx) = mpsc::channel::<ActivationNotice>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                for provider in &providers {
                    match provider.send(&notice).await {
                        Ok(()) => tracing::debug!(
                            provider = provider.provider_name(),
                            user_id = %notice.user_id,
                            "Activation notice delivered"
                        ),
                        Err(error) => tracing::warn!(
                            provider = provider.provider_name(),
                            user_id = %notice.user_id,
                            error = %error,
                            "Notification provider failed"
                        ),
                    }
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// A notifier that drops every notice
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn try_notify(&self, notice: ActivationNotice) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                tracing::warn!(user_id = %notice.user_id, "Notification queue full; dropping notice");
            }
            Err(mpsc::error::TrySendError::Closed(notice)) => {
                tracing::warn!(user_id = %notice.user_id, "Notification queue closed; dropping notice");
            }
        }
    }
}

/// POSTs each notice as JSON to a configured endpoint
pub struct HttpNotificationProvider {
    endpoint: Url,
    client: Client,
}

impl HttpNotificationProvider {
    pub fn new(endpoint: Url) -> BillingResult<Self> {
        Self::with_timeout(endpoint, NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(endpoint: Url, timeout: Duration) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Configuration(format!("notification client: {}", e)))?;

        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl NotificationProvider for HttpNotificationProvider {
    async fn send(&self, notice: &ActivationNotice) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&serde_json::json!({
                "type": "subscription.activated",
                "subscription": notice,
            }))
            .send()
            .await
            .map_err(sanitize_reqwest_error)?;

        if response.status().is_success() {
            return Ok(());
        }

        Err(anyhow!(
            "notification endpoint returned non-success status: {}",
            response.status()
        ))
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

fn sanitize_reqwest_error(error: reqwest::Error) -> anyhow::Error {
    if error.is_timeout() {
        return anyhow!("notification request timed out");
    }
    if error.is_connect() {
        return anyhow!("notification endpoint connection failed");
    }
    anyhow!("notification request failed")
}

/// Build the notifier from an optional endpoint
pub fn notifier_from_endpoint(endpoint: Option<&str>) -> BillingResult<Notifier> {
    match endpoint.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|e| BillingError::Configuration(format!("NOTIFY_WEBHOOK_URL: {}", e)))?;
            let provider = HttpNotificationProvider::new(url)?;
            tracing::info!("Activation notifications enabled");
            Ok(Notifier::new(vec![Arc::new(provider)]))
        }
        None => {
            tracing::info!("No notification endpoint configured; activation notifications disabled");
            Ok(Notifier::disabled())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProvider;

    fn notice() -> ActivationNotice {
        ActivationNotice {
            user_id: "u1".into(),
            plan_id: "pro".into(),
            plan_name: Some("Pro".into()),
            processor_subscription_id: "sub_1".into(),
            status: SubscriptionStatus::Active,
            expires_at: OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap(),
            source: "checkout.session.completed".into(),
        }
    }

    #[tokio::test]
    async fn test_http_provider_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks/activation")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "type": "subscription.activated",
                "subscription": { "userId": "u1", "planId": "pro", "status": "active" }
            })))
            .with_status(204)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/hooks/activation", server.url())).unwrap();
        let provider = HttpNotificationProvider::new(url).unwrap();
        provider.send(&notice()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_provider_reports_failure_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(500)
            .create_async()
            .await;

        let provider = HttpNotificationProvider::new(Url::parse(&server.url()).unwrap()).unwrap();
        let err = provider.send(&notice()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_notifier_delivers_in_background() {
        let provider = Arc::new(RecordingProvider::default());
        let notifier = Notifier::new(vec![provider.clone()]);
        notifier.try_notify(notice());

        for _ in 0..50 {
            if !provider.notices().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.notices(), vec![notice()]);
    }

    #[tokio::test]
    async fn test_failing_provider_does_not_reach_caller() {
        let failing = Arc::new(RecordingProvider::failing());
        let notifier = Notifier::new(vec![failing.clone()]);
        notifier.try_notify(notice());
        notifier.try_notify(notice());

        for _ in 0..50 {
            if failing.attempts() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failing.attempts(), 2);
    }

    #[test]
    fn test_disabled_notifier_drops_silently() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        notifier.try_notify(notice());
    }

    #[test]
    fn test_no_endpoint_means_disabled() {
        assert!(!notifier_from_endpoint(None).unwrap().is_enabled());
        assert!(!notifier_from_endpoint(Some("  ")).unwrap().is_enabled());
        assert!(notifier_from_endpoint(Some("not a url")).is_err());
    }
}
