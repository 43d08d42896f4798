//! Webhook event envelope and the payload objects the reconciler reads
//!
//! Only the fields used downstream are modelled; everything else in the
//! processor payload is ignored.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Verified webhook event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Event types the dispatcher routes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unhandled,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            _ => EventKind::Unhandled,
        }
    }
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedPayload(format!("invalid event JSON: {}", e)))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    /// Event creation time, falling back to now for a missing or bogus timestamp
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    /// Deserialize `data.object` into a typed payload
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::MalformedPayload(format!(
                "{} event {} has an unexpected object: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

/// `checkout.session.completed` object
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: HashMap<String, String>,
}

/// `customer.subscription.*` object
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: HashMap<String, String>,
}

/// `invoice.*` object
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: HashMap<String, String>,
}

impl InvoiceObject {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.subscription_details
            .as_ref()
            .and_then(|d| d.metadata.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Accept either a bare id or an expanded object carrying an `id`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Some(id),
        Some(serde_json::Value::Object(map)) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    })
}

/// Metadata as a string map; null and non-string values are dropped
fn lenient_metadata<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(value
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_routing() {
        assert_eq!(
            EventKind::from_type("checkout.session.completed"),
            EventKind::CheckoutSessionCompleted
        );
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::Unhandled);
        assert_eq!(EventKind::from_type("charge.refunded"), EventKind::Unhandled);
    }

    #[test]
    fn test_parse_checkout_session_with_expanded_customer() {
        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_test_1",
                "customer": { "id": "cus_1", "object": "customer" },
                "subscription": "sub_1",
                "client_reference_id": "u1",
                "metadata": { "userId": "u1", "planId": "pro", "extra": null }
            }}
        })
        .to_string();

        let event = WebhookEvent::parse(&payload).unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutSessionCompleted);
        let session: CheckoutSessionObject = event.object().unwrap();
        assert_eq!(session.customer.as_deref(), Some("cus_1"));
        assert_eq!(session.subscription.as_deref(), Some("sub_1"));
        assert_eq!(session.metadata.get("planId").map(String::as_str), Some("pro"));
        assert!(!session.metadata.contains_key("extra"));
    }

    #[test]
    fn test_missing_metadata_is_empty() {
        let payload = json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_1", "status": "active", "metadata": null } }
        })
        .to_string();

        let event = WebhookEvent::parse(&payload).unwrap();
        let sub: SubscriptionObject = event.object().unwrap();
        assert!(sub.metadata.is_empty());
        assert_eq!(sub.customer, None);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            WebhookEvent::parse("not json").unwrap_err(),
            BillingError::MalformedPayload(_)
        ));

        let event = WebhookEvent::parse(
            &json!({ "id": "evt_3", "type": "invoice.payment_failed", "data": { "object": [] } })
                .to_string(),
        )
        .unwrap();
        assert!(matches!(
            event.object::<InvoiceObject>().unwrap_err(),
            BillingError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_invoice_metadata_lookup() {
        let event = WebhookEvent::parse(
            &json!({
                "id": "evt_4",
                "type": "invoice.payment_failed",
                "data": { "object": {
                    "id": "in_1",
                    "subscription": "sub_1",
                    "subscription_details": { "metadata": { "userId": "u9" } }
                }}
            })
            .to_string(),
        )
        .unwrap();
        let invoice: InvoiceObject = event.object().unwrap();
        assert_eq!(invoice.metadata_value("userId"), Some("u9"));
        assert_eq!(invoice.metadata_value("planId"), None);
    }
}
