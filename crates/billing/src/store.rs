//! Persistence boundary for plans, credentials, subscriptions and webhook bookkeeping

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::credentials::CredentialRecord;
use crate::error::BillingResult;
use crate::status::SubscriptionStatus;

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Price in minor currency units (99.00 is stored as 9900)
    pub price_cents: i64,
    pub processor_price_ref: String,
    pub processor_product_ref: Option<String>,
    pub is_active: bool,
}

/// The authoritative subscription row, one per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub plan_id: String,
    pub processor_subscription_id: String,
    pub processor_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Active with an expiry already in the past
    pub fn is_lapsed(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at <= now
    }

    /// Whether the record grants access at `now`
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at > now
    }
}

/// Outcome of trying to claim a webhook event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This delivery owns processing of the event
    Claimed,
    /// Event already handled successfully (or deliberately ignored)
    AlreadyProcessed,
    /// Another delivery is processing the event right now
    InFlight,
}

/// Final state recorded for a claimed webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Success,
    Ignored,
    Error,
}

impl EventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventResult::Success => "success",
            EventResult::Ignored => "ignored",
            EventResult::Error => "error",
        }
    }
}

/// Invoice outcome kept for the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceOutcome {
    PaymentSucceeded,
    PaymentFailed,
}

impl InvoiceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceOutcome::PaymentSucceeded => "payment_succeeded",
            InvoiceOutcome::PaymentFailed => "payment_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub user_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub outcome: InvoiceOutcome,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

/// Data store used by the billing flows.
///
/// Implementations must enforce at most one subscription row per `user_id`
/// and at most one processed-event row per event id.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// The single active credential row, if any
    async fn active_credentials(&self) -> BillingResult<Option<CredentialRecord>>;

    /// Look up a plan by id; with `active_only` inactive plans are treated as missing
    async fn find_plan(&self, plan_id: &str, active_only: bool) -> BillingResult<Option<Plan>>;

    async fn subscription_for_user(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    async fn subscription_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn subscription_by_customer(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert a new row. Returns `false` without writing if the user already has one.
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool>;

    /// Overwrite the row for `record.user_id`. Returns the number of rows touched.
    async fn update_subscription(&self, record: &SubscriptionRecord) -> BillingResult<u64>;

    /// Mark the user's row expired only if it is still active with an expiry
    /// at or before `now`. Returns whether a row changed.
    async fn expire_if_lapsed(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<bool>;

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_created: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn record_invoice(&self, record: &InvoiceRecord) -> BillingResult<()>;
}
