//! In-memory store and fake processor for tests
//!
//! Enabled for this crate's unit tests and, through the `testing` feature,
//! for downstream crates' integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::client::{
    CheckoutSessionRequest, CreatedCheckoutSession, NewCustomer, PaymentProcessor, PriceInfo,
    ProcessorFactory, ProcessorSubscription,
};
use crate::credentials::{CredentialRecord, Credentials, Environment};
use crate::error::{BillingResult, ProcessorError, ProcessorErrorCode};
use crate::notify::{ActivationNotice, NotificationProvider};
use crate::status::SubscriptionStatus;
use crate::store::{
    BillingStore, EventClaim, EventResult, InvoiceRecord, Plan, SubscriptionRecord,
};
use crate::webhooks::compute_signature;

/// Events stuck in processing longer than this are reclaimed
const PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct EventRow {
    /// `None` while processing
    result: Option<EventResult>,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

/// `BillingStore` held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: Mutex<Option<CredentialRecord>>,
    plans: Mutex<HashMap<String, Plan>>,
    subscriptions: Mutex<HashMap<String, SubscriptionRecord>>,
    events: Mutex<HashMap<String, EventRow>>,
    invoices: Mutex<Vec<InvoiceRecord>>,
    /// Number of upcoming updates that silently keep the stored plan
    stale_plan_writes: AtomicUsize,
    /// Plan id written instead of the requested one by the next insert
    misplaced_insert_plan: Mutex<Option<String>>,
    updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a free, a basic and a pro plan
    pub fn with_default_plans() -> Self {
        let store = Self::new();
        store.add_plan(plan("free", "Free", 0, "price_1FreeTier0000"));
        store.add_plan(plan("basic", "Basic", 4900, "price_1BasicTier000"));
        store.add_plan(plan("pro", "Pro", 9900, "price_1NqXyZabcdef"));
        store
    }

    pub fn set_credentials(&self, record: CredentialRecord) {
        *lock(&self.credentials) = Some(record);
    }

    /// Store validated credentials as the active row
    pub fn set_active_credentials(&self, credentials: &Credentials) {
        self.set_credentials(CredentialRecord {
            secret_key: Some(credentials.secret_key.clone()),
            publishable_key: Some(credentials.publishable_key.clone()),
            webhook_signing_secret: Some(credentials.webhook_signing_secret.clone()),
            environment: Some(credentials.environment.as_str().to_string()),
        });
    }

    pub fn add_plan(&self, plan: Plan) {
        lock(&self.plans).insert(plan.id.clone(), plan);
    }

    pub fn put_subscription(&self, record: SubscriptionRecord) {
        lock(&self.subscriptions).insert(record.user_id.clone(), record);
    }

    pub fn subscription(&self, user_id: &str) -> Option<SubscriptionRecord> {
        lock(&self.subscriptions).get(user_id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn invoices(&self) -> Vec<InvoiceRecord> {
        lock(&self.invoices).clone()
    }

    /// Recorded result for an event: `Some(None)` while still processing
    pub fn event_result(&self, event_id: &str) -> Option<Option<EventResult>> {
        lock(&self.events).get(event_id).map(|row| row.result)
    }

    pub fn event_error(&self, event_id: &str) -> Option<String> {
        lock(&self.events)
            .get(event_id)
            .and_then(|row| row.error_message.clone())
    }

    /// Pretend an event started processing at `started_at` and never finished
    pub fn mark_event_processing(&self, event_id: &str, started_at: OffsetDateTime) {
        lock(&self.events).insert(
            event_id.to_string(),
            EventRow {
                result: None,
                started_at,
                error_message: None,
            },
        );
    }

    /// Make the next `n` subscription updates keep the stored plan id
    pub fn drop_plan_on_next_updates(&self, n: usize) {
        self.stale_plan_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next insert store `plan_id` instead of the requested plan
    pub fn misplace_plan_on_next_insert(&self, plan_id: &str) {
        *lock(&self.misplaced_insert_plan) = Some(plan_id.to_string());
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

fn plan(id: &str, name: &str, price_cents: i64, price_ref: &str) -> Plan {
    Plan {
        id: id.to_string(),
        name: name.to_string(),
        price_cents,
        processor_price_ref: price_ref.to_string(),
        processor_product_ref: None,
        is_active: true,
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn active_credentials(&self) -> BillingResult<Option<CredentialRecord>> {
        Ok(lock(&self.credentials).clone())
    }

    async fn find_plan(&self, plan_id: &str, active_only: bool) -> BillingResult<Option<Plan>> {
        Ok(lock(&self.plans)
            .get(plan_id)
            .filter(|p| !active_only || p.is_active)
            .cloned())
    }

    async fn subscription_for_user(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscription(user_id))
    }

    async fn subscription_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.subscriptions)
            .values()
            .find(|s| s.processor_subscription_id == processor_subscription_id)
            .cloned())
    }

    async fn subscription_by_customer(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.subscriptions)
            .values()
            .find(|s| s.processor_customer_id.as_deref() == Some(processor_customer_id))
            .cloned())
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(&record.user_id) {
            return Ok(false);
        }
        let mut stored = record.clone();
        if let Some(plan_id) = lock(&self.misplaced_insert_plan).take() {
            stored.plan_id = plan_id;
        }
        subscriptions.insert(record.user_id.clone(), stored);
        Ok(true)
    }

    async fn update_subscription(&self, record: &SubscriptionRecord) -> BillingResult<u64> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let drop_plan = self
            .stale_plan_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut subscriptions = lock(&self.subscriptions);
        match subscriptions.get_mut(&record.user_id) {
            Some(existing) => {
                let kept_plan = existing.plan_id.clone();
                *existing = record.clone();
                if drop_plan {
                    existing.plan_id = kept_plan;
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn expire_if_lapsed(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let mut subscriptions = lock(&self.subscriptions);
        match subscriptions.get_mut(user_id) {
            Some(row) if row.is_lapsed(now) => {
                row.status = SubscriptionStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_created: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let now = OffsetDateTime::now_utc();
        let mut events = lock(&self.events);

        let claim = match events.get(event_id) {
            None => EventClaim::Claimed,
            Some(row) => match row.result {
                Some(EventResult::Success) | Some(EventResult::Ignored) => EventClaim::AlreadyProcessed,
                Some(EventResult::Error) => EventClaim::Claimed,
                None if row.started_at < now - PROCESSING_TIMEOUT => EventClaim::Claimed,
                None => EventClaim::InFlight,
            },
        };

        if claim == EventClaim::Claimed {
            events.insert(
                event_id.to_string(),
                EventRow {
                    result: None,
                    started_at: now,
                    error_message: None,
                },
            );
        }
        Ok(claim)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(row) = lock(&self.events).get_mut(event_id) {
            row.result = Some(result);
            row.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn record_invoice(&self, record: &InvoiceRecord) -> BillingResult<()> {
        let mut invoices = lock(&self.invoices);
        match invoices.iter_mut().find(|i| i.invoice_id == record.invoice_id) {
            Some(existing) => *existing = record.clone(),
            None => invoices.push(record.clone()),
        }
        Ok(())
    }
}

/// Scriptable `PaymentProcessor` that records every call
#[derive(Debug)]
pub struct FakeProcessor {
    environment: Environment,
    prices: Mutex<HashMap<String, PriceInfo>>,
    subscriptions: Mutex<HashMap<String, ProcessorSubscription>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ProcessorError>>>,
    calls: Mutex<Vec<String>>,
    sessions: Mutex<Vec<CheckoutSessionRequest>>,
    sequence: AtomicUsize,
}

impl FakeProcessor {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            prices: Mutex::default(),
            subscriptions: Mutex::default(),
            failures: Mutex::default(),
            calls: Mutex::default(),
            sessions: Mutex::default(),
            sequence: AtomicUsize::new(1),
        }
    }

    pub fn add_price(&self, price: PriceInfo) {
        lock(&self.prices).insert(price.id.clone(), price);
    }

    /// Add or replace the processor's view of a subscription
    pub fn add_subscription(&self, subscription: ProcessorSubscription) {
        lock(&self.subscriptions).insert(subscription.id.clone(), subscription);
    }

    /// Queue an error for the next call of `operation`
    pub fn fail_next(&self, operation: &'static str, error: ProcessorError) {
        lock(&self.failures).entry(operation).or_default().push_back(error);
    }

    /// Operation names in call order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn created_sessions(&self) -> Vec<CheckoutSessionRequest> {
        lock(&self.sessions).clone()
    }

    fn begin(&self, operation: &'static str) -> Result<(), ProcessorError> {
        lock(&self.calls).push(operation.to_string());
        match lock(&self.failures).get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{:06}", prefix, self.environment.as_str(), n)
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    fn environment(&self) -> Environment {
        self.environment
    }

    async fn retrieve_price(&self, price_ref: &str) -> Result<PriceInfo, ProcessorError> {
        self.begin("retrieve_price")?;
        lock(&self.prices).get(price_ref).cloned().ok_or_else(|| {
            ProcessorError::new(
                "retrieve_price",
                ProcessorErrorCode::ResourceMissing,
                format!("No such price: '{}'", price_ref),
            )
            .with_status(404)
            .with_resource(price_ref)
        })
    }

    async fn create_customer(&self, _customer: NewCustomer) -> Result<String, ProcessorError> {
        self.begin("create_customer")?;
        Ok(self.next_id("cus"))
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CreatedCheckoutSession, ProcessorError> {
        self.begin("create_checkout_session")?;
        let id = self.next_id("cs");
        lock(&self.sessions).push(request);
        Ok(CreatedCheckoutSession {
            url: format!("https://checkout.stripe.com/c/pay/{}", id),
            id,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.begin("retrieve_subscription")?;
        lock(&self.subscriptions)
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                ProcessorError::new(
                    "retrieve_subscription",
                    ProcessorErrorCode::ResourceMissing,
                    format!("No such subscription: '{}'", subscription_id),
                )
                .with_status(404)
                .with_resource(subscription_id)
            })
    }
}

/// Factory handing out one shared `FakeProcessor`
#[derive(Debug, Clone)]
pub struct FakeFactory {
    processor: Arc<FakeProcessor>,
}

impl FakeFactory {
    pub fn new(processor: Arc<FakeProcessor>) -> Self {
        Self { processor }
    }
}

impl ProcessorFactory for FakeFactory {
    fn connect(&self, _credentials: &Credentials) -> Arc<dyn PaymentProcessor> {
        self.processor.clone()
    }
}

/// Notification provider that keeps what it was sent
#[derive(Debug, Default)]
pub struct RecordingProvider {
    notices: Mutex<Vec<ActivationNotice>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingProvider {
    /// A provider whose every delivery fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn notices(&self) -> Vec<ActivationNotice> {
        lock(&self.notices).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationProvider for RecordingProvider {
    async fn send(&self, notice: &ActivationNotice) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("recording provider configured to fail"));
        }
        lock(&self.notices).push(notice.clone());
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "recording"
    }
}

/// `Stripe-Signature` header for `payload` signed now
pub fn signature_header(secret: &str, payload: &str) -> BillingResult<String> {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}
