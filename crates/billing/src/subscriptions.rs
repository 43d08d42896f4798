//! Subscription reconciliation
//!
//! Applies processor events to the single subscription row kept per user.
//! Events arrive out of order and more than once, so every write is an upsert
//! keyed by user id and the processor's current view of the subscription is
//! re-fetched wherever the event payload could be stale.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::client::{PaymentProcessor, ProcessorSubscription, META_PLAN_ID, META_PLAN_NAME, META_USER_ID};
use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSessionObject, InvoiceObject, SubscriptionObject};
use crate::notify::{ActivationNotice, Notifier};
use crate::status::{map_processor_status, SubscriptionStatus};
use crate::store::{BillingStore, InvoiceOutcome, InvoiceRecord, SubscriptionRecord};

/// Length of a paid subscription term
pub const SUBSCRIPTION_TERM: Duration = Duration::days(365);

/// What a reconciliation step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The subscription row was written
    Applied {
        user_id: String,
        status: SubscriptionStatus,
        activated: bool,
    },
    /// An invoice audit row was written without touching the subscription
    Recorded,
    /// Nothing to do; the reason is logged
    Skipped(&'static str),
}

/// Bounds for the success-page polling fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: usize,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
    pub total_budget: StdDuration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: StdDuration::from_millis(500),
            max_delay: StdDuration::from_secs(5),
            total_budget: StdDuration::from_secs(20),
        }
    }
}

impl PollPolicy {
    fn strategy(&self) -> impl Iterator<Item = StdDuration> {
        // ExponentialBackoff yields base^n ms scaled by factor; base 2 doubles each step
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Result of waiting for a checkout to land
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub confirmed: bool,
    pub subscription: Option<SubscriptionRecord>,
}

/// Processor state to be written for one user
#[derive(Debug, Clone)]
struct SubscriptionSnapshot {
    user_id: String,
    /// `None` keeps the stored plan
    plan_id: Option<String>,
    plan_name: Option<String>,
    processor_subscription_id: String,
    processor_customer_id: Option<String>,
    status: SubscriptionStatus,
    period_start: Option<OffsetDateTime>,
}

fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.filter(|s| *s > 0)
        .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Correct an active row whose term has run out
fn downgrade_if_lapsed(record: &mut SubscriptionRecord, now: OffsetDateTime) -> bool {
    if record.is_lapsed(now) {
        tracing::info!(
            user_id = %record.user_id,
            expires_at = %record.expires_at,
            "Subscription term elapsed, marking expired"
        );
        record.status = SubscriptionStatus::Expired;
        true
    } else {
        false
    }
}

/// Writes processor state into the subscription store
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    notifier: Notifier,
    poll_policy: PollPolicy,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Notifier) -> Self {
        Self {
            store,
            notifier,
            poll_policy: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    /// `checkout.session.completed`
    pub async fn on_checkout_completed(
        &self,
        processor: &dyn PaymentProcessor,
        session: CheckoutSessionObject,
        source: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let user_id = non_empty(session.metadata.get(META_USER_ID))
            .or_else(|| non_empty(session.client_reference_id.as_ref()));
        let plan_id = non_empty(session.metadata.get(META_PLAN_ID));

        let (user_id, plan_id) = match (user_id, plan_id) {
            (Some(u), Some(p)) => (u, p),
            (user_id, plan_id) => {
                tracing::warn!(
                    session_id = %session.id,
                    has_user_id = user_id.is_some(),
                    has_plan_id = plan_id.is_some(),
                    "Checkout session is missing user or plan metadata, ignoring"
                );
                return Ok(ReconcileOutcome::Skipped("checkout session missing metadata"));
            }
        };

        let Some(plan) = self.store.find_plan(&plan_id, false).await? else {
            tracing::warn!(
                session_id = %session.id,
                plan_id = %plan_id,
                "Checkout session references a plan missing from the catalog, ignoring"
            );
            return Ok(ReconcileOutcome::Skipped("unknown plan"));
        };

        let Some(subscription_id) = session.subscription.clone() else {
            tracing::warn!(
                session_id = %session.id,
                mode = ?session.mode,
                "Completed checkout session carries no subscription, ignoring"
            );
            return Ok(ReconcileOutcome::Skipped("checkout session without subscription"));
        };

        let current = processor
            .retrieve_subscription(&subscription_id)
            .await
            .map_err(|e| BillingError::from_processor(e, processor.environment()))?;

        let snapshot = SubscriptionSnapshot {
            user_id,
            plan_id: Some(plan.id.clone()),
            plan_name: Some(plan.name.clone()),
            processor_subscription_id: current.id.clone(),
            processor_customer_id: current.customer_id.clone().or(session.customer.clone()),
            status: map_processor_status(&current.status),
            period_start: timestamp(current.current_period_start),
        };

        self.upsert(snapshot, source).await
    }

    /// `customer.subscription.created` / `customer.subscription.updated`
    pub async fn on_subscription_changed(
        &self,
        processor: &dyn PaymentProcessor,
        payload: SubscriptionObject,
        source: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let current = match processor.retrieve_subscription(&payload.id).await {
            Ok(current) => current,
            Err(e) if e.is_definitive() => {
                tracing::warn!(
                    subscription_id = %payload.id,
                    error = %e,
                    "Could not re-fetch subscription, using event payload"
                );
                ProcessorSubscription {
                    id: payload.id.clone(),
                    customer_id: payload.customer.clone(),
                    status: payload.status.clone().unwrap_or_default(),
                    current_period_start: payload.current_period_start,
                    current_period_end: payload.current_period_end,
                    ended_at: payload.ended_at,
                    metadata: payload.metadata.clone(),
                }
            }
            Err(e) => return Err(BillingError::from_processor(e, processor.environment())),
        };

        let metadata_user = non_empty(current.metadata.get(META_USER_ID))
            .or_else(|| non_empty(payload.metadata.get(META_USER_ID)));
        let plan_id = non_empty(current.metadata.get(META_PLAN_ID))
            .or_else(|| non_empty(payload.metadata.get(META_PLAN_ID)));

        let user_id = match metadata_user {
            Some(user_id) => user_id,
            None => match self.store.subscription_by_processor_id(&current.id).await? {
                Some(row) => row.user_id,
                None => {
                    tracing::warn!(
                        subscription_id = %current.id,
                        "Subscription has no user metadata and no stored row, ignoring"
                    );
                    return Ok(ReconcileOutcome::Skipped("subscription not linked to a user"));
                }
            },
        };

        let plan_name = match &plan_id {
            Some(plan_id) => match self.store.find_plan(plan_id, false).await? {
                Some(plan) => Some(plan.name),
                None => {
                    tracing::warn!(
                        subscription_id = %current.id,
                        plan_id = %plan_id,
                        "Subscription references a plan missing from the catalog, ignoring"
                    );
                    return Ok(ReconcileOutcome::Skipped("unknown plan"));
                }
            },
            None => non_empty(current.metadata.get(META_PLAN_NAME)),
        };

        let snapshot = SubscriptionSnapshot {
            user_id,
            plan_id,
            plan_name,
            processor_subscription_id: current.id.clone(),
            processor_customer_id: current.customer_id.clone(),
            status: map_processor_status(&current.status),
            period_start: timestamp(current.current_period_start),
        };

        self.upsert(snapshot, source).await
    }

    /// `customer.subscription.deleted`
    pub async fn on_subscription_deleted(
        &self,
        payload: SubscriptionObject,
    ) -> BillingResult<ReconcileOutcome> {
        let existing = match non_empty(payload.metadata.get(META_USER_ID)) {
            Some(user_id) => self.store.subscription_for_user(&user_id).await?,
            None => self.store.subscription_by_processor_id(&payload.id).await?,
        };

        let Some(mut record) = existing else {
            tracing::warn!(subscription_id = %payload.id, "Deleted subscription has no stored row, ignoring");
            return Ok(ReconcileOutcome::Skipped("no stored subscription"));
        };

        if record.processor_subscription_id != payload.id {
            tracing::info!(
                user_id = %record.user_id,
                subscription_id = %payload.id,
                current_subscription_id = %record.processor_subscription_id,
                "Deletion is for a superseded subscription, ignoring"
            );
            return Ok(ReconcileOutcome::Skipped("superseded subscription"));
        }

        let now = OffsetDateTime::now_utc();
        record.status = SubscriptionStatus::Cancelled;
        record.expires_at = timestamp(payload.ended_at)
            .or_else(|| timestamp(payload.current_period_end))
            .unwrap_or(now);

        self.store.update_subscription(&record).await?;

        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %payload.id,
            expires_at = %record.expires_at,
            "Subscription cancelled"
        );

        Ok(ReconcileOutcome::Applied {
            user_id: record.user_id,
            status: SubscriptionStatus::Cancelled,
            activated: false,
        })
    }

    /// `invoice.payment_failed`
    pub async fn on_invoice_failed(&self, invoice: InvoiceObject) -> BillingResult<ReconcileOutcome> {
        let existing = self.subscription_for_invoice(&invoice).await?;

        let outcome = match existing {
            Some(mut record) => {
                record.status = SubscriptionStatus::Inactive;
                self.store.update_subscription(&record).await?;
                tracing::warn!(
                    user_id = %record.user_id,
                    invoice_id = %invoice.id,
                    "Invoice payment failed, subscription marked inactive"
                );
                self.record_invoice(&invoice, Some(record.user_id.clone()), InvoiceOutcome::PaymentFailed)
                    .await?;
                ReconcileOutcome::Applied {
                    user_id: record.user_id,
                    status: SubscriptionStatus::Inactive,
                    activated: false,
                }
            }
            None => match self.customer_subscription(&invoice).await? {
                // The customer moved on to another subscription; keep the audit row only
                Some(current) if invoice.subscription.is_some() => {
                    tracing::info!(
                        user_id = %current.user_id,
                        invoice_id = %invoice.id,
                        subscription_id = ?invoice.subscription,
                        current_subscription_id = %current.processor_subscription_id,
                        "Failed invoice is for a superseded subscription, ignoring"
                    );
                    self.record_invoice(&invoice, Some(current.user_id), InvoiceOutcome::PaymentFailed)
                        .await?;
                    ReconcileOutcome::Skipped("superseded subscription")
                }
                _ => {
                    tracing::warn!(
                        invoice_id = %invoice.id,
                        subscription_id = ?invoice.subscription,
                        customer_id = ?invoice.customer,
                        "Failed invoice matches no stored subscription"
                    );
                    self.record_invoice(&invoice, None, InvoiceOutcome::PaymentFailed).await?;
                    ReconcileOutcome::Recorded
                }
            },
        };

        Ok(outcome)
    }

    /// `invoice.payment_succeeded`. The subscription events carry the state change.
    pub async fn on_invoice_succeeded(&self, invoice: InvoiceObject) -> BillingResult<ReconcileOutcome> {
        let user_id = match self.subscription_for_invoice(&invoice).await? {
            Some(record) => Some(record.user_id),
            None => self.customer_subscription(&invoice).await?.map(|r| r.user_id),
        };
        self.record_invoice(&invoice, user_id, InvoiceOutcome::PaymentSucceeded).await?;
        tracing::info!(invoice_id = %invoice.id, "Invoice payment recorded");
        Ok(ReconcileOutcome::Recorded)
    }

    /// The stored row an invoice applies to.
    ///
    /// An invoice naming a subscription only matches that subscription; the
    /// customer is used only for invoices without one.
    async fn subscription_for_invoice(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        match invoice.subscription.as_deref() {
            Some(subscription_id) => self.store.subscription_by_processor_id(subscription_id).await,
            None => self.customer_subscription(invoice).await,
        }
    }

    async fn customer_subscription(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        match invoice.customer.as_deref() {
            Some(customer_id) => self.store.subscription_by_customer(customer_id).await,
            None => Ok(None),
        }
    }

    async fn record_invoice(
        &self,
        invoice: &InvoiceObject,
        user_id: Option<String>,
        outcome: InvoiceOutcome,
    ) -> BillingResult<()> {
        let amount_cents = match outcome {
            InvoiceOutcome::PaymentSucceeded => invoice.amount_paid.or(invoice.amount_due),
            InvoiceOutcome::PaymentFailed => invoice.amount_due.or(invoice.amount_paid),
        };

        self.store
            .record_invoice(&InvoiceRecord {
                invoice_id: invoice.id.clone(),
                user_id: user_id.or_else(|| invoice.metadata_value(META_USER_ID).map(str::to_string)),
                processor_subscription_id: invoice.subscription.clone(),
                processor_customer_id: invoice.customer.clone(),
                outcome,
                amount_cents,
                currency: invoice.currency.clone(),
            })
            .await
    }

    /// Idempotent write of a processor snapshot into the user's row
    async fn upsert(&self, snapshot: SubscriptionSnapshot, source: &str) -> BillingResult<ReconcileOutcome> {
        let now = OffsetDateTime::now_utc();

        let existing = match self.store.subscription_for_user(&snapshot.user_id).await? {
            Some(existing) => existing,
            None => {
                let Some(plan_id) = snapshot.plan_id.clone() else {
                    tracing::warn!(
                        user_id = %snapshot.user_id,
                        subscription_id = %snapshot.processor_subscription_id,
                        "No plan known for a new subscription row, ignoring"
                    );
                    return Ok(ReconcileOutcome::Skipped("no plan for new subscription"));
                };

                let started_at = snapshot.period_start.unwrap_or(now);
                let mut record = SubscriptionRecord {
                    user_id: snapshot.user_id.clone(),
                    plan_id,
                    processor_subscription_id: snapshot.processor_subscription_id.clone(),
                    processor_customer_id: snapshot.processor_customer_id.clone(),
                    status: snapshot.status,
                    started_at,
                    expires_at: started_at + SUBSCRIPTION_TERM,
                };
                downgrade_if_lapsed(&mut record, now);

                if self.store.insert_subscription(&record).await? {
                    self.verify_plan(&record).await?;
                    tracing::info!(
                        user_id = %record.user_id,
                        plan_id = %record.plan_id,
                        status = %record.status,
                        expires_at = %record.expires_at,
                        source = %source,
                        "Subscription created"
                    );
                    let activated = record.status.is_active();
                    if activated {
                        self.notify(&record, snapshot.plan_name.clone(), source);
                    }
                    return Ok(ReconcileOutcome::Applied {
                        user_id: record.user_id,
                        status: record.status,
                        activated,
                    });
                }

                tracing::info!(
                    user_id = %snapshot.user_id,
                    "Concurrent insert won the race, updating instead"
                );
                self.store
                    .subscription_for_user(&snapshot.user_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Persistence(format!(
                            "subscription row for user {} vanished after conflicting insert",
                            snapshot.user_id
                        ))
                    })?
            }
        };

        if existing.processor_subscription_id != snapshot.processor_subscription_id
            && !snapshot.status.is_active()
        {
            tracing::info!(
                user_id = %existing.user_id,
                subscription_id = %snapshot.processor_subscription_id,
                current_subscription_id = %existing.processor_subscription_id,
                status = %snapshot.status,
                "Event is for a superseded subscription, ignoring"
            );
            return Ok(ReconcileOutcome::Skipped("superseded subscription"));
        }

        let renewal = snapshot.status.is_active()
            && (!existing.status.is_active()
                || existing.processor_subscription_id != snapshot.processor_subscription_id
                || snapshot
                    .period_start
                    .is_some_and(|start| start != existing.started_at));

        let mut record = SubscriptionRecord {
            user_id: existing.user_id.clone(),
            plan_id: snapshot.plan_id.clone().unwrap_or_else(|| existing.plan_id.clone()),
            processor_subscription_id: snapshot.processor_subscription_id.clone(),
            processor_customer_id: snapshot
                .processor_customer_id
                .clone()
                .or_else(|| existing.processor_customer_id.clone()),
            status: snapshot.status,
            started_at: snapshot
                .period_start
                .unwrap_or(if renewal { now } else { existing.started_at }),
            expires_at: if renewal {
                now + SUBSCRIPTION_TERM
            } else {
                existing.expires_at
            },
        };
        downgrade_if_lapsed(&mut record, now);

        self.store.update_subscription(&record).await?;
        self.verify_plan(&record).await?;

        let activated = record.status.is_active() && !existing.status.is_active();

        tracing::info!(
            user_id = %record.user_id,
            plan_id = %record.plan_id,
            previous_status = %existing.status,
            status = %record.status,
            renewal = renewal,
            expires_at = %record.expires_at,
            source = %source,
            "Subscription updated"
        );

        if activated {
            self.notify(&record, snapshot.plan_name.clone(), source);
        }

        Ok(ReconcileOutcome::Applied {
            user_id: record.user_id,
            status: record.status,
            activated,
        })
    }

    /// Re-read after an update and re-apply once if the plan did not stick
    async fn verify_plan(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let stored_plan = self
            .store
            .subscription_for_user(&record.user_id)
            .await?
            .map(|r| r.plan_id);

        if stored_plan.as_deref() == Some(record.plan_id.as_str()) {
            return Ok(());
        }

        tracing::warn!(
            user_id = %record.user_id,
            expected_plan = %record.plan_id,
            stored_plan = ?stored_plan,
            "Plan did not persist, retrying update once"
        );
        self.store.update_subscription(record).await?;

        let stored_plan = self
            .store
            .subscription_for_user(&record.user_id)
            .await?
            .map(|r| r.plan_id);
        if stored_plan.as_deref() != Some(record.plan_id.as_str()) {
            tracing::warn!(
                user_id = %record.user_id,
                expected_plan = %record.plan_id,
                stored_plan = ?stored_plan,
                "Plan still differs after retry, leaving for the next event"
            );
        }
        Ok(())
    }

    fn notify(&self, record: &SubscriptionRecord, plan_name: Option<String>, source: &str) {
        self.notifier.try_notify(ActivationNotice {
            user_id: record.user_id.clone(),
            plan_id: record.plan_id.clone(),
            plan_name,
            processor_subscription_id: record.processor_subscription_id.clone(),
            status: record.status,
            expires_at: record.expires_at,
            source: source.to_string(),
        });
    }

    /// Current subscription for a user with the lapsed-term correction applied
    pub async fn current_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let Some(mut record) = self.store.subscription_for_user(user_id).await? else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        if !downgrade_if_lapsed(&mut record, now) {
            return Ok(Some(record));
        }

        // Conditional write: a renewal landing in between must not be overwritten
        match self.store.expire_if_lapsed(user_id, now).await {
            Ok(true) => Ok(Some(record)),
            Ok(false) => {
                tracing::info!(user_id = %user_id, "Subscription changed before expiry correction, re-reading");
                self.store.subscription_for_user(user_id).await
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to persist expiry correction"
                );
                Ok(Some(record))
            }
        }
    }

    /// Poll until the user holds an active subscription (to `plan_id` when given).
    ///
    /// Bounded by the poll policy's attempt count and total time budget.
    pub async fn wait_for_subscription(
        &self,
        user_id: &str,
        plan_id: Option<&str>,
    ) -> BillingResult<SubscriptionConfirmation> {
        let policy = self.poll_policy;
        let this = self;

        let attempt = move || async move {
            match this.current_subscription(user_id).await {
                Ok(Some(record))
                    if record.grants_access(OffsetDateTime::now_utc())
                        && plan_id.map_or(true, |p| p == record.plan_id) =>
                {
                    Ok(record)
                }
                Ok(_) => Err(()),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Subscription poll read failed");
                    Err(())
                }
            }
        };

        let polled = tokio::time::timeout(policy.total_budget, Retry::spawn(policy.strategy(), attempt)).await;

        match polled {
            Ok(Ok(record)) => Ok(SubscriptionConfirmation {
                confirmed: true,
                subscription: Some(record),
            }),
            Ok(Err(())) | Err(_) => {
                tracing::info!(
                    user_id = %user_id,
                    plan_id = ?plan_id,
                    "Subscription not confirmed within polling budget"
                );
                Ok(SubscriptionConfirmation {
                    confirmed: false,
                    subscription: self.current_subscription(user_id).await?,
                })
            }
        }
    }
}
