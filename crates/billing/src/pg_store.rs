//! Postgres implementation of `BillingStore`

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credentials::CredentialRecord;
use crate::error::{BillingError, BillingResult};
use crate::store::{
    BillingStore, EventClaim, EventResult, InvoiceRecord, Plan, SubscriptionRecord,
};

/// Minutes after which an event stuck in 'processing' may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

const SUBSCRIPTION_COLUMNS: &str = "user_id, plan_id, processor_subscription_id, \
     processor_customer_id, status, started_at, expires_at";

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Persistence(format!("migration failed: {}", e)))
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    plan_id: String,
    processor_subscription_id: String,
    processor_customer_id: Option<String>,
    status: String,
    started_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            status: row.status.parse()?,
            user_id: row.user_id,
            plan_id: row.plan_id,
            processor_subscription_id: row.processor_subscription_id,
            processor_customer_id: row.processor_customer_id,
            started_at: row.started_at,
            expires_at: row.expires_at,
        })
    }
}

/// Billing store backed by a Postgres pool
#[derive(Debug, Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_subscription(
        &self,
        column: &'static str,
        value: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        // `column` is always one of the fixed names below, never user input
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {} = $1 ORDER BY updated_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS, column
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn active_credentials(&self) -> BillingResult<Option<CredentialRecord>> {
        let record: Option<CredentialRecord> = sqlx::query_as(
            r#"
            SELECT secret_key, publishable_key, webhook_signing_secret, environment
            FROM payment_credentials
            WHERE is_active = TRUE
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_plan(&self, plan_id: &str, active_only: bool) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, ROUND(price * 100)::BIGINT AS price_cents,
                   processor_price_ref, processor_product_ref, is_active
            FROM plans
            WHERE id = $1 AND (is_active = TRUE OR NOT $2)
            "#,
        )
        .bind(plan_id)
        .bind(active_only)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn subscription_for_user(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_subscription("user_id", user_id).await
    }

    async fn subscription_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_subscription("processor_subscription_id", processor_subscription_id)
            .await
    }

    async fn subscription_by_customer(
        &self,
        processor_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.fetch_subscription("processor_customer_id", processor_customer_id)
            .await
    }

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, processor_subscription_id, processor_customer_id,
                status, started_at, expires_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.plan_id)
        .bind(&record.processor_subscription_id)
        .bind(&record.processor_customer_id)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_subscription(&self, record: &SubscriptionRecord) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                processor_subscription_id = $3,
                processor_customer_id = $4,
                status = $5,
                started_at = $6,
                expires_at = $7,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.plan_id)
        .bind(&record.processor_subscription_id)
        .bind(&record.processor_customer_id)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn expire_if_lapsed(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'expired',
                updated_at = NOW()
            WHERE user_id = $1
              AND status = 'active'
              AND expires_at <= $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim an event id.
    ///
    /// INSERT ... ON CONFLICT ... RETURNING lets exactly one concurrent delivery
    /// win. Rows that errored, or that have been processing for longer than the
    /// timeout, are reclaimed.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_created: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events
                (event_id, event_type, event_created_at, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE processed_webhook_events.processing_result = 'error'
               OR (processed_webhook_events.processing_result = 'processing'
                   AND processed_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_created)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::from(e)
        })?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM processed_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == "processing" => EventClaim::InFlight,
            _ => EventClaim::AlreadyProcessed,
        })
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_invoice(&self, record: &InvoiceRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_invoices (
                invoice_id, user_id, processor_subscription_id, processor_customer_id,
                outcome, amount_cents, currency, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (invoice_id) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, subscription_invoices.user_id),
                outcome = EXCLUDED.outcome,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                recorded_at = NOW()
            "#,
        )
        .bind(&record.invoice_id)
        .bind(&record.user_id)
        .bind(&record.processor_subscription_id)
        .bind(&record.processor_customer_id)
        .bind(record.outcome.as_str())
        .bind(record.amount_cents)
        .bind(&record.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SubscriptionStatus;

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let now = OffsetDateTime::now_utc();
        let row = SubscriptionRow {
            user_id: "u1".into(),
            plan_id: "pro".into(),
            processor_subscription_id: "sub_1".into(),
            processor_customer_id: None,
            status: "canceled".into(),
            started_at: now,
            expires_at: now,
        };
        assert!(matches!(
            SubscriptionRecord::try_from(row),
            Err(BillingError::Persistence(_))
        ));
    }

    #[test]
    fn test_row_conversion() {
        let now = OffsetDateTime::now_utc();
        let row = SubscriptionRow {
            user_id: "u1".into(),
            plan_id: "pro".into(),
            processor_subscription_id: "sub_1".into(),
            processor_customer_id: Some("cus_1".into()),
            status: "active".into(),
            started_at: now,
            expires_at: now,
        };
        let record = SubscriptionRecord::try_from(row).unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.processor_customer_id.as_deref(), Some("cus_1"));
    }
}
