//! Subscription lookup and post-checkout confirmation

use axum::{
    extract::{Path, Query, State},
    Json,
};
use doclib_billing::{SubscriptionRecord, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub processor_subscription_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Active and not yet expired
    pub has_access: bool,
}

impl From<SubscriptionRecord> for SubscriptionView {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            has_access: record.grants_access(OffsetDateTime::now_utc()),
            user_id: record.user_id,
            plan_id: record.plan_id,
            status: record.status,
            processor_subscription_id: record.processor_subscription_id,
            started_at: record.started_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmQuery {
    pub plan_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub confirmed: bool,
    pub subscription: Option<SubscriptionView>,
}

/// GET /api/subscriptions/{user_id}
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<SubscriptionView>> {
    let record = state
        .billing
        .subscriptions
        .current_subscription(&user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(record.into()))
}

/// GET /api/subscriptions/{user_id}/confirm?planId=
///
/// Fallback for the checkout success page when the webhook has not landed yet.
pub async fn confirm_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<Json<ConfirmResponse>> {
    let plan_id = query.plan_id.as_deref().filter(|p| !p.trim().is_empty());

    let confirmation = state
        .billing
        .subscriptions
        .wait_for_subscription(&user_id, plan_id)
        .await?;

    Ok(Json(ConfirmResponse {
        confirmed: confirmation.confirmed,
        subscription: confirmation.subscription.map(SubscriptionView::from),
    }))
}
