//! Stripe webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use doclib_billing::BillingError;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/webhooks/stripe
///
/// The body is taken raw: the signature covers the exact bytes.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without Stripe-Signature header");
            BillingError::Signature("missing Stripe-Signature header".to_string())
        })?;

    let payload = std::str::from_utf8(&body).map_err(|e| {
        tracing::warn!(error = %e, payload_len = body.len(), "Webhook body is not valid UTF-8");
        ApiError::Validation("webhook body must be UTF-8 JSON".to_string())
    })?;

    let outcome = state.billing.webhooks.handle(payload, signature).await?;
    tracing::debug!(outcome = ?outcome, "Webhook acknowledged");

    Ok(Json(json!({ "received": true })))
}
