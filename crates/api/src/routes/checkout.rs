//! Checkout session creation

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use doclib_billing::{CheckoutRequest, CheckoutResponse};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /api/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    body: Result<Json<CheckoutRequest>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let Json(request) = body.map_err(|e| ApiError::Validation(e.body_text()))?;

    tracing::info!(
        user_id = %request.user_id,
        plan_id = %request.plan_id,
        "Checkout requested"
    );

    let response = state.billing.checkout.create_checkout(request).await.map_err(|e| {
        tracing::warn!(error = %e, "Checkout failed");
        ApiError::from(e)
    })?;

    Ok(Json(response))
}
