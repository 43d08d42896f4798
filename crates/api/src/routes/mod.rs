//! HTTP routes

pub mod checkout;
pub mod health;
pub mod subscriptions;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/checkout", post(checkout::create_checkout))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/api/subscriptions/{user_id}",
            get(subscriptions::get_subscription),
        )
        .route(
            "/api/subscriptions/{user_id}/confirm",
            get(subscriptions::confirm_subscription),
        )
        .with_state(state)
}
