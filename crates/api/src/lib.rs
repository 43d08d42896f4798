// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! DocLib API Library
//!
//! HTTP surface for subscription checkout, Stripe webhooks and subscription
//! lookups.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::http::{header, HeaderValue, Method};
use axum::Router;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

/// Router with CORS restricted to `allowed_origins` and request tracing
pub fn build_app(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?origins,
        "CORS configured with {} allowed origins",
        origins.len()
    );

    // The webhook endpoint is called server-to-server and is unaffected by CORS
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
        .expose_headers([header::CONTENT_TYPE]);

    routes::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
