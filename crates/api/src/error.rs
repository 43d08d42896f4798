//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use doclib_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(err) => billing_status(err),
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::Validation(_)
        | BillingError::InvalidPlan(_)
        | BillingError::InvalidReference(_)
        | BillingError::EnvironmentMismatch { .. }
        | BillingError::Signature(_)
        | BillingError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::EventInFlight(_) => StatusCode::CONFLICT,
        BillingError::Configuration(_)
        | BillingError::Processor(_)
        | BillingError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Short machine-readable label for the response `error` field
fn billing_label(err: &BillingError) -> &'static str {
    match err {
        BillingError::Configuration(_) => "configuration_error",
        BillingError::Validation(_) => "validation_error",
        BillingError::InvalidPlan(_) => "invalid_plan",
        BillingError::InvalidReference(_) => "invalid_reference",
        BillingError::EnvironmentMismatch { .. } => "environment_mismatch",
        BillingError::NotFound(_) => "not_found",
        BillingError::Signature(_) => "invalid_signature",
        BillingError::MalformedPayload(_) => "malformed_payload",
        BillingError::Processor(_) => "payment_processor_error",
        BillingError::Persistence(_) => "internal_error",
        BillingError::EventInFlight(_) => "event_in_progress",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (error, details) = match &self {
            ApiError::Billing(err) => {
                let details = match err {
                    // Internal failures: full diagnostic to the log only
                    BillingError::Configuration(_)
                    | BillingError::Processor(_)
                    | BillingError::Persistence(_) => {
                        tracing::error!(error = %err, "Billing request failed");
                        "The request could not be completed, please try again later".to_string()
                    }
                    // Never echo signature diagnostics back to the sender
                    BillingError::Signature(_) => {
                        "Webhook signature verification failed".to_string()
                    }
                    other => other.to_string(),
                };
                (billing_label(err), details)
            }
            ApiError::Validation(msg) => ("validation_error", msg.clone()),
            ApiError::NotFound => ("not_found", "Resource not found".to_string()),
        };

        let body = Json(json!({
            "error": error,
            "details": details,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclib_billing::{Environment, ProcessorError, ProcessorErrorCode};

    #[test]
    fn test_client_errors_are_400() {
        for err in [
            BillingError::Validation("planId is required".into()),
            BillingError::InvalidPlan("free".into()),
            BillingError::InvalidReference("price".into()),
            BillingError::Signature("bad".into()),
            BillingError::MalformedPayload("bad".into()),
            BillingError::EnvironmentMismatch {
                key_mode: Environment::Live,
                reference_mode: Environment::Test,
                reference_kind: "price",
                reference: "price_test_abc12345".into(),
            },
        ] {
            assert_eq!(ApiError::from(err).status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_internal_errors_are_500() {
        let processor = ProcessorError::new(
            "create_customer",
            ProcessorErrorCode::Unavailable,
            "upstream exploded",
        );
        for err in [
            BillingError::Configuration("no credentials".into()),
            BillingError::Processor(processor),
            BillingError::Persistence("connection reset".into()),
        ] {
            assert_eq!(ApiError::from(err).status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_not_found() {
        assert_eq!(
            ApiError::from(BillingError::NotFound("plan".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_event_in_flight_is_conflict() {
        assert_eq!(
            ApiError::from(BillingError::EventInFlight("evt_1".into())).status(),
            StatusCode::CONFLICT
        );
    }
}
