//! Billing error types

use std::fmt;

use crate::credentials::Environment;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by checkout, webhook and reconciliation flows
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Missing or inconsistent processor credentials
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing fields or malformed input
    #[error("validation error: {0}")]
    Validation(String),

    /// Plan cannot be checked out (e.g. free plan)
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Price or product reference does not match the processor grammar
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Secret key and price/product reference belong to different account modes
    #[error(
        "environment mismatch: secret key is in {key_mode} mode but {reference_kind} \
         '{reference}' belongs to {reference_mode} mode"
    )]
    EnvironmentMismatch {
        key_mode: Environment,
        reference_mode: Environment,
        reference_kind: &'static str,
        reference: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Webhook signature verification failed
    #[error("webhook signature invalid: {0}")]
    Signature(String),

    /// Webhook body could not be parsed after verification
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// Another delivery of the same event is still being processed
    #[error("event {0} is already being processed")]
    EventInFlight(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Persistence(err.to_string())
    }
}

impl BillingError {
    /// Reclassify a processor failure into the caller-facing taxonomy.
    ///
    /// `key_mode` is the mode of the credentials used for the call and is only
    /// needed to describe a mode mismatch.
    pub fn from_processor(err: ProcessorError, key_mode: Environment) -> Self {
        match err.code {
            ProcessorErrorCode::Authentication => BillingError::Configuration(format!(
                "processor rejected the {} secret key during {}",
                key_mode, err.operation
            )),
            ProcessorErrorCode::ModeMismatch => BillingError::EnvironmentMismatch {
                key_mode,
                reference_mode: key_mode.other(),
                reference_kind: "reference",
                reference: err.resource.clone().unwrap_or_else(|| "unknown".to_string()),
            },
            ProcessorErrorCode::ResourceMissing => BillingError::NotFound(format!(
                "processor resource {} not found during {}",
                err.resource.as_deref().unwrap_or("unknown"),
                err.operation
            )),
            ProcessorErrorCode::InvalidRequest => BillingError::Validation(format!(
                "processor rejected {}: {}",
                err.operation, err.message
            )),
            ProcessorErrorCode::RateLimited
            | ProcessorErrorCode::Unavailable
            | ProcessorErrorCode::Timeout
            | ProcessorErrorCode::Transport => BillingError::Processor(err),
        }
    }

    /// Whether a webhook delivery that failed with this error should be retried
    /// by the processor (non-2xx response).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Processor(_)
                | BillingError::Persistence(_)
                | BillingError::Configuration(_)
                | BillingError::EventInFlight(_)
        )
    }
}

/// Failure reported by the payment processor adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorError {
    /// Operation being performed (e.g. `retrieve_price`)
    pub operation: &'static str,
    pub code: ProcessorErrorCode,
    /// Human readable message from the processor, for logs only
    pub message: String,
    pub http_status: Option<u16>,
    /// Identifier of the object involved, when known
    pub resource: Option<String>,
}

impl ProcessorError {
    pub fn new(operation: &'static str, code: ProcessorErrorCode, message: impl Into<String>) -> Self {
        Self {
            operation,
            code,
            message: message.into(),
            http_status: None,
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// A definitive answer from the processor, as opposed to a transient failure
    pub fn is_definitive(&self) -> bool {
        match self.code {
            ProcessorErrorCode::ResourceMissing
            | ProcessorErrorCode::ModeMismatch
            | ProcessorErrorCode::Authentication
            | ProcessorErrorCode::InvalidRequest => true,
            ProcessorErrorCode::RateLimited
            | ProcessorErrorCode::Unavailable
            | ProcessorErrorCode::Timeout
            | ProcessorErrorCode::Transport => false,
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.operation, self.code, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " [http {}]", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProcessorError {}

/// Structured processor error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorErrorCode {
    /// Object does not exist in the account mode of the key
    ResourceMissing,
    /// Object exists, but in the other account mode
    ModeMismatch,
    /// Secret key rejected
    Authentication,
    /// Request parameters rejected
    InvalidRequest,
    RateLimited,
    /// Processor-side 5xx
    Unavailable,
    Timeout,
    /// Connection or serialization failure before a processor answer
    Transport,
}

impl fmt::Display for ProcessorErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorErrorCode::ResourceMissing => "resource_missing",
            ProcessorErrorCode::ModeMismatch => "mode_mismatch",
            ProcessorErrorCode::Authentication => "authentication",
            ProcessorErrorCode::InvalidRequest => "invalid_request",
            ProcessorErrorCode::RateLimited => "rate_limited",
            ProcessorErrorCode::Unavailable => "unavailable",
            ProcessorErrorCode::Timeout => "timeout",
            ProcessorErrorCode::Transport => "transport",
        };
        f.write_str(s)
    }
}
