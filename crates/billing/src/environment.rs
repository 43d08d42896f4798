//! Price/environment compatibility checks
//!
//! Test-mode and live-mode objects are never interoperable. A plan whose price
//! belongs to the other mode than the active secret key is the most common
//! checkout misconfiguration, so it is caught here with an error that says
//! which side is in which mode.

use crate::client::PaymentProcessor;
use crate::credentials::Environment;
use crate::error::{BillingError, BillingResult, ProcessorErrorCode};
use crate::store::Plan;

const PRICE_REF_PREFIX: &str = "price_";
const PRODUCT_REF_PREFIX: &str = "prod_";
const MIN_REF_BODY_LEN: usize = 8;

/// Result of a successful compatibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityVerdict {
    pub key_mode: Environment,
    /// Mode of the price as far as it could be determined
    pub reference_mode: Option<Environment>,
    /// Whether the processor lookup confirmed the verdict
    pub confirmed: bool,
}

fn validate_ref(reference: &str, prefix: &str, kind: &str) -> BillingResult<()> {
    let body = reference.strip_prefix(prefix).ok_or_else(|| {
        BillingError::InvalidReference(format!(
            "{} reference '{}' must start with '{}'",
            kind, reference, prefix
        ))
    })?;

    if body.len() < MIN_REF_BODY_LEN
        || !body.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BillingError::InvalidReference(format!(
            "{} reference '{}' is not a valid processor identifier",
            kind, reference
        )));
    }
    Ok(())
}

/// Check a price reference against the processor's price-id grammar
pub fn validate_price_ref(reference: &str) -> BillingResult<()> {
    validate_ref(reference, PRICE_REF_PREFIX, "price")
}

pub fn validate_product_ref(reference: &str) -> BillingResult<()> {
    validate_ref(reference, PRODUCT_REF_PREFIX, "product")
}

/// Classify a reference by its format alone.
///
/// References carrying an explicit `_test_`/`_live_` marker are classified;
/// anything else is undetermined and has to be confirmed by a lookup.
pub fn classify_reference(reference: &str) -> Option<Environment> {
    if reference.contains("_test_") {
        Some(Environment::Test)
    } else if reference.contains("_live_") {
        Some(Environment::Live)
    } else {
        None
    }
}

fn mismatch(key_mode: Environment, reference_kind: &'static str, reference: &str) -> BillingError {
    BillingError::EnvironmentMismatch {
        key_mode,
        reference_mode: key_mode.other(),
        reference_kind,
        reference: reference.to_string(),
    }
}

/// Verify that a plan's price and product references belong to `key_mode`.
///
/// Format disagreements are rejected before any processor call. A lookup that
/// fails for a transient reason does not block checkout.
pub async fn check_compatibility(
    processor: &dyn PaymentProcessor,
    key_mode: Environment,
    plan: &Plan,
) -> BillingResult<CompatibilityVerdict> {
    let price_ref = plan.processor_price_ref.as_str();
    let price_mode = classify_reference(price_ref);

    if let Some(mode) = price_mode {
        if mode != key_mode {
            tracing::error!(
                plan_id = %plan.id,
                key_mode = %key_mode,
                reference_mode = %mode,
                price_ref = %price_ref,
                "Price reference and secret key are in different modes"
            );
            return Err(mismatch(key_mode, "price", price_ref));
        }
    }

    if let Some(product_ref) = plan.processor_product_ref.as_deref() {
        if let Some(mode) = classify_reference(product_ref) {
            if mode != key_mode {
                tracing::error!(
                    plan_id = %plan.id,
                    key_mode = %key_mode,
                    reference_mode = %mode,
                    product_ref = %product_ref,
                    "Product reference and secret key are in different modes"
                );
                return Err(mismatch(key_mode, "product", product_ref));
            }
        }
    }

    match processor.retrieve_price(price_ref).await {
        Ok(price) => {
            let looked_up_mode = Environment::from_livemode(price.livemode);
            if looked_up_mode != key_mode {
                tracing::error!(
                    plan_id = %plan.id,
                    key_mode = %key_mode,
                    reference_mode = %looked_up_mode,
                    price_ref = %price_ref,
                    "Processor reports price in the other mode"
                );
                return Err(mismatch(key_mode, "price", price_ref));
            }

            if !price.active {
                return Err(BillingError::InvalidReference(format!(
                    "price '{}' is archived at the processor",
                    price_ref
                )));
            }

            if let (Some(expected), Some(actual)) =
                (plan.processor_product_ref.as_deref(), price.product_id.as_deref())
            {
                if expected != actual {
                    return Err(BillingError::InvalidReference(format!(
                        "price '{}' belongs to product '{}', plan expects '{}'",
                        price_ref, actual, expected
                    )));
                }
            }

            tracing::debug!(
                plan_id = %plan.id,
                key_mode = %key_mode,
                "Price confirmed compatible with credentials"
            );

            Ok(CompatibilityVerdict {
                key_mode,
                reference_mode: Some(looked_up_mode),
                confirmed: true,
            })
        }
        Err(e) => match e.code {
            ProcessorErrorCode::ModeMismatch => {
                tracing::error!(
                    plan_id = %plan.id,
                    key_mode = %key_mode,
                    price_ref = %price_ref,
                    "Price exists only in the other mode"
                );
                Err(mismatch(key_mode, "price", price_ref))
            }
            ProcessorErrorCode::ResourceMissing => Err(BillingError::NotFound(format!(
                "price '{}' does not exist in {} mode",
                price_ref, key_mode
            ))),
            ProcessorErrorCode::Authentication => Err(BillingError::Configuration(format!(
                "processor rejected the {} secret key",
                key_mode
            ))),
            ProcessorErrorCode::InvalidRequest => Err(BillingError::InvalidReference(format!(
                "processor rejected price reference '{}': {}",
                price_ref, e.message
            ))),
            ProcessorErrorCode::RateLimited
            | ProcessorErrorCode::Unavailable
            | ProcessorErrorCode::Timeout
            | ProcessorErrorCode::Transport => {
                tracing::warn!(
                    plan_id = %plan.id,
                    key_mode = %key_mode,
                    reference_mode = ?price_mode,
                    error = %e,
                    "Price lookup failed transiently, continuing without confirmation"
                );
                Ok(CompatibilityVerdict {
                    key_mode,
                    reference_mode: price_mode,
                    confirmed: false,
                })
            }
        },
    }
}
