//! Internal subscription status and the processor status mapping

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BillingError;

/// The four statuses a stored subscription can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(BillingError::Persistence(format!(
                "stored subscription status '{}' is not recognised",
                other
            ))),
        }
    }
}

/// Map a processor subscription status string onto the internal status.
///
/// Total: unrecognised statuses map to `Inactive` and are logged.
pub fn map_processor_status(processor_status: &str) -> SubscriptionStatus {
    match processor_status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" | "incomplete" | "incomplete_expired" => SubscriptionStatus::Inactive,
        "canceled" => SubscriptionStatus::Cancelled,
        other => {
            tracing::warn!(
                processor_status = %other,
                "Unrecognised processor subscription status, treating as inactive"
            );
            SubscriptionStatus::Inactive
        }
    }
}
