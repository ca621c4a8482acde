//! Billing error types

use thiserror::Error;

/// Billing-specific errors.
///
/// Expected blocking conditions (insufficient balance, per-appointment cap)
/// are structured results on the wallet operations, not errors; only
/// infrastructure faults and caller mistakes surface here.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Subscription not found or reconstructable: {0}")]
    SubscriptionUnresolvable(String),

    #[error("Unknown credit package: {0}")]
    PackageInvalid(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
