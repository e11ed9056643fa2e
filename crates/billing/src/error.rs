//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("No product mapping for provider product '{0}'")]
    UnmappedProduct(String),

    #[error("Product mapping for '{product_id}' is incomplete: {reason}")]
    InvalidMapping { product_id: String, reason: String },

    #[error("Cannot correlate event to a user: {0}")]
    UserCorrelation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<billsync_shared::SharedError> for BillingError {
    fn from(err: billsync_shared::SharedError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
