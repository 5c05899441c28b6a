//! Error kinds shared across the webhook subsystem: one `thiserror` enum
//! with a variant per failure class, plus a conversion from `sqlx::Error`
//! so store methods can use `?` directly.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("registration {0} not found")]
    NotFound(String),

    #[error("carrier not found: {0}")]
    CarrierUnknown(String),

    #[error("tracking API error: {0}")]
    CarrierFailure(String),

    #[error("delivery could not be completed but may be retried: {0}")]
    DeliveryTransient(String),

    #[error("delivery failed and cannot be retried: {0}")]
    DeliveryPermanent(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for WebhookError {
    fn from(error: sqlx::Error) -> Self {
        WebhookError::Internal(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
