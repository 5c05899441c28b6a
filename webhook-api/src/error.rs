//! Maps `WebhookError` onto HTTP responses. Lives here rather than in
//! `webhook-common` because `IntoResponse` is axum's trait and orphan rules
//! keep that impl out of the shared crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use webhook_common::error::WebhookError;

pub struct ApiError(pub WebhookError);

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WebhookError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebhookError::NotFound(_) => StatusCode::NOT_FOUND,
            WebhookError::CarrierUnknown(_) => StatusCode::BAD_REQUEST,
            WebhookError::CarrierFailure(_)
            | WebhookError::DeliveryTransient(_)
            | WebhookError::DeliveryPermanent(_)
            | WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
