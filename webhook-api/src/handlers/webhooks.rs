//! REST surface for the `Register`/`Deactivate`/`GetWebhook`/
//! `GetDeliveryLogs` facade operations.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use webhook_common::error::WebhookError;
use webhook_common::model::{DeliveryLog, WebhookRegistration};

use crate::error::ApiError;
use crate::service::{RegisterRequest, WebhookService};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub carrier_id: String,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
}

#[derive(serde::Serialize)]
pub struct RegisterResponse {
    pub id: Uuid,
}

pub async fn register(
    State(service): State<Arc<WebhookService>>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let id = service
        .register(RegisterRequest {
            carrier_id: body.carrier_id,
            tracking_number: body.tracking_number,
            callback_url: body.callback_url,
            expiration_time: body.expiration_time,
        })
        .await?;
    Ok(Json(RegisterResponse { id }))
}

pub async fn deactivate(
    State(service): State<Arc<WebhookService>>,
    Path(id): Path<Uuid>,
) -> Result<(), ApiError> {
    service.deactivate(id).await?;
    Ok(())
}

pub async fn get_webhook(
    State(service): State<Arc<WebhookService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WebhookRegistration>, ApiError> {
    let record = service
        .get_webhook(id)
        .await?
        .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct DeliveryLogsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn get_delivery_logs(
    State(service): State<Arc<WebhookService>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveryLogsQuery>,
) -> Result<Json<Vec<DeliveryLog>>, ApiError> {
    let logs = service.get_delivery_logs(id, query.limit).await?;
    Ok(Json(logs))
}
