//! Operational endpoints: queue and cache introspection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use webhook_common::cache::CacheStats;
use webhook_common::queue::QueueCounts;

use crate::error::ApiError;
use crate::service::WebhookService;

pub async fn queue_stats(
    State(service): State<Arc<WebhookService>>,
) -> Result<Json<HashMap<String, QueueCounts>>, ApiError> {
    Ok(Json(service.get_queue_stats().await?))
}

pub async fn cache_stats(State(service): State<Arc<WebhookService>>) -> Json<CacheStats> {
    Json(service.get_cache_stats())
}

pub async fn clear_cache(State(service): State<Arc<WebhookService>>) {
    service.clear_cache();
}
