use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use webhook_common::metrics::{setup_metrics_router, track_metrics};

use crate::service::WebhookService;

use super::{ops, webhooks};

pub fn add_routes(router: Router, service: Arc<WebhookService>) -> Router {
    router
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/webhooks",
            post(webhooks::register).layer(DefaultBodyLimit::disable()),
        )
        .route("/webhooks/:id", get(webhooks::get_webhook))
        .route("/webhooks/:id", delete(webhooks::deactivate))
        .route("/webhooks/:id/deliveries", get(webhooks::get_delivery_logs))
        .route("/queues/stats", get(ops::queue_stats))
        .route("/cache/stats", get(ops::cache_stats))
        .route("/cache/clear", post(ops::clear_cache))
        .merge(setup_metrics_router())
        .route_layer(axum::middleware::from_fn(track_metrics))
        .with_state(service)
}

pub async fn index() -> &'static str {
    "webhook tracking api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use sqlx::PgPool;
    use std::time::Duration;
    use tower::ServiceExt;
    use webhook_common::cache::TrackingCache;
    use webhook_common::carrier::CarrierRegistry;
    use webhook_common::queue::Queue;
    use webhook_common::retry::RetryPolicy;
    use webhook_common::store::RegistrationStore;

    fn test_service(db: PgPool) -> Arc<WebhookService> {
        Arc::new(WebhookService::new(
            Arc::new(RegistrationStore::new_from_pool(db.clone())),
            Arc::new(Queue::new_from_pool(db, "test", RetryPolicy::default())),
            Arc::new(TrackingCache::default()),
            Arc::new(CarrierRegistry::new()),
            Duration::from_secs(3600),
            false,
        ))
    }

    fn test_service_with_carrier(db: PgPool, carrier_id: &str) -> Arc<WebhookService> {
        let mut carriers = CarrierRegistry::new();
        carriers.register(
            carrier_id,
            Arc::new(webhook_common::carrier::test_support::StubCarrier::new(vec![])),
        );
        Arc::new(WebhookService::new(
            Arc::new(RegistrationStore::new_from_pool(db.clone())),
            Arc::new(Queue::new_from_pool(db, "test", RetryPolicy::default())),
            Arc::new(TrackingCache::default()),
            Arc::new(carriers),
            Duration::from_secs(3600),
            false,
        ))
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn index(db: PgPool) {
        let service = test_service(db);
        let app = add_routes(Router::new(), service);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"webhook tracking api");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn get_webhook_404s_for_unknown_id(db: PgPool) {
        let service = test_service(db);
        let app = add_routes(Router::new(), service);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/webhooks/{}", uuid::Uuid::nil()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn register_rejects_unknown_carrier(db: PgPool) {
        let service = test_service(db);
        let app = add_routes(Router::new(), service);

        let body = serde_json::json!({
            "carrierId": "unknown",
            "trackingNumber": "1",
            "callbackUrl": "https://hook.test/r1",
            "expirationTime": chrono::Utc::now() + chrono::Duration::hours(1),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn register_accepts_camel_case_body(db: PgPool) {
        // spec.md §6's Registration input is camelCase
        // (carrierId/trackingNumber/callbackUrl/expirationTime); this
        // guards against the route silently only accepting snake_case.
        let service = test_service_with_carrier(db, "kr.cjlogistics");
        let app = add_routes(Router::new(), service);

        let body = serde_json::json!({
            "carrierId": "kr.cjlogistics",
            "trackingNumber": "100000001",
            "callbackUrl": "https://hook.test/r1",
            "expirationTime": chrono::Utc::now() + chrono::Duration::hours(1),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
