//! Sweep expired registrations, stale cache entries, and queue
//! housekeeping on the hourly `expiration-cleanup` cron.

mod config;
mod janitor;

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use webhook_common::cache::TrackingCache;
use webhook_common::metrics::{setup_metrics_router, track_metrics};
use webhook_common::queue::Queue;
use webhook_common::retry::fixed_interval;
use webhook_common::store::RegistrationStore;

use config::Config;
use janitor::CleanupWorker;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("cleanup-worker".to_string(), time::Duration::seconds(60))
        .await;

    let retry_policy = fixed_interval(Duration::from_millis(config.retry_fixed_interval_ms));

    let queue = Arc::new(
        Queue::new(&config.database_url, &config.worker_name, retry_policy)
            .await
            .expect("failed to initialize queue"),
    );

    let store = Arc::new(
        RegistrationStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to initialize registration store"),
    );

    let cache = Arc::new(TrackingCache::new(
        Duration::from_millis(config.cache_ttl_ms),
        config.cache_max_size,
    ));

    let worker = CleanupWorker::new(
        &config.worker_name,
        queue,
        store,
        cache,
        config.poll_interval(),
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router())
        .route_layer(axum::middleware::from_fn(track_metrics));

    let bind = config.bind();
    tokio::task::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .expect("failed to bind metrics listener");
        axum::serve(listener, router)
            .await
            .expect("failed to serve metrics");
    });

    worker.run().await;

    Ok(())
}

async fn index() -> &'static str {
    "webhook cleanup worker"
}
