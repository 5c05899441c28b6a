//! Pop `webhook-delivery` jobs and execute the callback POSTs they describe.

mod config;
mod dns;
mod util;
mod worker;

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use webhook_common::metrics::{setup_metrics_router, track_metrics};
use webhook_common::queue::Queue;
use webhook_common::retry::RetryPolicy;
use webhook_common::store::RegistrationStore;

use config::Config;
use worker::DeliveryWorker;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("delivery-worker".to_string(), time::Duration::seconds(60))
        .await;

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );

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

    let worker = DeliveryWorker::new(
        &config.worker_name,
        queue,
        store,
        config.poll_interval.0,
        config.request_timeout.0,
        config.max_concurrent_jobs,
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
    "webhook delivery worker"
}
