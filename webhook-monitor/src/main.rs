//! Pop `tracking-monitor` jobs: consult the cache or a carrier, checksum
//! the event timeline, and enqueue `webhook-delivery` jobs on change.

mod config;
mod monitor;

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use webhook_common::cache::TrackingCache;
use webhook_common::carrier::CarrierRegistry;
use webhook_common::metrics::{setup_metrics_router, track_metrics};
use webhook_common::queue::Queue;
use webhook_common::store::RegistrationStore;

use config::Config;
use monitor::MonitorWorker;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("monitor-worker".to_string(), time::Duration::seconds(60))
        .await;

    let queue = Arc::new(
        Queue::new(&config.database_url, &config.worker_name, config.retry_policy())
            .await
            .expect("failed to initialize queue"),
    );

    let store = Arc::new(
        RegistrationStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to initialize registration store"),
    );

    let cache = Arc::new(TrackingCache::default());

    // Concrete carrier scrapers are out of scope here; this process only
    // carries a pluggable, initially-empty registry that the embedding
    // deployment is responsible for populating.
    let carriers = Arc::new(CarrierRegistry::new());

    let worker = MonitorWorker::new(
        &config.worker_name,
        queue,
        store,
        cache,
        carriers,
        config.poll_interval(),
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
    "webhook monitor worker"
}
