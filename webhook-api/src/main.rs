//! The Service Facade binary (component G): the REST surface for
//! registering and inspecting webhook subscriptions, plus the periodic
//! scheduler tick that materializes due repeat/cron schedules into jobs
//! the monitor, delivery, and cleanup workers dequeue.

mod config;
mod error;
mod handlers;
mod service;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use tracing::{error, info};

use webhook_common::cache::TrackingCache;
use webhook_common::carrier::CarrierRegistry;
use webhook_common::queue::Queue;
use webhook_common::retry::RetryPolicy;
use webhook_common::store::RegistrationStore;

use config::Config;
use handlers::app::add_routes;
use service::WebhookService;

/// How often `Queue::tick_schedules` is polled to materialize due repeat
/// and cron schedules into runnable jobs. Not user-configurable: it only
/// trades latency for database load, and 1s is already generous against a
/// coarsest schedule granularity of an hour.
const SCHEDULER_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let queue = Arc::new(
        Queue::new(&config.database_url, &config.worker_name, RetryPolicy::default())
            .await
            .expect("failed to initialize queue"),
    );

    let store = Arc::new(
        RegistrationStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to initialize registration store"),
    );

    let cache = Arc::new(TrackingCache::new(config.cache_ttl(), config.cache_max_size));

    // Concrete carrier scrapers are out of scope here; this process only
    // carries a pluggable, initially-empty registry that the embedding
    // deployment is responsible for populating.
    let carriers = Arc::new(CarrierRegistry::new());

    let service = Arc::new(WebhookService::new(
        store,
        queue.clone(),
        cache,
        carriers,
        config.tracking_monitor_interval(),
        config.is_production(),
    ));

    service.init().await.expect("failed to schedule cleanup cron");

    tokio::task::spawn(scheduler_tick(queue));

    let router = add_routes(Router::new(), service);

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, router).await.expect("failed to serve api");

    Ok(())
}

async fn scheduler_tick(queue: Arc<Queue>) {
    let mut interval = tokio::time::interval(SCHEDULER_TICK_INTERVAL);
    loop {
        interval.tick().await;
        match queue.tick_schedules().await {
            Ok(materialized) if materialized > 0 => {
                info!(materialized, "materialized due schedules");
            }
            Ok(_) => {}
            Err(err) => error!(%err, "failed to tick schedules"),
        }
    }
}
