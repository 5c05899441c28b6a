//! The service facade: `Register`, `Deactivate`, `GetWebhook`,
//! `GetDeliveryLogs`, `GetQueueStats`, `GetCacheStats`, `ClearCache`.
//! Wires the store, queue, cache, and carrier registry together; workers
//! never hold the facade itself, only those same references directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use webhook_common::cache::{CacheStats, TrackingCache};
use webhook_common::carrier::CarrierRegistry;
use webhook_common::error::Result;
use webhook_common::jobs::{
    CleanupJobPayload, MonitorJobPayload, EXPIRATION_CLEANUP_JOB_ID, EXPIRATION_CLEANUP_QUEUE,
    MONITOR_MAX_ATTEMPTS, TRACKING_MONITOR_QUEUE, WEBHOOK_DELIVERY_QUEUE,
};
use webhook_common::jobs::CLEANUP_MAX_ATTEMPTS;
use webhook_common::model::{DeliveryLog, NewWebhookRegistration, WebhookRegistration};
use webhook_common::queue::{Queue, QueueCounts};
use webhook_common::store::RegistrationStore;

use crate::validation::{validate_register_input, RegisterInput};

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<RegistrationStore>,
    queue: Arc<Queue>,
    cache: Arc<TrackingCache>,
    carriers: Arc<CarrierRegistry>,
    monitor_period: Duration,
    production: bool,
}

/// Raw registration input as received from a caller — the place a
/// GraphQL resolver would sit, out of scope here.
pub struct RegisterRequest {
    pub carrier_id: String,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
}

impl WebhookService {
    pub fn new(
        store: Arc<RegistrationStore>,
        queue: Arc<Queue>,
        cache: Arc<TrackingCache>,
        carriers: Arc<CarrierRegistry>,
        monitor_period: Duration,
        production: bool,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            carriers,
            monitor_period,
            production,
        }
    }

    /// Enqueues the hourly cleanup cron. Job handlers themselves are
    /// wired by each worker binary, not here — this facade only owns the
    /// store/queue/cache, not worker loops.
    pub async fn init(&self) -> Result<()> {
        self.queue
            .enqueue_cron_hourly(
                EXPIRATION_CLEANUP_QUEUE,
                EXPIRATION_CLEANUP_JOB_ID,
                CleanupJobPayload::default(),
                CLEANUP_MAX_ATTEMPTS,
            )
            .await
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<Uuid> {
        validate_register_input(
            &RegisterInput {
                carrier_id: &request.carrier_id,
                tracking_number: &request.tracking_number,
                callback_url: &request.callback_url,
                expiration_time: request.expiration_time,
            },
            &self.carriers,
            self.production,
        )?;

        let record = self
            .store
            .create(NewWebhookRegistration {
                carrier_id: request.carrier_id.clone(),
                tracking_number: request.tracking_number.clone(),
                callback_url: request.callback_url,
                expiration_time: request.expiration_time,
            })
            .await?;

        self.queue
            .enqueue_repeating(
                TRACKING_MONITOR_QUEUE,
                &record.id.to_string(),
                MonitorJobPayload {
                    webhook_registration_id: record.id,
                    carrier_id: request.carrier_id,
                    tracking_number: request.tracking_number,
                },
                MONITOR_MAX_ATTEMPTS,
                self.monitor_period,
            )
            .await?;

        Ok(record.id)
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<()> {
        self.store.deactivate(id).await?;
        self.queue.remove_scheduled(&id.to_string()).await?;
        Ok(())
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookRegistration>> {
        self.store.find_by_id(id).await
    }

    pub async fn get_delivery_logs(&self, id: Uuid, limit: i64) -> Result<Vec<DeliveryLog>> {
        self.store.get_delivery_logs(id, limit).await
    }

    pub async fn get_queue_stats(&self) -> Result<HashMap<String, QueueCounts>> {
        let mut stats = HashMap::new();
        for queue_name in [TRACKING_MONITOR_QUEUE, WEBHOOK_DELIVERY_QUEUE, EXPIRATION_CLEANUP_QUEUE] {
            stats.insert(queue_name.to_owned(), self.queue.counts(queue_name).await?);
        }
        Ok(stats)
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;
    use webhook_common::carrier::test_support::StubCarrier;
    use webhook_common::retry::RetryPolicy;

    fn service(store: RegistrationStore, queue: Queue, production: bool) -> WebhookService {
        let mut carriers = CarrierRegistry::new();
        carriers.register("kr.cjlogistics", Arc::new(StubCarrier::new(vec![])));

        WebhookService::new(
            Arc::new(store),
            Arc::new(queue),
            Arc::new(TrackingCache::default()),
            Arc::new(carriers),
            Duration::from_secs(3600),
            production,
        )
    }

    fn request(callback_url: &str) -> RegisterRequest {
        RegisterRequest {
            carrier_id: "kr.cjlogistics".to_owned(),
            tracking_number: "100000001".to_owned(),
            callback_url: callback_url.to_owned(),
            expiration_time: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn register_persists_and_schedules_monitor_job(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db.clone());
        let queue = Queue::new_from_pool(db, "test", RetryPolicy::default());
        let service = service(store, queue, false);

        let id = service.register(request("https://hook.test/r1")).await.unwrap();

        let record = service.get_webhook(id).await.unwrap().unwrap();
        assert!(record.active);
        assert_eq!(record.carrier_id, "kr.cjlogistics");

        let materialized = service.queue.tick_schedules().await.unwrap();
        assert_eq!(materialized, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn register_rejects_private_host_in_production(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db.clone());
        let queue = Queue::new_from_pool(db, "test", RetryPolicy::default());
        let service = service(store, queue, true);

        let result = service.register(request("http://127.0.0.1/cb")).await;
        assert!(result.is_err());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn deactivate_clears_schedule(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db.clone());
        let queue = Queue::new_from_pool(db, "test", RetryPolicy::default());
        let service = service(store, queue, false);

        let id = service.register(request("https://hook.test/r1")).await.unwrap();
        service.deactivate(id).await.unwrap();

        let record = service.get_webhook(id).await.unwrap().unwrap();
        assert!(!record.active);

        let materialized = service.queue.tick_schedules().await.unwrap();
        assert_eq!(materialized, 0, "cancelled schedule must not materialize");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn get_queue_stats_reports_all_three_queues(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db.clone());
        let queue = Queue::new_from_pool(db, "test", RetryPolicy::default());
        let service = service(store, queue, false);

        let stats = service.get_queue_stats().await.unwrap();
        assert!(stats.contains_key(TRACKING_MONITOR_QUEUE));
        assert!(stats.contains_key(WEBHOOK_DELIVERY_QUEUE));
        assert!(stats.contains_key(EXPIRATION_CLEANUP_QUEUE));
    }
}
