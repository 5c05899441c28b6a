//! The monitor worker (component D): pops `tracking-monitor` jobs,
//! consults the cache or a carrier, checksums the event timeline, and
//! enqueues a delivery on change.
//!
//! Structured the same way `webhook_worker::worker::DeliveryWorker` polls
//! its queue in a loop and spawns one task per dequeued job; this worker
//! never performs HTTP delivery itself (spec.md 9's Monitor/Delivery
//! coupling note) — a checksum transition only ever produces a
//! `webhook-delivery` job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use tracing::{error, info, warn};

use webhook_common::cache::TrackingCache;
use webhook_common::carrier::CarrierRegistry;
use webhook_common::checksum::checksum_events;
use webhook_common::error::WebhookError;
use webhook_common::jobs::{
    DeliveryJobPayload, MonitorJobPayload, DELIVERY_MAX_ATTEMPTS, TRACKING_MONITOR_QUEUE,
    WEBHOOK_DELIVERY_QUEUE,
};
use webhook_common::model::WebhookRegistrationPatch;
use webhook_common::queue::{Job, NewJob, Queue};
use webhook_common::store::RegistrationStore;

pub struct MonitorWorker {
    name: String,
    queue: Arc<Queue>,
    store: Arc<RegistrationStore>,
    cache: Arc<TrackingCache>,
    carriers: Arc<CarrierRegistry>,
    poll_interval: Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl MonitorWorker {
    pub fn new(
        name: &str,
        queue: Arc<Queue>,
        store: Arc<RegistrationStore>,
        cache: Arc<TrackingCache>,
        carriers: Arc<CarrierRegistry>,
        poll_interval: Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            cache,
            carriers,
            poll_interval,
            max_concurrent_jobs,
            liveness,
        }
    }

    /// Continuously polls `tracking-monitor`, spawning up to
    /// `max_concurrent_jobs` concurrent checks.
    pub async fn run(&self) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_jobs));
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let job: Option<Job<MonitorJobPayload>> =
                match self.queue.dequeue(TRACKING_MONITOR_QUEUE).await {
                    Ok(job) => job,
                    Err(error) => {
                        error!(worker = self.name, %error, "failed to dequeue monitor job");
                        continue;
                    }
                };

            let Some(job) = job else { continue };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let queue = self.queue.clone();
            let store = self.store.clone();
            let cache = self.cache.clone();
            let carriers = self.carriers.clone();

            tokio::spawn(async move {
                if let Err(error) = process_monitor_job(queue.clone(), store, cache, carriers, &job).await {
                    warn!(%error, webhook_id = %job.payload.0.webhook_registration_id, "error processing monitor job, scheduling retry");
                    if let Err(retry_error) = queue
                        .retry(job.id, job.attempt, job.max_attempts, &error.to_string(), None)
                        .await
                    {
                        error!(%retry_error, "failed to reschedule monitor job after failure");
                    }
                }
                drop(permit);
            });
        }
    }
}

/// Runs the full monitor contract (spec.md 4.4) for one dequeued job.
/// `job.id` is completed on every non-error path (steps 1, 2, 3, 4, 6, 7
/// are all terminal-success for this invocation); only an unexpected
/// store/queue failure propagates so the caller retries.
async fn process_monitor_job(
    queue: Arc<Queue>,
    store: Arc<RegistrationStore>,
    cache: Arc<TrackingCache>,
    carriers: Arc<CarrierRegistry>,
    job: &Job<MonitorJobPayload>,
) -> Result<(), WebhookError> {
    let payload = &job.payload.0;
    let registration_id = payload.webhook_registration_id;
    let now = Utc::now();

    // Step 1: registration missing or inactive — remove the schedule and
    // complete, no retry.
    let Some(record) = store.find_by_id(registration_id).await? else {
        queue.remove_scheduled(&registration_id.to_string()).await?;
        queue.complete(job.id).await?;
        return Ok(());
    };

    if !record.active {
        queue.remove_scheduled(&registration_id.to_string()).await?;
        queue.complete(job.id).await?;
        return Ok(());
    }

    // Step 2: expired — deactivate, remove the schedule, complete.
    if now >= record.expiration_time {
        store.deactivate(registration_id).await?;
        queue.remove_scheduled(&registration_id.to_string()).await?;
        queue.complete(job.id).await?;
        info!(webhook_id = %registration_id, "registration expired, deactivated on monitor tick");
        return Ok(());
    }

    // Step 3: unknown carrier — record and complete, never retried at the
    // job level (the next periodic tick is the retry).
    let Some(carrier) = carriers.get(&payload.carrier_id) else {
        let patch = WebhookRegistrationPatch::default()
            .with_error(format!("Carrier not found: {}", payload.carrier_id))
            .with_checked_at(now);
        store.update(registration_id, patch).await?;
        queue.complete(job.id).await?;
        warn!(webhook_id = %registration_id, carrier_id = %payload.carrier_id, "carrier not found");
        return Ok(());
    };

    // Step 4: cache-or-carrier. A carrier error is absorbed into
    // `last_error` — an upstream outage must not consume delivery retries,
    // and no delivery is enqueued, no checksum advanced, registration stays
    // active (spec.md's carrier-API error isolation property).
    let track_info = match cache.get(&payload.carrier_id, &payload.tracking_number) {
        Some(cached) => cached,
        None => match carrier.track(&payload.tracking_number).await {
            Ok(info) => {
                cache.set(&payload.carrier_id, &payload.tracking_number, info.clone());
                info
            }
            Err(carrier_error) => {
                let patch = WebhookRegistrationPatch::default()
                    .with_error(format!("Tracking API error: {carrier_error}"))
                    .with_checked_at(now);
                store.update(registration_id, patch).await?;
                queue.complete(job.id).await?;
                warn!(webhook_id = %registration_id, %carrier_error, "carrier tracking call failed");
                return Ok(());
            }
        },
    };

    // Step 5: checksum the event timeline.
    let current_checksum = checksum_events(&track_info.events);

    // Step 6: no change — advance last_checked_at only.
    if record.last_checksum.as_deref() == Some(current_checksum.as_str()) {
        store
            .update(registration_id, WebhookRegistrationPatch::default().with_checked_at(now))
            .await?;
        queue.complete(job.id).await?;
        return Ok(());
    }

    // Step 7: checksum transition — enqueue the delivery *before* writing
    // the new checksum (spec.md 4.4's ordering guarantee): if the enqueue
    // fails the write never happens and the next poll retries cleanly; if
    // the write fails after a successful enqueue, the next poll just
    // re-observes the same transition, which at-least-once delivery
    // already tolerates.
    let delivery_payload = DeliveryJobPayload {
        webhook_registration_id: registration_id,
        callback_url: record.callback_url.clone(),
        track_info,
        previous_checksum: record.last_checksum.clone(),
        current_checksum: current_checksum.clone(),
    };
    queue
        .enqueue(WEBHOOK_DELIVERY_QUEUE, NewJob::new(DELIVERY_MAX_ATTEMPTS, delivery_payload))
        .await?;

    store
        .update(
            registration_id,
            WebhookRegistrationPatch::default()
                .with_checksum(current_checksum)
                .with_checked_at(now)
                .clear_error(),
        )
        .await?;

    queue.complete(job.id).await?;
    info!(webhook_id = %registration_id, "checksum transition detected, delivery enqueued");

    Ok(())
}
