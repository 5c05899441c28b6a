//! The cleanup worker: deactivates expired registrations and evicts stale
//! cache entries on a belt-and-suspenders schedule, plus the housekeeping
//! (`webhook_common::queue`'s stalled-job reaping and finished-job
//! retention) that otherwise has no periodic caller.
//!
//! The monitor worker already checks expiration on entry; this worker
//! bounds the window during which an expired registration with no
//! scheduled monitor tick would otherwise stay active indefinitely.
//!
//! The cache instance here is this process' own — see DESIGN.md for why a
//! per-process cache is the right tradeoff in a multi-binary deployment;
//! the eviction-on-read invariant already holds independently wherever the
//! cache is populated.

use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tracing::{error, info, warn};

use webhook_common::cache::TrackingCache;
use webhook_common::error::WebhookError;
use webhook_common::jobs::{CleanupJobPayload, EXPIRATION_CLEANUP_QUEUE};
use webhook_common::queue::{Job, Queue};
use webhook_common::store::RegistrationStore;

/// Queues swept for stalled-job reaping and finished-job retention on
/// every cleanup invocation.
const ALL_QUEUES: [&str; 3] = [
    webhook_common::jobs::TRACKING_MONITOR_QUEUE,
    webhook_common::jobs::WEBHOOK_DELIVERY_QUEUE,
    webhook_common::jobs::EXPIRATION_CLEANUP_QUEUE,
];

pub struct CleanupWorker {
    name: String,
    queue: Arc<Queue>,
    store: Arc<RegistrationStore>,
    cache: Arc<TrackingCache>,
    poll_interval: Duration,
    liveness: HealthHandle,
}

impl CleanupWorker {
    pub fn new(
        name: &str,
        queue: Arc<Queue>,
        store: Arc<RegistrationStore>,
        cache: Arc<TrackingCache>,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            cache,
            poll_interval,
            liveness,
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let job: Option<Job<CleanupJobPayload>> =
                match self.queue.dequeue(EXPIRATION_CLEANUP_QUEUE).await {
                    Ok(job) => job,
                    Err(error) => {
                        error!(worker = self.name, %error, "failed to dequeue cleanup job");
                        continue;
                    }
                };

            let Some(job) = job else { continue };

            if let Err(error) = process_cleanup_job(&self.queue, &self.store, &self.cache, &job).await {
                warn!(%error, "cleanup invocation failed, scheduling retry");
                if let Err(retry_error) = self
                    .queue
                    .retry(job.id, job.attempt, job.max_attempts, &error.to_string(), None)
                    .await
                {
                    error!(%retry_error, "failed to reschedule cleanup job after failure");
                }
            }
        }
    }
}

/// Runs the full cleanup contract for one dequeued job.
async fn process_cleanup_job(
    queue: &Queue,
    store: &RegistrationStore,
    cache: &TrackingCache,
    job: &Job<CleanupJobPayload>,
) -> Result<(), WebhookError> {
    let deactivated = store.deactivate_expired().await?;
    if deactivated > 0 {
        info!(deactivated, "deactivated expired registrations");
    }

    let evicted = cache.cleanup();
    if evicted > 0 {
        info!(evicted, "evicted stale cache entries");
    }

    for queue_name in ALL_QUEUES {
        let reaped = queue.reap_stalled(queue_name).await?;
        let trimmed = queue.enforce_retention(queue_name).await?;
        if reaped > 0 || trimmed > 0 {
            info!(queue = queue_name, reaped, trimmed, "queue housekeeping");
        }
    }

    queue.complete(job.id).await?;
    Ok(())
}
