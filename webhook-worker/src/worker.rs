//! The delivery worker: pops `webhook-delivery` jobs, POSTs the callback,
//! classifies the response, and records the outcome.
//!
//! Polls the queue in a loop and spawns one task per dequeued job, bounded
//! by a semaphore. Processing a job also touches the registration store —
//! delivery here is change-notification, not a bare HTTP relay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use reqwest::header;
use tracing::{error, info, warn};
use webhook_common::error::WebhookError;
use webhook_common::jobs::{DeliveryJobPayload, DeliveryMetadata, DeliveryRequestBody, WEBHOOK_DELIVERY_QUEUE};
use webhook_common::model::{NewDeliveryLog, WebhookRegistrationPatch};
use webhook_common::queue::{Job, Queue};
use webhook_common::retry::RetryPolicy;
use webhook_common::store::RegistrationStore;

use crate::dns::PublicResolver;

const USER_AGENT: &str = "delivery-tracker-webhook/1.0";

pub struct DeliveryWorker {
    name: String,
    queue: Arc<Queue>,
    store: Arc<RegistrationStore>,
    poll_interval: Duration,
    client: reqwest::Client,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl DeliveryWorker {
    pub fn new(
        name: &str,
        queue: Arc<Queue>,
        store: Arc<RegistrationStore>,
        poll_interval: Duration,
        request_timeout: Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .dns_resolver(Arc::new(PublicResolver {}))
            .build()
            .expect("failed to construct reqwest client for delivery worker");

        Self {
            name: name.to_owned(),
            queue,
            store,
            poll_interval,
            client,
            max_concurrent_jobs,
            liveness,
        }
    }

    /// Continuously polls `webhook-delivery`, spawning up to
    /// `max_concurrent_jobs` concurrent deliveries.
    pub async fn run(&self) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_jobs));
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let job: Option<Job<DeliveryJobPayload>> =
                match self.queue.dequeue(WEBHOOK_DELIVERY_QUEUE).await {
                    Ok(job) => job,
                    Err(error) => {
                        error!(worker = self.name, %error, "failed to dequeue delivery job");
                        continue;
                    }
                };

            let Some(job) = job else { continue };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let client = self.client.clone();
            let queue = self.queue.clone();
            let store = self.store.clone();

            tokio::spawn(async move {
                if let Err(error) = process_delivery_job(client, queue, store, job).await {
                    error!(%error, "error processing delivery job");
                }
                drop(permit);
            });
        }
    }
}

/// Runs the full delivery contract for one dequeued job.
async fn process_delivery_job(
    client: reqwest::Client,
    queue: Arc<Queue>,
    store: Arc<RegistrationStore>,
    job: Job<DeliveryJobPayload>,
) -> Result<(), WebhookError> {
    let payload = job.payload.0.clone();
    let registration_id = payload.webhook_registration_id;

    // `IncrementDeliveryAttempts` is called for its bookkeeping side effect
    // on the registration row (spec.md 4.5 step 1); `attemptNumber` itself
    // comes from this job's own attempt counter, not the registration's
    // lifetime-cumulative `delivery_attempts` field, which keeps climbing
    // across separate delivery jobs and would never reset to 1 for a later
    // checksum transition's own delivery.
    store.increment_delivery_attempts(registration_id).await?;
    let attempt_number = job.attempt;

    let body = DeliveryRequestBody {
        webhook_id: registration_id,
        tracking_data: payload.track_info.clone(),
        metadata: DeliveryMetadata {
            previous_checksum: payload.previous_checksum.clone(),
            current_checksum: payload.current_checksum.clone(),
            delivered_at: Utc::now(),
        },
    };
    let request_body = serde_json::to_string(&body).map_err(|e| WebhookError::Internal(e.to_string()))?;

    let outcome = send_delivery(&client, &payload.callback_url, registration_id, attempt_number, request_body.clone()).await;

    let labels = [("queue", WEBHOOK_DELIVERY_QUEUE.to_owned())];
    metrics::counter!("webhook_deliveries_total", &labels).increment(1);

    match outcome {
        DeliveryOutcome::Success { status_code, response_body } => {
            store
                .log_delivery(NewDeliveryLog {
                    webhook_registration_id: registration_id,
                    attempt_number,
                    status_code: Some(status_code as i32),
                    success: true,
                    error_message: None,
                    request_body,
                    response_body,
                })
                .await?;
            store
                .update(registration_id, WebhookRegistrationPatch::default().clear_error())
                .await?;
            queue.complete(job.id).await?;
            metrics::counter!("webhook_deliveries_succeeded", &labels).increment(1);
            info!(webhook_id = %registration_id, attempt_number, "delivery succeeded");
        }
        DeliveryOutcome::Retry { status_code, message, response_body, retry_after } => {
            store
                .log_delivery(NewDeliveryLog {
                    webhook_registration_id: registration_id,
                    attempt_number,
                    status_code: status_code.map(|s| s as i32),
                    success: false,
                    error_message: Some(message.clone()),
                    request_body,
                    response_body,
                })
                .await?;

            if attempt_number >= job.max_attempts {
                let error = format!("Delivery failed after {attempt_number} attempts: {message}");
                store
                    .update(
                        registration_id,
                        WebhookRegistrationPatch::default()
                            .with_error(error.clone())
                            .with_active(false),
                    )
                    .await?;
                queue.fail(job.id, &error).await?;
                metrics::counter!("webhook_deliveries_failed", &labels).increment(1);
                warn!(webhook_id = %registration_id, attempt_number, "delivery exhausted retries, deactivating");
            } else {
                let error = format!("Delivery attempt {attempt_number} failed: {message}");
                store
                    .update(registration_id, WebhookRegistrationPatch::default().with_error(error.clone()))
                    .await?;
                queue
                    .retry(job.id, job.attempt, job.max_attempts, &error, retry_after)
                    .await?;
                metrics::counter!("webhook_deliveries_retried", &labels).increment(1);
            }
        }
        DeliveryOutcome::Permanent { status_code, message, response_body } => {
            store
                .log_delivery(NewDeliveryLog {
                    webhook_registration_id: registration_id,
                    attempt_number,
                    status_code: Some(status_code as i32),
                    success: false,
                    error_message: Some(message.clone()),
                    request_body,
                    response_body,
                })
                .await?;

            let error = format!("Delivery failed after {attempt_number} attempts: {message}");
            store
                .update(
                    registration_id,
                    WebhookRegistrationPatch::default()
                        .with_error(error.clone())
                        .with_active(false),
                )
                .await?;
            queue.fail(job.id, &error).await?;
            metrics::counter!("webhook_deliveries_failed", &labels).increment(1);
            warn!(webhook_id = %registration_id, status_code, "delivery non-retryable, deactivating");
        }
    }

    Ok(())
}

enum DeliveryOutcome {
    Success {
        status_code: u16,
        response_body: Option<String>,
    },
    Retry {
        status_code: Option<u16>,
        message: String,
        response_body: Option<String>,
        retry_after: Option<Duration>,
    },
    Permanent {
        status_code: u16,
        message: String,
        response_body: Option<String>,
    },
}

/// Issues the callback POST and classifies the response into success,
/// transient-retry, or permanent failure. Response bodies are read
/// best-effort: a read failure does not reclassify the outcome.
async fn send_delivery(
    client: &reqwest::Client,
    callback_url: &str,
    webhook_id: uuid::Uuid,
    attempt_number: i32,
    body: String,
) -> DeliveryOutcome {
    let response = match client
        .post(callback_url)
        .header("X-Webhook-Id", webhook_id.to_string())
        .header("X-Webhook-Attempt", attempt_number.to_string())
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            return DeliveryOutcome::Retry {
                status_code: None,
                message: error.to_string(),
                response_body: None,
                retry_after: None,
            }
        }
    };

    let status = response.status();
    let retry_after = parse_retry_after_header(response.headers());
    let response_body = crate::util::first_n_bytes_of_response(response, 1000).await.ok();

    if status.is_success() {
        return DeliveryOutcome::Success {
            status_code: status.as_u16(),
            response_body,
        };
    }

    let message = format!("received status {status}");

    if status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 404 {
        return DeliveryOutcome::Permanent {
            status_code: status.as_u16(),
            message,
            response_body,
        };
    }

    if status.is_server_error() {
        return DeliveryOutcome::Retry {
            status_code: Some(status.as_u16()),
            message,
            response_body,
            retry_after,
        };
    }

    // Remaining 4xx: retried at most once. This attempt is the first if
    // `attempt_number < 2`; a second-or-later 4xx of this kind is terminal
    // regardless of how many job attempts remain, which is why this is
    // decided here rather than left to the job's own max_attempts counter.
    if attempt_number < 2 {
        DeliveryOutcome::Retry {
            status_code: Some(status.as_u16()),
            message,
            response_body,
            retry_after,
        }
    } else {
        DeliveryOutcome::Permanent {
            status_code: status.as_u16(),
            message,
            response_body,
        }
    }
}

fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    let value = value.to_str().ok()?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(value) {
        let duration = chrono::DateTime::<Utc>::from(dt) - Utc::now();
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn parse_retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn parse_retry_after_missing_is_none() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn status_classification_matches_spec() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::INTERNAL_SERVER_ERROR.is_server_error());
        assert!(!StatusCode::NOT_FOUND.is_server_error());
    }

    #[tokio::test]
    async fn other_4xx_retries_once_then_becomes_permanent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cb")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;
        let client = reqwest::Client::new();
        let url = format!("{}/cb", server.url());

        let first = send_delivery(&client, &url, uuid::Uuid::nil(), 1, "{}".into()).await;
        assert!(matches!(first, DeliveryOutcome::Retry { .. }));

        let second = send_delivery(&client, &url, uuid::Uuid::nil(), 2, "{}".into()).await;
        assert!(matches!(second, DeliveryOutcome::Permanent { status_code: 429, .. }));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn four_oh_four_is_always_permanent() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/cb").with_status(404).create_async().await;
        let client = reqwest::Client::new();
        let url = format!("{}/cb", server.url());

        let outcome = send_delivery(&client, &url, uuid::Uuid::nil(), 1, "{}".into()).await;
        assert!(matches!(outcome, DeliveryOutcome::Permanent { status_code: 404, .. }));
    }
}
