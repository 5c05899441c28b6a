//! The Postgres-backed durable queue: a single `webhook_jobs` table backs
//! the three named queues — tracking-monitor, webhook-delivery,
//! expiration-cleanup — distinguished by the `queue` column, dequeued with
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never double-process a
//! job.
//!
//! A second table, `webhook_repeat_schedules`, holds "repeat every N ms" /
//! "run on this hourly cron" registrations; an internal scheduler tick
//! (modeled on `health::HealthRegistry`'s background task) periodically
//! materializes due schedules into `webhook_jobs` rows.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A dequeued unit of work, generic over its JSON payload.
#[derive(sqlx::FromRow)]
pub struct Job<T> {
    pub id: JobId,
    pub queue: String,
    pub job_id: Option<String>,
    pub payload: Json<T>,
    pub status: JobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub attempted_by: Vec<String>,
    pub errors: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A job to be inserted. `job_id` is the idempotency key for repeating
/// schedules; plain one-off jobs leave it `None`.
pub struct NewJob<T> {
    pub job_id: Option<String>,
    pub max_attempts: i32,
    pub payload: T,
}

impl<T> NewJob<T> {
    pub fn new(max_attempts: i32, payload: T) -> Self {
        Self {
            job_id: None,
            max_attempts,
            payload,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

/// Retention caps applied by `enforce_retention` (spec.md's "bounded
/// history" requirement for finished jobs).
pub const RETAIN_COMPLETED: i64 = 100;
pub const RETAIN_FAILED: i64 = 500;

/// How long a `running` job may go unfinished before it's considered
/// abandoned by a crashed worker and returned to `available`.
pub const STALLED_VISIBILITY_WINDOW: StdDuration = StdDuration::from_secs(300);

pub struct Queue {
    pool: PgPool,
    worker: String,
    retry_policy: RetryPolicy,
}

impl Queue {
    pub async fn new(database_url: &str, worker: &str, retry_policy: RetryPolicy) -> crate::error::Result<Self> {
        let pool = PgPoolOptions::new().connect(database_url).await?;
        Ok(Self {
            pool,
            worker: worker.to_owned(),
            retry_policy,
        })
    }

    pub fn new_from_pool(pool: PgPool, worker: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            pool,
            worker: worker.to_owned(),
            retry_policy,
        }
    }

    /// Enqueues a one-off job, available immediately.
    pub async fn enqueue<T: Serialize + Sync>(&self, queue: &str, job: NewJob<T>) -> crate::error::Result<JobId> {
        let row: (JobId,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_jobs (queue, job_id, payload, max_attempts, status, scheduled_at)
            VALUES ($1, $2, $3, $4, 'available', NOW())
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(&job.job_id)
        .bind(Json(&job.payload))
        .bind(job.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Upserts a repeating schedule (spec.md's tracking-monitor poll
    /// cadence): `job_id` is the idempotency key, so calling this again
    /// with the same id updates the existing schedule rather than
    /// duplicating it.
    pub async fn enqueue_repeating<T: Serialize + Sync>(
        &self,
        queue: &str,
        job_id: &str,
        payload: T,
        max_attempts: i32,
        every: StdDuration,
    ) -> crate::error::Result<()> {
        let interval_ms = every.as_millis() as i64;
        sqlx::query(
            r#"
            INSERT INTO webhook_repeat_schedules (job_id, queue, payload, max_attempts, interval_ms, next_run_at, cancelled)
            VALUES ($1, $2, $3, $4, $5, NOW(), FALSE)
            ON CONFLICT (job_id) DO UPDATE SET
                queue = EXCLUDED.queue,
                payload = EXCLUDED.payload,
                max_attempts = EXCLUDED.max_attempts,
                interval_ms = EXCLUDED.interval_ms,
                cancelled = FALSE
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(Json(payload))
        .bind(max_attempts)
        .bind(interval_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upserts the hourly cleanup schedule. No cron-parsing dependency is
    /// needed since the cleanup queue only ever runs on a fixed hourly
    /// cadence; `next_top_of_hour` computes the next occurrence directly.
    pub async fn enqueue_cron_hourly<T: Serialize + Sync>(
        &self,
        queue: &str,
        job_id: &str,
        payload: T,
        max_attempts: i32,
    ) -> crate::error::Result<()> {
        let next_run = next_top_of_hour(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO webhook_repeat_schedules (job_id, queue, payload, max_attempts, interval_ms, next_run_at, cancelled)
            VALUES ($1, $2, $3, $4, NULL, $5, FALSE)
            ON CONFLICT (job_id) DO UPDATE SET
                queue = EXCLUDED.queue,
                payload = EXCLUDED.payload,
                max_attempts = EXCLUDED.max_attempts,
                next_run_at = EXCLUDED.next_run_at,
                cancelled = FALSE
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(Json(payload))
        .bind(max_attempts)
        .bind(next_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_scheduled(&self, job_id: &str) -> crate::error::Result<()> {
        sqlx::query("UPDATE webhook_repeat_schedules SET cancelled = TRUE WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sweeps due `webhook_repeat_schedules` rows and materializes an
    /// occurrence of each into `webhook_jobs`, then advances `next_run_at`.
    /// Repeating (interval-based) schedules advance by their interval;
    /// cron-style schedules (`interval_ms IS NULL`) advance to the next
    /// top of the hour. Intended to be called from a periodic tick owned
    /// by the binary embedding this queue.
    pub async fn tick_schedules(&self) -> crate::error::Result<usize> {
        let due: Vec<(String, String, serde_json::Value, i32, Option<i64>)> = sqlx::query_as(
            "SELECT job_id, queue, payload, max_attempts, interval_ms \
             FROM webhook_repeat_schedules \
             WHERE cancelled = FALSE AND next_run_at <= NOW() \
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut materialized = 0usize;
        for (job_id, queue, payload, max_attempts, interval_ms) in due {
            sqlx::query(
                r#"
                INSERT INTO webhook_jobs (queue, job_id, payload, max_attempts, status, scheduled_at)
                VALUES ($1, $2, $3, $4, 'available', NOW())
                "#,
            )
            .bind(&queue)
            .bind(&job_id)
            .bind(&payload)
            .bind(max_attempts)
            .execute(&self.pool)
            .await?;

            let next_run = match interval_ms {
                Some(ms) => Utc::now() + Duration::milliseconds(ms),
                None => next_top_of_hour(Utc::now()),
            };

            sqlx::query("UPDATE webhook_repeat_schedules SET next_run_at = $2 WHERE job_id = $1")
                .bind(&job_id)
                .bind(next_run)
                .execute(&self.pool)
                .await?;

            materialized += 1;
        }

        if materialized > 0 {
            debug!(count = materialized, "materialized due repeat schedules");
        }

        Ok(materialized)
    }

    /// Dequeues the oldest available job on `queue`, marking it `running`.
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never contend
    /// for the same row, following the teacher's `PgQueue::dequeue`.
    pub async fn dequeue<T>(&self, queue: &str) -> crate::error::Result<Option<Job<T>>>
    where
        T: DeserializeOwned + Send + Unpin + 'static,
    {
        let job = sqlx::query_as::<_, Job<T>>(
            r#"
            WITH available_in_queue AS (
                SELECT id FROM webhook_jobs
                WHERE status = 'available' AND scheduled_at <= NOW() AND queue = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_jobs
            SET attempted_at = NOW(),
                status = 'running'::job_status,
                attempt = webhook_jobs.attempt + 1,
                attempted_by = array_append(webhook_jobs.attempted_by, $2::text)
            FROM available_in_queue
            WHERE webhook_jobs.id = available_in_queue.id
            RETURNING webhook_jobs.*
            "#,
        )
        .bind(queue)
        .bind(&self.worker)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn complete(&self, job_id: JobId) -> crate::error::Result<()> {
        sqlx::query(
            "UPDATE webhook_jobs SET finished_at = NOW(), status = 'completed'::job_status WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-enqueues a job for retry at a back-off-computed time, or marks it
    /// failed outright if `attempt` has already reached `max_attempts`.
    ///
    /// `attempt` is `job.attempt` as returned by `dequeue`, which is
    /// already 1 on a job's first try (the dequeue CTE increments it
    /// before handing the job to the caller). `RetryPolicy::time_until_next_retry`
    /// takes a 0-indexed attempt count, so it's passed `attempt - 1` here
    /// rather than by each caller, keeping every call site correct.
    pub async fn retry(
        &self,
        job_id: JobId,
        attempt: i32,
        max_attempts: i32,
        error: &str,
        preferred_interval: Option<StdDuration>,
    ) -> crate::error::Result<()> {
        if attempt >= max_attempts {
            return self.fail(job_id, error).await;
        }

        let delay = self
            .retry_policy
            .time_until_next_retry((attempt - 1).max(0) as u32, preferred_interval);

        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = 'available'::job_status,
                scheduled_at = NOW() + $2::interval,
                errors = array_append(errors, $3)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(std_duration_to_pg_interval(delay))
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn fail(&self, job_id: JobId, error: &str) -> crate::error::Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET finished_at = NOW(),
                status = 'failed'::job_status,
                errors = array_append(errors, $2)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns abandoned `running` jobs (workers that crashed mid-attempt,
    /// never calling `complete`/`retry`/`fail`) to `available`.
    pub async fn reap_stalled(&self, queue: &str) -> crate::error::Result<u64> {
        let cutoff = Utc::now() - Duration::from_std(STALLED_VISIBILITY_WINDOW).expect("fits");
        let result = sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = 'available'::job_status
            WHERE queue = $1 AND status = 'running' AND attempted_at < $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            warn!(queue, reaped, "reaped stalled jobs back to available");
        }
        Ok(reaped)
    }

    /// Trims finished jobs beyond the retention cap, oldest first, per
    /// queue. Keeps the table from growing unbounded while preserving
    /// recent history for `/queues/stats` and operator inspection.
    pub async fn enforce_retention(&self, queue: &str) -> crate::error::Result<u64> {
        let completed_deleted = self
            .trim_finished(queue, "completed", RETAIN_COMPLETED)
            .await?;
        let failed_deleted = self.trim_finished(queue, "failed", RETAIN_FAILED).await?;
        Ok(completed_deleted + failed_deleted)
    }

    async fn trim_finished(&self, queue: &str, status: &str, retain: i64) -> crate::error::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_jobs
            WHERE id IN (
                SELECT id FROM webhook_jobs
                WHERE queue = $1 AND status = $2::job_status
                ORDER BY finished_at DESC
                OFFSET $3
            )
            "#,
        )
        .bind(queue)
        .bind(status)
        .bind(retain)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn counts(&self, queue: &str) -> crate::error::Result<QueueCounts> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM webhook_jobs WHERE queue = $1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status {
                JobStatus::Available => counts.waiting += count,
                JobStatus::Running => counts.active += count,
                JobStatus::Completed => counts.completed += count,
                JobStatus::Failed => counts.failed += count,
                JobStatus::Cancelled => {}
            }
        }

        let delayed: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM webhook_jobs WHERE queue = $1 AND status = 'available' AND scheduled_at > NOW()",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        counts.delayed = delayed.0;
        // `waiting` above already counts delayed rows via the generic
        // status grouping; subtract so the two figures don't overlap.
        counts.waiting -= counts.delayed;

        Ok(counts)
    }
}

/// The next top-of-the-hour strictly after `now`, used for the expiration
/// cleanup queue's hourly cadence without a cron-expression dependency.
pub fn next_top_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing minute/second/nanosecond never fails");

    if truncated > now {
        truncated
    } else {
        truncated + Duration::hours(1)
    }
}

fn std_duration_to_pg_interval(d: StdDuration) -> sqlx::postgres::types::PgInterval {
    sqlx::postgres::types::PgInterval {
        months: 0,
        days: 0,
        microseconds: d.as_micros() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sqlx::PgPool;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        tracking_number: String,
    }

    fn queue(pool: PgPool, worker: &str) -> Queue {
        Queue::new_from_pool(pool, worker, RetryPolicy::default())
    }

    #[test]
    fn next_top_of_hour_rounds_up() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap();
        let next = next_top_of_hour(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_top_of_hour_is_exclusive_of_now() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = next_top_of_hour(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn enqueue_then_dequeue_marks_running(db: PgPool) {
        let q = queue(db, "worker-1");
        let id = q
            .enqueue(
                "webhook-delivery",
                NewJob::new(3, Payload { tracking_number: "1".into() }),
            )
            .await
            .unwrap();

        let job: Job<Payload> = q.dequeue("webhook-delivery").await.unwrap().expect("job present");
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
        assert!(job.attempted_by.contains(&"worker-1".to_owned()));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn dequeue_on_empty_queue_returns_none(db: PgPool) {
        let q = queue(db, "worker-1");
        let job: Option<Job<Payload>> = q.dequeue("webhook-delivery").await.unwrap();
        assert!(job.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn retry_reschedules_until_max_attempts_then_fails(db: PgPool) {
        let q = queue(db, "worker-1");
        q.enqueue(
            "webhook-delivery",
            NewJob::new(2, Payload { tracking_number: "1".into() }),
        )
        .await
        .unwrap();

        let job: Job<Payload> = q.dequeue("webhook-delivery").await.unwrap().unwrap();
        q.retry(job.id, job.attempt, job.max_attempts, "timed out", None)
            .await
            .unwrap();

        let retried: Job<Payload> = q.dequeue("webhook-delivery").await.unwrap().expect("still retryable");
        assert_eq!(retried.attempt, 2);

        // Attempt now equals max_attempts; another failure should fail outright.
        q.retry(retried.id, retried.attempt, retried.max_attempts, "timed out again", None)
            .await
            .unwrap();

        let none: Option<Job<Payload>> = q.dequeue("webhook-delivery").await.unwrap();
        assert!(none.is_none());

        let counts = q.counts("webhook-delivery").await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn first_retry_waits_base_interval_not_doubled(db: PgPool) {
        // spec.md §8 scenario 3 pins the first retry to ~60s, the second to
        // ~120s, for the default base-60s exponential policy. `job.attempt`
        // from `dequeue` is already 1 on the first try, so `retry` must
        // treat that as the 0th back-off step, not the 1st.
        let q = Queue::new_from_pool(db, "worker-1", RetryPolicy::default());
        q.enqueue(
            "webhook-delivery",
            NewJob::new(3, Payload { tracking_number: "1".into() }),
        )
        .await
        .unwrap();

        let job: Job<Payload> = q.dequeue("webhook-delivery").await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        let before_retry = Utc::now();
        q.retry(job.id, job.attempt, job.max_attempts, "timed out", None)
            .await
            .unwrap();

        let (scheduled_at,): (DateTime<Utc>,) =
            sqlx::query_as("SELECT scheduled_at FROM webhook_jobs WHERE id = $1")
                .bind(job.id)
                .fetch_one(&q.pool)
                .await
                .unwrap();
        let delay = scheduled_at - before_retry;
        assert!(
            delay >= Duration::seconds(55) && delay <= Duration::seconds(65),
            "expected ~60s delay for the first retry, got {delay}"
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn repeat_schedule_is_idempotent_by_job_id(db: PgPool) {
        let q = queue(db, "worker-1");
        q.enqueue_repeating(
            "tracking-monitor",
            "monitor-tick",
            Payload { tracking_number: "n/a".into() },
            1,
            StdDuration::from_secs(60),
        )
        .await
        .unwrap();
        q.enqueue_repeating(
            "tracking-monitor",
            "monitor-tick",
            Payload { tracking_number: "n/a".into() },
            1,
            StdDuration::from_secs(120),
        )
        .await
        .unwrap();

        let materialized = q.tick_schedules().await.unwrap();
        assert_eq!(materialized, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn reap_stalled_returns_abandoned_jobs_to_available(db: PgPool) {
        let q = queue(db.clone(), "worker-1");
        q.enqueue(
            "webhook-delivery",
            NewJob::new(3, Payload { tracking_number: "1".into() }),
        )
        .await
        .unwrap();
        let job: Job<Payload> = q.dequeue("webhook-delivery").await.unwrap().unwrap();

        sqlx::query("UPDATE webhook_jobs SET attempted_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(job.id)
            .execute(&db)
            .await
            .unwrap();

        let reaped = q.reap_stalled("webhook-delivery").await.unwrap();
        assert_eq!(reaped, 1);

        let counts = q.counts("webhook-delivery").await.unwrap();
        assert_eq!(counts.waiting, 1);
    }
}
