//! The registration store: durable persistence of webhook registrations
//! and delivery logs, backed by PostgreSQL.
//!
//! Each operation here is atomic with respect to other operations on the
//! same row. Uses runtime `sqlx::query`/`query_as` rather than the
//! compile-time `query!` macros, which would require a live database at
//! build time, with errors wrapped into this crate's own error type.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::{Result, WebhookError};
use crate::model::{
    DeliveryLog, NewDeliveryLog, NewWebhookRegistration, WebhookRegistration,
    WebhookRegistrationPatch,
};

/// A registration is due for another check if it has never been checked,
/// or was last checked more than this long ago (spec.md 4.1).
pub const DUE_FOR_CHECK_INTERVAL: Duration = Duration::minutes(5);

#[derive(Clone)]
pub struct RegistrationStore {
    pool: PgPool,
}

impl RegistrationStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewWebhookRegistration) -> Result<WebhookRegistration> {
        let id = Uuid::now_v7();
        let record = sqlx::query_as::<_, WebhookRegistration>(
            r#"
            INSERT INTO webhook_registrations
                (id, carrier_id, tracking_number, callback_url, expiration_time, active)
            VALUES
                ($1, $2, $3, $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.carrier_id)
        .bind(&input.tracking_number)
        .bind(&input.callback_url)
        .bind(input.expiration_time)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookRegistration>> {
        let record =
            sqlx::query_as::<_, WebhookRegistration>("SELECT * FROM webhook_registrations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    pub async fn find_active(&self) -> Result<Vec<WebhookRegistration>> {
        let records = sqlx::query_as::<_, WebhookRegistration>(
            "SELECT * FROM webhook_registrations WHERE active = TRUE ORDER BY last_checked_at ASC NULLS FIRST",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn find_due_for_check(&self, limit: i64) -> Result<Vec<WebhookRegistration>> {
        let cutoff = Utc::now() - DUE_FOR_CHECK_INTERVAL;
        let records = sqlx::query_as::<_, WebhookRegistration>(
            r#"
            SELECT * FROM webhook_registrations
            WHERE active = TRUE
              AND (last_checked_at IS NULL OR last_checked_at < $1)
            ORDER BY last_checked_at ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// A single round-trip partial update: `COALESCE` handles the
    /// single-`Option` fields ("don't touch" = `NULL` bind = keep the
    /// column), and the double-`Option` fields (`last_checksum`,
    /// `last_error`) carry a separate `_set` flag alongside their value so
    /// "don't touch" and "clear to NULL" stay distinguishable without a
    /// preliminary read (spec.md 4.1/5a: every operation is atomic with
    /// respect to other operations on the same row).
    pub async fn update(&self, id: Uuid, patch: WebhookRegistrationPatch) -> Result<WebhookRegistration> {
        let last_checksum_set = patch.last_checksum.is_some();
        let last_checksum = patch.last_checksum.flatten();
        let last_error_set = patch.last_error.is_some();
        let last_error = patch.last_error.flatten();

        let record = sqlx::query_as::<_, WebhookRegistration>(
            r#"
            UPDATE webhook_registrations
            SET active = COALESCE($2, active),
                last_checksum = CASE WHEN $3 THEN $4 ELSE last_checksum END,
                last_checked_at = COALESCE($5, last_checked_at),
                delivery_attempts = COALESCE($6, delivery_attempts),
                last_delivery_at = COALESCE($7, last_delivery_at),
                last_error = CASE WHEN $8 THEN $9 ELSE last_error END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.active)
        .bind(last_checksum_set)
        .bind(last_checksum)
        .bind(patch.last_checked_at)
        .bind(patch.delivery_attempts)
        .bind(patch.last_delivery_at)
        .bind(last_error_set)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;

        Ok(record)
    }

    /// Idempotent: deactivating an already-inactive (or missing)
    /// registration is not an error.
    pub async fn deactivate(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE webhook_registrations SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE webhook_registrations SET active = FALSE WHERE active = TRUE AND expiration_time < NOW()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn log_delivery(&self, input: NewDeliveryLog) -> Result<DeliveryLog> {
        let input = input.truncate();
        let log = sqlx::query_as::<_, DeliveryLog>(
            r#"
            INSERT INTO webhook_delivery_logs
                (webhook_registration_id, attempt_number, status_code, success, error_message, request_body, response_body)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(input.webhook_registration_id)
        .bind(input.attempt_number)
        .bind(input.status_code)
        .bind(input.success)
        .bind(input.error_message)
        .bind(input.request_body)
        .bind(input.response_body)
        .fetch_one(&self.pool)
        .await?;

        Ok(log)
    }

    /// Race-free read-modify-write: a single `UPDATE ... SET x = x + 1`
    /// rather than a read followed by a write (spec.md 4.1/5a).
    pub async fn increment_delivery_attempts(&self, id: Uuid) -> Result<WebhookRegistration> {
        let record = sqlx::query_as::<_, WebhookRegistration>(
            r#"
            UPDATE webhook_registrations
            SET delivery_attempts = delivery_attempts + 1,
                last_delivery_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;

        Ok(record)
    }

    pub async fn get_delivery_logs(&self, id: Uuid, limit: i64) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            "SELECT * FROM webhook_delivery_logs WHERE webhook_registration_id = $1 ORDER BY delivered_at DESC LIMIT $2",
        )
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}

/// Duration helper so callers don't need to import `chrono::Duration`
/// just to express "now minus the due-for-check window" in tests.
pub fn due_for_check_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - DUE_FOR_CHECK_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWebhookRegistration;
    use sqlx::PgPool;

    fn new_registration(carrier_id: &str, tracking_number: &str) -> NewWebhookRegistration {
        NewWebhookRegistration {
            carrier_id: carrier_id.to_owned(),
            tracking_number: tracking_number.to_owned(),
            callback_url: "https://hook.test/r1".to_owned(),
            expiration_time: Utc::now() + Duration::hours(1),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn create_and_find_by_id(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store
            .create(new_registration("kr.cjlogistics", "100000001"))
            .await
            .expect("create failed");

        assert!(created.active);
        assert!(created.last_checksum.is_none());

        let found = store
            .find_by_id(created.id)
            .await
            .expect("query failed")
            .expect("not found");
        assert_eq!(found.id, created.id);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn deactivate_is_idempotent(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store
            .create(new_registration("kr.cjlogistics", "100000001"))
            .await
            .unwrap();

        store.deactivate(created.id).await.unwrap();
        store.deactivate(created.id).await.unwrap();

        let found = store.find_by_id(created.id).await.unwrap().unwrap();
        assert!(!found.active);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn deactivate_expired_only_touches_expired_active_rows(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db.clone());
        let mut expired = new_registration("kr.cjlogistics", "1");
        expired.expiration_time = Utc::now() - Duration::seconds(1);
        let expired = store.create(expired).await.unwrap();

        let alive = store.create(new_registration("kr.cjlogistics", "2")).await.unwrap();

        let count = store.deactivate_expired().await.unwrap();
        assert_eq!(count, 1);

        assert!(!store.find_by_id(expired.id).await.unwrap().unwrap().active);
        assert!(store.find_by_id(alive.id).await.unwrap().unwrap().active);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn increment_delivery_attempts_is_monotonic(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store.create(new_registration("kr.cjlogistics", "1")).await.unwrap();

        let r1 = store.increment_delivery_attempts(created.id).await.unwrap();
        let r2 = store.increment_delivery_attempts(created.id).await.unwrap();

        assert_eq!(r1.delivery_attempts, 1);
        assert_eq!(r2.delivery_attempts, 2);
        assert!(r2.last_delivery_at.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn find_due_for_check_excludes_recently_checked(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let never_checked = store.create(new_registration("kr.cjlogistics", "1")).await.unwrap();
        let recently_checked = store.create(new_registration("kr.cjlogistics", "2")).await.unwrap();

        store
            .update(
                recently_checked.id,
                WebhookRegistrationPatch::lastchecked(Utc::now()),
            )
            .await
            .unwrap();

        let due = store.find_due_for_check(10).await.unwrap();
        let due_ids: Vec<_> = due.iter().map(|r| r.id).collect();

        assert!(due_ids.contains(&never_checked.id));
        assert!(!due_ids.contains(&recently_checked.id));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn update_patch_applies_only_provided_fields(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store.create(new_registration("kr.cjlogistics", "1")).await.unwrap();

        let updated = store
            .update(
                created.id,
                WebhookRegistrationPatch::default().with_checksum("abc123".to_owned()),
            )
            .await
            .unwrap();

        assert_eq!(updated.last_checksum.as_deref(), Some("abc123"));
        assert!(updated.active); // untouched field preserved
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn concurrent_updates_to_disjoint_fields_both_survive(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store.create(new_registration("kr.cjlogistics", "1")).await.unwrap();

        let checksum_update = store.update(
            created.id,
            WebhookRegistrationPatch::default().with_checksum("abc123".to_owned()),
        );
        let error_update = store.update(
            created.id,
            WebhookRegistrationPatch::default().with_error("boom"),
        );
        let (a, b) = tokio::join!(checksum_update, error_update);
        a.unwrap();
        b.unwrap();

        let found = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(found.last_checksum.as_deref(), Some("abc123"));
        assert_eq!(found.last_error.as_deref(), Some("boom"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn delivery_logs_are_append_only_and_ordered(db: PgPool) {
        let store = RegistrationStore::new_from_pool(db);
        let created = store.create(new_registration("kr.cjlogistics", "1")).await.unwrap();

        for attempt in 1..=3 {
            store
                .log_delivery(NewDeliveryLog {
                    webhook_registration_id: created.id,
                    attempt_number: attempt,
                    status_code: Some(500),
                    success: false,
                    error_message: Some("server error".to_owned()),
                    request_body: "{}".to_owned(),
                    response_body: None,
                })
                .await
                .unwrap();
        }

        let logs = store.get_delivery_logs(created.id, 10).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].attempt_number, 3); // most recent first
    }
}
