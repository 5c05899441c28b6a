//! The persisted data model: `WebhookRegistration` and `DeliveryLog`.
//!
//! Validation of user-supplied input (callback URL scheme/host,
//! expiration window) lives in `webhook-api::validation`, not here — this
//! module only carries the shape of a row once it has been accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durable webhook subscription: who to notify, about what, until when.
///
/// Invariants:
/// - `active = false` is terminal: once cleared, no further monitor or
///   delivery job may run against this id.
/// - `last_checksum` is only ever set immediately after a successful
///   delivery-trigger decision, never speculatively.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub carrier_id: String,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub last_checksum: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i32,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Fields accepted by `RegistrationStore::create`.
#[derive(Debug, Clone)]
pub struct NewWebhookRegistration {
    pub carrier_id: String,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
}

/// A partial update applied to a single registration row.
///
/// Every field is optional; `None` means "leave unchanged". `last_error`
/// and `last_checksum` use a double-`Option` so callers can distinguish
/// "don't touch" from "clear to null" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct WebhookRegistrationPatch {
    pub active: Option<bool>,
    pub last_checksum: Option<Option<String>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub delivery_attempts: Option<i32>,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
}

impl WebhookRegistrationPatch {
    pub fn lastchecked(now: DateTime<Utc>) -> Self {
        Self {
            last_checked_at: Some(now),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        // Errors are logged for operators, not returned to a caller, so a
        // generous-but-bounded cap is enough.
        let truncated = truncate_chars(&error, 2048);
        self.last_error = Some(Some(truncated));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.last_checksum = Some(Some(checksum));
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_checked_at(mut self, now: DateTime<Utc>) -> Self {
        self.last_checked_at = Some(now);
        self
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Append-only record of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: i64,
    pub webhook_registration_id: Uuid,
    pub attempt_number: i32,
    pub status_code: Option<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_body: String,
    pub response_body: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Fields accepted by `RegistrationStore::log_delivery`.
#[derive(Debug, Clone)]
pub struct NewDeliveryLog {
    pub webhook_registration_id: Uuid,
    pub attempt_number: i32,
    pub status_code: Option<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_body: String,
    pub response_body: Option<String>,
}

impl NewDeliveryLog {
    /// Response bodies are persisted truncated to 1000 bytes; error
    /// messages logged on a `DeliveryLog` are capped at 200 bytes,
    /// tighter than the 2048-byte cap used for `last_error` on the
    /// registration itself.
    pub fn truncate(mut self) -> Self {
        if let Some(body) = &self.response_body {
            self.response_body = Some(truncate_bytes(body, 1000));
        }
        if let Some(message) = &self.error_message {
            self.error_message = Some(truncate_bytes(message, 200));
        }
        self
    }
}

pub fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    // Find the largest char boundary at or before `max` so we never split a
    // multi-byte UTF-8 sequence.
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        let s = "héllo world"; // 'é' is 2 bytes
        let truncated = truncate_bytes(s, 2);
        assert!(truncated.len() <= 2);
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn truncate_bytes_noop_under_limit() {
        assert_eq!(truncate_bytes("short", 1000), "short");
    }

    #[test]
    fn patch_with_error_truncates_to_2048_chars() {
        let long = "x".repeat(3000);
        let patch = WebhookRegistrationPatch::default().with_error(long);
        assert_eq!(patch.last_error.unwrap().unwrap().chars().count(), 2048);
    }
}
