//! Job payload shapes shared between enqueuers and dequeuers across the
//! three named queues: the facade enqueues, the corresponding worker
//! dequeues, and both sides need the same serde-derived struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::carrier::TrackInfo;

pub const TRACKING_MONITOR_QUEUE: &str = "tracking-monitor";
pub const WEBHOOK_DELIVERY_QUEUE: &str = "webhook-delivery";
pub const EXPIRATION_CLEANUP_QUEUE: &str = "expiration-cleanup";

/// Per-invocation attempt caps from spec.md 4.3's queue table.
pub const MONITOR_MAX_ATTEMPTS: i32 = 3;
pub const DELIVERY_MAX_ATTEMPTS: i32 = 4;
pub const CLEANUP_MAX_ATTEMPTS: i32 = 3;

/// `jobId` under which the hourly cleanup cron is scheduled; fixed so
/// repeated `Init` calls coalesce onto the same schedule row (spec.md 4.3).
pub const EXPIRATION_CLEANUP_JOB_ID: &str = "expiration-cleanup";

/// Payload for the `tracking-monitor` queue (spec.md 4.3). `job_id` used
/// when scheduling this repeatedly is always the registration's id, so a
/// registration only ever has one scheduled instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorJobPayload {
    pub webhook_registration_id: Uuid,
    pub carrier_id: String,
    pub tracking_number: String,
}

/// Payload for the `webhook-delivery` queue, enqueued by the monitor
/// worker on a checksum transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJobPayload {
    pub webhook_registration_id: Uuid,
    pub callback_url: String,
    pub track_info: TrackInfo,
    pub previous_checksum: Option<String>,
    pub current_checksum: String,
}

/// Payload for the `expiration-cleanup` queue. Empty: the cleanup worker
/// takes no parameters, it simply sweeps every expired registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupJobPayload {}

/// The JSON body POSTed to a registration's `callback_url` (spec.md 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequestBody {
    pub webhook_id: Uuid,
    pub tracking_data: TrackInfo,
    pub metadata: DeliveryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMetadata {
    pub previous_checksum: Option<String>,
    pub current_checksum: String,
    pub delivered_at: DateTime<Utc>,
}
