//! The Carrier Registry boundary.
//!
//! Per spec.md's Non-goals, how a carrier is actually scraped is out of
//! scope here — a `Carrier` is just a handle exposing `track`. Everything
//! downstream (checksums, caching, delivery) only ever sees `TrackInfo`.
//!
//! Design Note 9 calls for tagged sum types rather than untyped maps for
//! the event timeline, so `TrackEventStatusCode` is a closed enum; the one
//! place opacity is preserved is `carrier_specific_data`, a plain
//! string-to-string map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEventStatusCode {
    InformationReceived,
    AtPickup,
    InTransit,
    OutForDelivery,
    AttemptFail,
    Delivered,
    AvailableForPickup,
    Exception,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub time: chrono::DateTime<chrono::Utc>,
    pub status: TrackEventStatusCode,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// A sender or recipient party. Kept generic but typed, since the
/// checksum domain deliberately excludes it (spec.md 4.4 step 5) and the
/// spec does not otherwise constrain its shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

/// Tracking state for one `(carrierId, trackingNumber)` pair, as returned
/// by a `Carrier` and cached/delivered by this subsystem. Opaque to this
/// subsystem except for `events`, which is the checksum basis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub events: Vec<TrackEvent>,
    #[serde(default)]
    pub sender: Party,
    #[serde(default)]
    pub recipient: Party,
    #[serde(default)]
    pub carrier_specific_data: HashMap<String, String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CarrierError {
    #[error("carrier request failed: {0}")]
    RequestFailed(String),
}

impl fmt::Display for TrackEventStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single carrier's tracking capability. Scraping, auth, and rate
/// limiting are entirely the implementor's concern; this subsystem only
/// calls `track` and reacts to its `Result`.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn track(&self, tracking_number: &str) -> Result<TrackInfo, CarrierError>;
}

/// Resolves a `carrierId` to a `Carrier` handle. Construction of the
/// concrete carriers (the scrapers) is out of scope; callers register
/// whatever implementations they have.
#[derive(Clone, Default)]
pub struct CarrierRegistry {
    carriers: HashMap<String, Arc<dyn Carrier>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, carrier_id: impl Into<String>, carrier: Arc<dyn Carrier>) {
        self.carriers.insert(carrier_id.into(), carrier);
    }

    pub fn get(&self, carrier_id: &str) -> Option<Arc<dyn Carrier>> {
        self.carriers.get(carrier_id).cloned()
    }

    pub fn contains(&self, carrier_id: &str) -> bool {
        self.carriers.contains_key(carrier_id)
    }
}

/// A scriptable stub `Carrier` for monitor/delivery tests in this crate and
/// downstream ones. Not feature-gated: keeping it a plain public module
/// (rather than `#[cfg(test)]`) is what lets `webhook-monitor` and
/// `webhook-worker` reuse it from their own test suites.
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub struct StubCarrier {
        responses: Mutex<Vec<Result<TrackInfo, CarrierError>>>,
    }

    impl StubCarrier {
        /// Responses are returned in order, oldest first; the last one
        /// repeats once exhausted.
        pub fn new(responses: Vec<Result<TrackInfo, CarrierError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl Carrier for StubCarrier {
        async fn track(&self, _tracking_number: &str) -> Result<TrackInfo, CarrierError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Err(CarrierError::RequestFailed("exhausted".into())))
            }
        }
    }
}
