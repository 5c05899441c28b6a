//! Change detection: SHA-256 over the canonically serialized event timeline.
//!
//! spec.md 4.4 step 5 requires that two `events` values differing only in
//! top-level object key ordering hash identically. `serde_json::Map` is
//! `BTreeMap`-backed unless the `preserve_order` feature is enabled (it
//! isn't here, matching the teacher's own `serde_json` dependency), so
//! round-tripping through `serde_json::to_value` sorts every object's keys
//! at every depth for free — no hand-rolled canonicalization needed.

use sha2::{Digest, Sha256};

use crate::carrier::TrackEvent;

/// Computes `SHA-256(canonical(events))` as a lowercase hex string.
///
/// The checksum domain is deliberately limited to `events` — sender,
/// recipient, and carrier-specific data are excluded because they rarely
/// change and would otherwise produce spurious deliveries (spec.md 4.4).
pub fn checksum_events(events: &[TrackEvent]) -> String {
    let value = serde_json::to_value(events).expect("TrackEvent is always serializable");
    let canonical = serde_json::to_string(&value).expect("Value is always serializable");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::TrackEventStatusCode;
    use chrono::{TimeZone, Utc};

    fn event(desc: &str) -> TrackEvent {
        TrackEvent {
            time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            status: TrackEventStatusCode::InTransit,
            location: Some("hub".to_owned()),
            description: Some(desc.to_owned()),
        }
    }

    #[test]
    fn identical_events_checksum_identically() {
        let a = vec![event("left hub")];
        let b = vec![event("left hub")];
        assert_eq!(checksum_events(&a), checksum_events(&b));
    }

    #[test]
    fn differing_events_checksum_differently() {
        let a = vec![event("left hub")];
        let b = vec![event("left hub"), event("arrived at destination")];
        assert_ne!(checksum_events(&a), checksum_events(&b));
    }

    #[test]
    fn checksum_is_64_char_lowercase_hex() {
        let checksum = checksum_events(&[event("left hub")]);
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_order_in_serialized_maps_does_not_affect_checksum() {
        // TrackEvent's own field order is fixed by its struct definition, so
        // this instead exercises the underlying canonicalization directly:
        // two Values built with differently-ordered object keys must
        // serialize identically once round-tripped through `to_value`.
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
