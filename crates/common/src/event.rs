//! Behavior events emitted by the analyzers

use crate::geometry::BBox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One structured behavior event.
///
/// Sinks must be idempotent on the `(camera_id, rule_id, object_id,
/// timestamp_ms)` tuple; `dedup_key` exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    /// Event type, initially "intrusion"
    pub event_type: String,
    /// Originating rule id
    pub rule_id: String,
    /// Camera-local track id
    pub object_id: u64,
    /// Global identity string, if cross-camera matching assigned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_identity: Option<String>,
    /// Owning camera id
    pub camera_id: String,
    /// Object bounding box at emission time
    pub bbox: BBox,
    /// Event confidence from the rule
    pub confidence: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Free-form metadata (conflict sets, dwell duration, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BehaviorEvent {
    /// Idempotence key for event sinks.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String, u64, i64) {
        (
            self.camera_id.clone(),
            self.rule_id.clone(),
            self.object_id,
            self.timestamp_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> BehaviorEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("duration".to_string(), "5.0s".to_string());
        metadata.insert("selected_priority".to_string(), "5".to_string());
        BehaviorEvent {
            event_type: "intrusion".to_string(),
            rule_id: "default_intrusion".to_string(),
            object_id: 3,
            global_identity: Some("17".to_string()),
            camera_id: "cam1".to_string(),
            bbox: BBox::new(100.0, 100.0, 50.0, 120.0),
            confidence: 0.7,
            timestamp_ms: 1_700_000_000_123,
            metadata,
        }
    }

    #[test]
    fn test_sink_format_round_trip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let decoded: BehaviorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_round_trip_without_identity() {
        let mut event = sample_event();
        event.global_identity = None;
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("global_identity"));
        let decoded: BehaviorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_dedup_key() {
        let event = sample_event();
        let (camera, rule, object, ts) = event.dedup_key();
        assert_eq!(camera, "cam1");
        assert_eq!(rule, "default_intrusion");
        assert_eq!(object, 3);
        assert_eq!(ts, 1_700_000_000_123);
    }
}
