//! Common types shared by the VisionGuard analytics engine
//!
//! This crate holds the data model that crosses crate boundaries: frames,
//! bounding boxes, detections, behavior events, video-source configuration,
//! the event-sink contract, the error taxonomy, and the clock abstraction
//! used by time-window and dwell logic.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod geometry;
pub mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CameraOptions, Credentials, DetectionOptions, DetectorBackendChoice, PersonStatisticsConfig,
    StreamOptions, VideoSourceConfig,
};
pub use error::{AnalyticsError, Result};
pub use event::BehaviorEvent;
pub use frame::Frame;
pub use geometry::{BBox, Point};
pub use sink::{EventSink, JsonLinesSink, MemorySink};

use serde::{Deserialize, Serialize};

/// A single detected object in original-image pixel coordinates.
///
/// Invariants: the box is clipped to the frame bounds and `confidence` is at
/// least the detector's configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// COCO class ID (0-79)
    pub class_id: u8,
    /// Resolved class name from the label table
    pub class_name: String,
    /// Confidence score (0-1)
    pub confidence: f32,
    /// Axis-aligned box in original-image pixels
    pub bbox: BBox,
}

impl Detection {
    #[must_use]
    pub fn new(class_id: u8, class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }
}
