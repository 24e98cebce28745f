//! Shared decoded frames
//!
//! A frame is an immutable view of one decoded image. Ownership is shared by
//! reference count so downstream stages never copy pixels; the buffer is
//! released when the last stage drops its handle.

use image::RgbImage;
use std::sync::Arc;

/// One decoded video frame.
///
/// `sequence` increases monotonically per camera session and resets on
/// reconnect. `timestamp_ns` derives from the source PTS when present,
/// otherwise the emission time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Per-session monotone sequence number
    pub sequence: u64,
    /// Capture timestamp, nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    /// Shared RGB pixel buffer; no stage mutates pixels
    pub pixels: Arc<RgbImage>,
}

impl Frame {
    #[must_use]
    pub fn new(sequence: u64, timestamp_ns: i64, pixels: RgbImage) -> Self {
        Self {
            sequence,
            timestamp_ns,
            pixels: Arc::new(pixels),
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Timestamp in whole milliseconds, the unit used by events.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ns / 1_000_000
    }
}
