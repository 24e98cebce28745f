//! Regions of interest
//!
//! A ROI is a polygon in image coordinates with a priority and an optional
//! daily time window. Membership is tested with a ray cast against the
//! object's representative point.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use visionguard_common::{AnalyticsError, Point, Result};

/// Valid priority range
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

/// Parsed state of a ROI's time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    /// No schedule configured: always active
    None,
    /// Active between start and end, wrapping midnight when `end <= start`
    Window { start: NaiveTime, end: NaiveTime },
    /// Unparseable strings: treated as always active (logged at add time)
    Invalid,
}

/// Region of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub id: String,
    pub name: String,
    /// Polygon vertices in image coordinates; at least 3 required
    pub polygon: Vec<Point>,
    pub enabled: bool,
    /// Conflict-resolution priority, 1 (lowest) to 5 (highest)
    pub priority: u8,
    /// Optional daily schedule start, `HH:MM` or `HH:MM:SS`
    #[serde(default)]
    pub start_time: Option<String>,
    /// Optional daily schedule end
    #[serde(default)]
    pub end_time: Option<String>,
}

impl Roi {
    /// Rectangle helper for tests and simple zones.
    #[must_use]
    pub fn rectangle(id: &str, x1: f32, y1: f32, x2: f32, y2: f32, priority: u8) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            polygon: vec![
                Point::new(x1, y1),
                Point::new(x2, y1),
                Point::new(x2, y2),
                Point::new(x1, y2),
            ],
            enabled: true,
            priority,
            start_time: None,
            end_time: None,
        }
    }

    /// Validate the §3 invariants. Rejected ROIs never enter the analyzer.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AnalyticsError::InvalidRoi("ROI id must not be empty".into()));
        }
        if self.polygon.len() < 3 {
            return Err(AnalyticsError::InvalidRoi(format!(
                "ROI '{}' polygon has {} vertices, need at least 3",
                self.id,
                self.polygon.len()
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(AnalyticsError::InvalidRoi(format!(
                "ROI '{}' priority {} outside [{MIN_PRIORITY},{MAX_PRIORITY}]",
                self.id, self.priority
            )));
        }
        Ok(())
    }

    /// Parse the configured schedule.
    #[must_use]
    pub fn time_window(&self) -> TimeWindow {
        match (&self.start_time, &self.end_time) {
            (None, None) => TimeWindow::None,
            (Some(start), Some(end)) => {
                match (parse_time_of_day(start), parse_time_of_day(end)) {
                    (Some(start), Some(end)) => TimeWindow::Window { start, end },
                    _ => TimeWindow::Invalid,
                }
            }
            // A half-configured schedule is invalid
            _ => TimeWindow::Invalid,
        }
    }

    /// Whether the ROI has a valid explicit schedule (used as a conflict
    /// tie-breaker: an explicitly windowed ROI is more specific).
    #[must_use]
    pub fn has_explicit_window(&self) -> bool {
        matches!(self.time_window(), TimeWindow::Window { .. })
    }

    /// Whether the ROI is active at the given wall-clock time of day.
    ///
    /// `end <= start` wraps across midnight, except `start == end` which is
    /// a zero-length interval and never active. Invalid schedules behave as
    /// always active.
    #[must_use]
    pub fn is_active_at(&self, time: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        match self.time_window() {
            TimeWindow::None | TimeWindow::Invalid => true,
            TimeWindow::Window { start, end } => {
                if start == end {
                    false
                } else if start < end {
                    time >= start && time < end
                } else {
                    // Crosses midnight
                    time >= start || time < end
                }
            }
        }
    }

    /// Ray-cast membership test for the representative point.
    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        if self.polygon.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = self.polygon.len() - 1;
        for i in 0..self.polygon.len() {
            let a = self.polygon[i];
            let b = self.polygon[j];
            // Edge crosses the horizontal ray through the point
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
                if point.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
#[must_use]
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}
