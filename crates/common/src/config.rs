//! Video-source configuration records
//!
//! These are the records the pipeline manager consumes from the
//! configuration store. Mutation happens only through the manager on
//! config-apply.

use crate::error::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};

/// URL schemes accepted for video sources
const ACCEPTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];

/// Optional stream credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Detection backend requested for a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectorBackendChoice {
    Npu,
    Gpu,
    Cpu,
    #[default]
    Auto,
}

/// Per-camera detection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOptions {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub backend: DetectorBackendChoice,
    pub model_path: String,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            backend: DetectorBackendChoice::Auto,
            model_path: "models/yolov8n.onnx".to_string(),
        }
    }
}

/// Per-camera preview stream options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub fps: u32,
    pub quality: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            fps: 15,
            quality: 80,
            max_width: 1280,
            max_height: 720,
        }
    }
}

/// Per-camera person-statistics (attribute analysis) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonStatisticsConfig {
    pub enabled: bool,
    pub gender_threshold: f32,
    pub age_threshold: f32,
    pub batch_size: usize,
    pub enable_caching: bool,
}

impl Default for PersonStatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gender_threshold: 0.6,
            age_threshold: 0.5,
            batch_size: 4,
            enable_caching: true,
        }
    }
}

/// Options bag attached to every camera record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CameraOptions {
    pub detection_enabled: bool,
    pub recording_enabled: bool,
    #[serde(default)]
    pub detection: DetectionOptions,
    #[serde(default)]
    pub stream: StreamOptions,
    #[serde(default)]
    pub person_statistics: PersonStatisticsConfig,
}

/// One video source as persisted in the configuration store.
///
/// Invariants: `id` is non-empty and unique process-wide; the URL scheme is
/// one of rtsp, rtsps, http, https, file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSourceConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub preview_port: Option<u16>,
    pub enabled: bool,
    #[serde(default)]
    pub options: CameraOptions,
}

impl VideoSourceConfig {
    /// Minimal config for tests and bring-up.
    #[must_use]
    pub fn test_source(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            credentials: None,
            width: 640,
            height: 480,
            fps: 10,
            preview_port: None,
            enabled: true,
            options: CameraOptions {
                detection_enabled: true,
                ..Default::default()
            },
        }
    }

    /// URL scheme, lowercased, if the URL has one.
    #[must_use]
    pub fn scheme(&self) -> Option<String> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }

    /// Validate the record against the §3 invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AnalyticsError::InvalidConfig(
                "video source id must not be empty".to_string(),
            ));
        }
        match self.scheme() {
            Some(scheme) if ACCEPTED_SCHEMES.contains(&scheme.as_str()) => {}
            Some(scheme) => {
                return Err(AnalyticsError::InvalidConfig(format!(
                    "unsupported URL scheme '{scheme}' for source '{}'",
                    self.id
                )))
            }
            None => {
                return Err(AnalyticsError::InvalidConfig(format!(
                    "URL '{}' for source '{}' has no scheme",
                    self.url, self.id
                )))
            }
        }
        if self.fps == 0 {
            return Err(AnalyticsError::InvalidConfig(format!(
                "source '{}' has zero fps",
                self.id
            )));
        }
        Ok(())
    }
}
