//! Configuration store access
//!
//! The manager reads desired state (camera records plus system keys)
//! through the `ConfigStore` trait; the relational store itself lives
//! outside this crate. A JSON file store is provided for deployments and
//! tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use visionguard_common::{AnalyticsError, Result, VideoSourceConfig};

/// System-level configuration keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Enables the detector worker pool on capable hardware
    pub optimized_detection: bool,
    /// Worker threads for detection, clamped to [1, 8]
    pub detection_threads: u32,
    /// Seconds between status log lines
    pub status_interval: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            optimized_detection: false,
            detection_threads: 2,
            status_interval: 10,
        }
    }
}

impl SystemConfig {
    /// Apply the documented bounds.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.detection_threads = self.detection_threads.clamp(1, 8);
        self.status_interval = self.status_interval.max(1);
        self
    }
}

/// Read access to the configuration store.
pub trait ConfigStore: Send + Sync {
    fn load_cameras(&self) -> Result<Vec<VideoSourceConfig>>;
    fn load_system(&self) -> Result<SystemConfig>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    cameras: Vec<VideoSourceConfig>,
    #[serde(default)]
    system: Option<SystemConfig>,
}

/// JSON file configuration store.
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load_document(&self) -> Result<StoreDocument> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            AnalyticsError::InvalidConfig(format!(
                "cannot read config store {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            AnalyticsError::InvalidConfig(format!(
                "cannot parse config store {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl ConfigStore for JsonConfigStore {
    fn load_cameras(&self) -> Result<Vec<VideoSourceConfig>> {
        let document = self.load_document()?;
        // Records that fail validation are dropped here with a warning; the
        // reconcile path reports per-camera errors for the rest.
        let mut cameras = Vec::with_capacity(document.cameras.len());
        for camera in document.cameras {
            if let Err(e) = camera.validate() {
                warn!("Skipping invalid camera record '{}': {e}", camera.id);
                continue;
            }
            cameras.push(camera);
        }
        Ok(cameras)
    }

    fn load_system(&self) -> Result<SystemConfig> {
        let document = self.load_document()?;
        Ok(document.system.unwrap_or_default().clamped())
    }
}
