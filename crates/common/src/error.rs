//! Error taxonomy for the analytics engine
//!
//! Per-frame errors are logged and counted by the owning stage, never thrown
//! across stage boundaries. Fatal conditions carry a short machine-readable
//! code surfaced through the manager's status query.

use thiserror::Error;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum AnalyticsError {
    // Source errors
    #[error("Host unreachable: {0}")]
    UnreachableHost(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Reconnect deadline exceeded after {0} attempts")]
    ReconnectDeadline(u32),

    // Detector errors
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Detector backend unavailable: {0}")]
    BackendUnavailable(String),

    // Pipeline / manager errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid ROI: {0}")]
    InvalidRoi(String),

    #[error("Pipeline stopped")]
    PipelineStopped,

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AnalyticsError {
    /// Short machine-readable fault code for the status query.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            AnalyticsError::UnreachableHost(_) => "E_SRC_UNREACHABLE",
            AnalyticsError::AuthFailed(_) => "E_SRC_AUTH",
            AnalyticsError::UnsupportedSource(_) => "E_SRC_UNSUPPORTED",
            AnalyticsError::TransientIo(_) => "E_SRC_TRANSIENT",
            AnalyticsError::EndOfStream => "E_SRC_EOS",
            AnalyticsError::Decode(_) => "E_SRC_DECODE",
            AnalyticsError::ReconnectDeadline(_) => "E_SRC_DEADLINE",
            AnalyticsError::ModelLoad(_) => "E_DET_MODEL_LOAD",
            AnalyticsError::Inference(_) => "E_DET_INFERENCE",
            AnalyticsError::BackendUnavailable(_) => "E_DET_BACKEND",
            AnalyticsError::InvalidConfig(_) => "E_CFG_INVALID",
            AnalyticsError::InvalidRoi(_) => "E_ROI_INVALID",
            AnalyticsError::PipelineStopped => "E_PIPE_STOPPED",
            AnalyticsError::PipelineNotFound(_) => "E_PIPE_NOT_FOUND",
            AnalyticsError::Io(_) => "E_IO",
            AnalyticsError::Serialization(_) => "E_SERDE",
            AnalyticsError::Other(_) => "E_OTHER",
        }
    }

    /// Whether the manager may auto-restart a pipeline that failed with this
    /// error. Authentication and configuration failures are never retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AnalyticsError::TransientIo(_)
                | AnalyticsError::UnreachableHost(_)
                | AnalyticsError::ReconnectDeadline(_)
                | AnalyticsError::EndOfStream
                | AnalyticsError::Decode(_)
                | AnalyticsError::Inference(_)
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AnalyticsError>;
