//! VisionGuard — multi-camera AI security video analytics engine
//!
//! Facade crate re-exporting the workspace members. Each camera runs one
//! processing pipeline (decode → detect → track → analyze → publish) under
//! the process-wide [`manager::PipelineManager`], which reconciles running
//! pipelines against the configuration store and owns the cross-camera
//! identity registry.

pub use visionguard_analyzer as analyzer;
pub use visionguard_attributes as attributes;
pub use visionguard_common as common;
pub use visionguard_detector as detector;
pub use visionguard_frame_source as frame_source;
pub use visionguard_manager as manager;
pub use visionguard_pipeline as pipeline;
pub use visionguard_tracker as tracker;
