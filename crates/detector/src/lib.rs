//! Object detection over interchangeable inference backends
//!
//! This crate provides the detector abstraction of the analytics engine:
//! letterboxed preprocessing, anchor-free decoding (single-tensor and
//! three-scale DFL layouts, float or int8-quantized), class-wise NMS, and
//! a uniform `ObjectDetector` contract over NPU/GPU/CPU backend variants.
//!
//! # Features
//! - Backend capability probing with ordered fallback (NPU → GPU → CPU)
//! - Letterbox preprocessing with exact inverse mapping
//! - DFL (softmax-expectation) box decoding with score-sum fast reject
//! - Per-class greedy non-maximum suppression
//! - Optional class allow-list filtering
//! - Per-instance contexts safe for one-per-worker pooling
//!
//! # Example
//! ```no_run
//! use visionguard_detector::{Detector, DetectorConfig, ObjectDetector};
//! use visionguard_common::{DetectorBackendChoice, Frame};
//!
//! # fn main() -> Result<(), visionguard_detector::DetectorError> {
//! let config = DetectorConfig::default();
//! let mut detector =
//!     Detector::with_fallback(DetectorBackendChoice::Auto, "models/yolov8n.onnx", config)?;
//!
//! # let frame = Frame::new(0, 0, image::RgbImage::new(640, 480));
//! let detections = detector.detect_objects(&frame)?;
//! for detection in detections {
//!     println!("{}: {:.2}%", detection.class_name, detection.confidence * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod decode;
pub mod labels;
pub mod letterbox;

pub use backend::{
    backend_candidates, BackendKind, DetectorBackend, ModelInput, ModelOutput, OrtBackend,
    OutputData,
};
pub use decode::{Candidate, QuantParams, ScaleBranch, TensorData};
pub use labels::{coco_class_name, COCO_CLASSES};
pub use letterbox::{letterbox, LetterboxTransform};

use decode::{decode_combined, decode_dfl_branches, nms_per_class};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use visionguard_common::{AnalyticsError, BBox, Detection, DetectorBackendChoice, Frame};

/// Window for the inference-time moving average
const INFERENCE_EMA_WINDOW: f32 = 100.0;

/// Detector errors
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Failed to create session builder: {0}")]
    SessionBuilder(String),

    #[error("Failed to load model from {path}: {error}")]
    ModelLoad { path: String, error: String },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Detector not initialized")]
    NotInitialized,

    #[error("No usable backend for {choice}: {detail}")]
    NoBackendAvailable { choice: String, detail: String },
}

impl From<DetectorError> for AnalyticsError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Inference(message) => AnalyticsError::Inference(message),
            DetectorError::NoBackendAvailable { .. } => {
                AnalyticsError::BackendUnavailable(err.to_string())
            }
            DetectorError::UnsupportedModel(message) => {
                AnalyticsError::BackendUnavailable(message)
            }
            other => AnalyticsError::ModelLoad(other.to_string()),
        }
    }
}

/// Shape of the model's output head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputLayout {
    /// Single `[84, N]` tensor: 4 box values + class scores per anchor
    Combined,
    /// Per-stride branches with DFL box distributions and class scores
    ThreeScale {
        strides: Vec<usize>,
        /// Whether each branch carries a trailing score-sum channel
        score_sum: bool,
    },
}

impl OutputLayout {
    #[must_use]
    fn output_count(&self) -> usize {
        match self {
            OutputLayout::Combined => 1,
            OutputLayout::ThreeScale { strides, .. } => strides.len(),
        }
    }
}

/// Element type of the model's input tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InputTensorType {
    /// Float input, normalized by 1/255
    #[default]
    Float32,
    /// UINT8 input passed through unchanged (quantization embeds scale/zp)
    Uint8,
}

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum confidence threshold for detections (0.0-1.0)
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression (0.0-1.0)
    pub nms_threshold: f32,
    /// Model input size (square, default 640)
    pub input_size: u32,
    /// Maximum number of detections returned per frame
    pub max_detections: usize,
    /// Enabled class names (None = all classes)
    pub allowed_classes: Option<Vec<String>>,
    /// Output head layout
    pub layout: OutputLayout,
    /// Input tensor element type
    pub input_tensor: InputTensorType,
    /// Output quantization parameters for int8 models
    pub quantization: Option<QuantizationConfig>,
}

/// Serializable mirror of [`QuantParams`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub scale: f32,
    pub zero_point: i32,
}

impl From<QuantizationConfig> for QuantParams {
    fn from(config: QuantizationConfig) -> Self {
        QuantParams {
            scale: config.scale,
            zero_point: config.zero_point,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            input_size: 640,
            max_detections: 300,
            allowed_classes: None,
            layout: OutputLayout::Combined,
            input_tensor: InputTensorType::Float32,
            quantization: None,
        }
    }
}

impl DetectorConfig {
    /// Config for person detection only, the common security setup.
    #[must_use]
    pub fn person_only() -> Self {
        Self {
            confidence_threshold: 0.3,
            allowed_classes: Some(vec!["person".to_string()]),
            max_detections: 100,
            ..Default::default()
        }
    }

    /// Config for int8-quantized three-scale models with a score-sum head.
    #[must_use]
    pub fn quantized(scale: f32, zero_point: i32) -> Self {
        Self {
            layout: OutputLayout::ThreeScale {
                strides: vec![8, 16, 32],
                score_sum: true,
            },
            input_tensor: InputTensorType::Uint8,
            quantization: Some(QuantizationConfig { scale, zero_point }),
            ..Default::default()
        }
    }
}

/// Uniform detection contract consumed by the pipeline.
pub trait ObjectDetector: Send {
    /// Detect objects in one frame. Per-frame inference errors yield an
    /// empty result and bump the failure counters; only fatal conditions
    /// (lost context) surface as errors.
    fn detect_objects(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;

    /// Human-readable description of the active backend.
    fn describe(&self) -> String;

    /// Consecutive per-frame failures since the last success.
    fn consecutive_failures(&self) -> u32 {
        0
    }

    /// Rebuild the inference context from the on-disk model.
    fn reinitialize(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }

    /// Apply a confidence-threshold delta in place.
    fn apply_confidence_threshold(&mut self, _threshold: f32) {}

    /// Apply an NMS-threshold delta in place.
    fn apply_nms_threshold(&mut self, _threshold: f32) {}
}

/// Factory producing one detector context per pool worker.
pub type DetectorFactory =
    Arc<dyn Fn() -> Result<Box<dyn ObjectDetector>, DetectorError> + Send + Sync>;

/// Object detector over one backend instance.
pub struct Detector {
    backend: Box<dyn DetectorBackend>,
    config: DetectorConfig,
    model_path: PathBuf,
    inference_ema_ms: f32,
    samples: u64,
    inference_errors: u64,
    consecutive_failures: u32,
}

impl Detector {
    /// Create a detector on an explicit backend. Model load failure is fatal
    /// for the instance.
    pub fn new(
        mut backend: Box<dyn DetectorBackend>,
        model_path: impl AsRef<Path>,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        backend.initialize(model_path.as_ref())?;
        Ok(Self {
            backend,
            config,
            model_path: model_path.as_ref().to_path_buf(),
            inference_ema_ms: 0.0,
            samples: 0,
            inference_errors: 0,
            consecutive_failures: 0,
        })
    }

    /// Create a detector for the configured backend choice, probing the
    /// candidate order and falling back on initialization failure. The
    /// failure of each candidate is logged; the error lists every attempt
    /// when none succeeds.
    pub fn with_fallback(
        choice: DetectorBackendChoice,
        model_path: impl AsRef<Path>,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        let model_path = model_path.as_ref();
        let mut failures = Vec::new();
        for kind in backend_candidates(choice) {
            let backend = Box::new(OrtBackend::new(kind, num_threads()));
            match Self::new(backend, model_path, config.clone()) {
                Ok(detector) => {
                    info!("Detector initialized on {} backend", kind.name());
                    return Ok(detector);
                }
                Err(e) => {
                    warn!(
                        "Backend {} failed to initialize for {}: {e}",
                        kind.name(),
                        model_path.display()
                    );
                    failures.push(format!("{}: {e}", kind.name()));
                }
            }
        }
        Err(DetectorError::NoBackendAvailable {
            choice: format!("{choice:?}"),
            detail: failures.join("; "),
        })
    }

    pub fn set_confidence_threshold(&mut self, threshold: f32) {
        self.config.confidence_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn set_nms_threshold(&mut self, threshold: f32) {
        self.config.nms_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn set_allowed_classes(&mut self, classes: Option<Vec<String>>) {
        self.config.allowed_classes = classes;
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    #[must_use]
    pub fn inference_errors(&self) -> u64 {
        self.inference_errors
    }

    /// Average inference time over the last ~100 samples, in milliseconds.
    #[must_use]
    pub fn average_inference_ms(&self) -> f32 {
        self.inference_ema_ms
    }

    /// Convert model-space candidates into final detections.
    fn finalize(
        &self,
        candidates: Vec<Candidate>,
        transform: &LetterboxTransform,
        frame: &Frame,
    ) -> Vec<Detection> {
        let kept = nms_per_class(candidates, self.config.nms_threshold);

        let mut detections = Vec::with_capacity(kept.len().min(self.config.max_detections));
        for candidate in kept {
            let bbox: BBox = transform
                .invert_bbox(&candidate.bbox)
                .clipped(frame.width(), frame.height());
            if bbox.area() <= 0.0 {
                continue;
            }
            let class_name = coco_class_name(candidate.class_id);
            if let Some(allowed) = &self.config.allowed_classes {
                if !allowed.iter().any(|name| name == class_name) {
                    continue;
                }
            }
            detections.push(Detection::new(
                candidate.class_id,
                class_name,
                candidate.confidence,
                bbox,
            ));
            if detections.len() >= self.config.max_detections {
                break;
            }
        }
        detections
    }

    fn tensor_data<'a>(&self, output: &'a ModelOutput) -> Result<TensorData<'a>, DetectorError> {
        match &output.data {
            OutputData::Float(data) => Ok(TensorData::Float(data)),
            OutputData::Int8(data) => {
                let params = self.config.quantization.ok_or_else(|| {
                    DetectorError::Inference(
                        "int8 output without quantization parameters".to_string(),
                    )
                })?;
                Ok(TensorData::Quantized {
                    data,
                    params: params.into(),
                })
            }
        }
    }

    fn decode_outputs(&self, outputs: &[ModelOutput]) -> Result<Vec<Candidate>, DetectorError> {
        match &self.config.layout {
            OutputLayout::Combined => {
                let output = outputs
                    .first()
                    .ok_or_else(|| DetectorError::Inference("no output tensor".to_string()))?;
                decode_combined(
                    &output.shape,
                    &self.tensor_data(output)?,
                    self.config.confidence_threshold,
                )
                .map_err(DetectorError::Inference)
            }
            OutputLayout::ThreeScale { strides, score_sum } => {
                if outputs.len() < strides.len() {
                    return Err(DetectorError::Inference(format!(
                        "expected {} output branches, got {}",
                        strides.len(),
                        outputs.len()
                    )));
                }
                let mut branches = Vec::with_capacity(strides.len());
                for (output, &stride) in outputs.iter().zip(strides.iter()) {
                    branches.push(ScaleBranch {
                        stride,
                        shape: &output.shape,
                        data: self.tensor_data(output)?,
                        has_score_sum: *score_sum,
                    });
                }
                decode_dfl_branches(&branches, self.config.confidence_threshold)
                    .map_err(DetectorError::Inference)
            }
        }
    }
}

impl ObjectDetector for Detector {
    fn detect_objects(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let (letterboxed, transform) = letterbox(&frame.pixels, self.config.input_size);

        let input = match self.config.input_tensor {
            InputTensorType::Float32 => ModelInput::Float(image_to_float_tensor(&letterboxed)),
            InputTensorType::Uint8 => ModelInput::Uint8(image_to_uint8_tensor(&letterboxed)),
        };

        let started = Instant::now();
        let result = match self.backend.infer(&input, self.config.layout.output_count()) {
            Ok(outputs) => self.decode_outputs(&outputs),
            Err(e) => Err(e),
        };

        match result {
            Ok(candidates) => {
                let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
                self.samples += 1;
                if self.samples == 1 {
                    self.inference_ema_ms = elapsed_ms;
                } else {
                    self.inference_ema_ms +=
                        (elapsed_ms - self.inference_ema_ms) / INFERENCE_EMA_WINDOW;
                }
                self.consecutive_failures = 0;

                let detections = self.finalize(candidates, &transform, frame);
                debug!(
                    "Frame {}: {} detections in {:.1}ms",
                    frame.sequence,
                    detections.len(),
                    elapsed_ms
                );
                Ok(detections)
            }
            Err(e) => {
                // Per-frame inference errors are non-fatal: empty result,
                // counter increment, failure streak for the pipeline's
                // re-init logic.
                self.inference_errors += 1;
                self.consecutive_failures += 1;
                warn!(
                    "Inference failed on frame {} ({} consecutive): {e}",
                    frame.sequence, self.consecutive_failures
                );
                Ok(Vec::new())
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} avg={:.1}ms errors={}",
            self.backend.describe(),
            self.inference_ema_ms,
            self.inference_errors
        )
    }

    fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn reinitialize(&mut self) -> Result<(), DetectorError> {
        info!("Reinitializing detector context for {}", self.model_path.display());
        self.backend.cleanup();
        self.backend.initialize(&self.model_path)?;
        self.consecutive_failures = 0;
        Ok(())
    }

    fn apply_confidence_threshold(&mut self, threshold: f32) {
        self.set_confidence_threshold(threshold);
    }

    fn apply_nms_threshold(&mut self, threshold: f32) {
        self.set_nms_threshold(threshold);
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.backend.cleanup();
    }
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

/// CHW float tensor normalized to `[0, 1]`.
#[must_use]
pub fn image_to_float_tensor(image: &image::RgbImage) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::zeros((1, 3, height, width));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        tensor[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        tensor[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }
    tensor
}

/// CHW UINT8 tensor with raw pixel values.
#[must_use]
pub fn image_to_uint8_tensor(image: &image::RgbImage) -> Array4<u8> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::zeros((1, 3, height, width));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0];
        tensor[[0, 1, y, x]] = pixel[1];
        tensor[[0, 2, y, x]] = pixel[2];
    }
    tensor
}
