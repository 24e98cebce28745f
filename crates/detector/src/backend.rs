//! Inference backend abstraction
//!
//! A backend owns one inference context (an ONNX Runtime session routed
//! through the execution providers of its hardware class). Contexts are
//! never shared across threads; a detector pool creates one backend per
//! worker from the same model file.
//!
//! Vendor container formats (`.rknn`, `.engine`, `.trt`) are recognized by
//! extension and reported unsupported by this runtime, which drives the
//! manager's backend-fallback path.

use crate::DetectorError;
use ndarray::Array4;
use ort::execution_providers::{CPU as CPUExecutionProvider, CUDA as CUDAExecutionProvider, CoreML as CoreMLExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use visionguard_common::DetectorBackendChoice;

/// Hardware class of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Neural engine via the CoreML execution provider (int8-friendly)
    Npu,
    /// CUDA / TensorRT execution providers (FP16 by default)
    Gpu,
    /// CPU reference path
    Cpu,
}

impl BackendKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Npu => "NPU",
            BackendKind::Gpu => "GPU",
            BackendKind::Cpu => "CPU",
        }
    }
}

/// Ordered candidate list for a configured backend choice.
///
/// `Auto` probes from the most specialized hardware down to the CPU
/// reference; an explicit choice yields exactly that backend. Availability
/// is established by attempting initialization: a candidate that fails to
/// initialize is skipped in favor of the next.
#[must_use]
pub fn backend_candidates(choice: DetectorBackendChoice) -> Vec<BackendKind> {
    match choice {
        DetectorBackendChoice::Npu => vec![BackendKind::Npu],
        DetectorBackendChoice::Gpu => vec![BackendKind::Gpu],
        DetectorBackendChoice::Cpu => vec![BackendKind::Cpu],
        DetectorBackendChoice::Auto => {
            let mut candidates = Vec::with_capacity(3);
            if cfg!(target_os = "macos") {
                candidates.push(BackendKind::Npu);
            }
            candidates.push(BackendKind::Gpu);
            candidates.push(BackendKind::Cpu);
            candidates
        }
    }
}

/// Preprocessed model input. Float tensors are normalized to `[0, 1]`;
/// UINT8 tensors carry raw pixel values (quantization embeds scale/zp).
#[derive(Debug)]
pub enum ModelInput {
    Float(Array4<f32>),
    Uint8(Array4<u8>),
}

/// Raw data of one output tensor.
#[derive(Debug)]
pub enum OutputData {
    Float(Vec<f32>),
    Int8(Vec<i8>),
}

/// One raw output tensor from the backend.
#[derive(Debug)]
pub struct ModelOutput {
    pub shape: Vec<usize>,
    pub data: OutputData,
}

/// One inference context. `initialize` is fatal on failure; per-frame
/// `infer` errors are non-fatal to the caller.
pub trait DetectorBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Load the model and build the context. Must be callable again after a
    /// failure: the context is reset on the next initialize.
    fn initialize(&mut self, model_path: &Path) -> Result<(), DetectorError>;

    /// Run one inference, returning the first `output_count` output tensors.
    fn infer(&mut self, input: &ModelInput, output_count: usize)
        -> Result<Vec<ModelOutput>, DetectorError>;

    /// Human-readable description of the context.
    fn describe(&self) -> String;

    /// Release the context. Idempotent.
    fn cleanup(&mut self);
}

/// Classify a model file by extension.
fn check_model_extension(model_path: &Path) -> Result<(), DetectorError> {
    let extension = model_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "onnx" => Ok(()),
        "rknn" | "engine" | "trt" => Err(DetectorError::UnsupportedModel(format!(
            "vendor container '{}' is not loadable by this runtime",
            model_path.display()
        ))),
        other => Err(DetectorError::UnsupportedModel(format!(
            "unknown model extension '{other}' for '{}'",
            model_path.display()
        ))),
    }
}

/// ONNX Runtime backend parameterized by hardware class.
pub struct OrtBackend {
    kind: BackendKind,
    intra_threads: usize,
    session: Option<Session>,
    model_path: Option<PathBuf>,
}

impl OrtBackend {
    #[must_use]
    pub fn new(kind: BackendKind, intra_threads: usize) -> Self {
        Self {
            kind,
            intra_threads: intra_threads.clamp(1, 8),
            session: None,
            model_path: None,
        }
    }

    fn build_session(&self, model_path: &Path) -> Result<Session, DetectorError> {
        let builder = Session::builder()
            .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?
            .with_memory_pattern(true)
            .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?;

        let mut builder = match self.kind {
            BackendKind::Npu => builder
                .with_execution_providers([
                    CoreMLExecutionProvider::default().with_subgraphs(true).build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?,
            BackendKind::Gpu => builder
                .with_execution_providers([
                    CUDAExecutionProvider::default().build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?,
            BackendKind::Cpu => builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(|e| DetectorError::SessionBuilder(e.to_string()))?,
        };

        builder
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::ModelLoad {
                path: model_path.display().to_string(),
                error: e.to_string(),
            })
    }

    fn extract_output(
        outputs: &ort::session::SessionOutputs,
        index: usize,
    ) -> Result<ModelOutput, DetectorError> {
        let output = &outputs[index];
        // Quantized models can surface int8 tensors; try float first since
        // most exported graphs dequantize at the output edge.
        if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
            return Ok(ModelOutput {
                shape: shape.as_ref().iter().map(|&d| d as usize).collect(),
                data: OutputData::Float(data.to_vec()),
            });
        }
        let (shape, data) = output
            .try_extract_tensor::<i8>()
            .map_err(|e| DetectorError::Inference(format!("failed to extract tensor: {e}")))?;
        Ok(ModelOutput {
            shape: shape.as_ref().iter().map(|&d| d as usize).collect(),
            data: OutputData::Int8(data.to_vec()),
        })
    }
}

impl DetectorBackend for OrtBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn initialize(&mut self, model_path: &Path) -> Result<(), DetectorError> {
        // Reset any previous context first so a failed init leaves a clean
        // slate for the next attempt.
        self.session = None;

        check_model_extension(model_path)?;
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        info!(
            "Loading detection model {} on {} backend",
            model_path.display(),
            self.kind.name()
        );
        let session = self.build_session(model_path)?;
        debug!("Model loaded on {} backend", self.kind.name());

        self.session = Some(session);
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    fn infer(
        &mut self,
        input: &ModelInput,
        output_count: usize,
    ) -> Result<Vec<ModelOutput>, DetectorError> {
        let session = self
            .session
            .as_mut()
            .ok_or(DetectorError::NotInitialized)?;

        let mut extracted = Vec::with_capacity(output_count);
        match input {
            ModelInput::Float(array) => {
                let tensor = TensorRef::from_array_view(array.view())
                    .map_err(|e| DetectorError::Inference(e.to_string()))?;
                let outputs = session
                    .run(ort::inputs![tensor])
                    .map_err(|e| DetectorError::Inference(e.to_string()))?;
                for index in 0..output_count {
                    extracted.push(Self::extract_output(&outputs, index)?);
                }
            }
            ModelInput::Uint8(array) => {
                let tensor = TensorRef::from_array_view(array.view())
                    .map_err(|e| DetectorError::Inference(e.to_string()))?;
                let outputs = session
                    .run(ort::inputs![tensor])
                    .map_err(|e| DetectorError::Inference(e.to_string()))?;
                for index in 0..output_count {
                    extracted.push(Self::extract_output(&outputs, index)?);
                }
            }
        }
        Ok(extracted)
    }

    fn describe(&self) -> String {
        match &self.model_path {
            Some(path) => format!("{} backend ({})", self.kind.name(), path.display()),
            None => format!("{} backend (uninitialized)", self.kind.name()),
        }
    }

    fn cleanup(&mut self) {
        self.session = None;
    }
}
