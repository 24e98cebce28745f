//! Multi-pipeline manager
//!
//! Process-wide coordinator: owns the `camera_id → Pipeline` map, the global
//! identity registry, system-level configuration, and the reconcile loop
//! that drives running pipelines toward the configuration store's desired
//! state. Per-camera configuration errors are isolated; other cameras keep
//! running.
//!
//! # Example
//! ```no_run
//! use visionguard_manager::{ManagerConfig, PipelineManager};
//! use visionguard_common::VideoSourceConfig;
//!
//! let mut manager = PipelineManager::new(ManagerConfig::default());
//! let desired = vec![VideoSourceConfig::test_source("cam1", "rtsp://10.0.0.5/stream1")];
//! let report = manager.reconcile(&desired);
//! println!("started {} pipelines", report.added.len());
//! manager.stop_all();
//! ```

pub mod registry;
pub mod store;

pub use registry::{GlobalIdentityRegistry, ReidConfig};
pub use store::{ConfigStore, JsonConfigStore, SystemConfig};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use visionguard_analyzer::{AnalyzerConfig, BehaviorAnalyzer, IdentityResolver, IntrusionRule, Roi};
use visionguard_attributes::{
    spawn_attribute_worker, AttributeProvider, PersonAttributes,
};
use visionguard_common::{
    AnalyticsError, Clock, EventSink, Result, SystemClock, VideoSourceConfig,
};
use visionguard_detector::{Detector, DetectorConfig, DetectorFactory, ObjectDetector};
use visionguard_frame_source::{FrameProducer, FrameSourceConfig, ReconnectingSource};
use visionguard_pipeline::{AttributeHook, Pipeline, PipelineConfig};

/// Produces a frame source for a camera record.
pub type ProducerFactory =
    Arc<dyn Fn(&VideoSourceConfig) -> Result<Box<dyn FrameProducer>> + Send + Sync>;

/// Produces a per-camera detector factory (one detector per pool worker).
pub type DetectorProvider = Arc<dyn Fn(&VideoSourceConfig) -> Result<DetectorFactory> + Send + Sync>;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-pipeline join deadline on shutdown
    pub stop_deadline: Duration,
    pub reid: ReidConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stop_deadline: Duration::from_secs(5),
            reid: ReidConfig::default(),
        }
    }
}

/// Result of one reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// `(camera_id, error)` for records rejected this pass
    pub rejected: Vec<(String, String)>,
}

impl ReconcileReport {
    /// True when the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.rejected.is_empty()
    }
}

/// Status-query view of one camera.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    pub fps: f64,
    pub processed: u64,
    pub dropped: u64,
    pub events_published: u64,
    /// `(code, message)` of the most recent pipeline fault
    pub last_error: Option<(String, String)>,
    /// Reconcile-time configuration error, if the camera is not running
    pub config_error: Option<String>,
}

/// Status-query view of the whole engine.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub cameras: BTreeMap<String, CameraStatus>,
    pub global_identities: usize,
}

enum UpdateAction {
    ThresholdsOnly,
    SourceSwap,
    Restart,
}

struct ManagedPipeline {
    config: VideoSourceConfig,
    pipeline: Pipeline,
}

/// Per-camera attribute results collected from the workers.
type AttributeLog = Arc<Mutex<HashMap<String, HashMap<u64, PersonAttributes>>>>;

/// The process-wide pipeline manager.
pub struct PipelineManager {
    config: ManagerConfig,
    system: SystemConfig,
    registry: Arc<GlobalIdentityRegistry>,
    pipelines: HashMap<String, ManagedPipeline>,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    camera_errors: HashMap<String, String>,
    producer_factory: ProducerFactory,
    detector_provider: DetectorProvider,
    attribute_provider: Option<Arc<dyn AttributeProvider>>,
    attribute_log: AttributeLog,
}

impl PipelineManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        let registry = Arc::new(GlobalIdentityRegistry::new(config.reid.clone()));
        Self {
            config,
            system: SystemConfig::default(),
            registry,
            pipelines: HashMap::new(),
            sinks: Vec::new(),
            clock: Arc::new(SystemClock),
            camera_errors: HashMap::new(),
            producer_factory: default_producer_factory(),
            detector_provider: default_detector_provider(),
            attribute_provider: None,
            attribute_log: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_system_config(&mut self, system: SystemConfig) {
        self.system = system.clamped();
    }

    pub fn set_producer_factory(&mut self, factory: ProducerFactory) {
        self.producer_factory = factory;
    }

    pub fn set_detector_provider(&mut self, provider: DetectorProvider) {
        self.detector_provider = provider;
    }

    pub fn set_attribute_provider(&mut self, provider: Arc<dyn AttributeProvider>) {
        self.attribute_provider = Some(provider);
    }

    #[must_use]
    pub fn registry(&self) -> Arc<GlobalIdentityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stable global id for a camera-local track.
    #[must_use]
    pub fn get_global_track_id(&self, camera_id: &str, local_track_id: u64) -> u64 {
        self.registry.global_track_id(camera_id, local_track_id)
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Attribute results gathered for a camera so far.
    #[must_use]
    pub fn person_attributes(&self, camera_id: &str) -> HashMap<u64, PersonAttributes> {
        self.attribute_log
            .lock()
            .ok()
            .and_then(|log| log.get(camera_id).cloned())
            .unwrap_or_default()
    }

    /// Reconcile against the configuration store's current content.
    pub fn reconcile_from_store(&mut self, store: &dyn ConfigStore) -> Result<ReconcileReport> {
        self.system = store.load_system()?;
        let cameras = store.load_cameras()?;
        Ok(self.reconcile(&cameras))
    }

    /// Drive running pipelines toward the desired list: start additions,
    /// stop removals, apply updates in place where possible. Reconciling
    /// the same desired state twice is a no-op.
    pub fn reconcile(&mut self, desired: &[VideoSourceConfig]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Validate and de-duplicate the desired records first
        let mut desired_ids = HashSet::with_capacity(desired.len());
        let mut valid = Vec::with_capacity(desired.len());
        for camera in desired {
            if let Err(e) = camera.validate() {
                self.camera_errors
                    .insert(camera.id.clone(), e.to_string());
                report.rejected.push((camera.id.clone(), e.to_string()));
                continue;
            }
            if !desired_ids.insert(camera.id.clone()) {
                let message = format!("duplicate camera id '{}'", camera.id);
                self.camera_errors.insert(camera.id.clone(), message.clone());
                report.rejected.push((camera.id.clone(), message));
                continue;
            }
            valid.push(camera.clone());
        }

        // Remove pipelines whose camera left the desired set
        let gone: Vec<String> = self
            .pipelines
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for camera_id in gone {
            self.stop_pipeline(&camera_id);
            self.registry.remove_camera(&camera_id);
            report.removed.push(camera_id);
        }

        for camera in valid {
            let camera_id = camera.id.clone();
            match self.pipelines.get(&camera_id) {
                None => {
                    if !camera.enabled {
                        report.unchanged.push(camera_id);
                        continue;
                    }
                    match self.start_pipeline(camera) {
                        Ok(()) => report.added.push(camera_id),
                        Err(e) => {
                            warn!("Camera {camera_id} failed to start: {e}");
                            self.camera_errors.insert(camera_id.clone(), e.to_string());
                            report.rejected.push((camera_id, e.to_string()));
                        }
                    }
                }
                Some(existing) => {
                    if !camera.enabled {
                        self.stop_pipeline(&camera_id);
                        report.removed.push(camera_id);
                        continue;
                    }
                    if existing.config == camera {
                        report.unchanged.push(camera_id);
                        continue;
                    }
                    match self.apply_update(&camera_id, camera) {
                        Ok(()) => report.updated.push(camera_id),
                        Err(e) => {
                            warn!("Camera {camera_id} update failed: {e}");
                            self.camera_errors.insert(camera_id.clone(), e.to_string());
                            report.rejected.push((camera_id, e.to_string()));
                        }
                    }
                }
            }
        }

        info!(
            "Reconcile: +{} -{} ~{} ={} !{}",
            report.added.len(),
            report.removed.len(),
            report.updated.len(),
            report.unchanged.len(),
            report.rejected.len()
        );
        report
    }

    /// ROI CRUD against a running camera, serialized with frame processing.
    pub fn add_roi(&self, camera_id: &str, roi: Roi) -> Result<()> {
        let managed = self
            .pipelines
            .get(camera_id)
            .ok_or_else(|| AnalyticsError::PipelineNotFound(camera_id.to_string()))?;
        managed
            .pipeline
            .analyzer()
            .lock()
            .map_err(|_| AnalyticsError::Other("analyzer lock poisoned".to_string()))?
            .add_roi(roi)
    }

    pub fn add_rule(&self, camera_id: &str, rule: IntrusionRule) -> Result<()> {
        let managed = self
            .pipelines
            .get(camera_id)
            .ok_or_else(|| AnalyticsError::PipelineNotFound(camera_id.to_string()))?;
        managed
            .pipeline
            .analyzer()
            .lock()
            .map_err(|_| AnalyticsError::Other("analyzer lock poisoned".to_string()))?
            .add_rule(rule)
    }

    pub fn remove_roi(&self, camera_id: &str, roi_id: &str) -> Result<bool> {
        let managed = self
            .pipelines
            .get(camera_id)
            .ok_or_else(|| AnalyticsError::PipelineNotFound(camera_id.to_string()))?;
        Ok(managed
            .pipeline
            .analyzer()
            .lock()
            .map_err(|_| AnalyticsError::Other("analyzer lock poisoned".to_string()))?
            .remove_roi(roi_id))
    }

    /// Point-in-time status of every known camera.
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let mut cameras = BTreeMap::new();
        for (camera_id, managed) in &self.pipelines {
            let snapshot = managed.pipeline.health().snapshot();
            cameras.insert(
                camera_id.clone(),
                CameraStatus {
                    name: managed.config.name.clone(),
                    enabled: managed.config.enabled,
                    healthy: snapshot.healthy,
                    fps: snapshot.fps,
                    processed: snapshot.processed,
                    dropped: snapshot.dropped,
                    events_published: snapshot.events_published,
                    last_error: snapshot.last_error,
                    config_error: self.camera_errors.get(camera_id).cloned(),
                },
            );
        }
        // Cameras that never started still appear, carrying their error
        for (camera_id, error) in &self.camera_errors {
            cameras.entry(camera_id.clone()).or_insert(CameraStatus {
                name: camera_id.clone(),
                enabled: false,
                healthy: false,
                fps: 0.0,
                processed: 0,
                dropped: 0,
                events_published: 0,
                last_error: None,
                config_error: Some(error.clone()),
            });
        }
        ManagerStatus {
            cameras,
            global_identities: self.registry.binding_count(),
        }
    }

    /// Restart pipelines that died with a retriable fault, when detection is
    /// enabled for the camera. Returns the restarted camera ids.
    pub fn auto_restart_unhealthy(&mut self) -> Vec<String> {
        let candidates: Vec<(String, VideoSourceConfig)> = self
            .pipelines
            .iter()
            .filter(|(_, managed)| {
                if !managed.config.options.detection_enabled {
                    return false;
                }
                let snapshot = managed.pipeline.health().snapshot();
                if snapshot.healthy {
                    return false;
                }
                snapshot
                    .last_error
                    .as_ref()
                    .map(|(code, _)| is_retriable_code(code))
                    .unwrap_or(false)
            })
            .map(|(id, managed)| (id.clone(), managed.config.clone()))
            .collect();

        let mut restarted = Vec::with_capacity(candidates.len());
        for (camera_id, config) in candidates {
            info!("Auto-restarting unhealthy pipeline {camera_id}");
            self.stop_pipeline(&camera_id);
            match self.start_pipeline(config) {
                Ok(()) => restarted.push(camera_id),
                Err(e) => {
                    warn!("Auto-restart of {camera_id} failed: {e}");
                    self.camera_errors.insert(camera_id, e.to_string());
                }
            }
        }
        restarted
    }

    /// Stop every pipeline, joining each up to the configured deadline, and
    /// release detector contexts.
    pub fn stop_all(&mut self) {
        let camera_ids: Vec<String> = self.pipelines.keys().cloned().collect();
        for camera_id in camera_ids {
            self.stop_pipeline(&camera_id);
        }
    }

    fn stop_pipeline(&mut self, camera_id: &str) {
        if let Some(mut managed) = self.pipelines.remove(camera_id) {
            let clean = managed.pipeline.stop(self.config.stop_deadline);
            if !clean {
                warn!("Pipeline {camera_id} was force-dropped past the stop deadline");
            }
            info!("Pipeline {camera_id} stopped");
        }
    }

    fn start_pipeline(&mut self, config: VideoSourceConfig) -> Result<()> {
        let producer = (self.producer_factory)(&config)?;
        let detector_factory = (self.detector_provider)(&config)?;

        let mut analyzer =
            BehaviorAnalyzer::new(&config.id, AnalyzerConfig::default(), Arc::clone(&self.clock));
        analyzer.set_resolver(Arc::clone(&self.registry) as Arc<dyn IdentityResolver>);

        let mut pipeline_config = PipelineConfig::new(&config.id, config.fps);
        pipeline_config.detector_workers = if self.system.optimized_detection {
            self.system.detection_threads.min(3) as usize
        } else {
            0
        };
        pipeline_config.attributes = self.attribute_hook(&config);

        let pipeline = Pipeline::spawn(
            pipeline_config,
            producer,
            detector_factory,
            analyzer,
            self.sinks.clone(),
        )?;

        self.camera_errors.remove(&config.id);
        self.pipelines
            .insert(config.id.clone(), ManagedPipeline { config, pipeline });
        Ok(())
    }

    /// Apply a config delta to a running pipeline, restarting only the
    /// stages whose inputs changed.
    fn apply_update(&mut self, camera_id: &str, new_config: VideoSourceConfig) -> Result<()> {
        let old_config = self
            .pipelines
            .get(camera_id)
            .map(|managed| managed.config.clone())
            .ok_or_else(|| AnalyticsError::PipelineNotFound(camera_id.to_string()))?;

        match update_action(&old_config, &new_config) {
            UpdateAction::ThresholdsOnly => {
                info!("Camera {camera_id}: applying detection thresholds in place");
                if let Some(managed) = self.pipelines.get_mut(camera_id) {
                    managed.pipeline.set_detection_thresholds(
                        Some(new_config.options.detection.confidence_threshold),
                        Some(new_config.options.detection.nms_threshold),
                    );
                    managed.config = new_config;
                }
                Ok(())
            }
            UpdateAction::SourceSwap => {
                info!("Camera {camera_id}: URL change, restarting the frame source only");
                let producer = (self.producer_factory)(&new_config)?;
                if let Some(managed) = self.pipelines.get_mut(camera_id) {
                    managed.pipeline.replace_source(producer);
                    managed.config = new_config;
                }
                Ok(())
            }
            UpdateAction::Restart => {
                info!("Camera {camera_id}: config delta requires a pipeline restart");
                self.stop_pipeline(camera_id);
                self.start_pipeline(new_config)
            }
        }
    }

    fn attribute_hook(&self, config: &VideoSourceConfig) -> Option<AttributeHook> {
        let statistics = &config.options.person_statistics;
        if !statistics.enabled {
            return None;
        }
        let provider = self.attribute_provider.as_ref()?;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Person statistics enabled for {} but no async runtime is available",
                config.id
            );
            return None;
        };

        let (request_tx, request_rx) = tokio::sync::mpsc::channel(32);
        let (result_tx, mut result_rx) = tokio::sync::mpsc::channel(32);
        let _guard = handle.enter();
        spawn_attribute_worker(
            Arc::clone(provider),
            statistics.clone(),
            request_rx,
            result_tx,
        );

        let camera_id = config.id.clone();
        let log = Arc::clone(&self.attribute_log);
        handle.spawn(async move {
            while let Some((track_id, attributes)) = result_rx.recv().await {
                if let Ok(mut log) = log.lock() {
                    log.entry(camera_id.clone())
                        .or_default()
                        .insert(track_id, attributes);
                }
            }
        });

        Some(AttributeHook {
            sender: request_tx,
            config: statistics.clone(),
            sample_interval_frames: 30,
            min_crop_size: 64,
        })
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Background monitor: periodic status logging plus auto-restart of
/// retriably-failed pipelines. Runs until `stop` is set.
pub async fn run_monitor(manager: Arc<tokio::sync::Mutex<PipelineManager>>, stop: Arc<AtomicBool>) {
    loop {
        let interval = {
            let manager = manager.lock().await;
            Duration::from_secs(manager.system.status_interval)
        };
        tokio::time::sleep(interval).await;
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let mut manager = manager.lock().await;
        let restarted = manager.auto_restart_unhealthy();
        if !restarted.is_empty() {
            info!("Monitor restarted pipelines: {:?}", restarted);
        }
        let status = manager.status();
        let healthy = status.cameras.values().filter(|c| c.healthy).count();
        info!(
            "Status: {}/{} pipelines healthy, {} global identities",
            healthy,
            status.cameras.len(),
            status.global_identities
        );
    }
}

fn is_retriable_code(code: &str) -> bool {
    matches!(
        code,
        "E_SRC_TRANSIENT" | "E_SRC_UNREACHABLE" | "E_SRC_DEADLINE" | "E_SRC_EOS" | "E_SRC_DECODE"
            | "E_DET_INFERENCE"
    )
}

fn update_action(old: &VideoSourceConfig, new: &VideoSourceConfig) -> UpdateAction {
    // Thresholds-only delta: everything else identical
    let mut probe = old.clone();
    probe.options.detection.confidence_threshold = new.options.detection.confidence_threshold;
    probe.options.detection.nms_threshold = new.options.detection.nms_threshold;
    if probe == *new {
        return UpdateAction::ThresholdsOnly;
    }

    // Source-only delta: URL or credentials changed, the rest identical
    let mut probe = old.clone();
    probe.url = new.url.clone();
    probe.credentials = new.credentials.clone();
    if probe == *new {
        return UpdateAction::SourceSwap;
    }

    UpdateAction::Restart
}

/// Default production factories: FFmpeg sources and ONNX detectors with
/// backend fallback per the camera's configured choice.
fn default_producer_factory() -> ProducerFactory {
    Arc::new(|config: &VideoSourceConfig| {
        let source_config = FrameSourceConfig::from_video_source(config);
        Ok(Box::new(ReconnectingSource::new(source_config)) as Box<dyn FrameProducer>)
    })
}

fn default_detector_provider() -> DetectorProvider {
    Arc::new(|config: &VideoSourceConfig| {
        let detection = config.options.detection.clone();
        let mut detector_config = DetectorConfig::default();
        detector_config.confidence_threshold = detection.confidence_threshold;
        detector_config.nms_threshold = detection.nms_threshold;

        let factory: DetectorFactory = Arc::new(move || {
            Detector::with_fallback(
                detection.backend,
                &detection.model_path,
                detector_config.clone(),
            )
            .map(|detector| Box::new(detector) as Box<dyn ObjectDetector>)
        });
        Ok(factory)
    })
}
