//! Per-camera processing pipeline
//!
//! One pipeline owns a frame source, a detection stage (inline or worker
//! pool), a tracker, a behavior analyzer and the event fan-out for a single
//! camera. The source thread decodes and paces frames into a bounded queue;
//! the frame thread runs the cooperative loop: pull one frame, detect,
//! track, analyze, publish, repeat. A full queue drops the newest frame and
//! counts it; events never block the loop.
//!
//! Stopping sets a flag observed at stage boundaries and injects a sentinel
//! into the inter-stage queue; in-flight detection results are awaited up to
//! a bounded timeout, then abandoned.

pub mod health;
pub mod pool;

pub use health::{HealthSnapshot, PipelineHealth};
pub use pool::DetectedFrame;

use pool::DetectorStage;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::imageops;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use visionguard_analyzer::BehaviorAnalyzer;
use visionguard_attributes::{AttributeSampler, PersonDetection};
use visionguard_common::{
    AnalyticsError, EventSink, Frame, PersonStatisticsConfig, Result,
};
use visionguard_detector::DetectorFactory;
use visionguard_frame_source::FrameProducer;
use visionguard_tracker::{Tracker, TrackerConfig, TrackState};

/// Poll interval for observing the stop flag at queue boundaries
const STOP_POLL: Duration = Duration::from_millis(100);

/// Pipeline configuration
#[derive(Clone)]
pub struct PipelineConfig {
    pub camera_id: String,
    /// Nominal source FPS, drives the health deadline
    pub nominal_fps: u32,
    /// Bounded frame queue between source and frame thread
    pub frame_queue_capacity: usize,
    /// 0 = detect inline on the frame thread; 1-3 = detector worker pool
    pub detector_workers: usize,
    /// Cancellation-safe timeout awaiting a pooled detection result
    pub detect_timeout: Duration,
    pub tracker: TrackerConfig,
    /// Consecutive inference failures before re-init / fatal marking
    pub max_inference_failures: u32,
    /// Optional attribute-extraction side channel
    pub attributes: Option<AttributeHook>,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(camera_id: &str, nominal_fps: u32) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            nominal_fps,
            frame_queue_capacity: 8,
            detector_workers: 0,
            detect_timeout: Duration::from_secs(1),
            tracker: TrackerConfig::default(),
            max_inference_failures: 3,
            attributes: None,
        }
    }
}

/// Side channel from the tracker to the attribute worker.
#[derive(Clone)]
pub struct AttributeHook {
    pub sender: tokio::sync::mpsc::Sender<PersonDetection>,
    pub config: PersonStatisticsConfig,
    /// Sample a track at most once per this many frames
    pub sample_interval_frames: u64,
    /// Minimum crop edge in pixels
    pub min_crop_size: u32,
}

/// Messages on the source → frame-thread queue.
enum SourceMessage {
    Frame(Frame),
    /// Fatal source fault: `(code, message)`
    Fault(String, String),
    Ended,
}

/// In-place configuration deltas applied by the frame thread.
enum ControlMessage {
    SetThresholds {
        confidence: Option<f32>,
        nms: Option<f32>,
    },
}

/// Control messages for the source thread.
enum SourceControl {
    /// Swap the transport (URL change) without touching tracker state
    Replace(Box<dyn FrameProducer>),
}

/// Handle to a running pipeline.
pub struct Pipeline {
    camera_id: String,
    stop: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    analyzer: Arc<Mutex<BehaviorAnalyzer>>,
    control_tx: Sender<ControlMessage>,
    source_control_tx: Sender<SourceControl>,
    done_rx: Receiver<()>,
    ended: bool,
    source_thread: Option<JoinHandle<()>>,
    frame_thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build the detection stage and start the source and frame threads.
    /// Detector construction failures surface here, before any thread runs.
    pub fn spawn(
        config: PipelineConfig,
        source: Box<dyn FrameProducer>,
        detector_factory: DetectorFactory,
        analyzer: BehaviorAnalyzer,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        let stage = DetectorStage::new(
            &detector_factory,
            config.detector_workers,
            config.detect_timeout,
        )
        .map_err(AnalyticsError::from)?;
        info!(
            "Pipeline {} starting with {}",
            config.camera_id,
            stage.describe()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let health = Arc::new(PipelineHealth::new(config.nominal_fps));
        let analyzer = Arc::new(Mutex::new(analyzer));
        let (frame_tx, frame_rx) = bounded::<SourceMessage>(config.frame_queue_capacity.max(1));
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlMessage>();
        let (source_control_tx, source_control_rx) = crossbeam_channel::unbounded::<SourceControl>();
        let (done_tx, done_rx) = bounded::<()>(1);

        let source_thread = {
            let stop = Arc::clone(&stop);
            let health = Arc::clone(&health);
            let camera_id = config.camera_id.clone();
            std::thread::Builder::new()
                .name(format!("source-{camera_id}"))
                .spawn(move || {
                    source_loop(source, frame_tx, source_control_rx, stop, health, camera_id)
                })
                .map_err(|e| AnalyticsError::Other(format!("spawn source thread: {e}")))?
        };

        let frame_thread = {
            let stop = Arc::clone(&stop);
            let health = Arc::clone(&health);
            let analyzer = Arc::clone(&analyzer);
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("frames-{}", config.camera_id))
                .spawn(move || {
                    frame_loop(
                        config, stage, frame_rx, control_rx, stop, health, analyzer, sinks,
                    );
                    let _ = done_tx.send(());
                })
                .map_err(|e| AnalyticsError::Other(format!("spawn frame thread: {e}")))?
        };

        Ok(Self {
            camera_id: config.camera_id,
            stop,
            health,
            analyzer,
            control_tx,
            source_control_tx,
            done_rx,
            ended: false,
            source_thread: Some(source_thread),
            frame_thread: Some(frame_thread),
        })
    }

    /// Swap the frame source in place (URL change). The tracker and analyzer
    /// keep their state; sequence numbers restart with the new transport.
    pub fn replace_source(&self, source: Box<dyn FrameProducer>) {
        let _ = self.source_control_tx.send(SourceControl::Replace(source));
    }

    #[must_use]
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    #[must_use]
    pub fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }

    /// Shared analyzer for ROI/rule CRUD and the visualization path. CRUD
    /// through this lock is serialized against frame processing.
    #[must_use]
    pub fn analyzer(&self) -> Arc<Mutex<BehaviorAnalyzer>> {
        Arc::clone(&self.analyzer)
    }

    /// Apply detection threshold deltas without a restart.
    pub fn set_detection_thresholds(&self, confidence: Option<f32>, nms: Option<f32>) {
        let _ = self
            .control_tx
            .send(ControlMessage::SetThresholds { confidence, nms });
    }

    /// Wait for the pipeline to finish on its own (finite sources).
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if self.ended {
            return true;
        }
        if self.done_rx.recv_timeout(timeout).is_ok() {
            self.ended = true;
        }
        self.ended
    }

    /// Signal stop and join up to the deadline. Returns false when a stage
    /// had to be abandoned (threads are detached in that case).
    pub fn stop(&mut self, deadline: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        self.health.mark_stopped();

        let clean = self.ended || self.done_rx.recv_timeout(deadline).is_ok();
        self.ended = self.ended || clean;
        if clean {
            if let Some(handle) = self.frame_thread.take() {
                let _ = handle.join();
            }
            if let Some(handle) = self.source_thread.take() {
                let _ = handle.join();
            }
            debug!("Pipeline {} stopped cleanly", self.camera_id);
        } else {
            // Force-drop: detach the stage threads past the deadline
            warn!(
                "Pipeline {} exceeded the stop deadline; abandoning stage threads",
                self.camera_id
            );
            self.frame_thread.take();
            self.source_thread.take();
        }
        clean
    }
}

/// Source thread: pull frames from the producer and push them into the
/// bounded queue with drop-newest backpressure.
fn source_loop(
    mut source: Box<dyn FrameProducer>,
    frame_tx: Sender<SourceMessage>,
    control_rx: Receiver<SourceControl>,
    stop: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    camera_id: String,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        while let Ok(SourceControl::Replace(replacement)) = control_rx.try_recv() {
            info!("Replacing frame source for {}", camera_id);
            source.close();
            source = replacement;
        }
        match source.next_frame() {
            Ok(frame) => match frame_tx.try_send(SourceMessage::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Downstream is saturated: drop the newest frame
                    health.record_dropped_frame();
                }
                Err(TrySendError::Disconnected(_)) => break,
            },
            Err(AnalyticsError::EndOfStream) => {
                info!("Source for {} reached end of stream", camera_id);
                let _ = frame_tx.send(SourceMessage::Ended);
                break;
            }
            Err(e) => {
                warn!("Source for {} failed: {e}", camera_id);
                let _ = frame_tx.send(SourceMessage::Fault(
                    e.code().to_string(),
                    e.to_string(),
                ));
                break;
            }
        }
    }
    source.close();
    debug!("Source thread for {} stopped", camera_id);
}

/// Frame thread: the cooperative per-frame loop.
#[allow(clippy::too_many_arguments)]
fn frame_loop(
    config: PipelineConfig,
    mut stage: DetectorStage,
    frame_rx: Receiver<SourceMessage>,
    control_rx: Receiver<ControlMessage>,
    stop: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    analyzer: Arc<Mutex<BehaviorAnalyzer>>,
    sinks: Vec<Arc<dyn EventSink>>,
) {
    let mut tracker = Tracker::new(config.tracker.clone());
    let mut sampler = config
        .attributes
        .as_ref()
        .map(|hook| AttributeSampler::new(hook.sample_interval_frames, hook.min_crop_size));
    let mut reinit_attempted = false;
    let mut previous_streak = 0u32;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        // Apply any pending config deltas before the next frame
        while let Ok(message) = control_rx.try_recv() {
            match message {
                ControlMessage::SetThresholds { confidence, nms } => {
                    stage.apply_thresholds(confidence, nms);
                }
            }
        }

        match frame_rx.recv_timeout(STOP_POLL) {
            Ok(SourceMessage::Frame(frame)) => {
                for detected in stage.submit(frame) {
                    process_detected_frame(
                        &config,
                        detected,
                        &mut tracker,
                        &analyzer,
                        &sinks,
                        &health,
                        &mut sampler,
                    );
                }
                observe_detector_faults(
                    &config,
                    &mut stage,
                    &health,
                    &mut reinit_attempted,
                    &mut previous_streak,
                );
            }
            Ok(SourceMessage::Ended) => {
                for detected in stage.drain() {
                    process_detected_frame(
                        &config,
                        detected,
                        &mut tracker,
                        &analyzer,
                        &sinks,
                        &health,
                        &mut sampler,
                    );
                }
                health.mark_stopped();
                break;
            }
            Ok(SourceMessage::Fault(code, message)) => {
                health.set_last_error(&code, &message);
                health.mark_stopped();
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stage.shutdown();
    debug!("Frame thread for {} stopped", config.camera_id);
}

/// Synchronous stages for one frame: track, analyze, publish, sample.
fn process_detected_frame(
    config: &PipelineConfig,
    detected: DetectedFrame,
    tracker: &mut Tracker,
    analyzer: &Arc<Mutex<BehaviorAnalyzer>>,
    sinks: &[Arc<dyn EventSink>],
    health: &Arc<PipelineHealth>,
    sampler: &mut Option<AttributeSampler>,
) {
    let DetectedFrame { frame, detections } = detected;
    let tracks = tracker.update(&detections);

    let events = {
        let mut analyzer = analyzer.lock().expect("analyzer lock poisoned");
        for removed in tracker.take_removed() {
            analyzer.remove_object(removed.id);
            if let Some(sampler) = sampler.as_mut() {
                sampler.forget(removed.id);
            }
        }
        analyzer.process_tracks(&tracks, frame.timestamp_ms())
    };

    // Non-blocking fan-out; a full sink drops oldest and is counted
    for event in &events {
        health.record_event();
        for sink in sinks {
            if !sink.try_publish(event) {
                health.record_sink_drop();
            }
        }
    }

    // Attribute side channel: person tracks, throttled per track
    if let (Some(hook), Some(sampler)) = (config.attributes.as_ref(), sampler.as_mut()) {
        if hook.config.enabled {
            for track in tracks
                .iter()
                .filter(|t| t.state == TrackState::Tracked && t.class_name == "person")
            {
                if !sampler.should_sample(track.id, frame.sequence, &track.bbox) {
                    continue;
                }
                let crop = crop_track(&frame, track.bbox.x, track.bbox.y, track.bbox.width, track.bbox.height);
                let request = PersonDetection {
                    bbox: track.bbox,
                    crop: Arc::new(crop),
                    track_id: track.id,
                    timestamp_ms: frame.timestamp_ms(),
                };
                // try_send: the side channel never blocks the frame loop
                let _ = hook.sender.try_send(request);
            }
        }
    }

    health.record_frame();
}

/// Three consecutive inference failures mark the pipeline unhealthy and
/// trigger one automatic re-init; further failures are fatal.
fn observe_detector_faults(
    config: &PipelineConfig,
    stage: &mut DetectorStage,
    health: &Arc<PipelineHealth>,
    reinit_attempted: &mut bool,
    previous_streak: &mut u32,
) {
    let streak = stage.failure_streak();
    if streak > *previous_streak {
        health.record_inference_error();
    }
    *previous_streak = streak;

    if streak == 0 {
        *reinit_attempted = false;
        return;
    }
    if streak < config.max_inference_failures {
        return;
    }

    if !*reinit_attempted {
        warn!(
            "Pipeline {}: {streak} consecutive inference failures; re-initializing detector",
            config.camera_id
        );
        health.set_last_error("E_DET_INFERENCE", "consecutive inference failures");
        if let Err(e) = stage.reinitialize() {
            warn!("Detector re-init for {} failed: {e}", config.camera_id);
            health.record_fatal_detector_error();
        }
        *reinit_attempted = true;
    } else {
        health.set_last_error("E_DET_INFERENCE", "inference failing after re-init");
        health.record_fatal_detector_error();
    }
}

/// Crop a track's box out of the shared frame, clamped to bounds.
fn crop_track(frame: &Frame, x: f32, y: f32, width: f32, height: f32) -> image::RgbImage {
    let x = x.max(0.0) as u32;
    let y = y.max(0.0) as u32;
    let width = (width.max(1.0) as u32).min(frame.width().saturating_sub(x).max(1));
    let height = (height.max(1.0) as u32).min(frame.height().saturating_sub(y).max(1));
    imageops::crop_imm(frame.pixels.as_ref(), x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use visionguard_analyzer::{AnalyzerConfig, IntrusionRule, Roi};
    use visionguard_common::{BBox, Detection, ManualClock, MemorySink};
    use visionguard_detector::{DetectorError, ObjectDetector};
    use visionguard_frame_source::TestPatternSource;

    /// Detector reporting one person at a fixed spot every frame.
    struct FixedDetector {
        bbox: BBox,
        fail_first: u32,
        streak: u32,
        reinits: Arc<AtomicBool>,
    }

    impl ObjectDetector for FixedDetector {
        fn detect_objects(&mut self, _frame: &Frame) -> std::result::Result<Vec<Detection>, DetectorError> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                self.streak += 1;
                return Ok(Vec::new());
            }
            self.streak = 0;
            Ok(vec![Detection::new(0, "person", 0.9, self.bbox)])
        }

        fn describe(&self) -> String {
            "fixed".to_string()
        }

        fn consecutive_failures(&self) -> u32 {
            self.streak
        }

        fn reinitialize(&mut self) -> std::result::Result<(), DetectorError> {
            self.reinits.store(true, Ordering::SeqCst);
            self.streak = 0;
            Ok(())
        }
    }

    fn fixed_factory(bbox: BBox, fail_first: u32, reinits: Arc<AtomicBool>) -> DetectorFactory {
        Arc::new(move || {
            Ok(Box::new(FixedDetector {
                bbox,
                fail_first,
                streak: 0,
                reinits: Arc::clone(&reinits),
            }) as Box<dyn ObjectDetector>)
        })
    }

    fn zone_analyzer(camera_id: &str, min_duration_secs: f32) -> BehaviorAnalyzer {
        let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
        let mut analyzer = BehaviorAnalyzer::new(camera_id, AnalyzerConfig::default(), clock);
        analyzer
            .add_roi(Roi::rectangle("zone", 0.0, 0.0, 640.0, 480.0, 3))
            .unwrap();
        analyzer
            .add_rule(IntrusionRule::new("zone_rule", "zone", min_duration_secs))
            .unwrap();
        analyzer
    }

    /// Person bbox whose bottom-center lands inside the 640x480 zone.
    fn person_bbox() -> BBox {
        BBox::new(275.0, 150.0, 50.0, 100.0)
    }

    #[test]
    fn test_pipeline_end_to_end_emits_ordered_events() {
        let sink = Arc::new(MemorySink::new("test", 64));
        let mut config = PipelineConfig::new("cam1", 10);
        config.frame_queue_capacity = 64;
        let source = Box::new(TestPatternSource::unpaced(640, 480, 10, 40));
        let mut pipeline = Pipeline::spawn(
            config,
            source,
            fixed_factory(person_bbox(), 0, Arc::new(AtomicBool::new(false))),
            zone_analyzer("cam1", 0.5),
            vec![sink.clone()],
        )
        .unwrap();

        assert!(pipeline.wait_for_completion(Duration::from_secs(10)));
        assert!(pipeline.stop(Duration::from_secs(2)));

        let events = sink.events();
        assert_eq!(events.len(), 1, "one dwell event for a continuous presence");
        assert_eq!(events[0].camera_id, "cam1");
        assert_eq!(events[0].rule_id, "zone_rule");

        let snapshot = pipeline.health().snapshot();
        assert_eq!(snapshot.processed, 40);
        assert_eq!(snapshot.events_published, 1);
    }

    /// Detector tracking a person who walks out of the left half of the
    /// frame and back in, smoothly enough to keep one track id.
    struct WanderingDetector;

    fn wander_x(sequence: u64) -> f32 {
        match sequence {
            0..=9 => 50.0,
            10..=24 => 50.0 + (sequence - 9) as f32 * 20.0,
            25..=39 => 350.0,
            40..=55 => 350.0 - (sequence - 39) as f32 * 20.0,
            _ => 30.0,
        }
    }

    impl ObjectDetector for WanderingDetector {
        fn detect_objects(&mut self, frame: &Frame) -> std::result::Result<Vec<Detection>, DetectorError> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(vec![Detection::new(
                0,
                "person",
                0.9,
                BBox::new(wander_x(frame.sequence), 150.0, 200.0, 200.0),
            )])
        }

        fn describe(&self) -> String {
            "wandering".to_string()
        }
    }

    #[test]
    fn test_pipeline_with_detector_pool_preserves_order() {
        let sink = Arc::new(MemorySink::new("test", 256));
        let mut config = PipelineConfig::new("cam1", 10);
        config.frame_queue_capacity = 128;
        config.detector_workers = 2;
        // Loosen matching so the walking subject holds one id through turns
        config.tracker.iou_match_threshold = 0.5;

        // Zone over the left half; the wanderer leaves it and comes back
        let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
        let mut analyzer = BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock);
        analyzer
            .add_roi(Roi::rectangle("left_half", 0.0, 0.0, 320.0, 480.0, 3))
            .unwrap();
        analyzer
            .add_rule(IntrusionRule::new("left_rule", "left_half", 0.0))
            .unwrap();

        let source = Box::new(TestPatternSource::unpaced(640, 480, 10, 80));
        let factory: DetectorFactory =
            Arc::new(|| Ok(Box::new(WanderingDetector) as Box<dyn ObjectDetector>));
        let mut pipeline =
            Pipeline::spawn(config, source, factory, analyzer, vec![sink.clone()]).unwrap();

        assert!(pipeline.wait_for_completion(Duration::from_secs(10)));
        assert!(pipeline.stop(Duration::from_secs(2)));

        // One event on first entry, one on re-entry
        let events = sink.events();
        assert_eq!(events.len(), 2, "expected re-entry events, got {}", events.len());
        // Within one pipeline, events preserve frame order
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp_ms).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted);
        // Both entries belong to the same local track
        assert_eq!(events[0].object_id, events[1].object_id);
        assert_eq!(pipeline.health().snapshot().processed, 80);
    }

    #[test]
    fn test_three_failures_trigger_reinit() {
        let reinits = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(MemorySink::new("test", 16));
        let mut config = PipelineConfig::new("cam1", 10);
        config.frame_queue_capacity = 64;
        let source = Box::new(TestPatternSource::unpaced(640, 480, 10, 20));
        let mut pipeline = Pipeline::spawn(
            config,
            source,
            fixed_factory(person_bbox(), 5, Arc::clone(&reinits)),
            zone_analyzer("cam1", 60.0),
            vec![sink],
        )
        .unwrap();

        assert!(pipeline.wait_for_completion(Duration::from_secs(10)));
        assert!(pipeline.stop(Duration::from_secs(2)));

        assert!(reinits.load(Ordering::SeqCst), "re-init was not attempted");
        let snapshot = pipeline.health().snapshot();
        assert!(snapshot.inference_errors >= 3);
    }

    #[test]
    fn test_stop_is_clean_for_idle_pipeline() {
        let sink = Arc::new(MemorySink::new("test", 16));
        let config = PipelineConfig::new("cam1", 10);
        // Paced endless source
        let source = Box::new(TestPatternSource::new(320, 240, 30));
        let mut pipeline = Pipeline::spawn(
            config,
            source,
            fixed_factory(person_bbox(), 0, Arc::new(AtomicBool::new(false))),
            zone_analyzer("cam1", 60.0),
            vec![sink],
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(pipeline.stop(Duration::from_secs(5)));
        assert!(!pipeline.health().healthy());
    }
}
