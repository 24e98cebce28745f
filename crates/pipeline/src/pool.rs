//! Detection stage: inline or worker pool
//!
//! With a pool, frames are submitted to per-worker detector contexts and
//! the frame thread collects results with a cancellation-safe timeout,
//! re-ordering completions so downstream stages always see frame order.
//! A result that misses its timeout is abandoned (counted as an inference
//! failure); the worker's context stays valid for subsequent frames.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};
use visionguard_common::{Detection, Frame};
use visionguard_detector::{DetectorError, DetectorFactory, ObjectDetector};

pub(crate) enum PoolJob {
    Detect(u64, Frame),
    Reinit,
    Shutdown,
}

pub(crate) struct PoolResult {
    sequence: u64,
    detections: Vec<Detection>,
}

/// One frame paired with its detections, ready for tracking.
pub struct DetectedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// The detection stage of one pipeline.
pub(crate) enum DetectorStage {
    Inline {
        detector: Box<dyn ObjectDetector>,
    },
    Pool {
        submit_tx: Sender<PoolJob>,
        result_rx: Receiver<PoolResult>,
        workers: Vec<JoinHandle<()>>,
        /// Frames submitted but not yet completed, oldest first
        in_flight: VecDeque<(u64, Frame)>,
        /// Out-of-order completions waiting for their turn
        ready: HashMap<u64, Vec<Detection>>,
        depth: usize,
        timeout: Duration,
        /// Most recently reported consecutive-failure streak
        failure_streak: Arc<AtomicU32>,
    },
}

impl DetectorStage {
    /// Build the stage. `workers == 0` detects inline on the frame thread;
    /// otherwise one detector context is created per worker from the same
    /// factory (contexts are never shared across threads).
    pub fn new(
        factory: &DetectorFactory,
        workers: usize,
        timeout: Duration,
    ) -> Result<Self, DetectorError> {
        if workers == 0 {
            return Ok(DetectorStage::Inline {
                detector: factory()?,
            });
        }

        let depth = workers.min(3);
        let (submit_tx, submit_rx) = bounded::<PoolJob>(depth * 2);
        let (result_tx, result_rx) = unbounded::<PoolResult>();
        let failure_streak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::with_capacity(depth);
        for worker_index in 0..depth {
            let mut detector = factory()?;
            let submit_rx = submit_rx.clone();
            let result_tx = result_tx.clone();
            let failure_streak = Arc::clone(&failure_streak);
            let handle = std::thread::Builder::new()
                .name(format!("detect-{worker_index}"))
                .spawn(move || {
                    while let Ok(job) = submit_rx.recv() {
                        match job {
                            PoolJob::Detect(sequence, frame) => {
                                let detections =
                                    detector.detect_objects(&frame).unwrap_or_default();
                                failure_streak
                                    .store(detector.consecutive_failures(), Ordering::Relaxed);
                                if result_tx
                                    .send(PoolResult {
                                        sequence,
                                        detections,
                                    })
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            PoolJob::Reinit => {
                                if let Err(e) = detector.reinitialize() {
                                    warn!("Worker {worker_index} re-init failed: {e}");
                                }
                            }
                            PoolJob::Shutdown => break,
                        }
                    }
                    debug!("Detector worker {worker_index} stopped");
                })
                .map_err(|e| DetectorError::Inference(format!("spawn worker: {e}")))?;
            handles.push(handle);
        }

        Ok(DetectorStage::Pool {
            submit_tx,
            result_rx,
            workers: handles,
            in_flight: VecDeque::with_capacity(depth),
            ready: HashMap::new(),
            depth,
            timeout,
            failure_streak,
        })
    }

    /// Feed one frame through the stage. Inline mode completes immediately;
    /// pool mode returns frames whose detections have arrived, in frame
    /// order (possibly none, possibly several).
    pub fn submit(&mut self, frame: Frame) -> Vec<DetectedFrame> {
        if let DetectorStage::Inline { detector } = self {
            let detections = detector.detect_objects(&frame).unwrap_or_default();
            return vec![DetectedFrame { frame, detections }];
        }

        let depth = {
            let DetectorStage::Pool {
                submit_tx,
                in_flight,
                depth,
                ..
            } = self
            else {
                unreachable!("inline handled above");
            };
            let sequence = frame.sequence;
            if submit_tx
                .send(PoolJob::Detect(sequence, frame.clone()))
                .is_err()
            {
                // Workers are gone; degrade to empty detections
                return vec![DetectedFrame {
                    frame,
                    detections: Vec::new(),
                }];
            }
            in_flight.push_back((sequence, frame));
            *depth
        };

        // Await the oldest result whenever the pool is saturated
        let mut completed = Vec::new();
        while self.in_flight_len() >= depth {
            match self.collect_oldest() {
                Some(done) => completed.push(done),
                None => break,
            }
        }
        completed
    }

    fn in_flight_len(&self) -> usize {
        match self {
            DetectorStage::Inline { .. } => 0,
            DetectorStage::Pool { in_flight, .. } => in_flight.len(),
        }
    }

    /// Block for the oldest in-flight frame's detections, up to the timeout.
    /// On timeout the frame proceeds with an empty detection set.
    fn collect_oldest(&mut self) -> Option<DetectedFrame> {
        let DetectorStage::Pool {
            result_rx,
            in_flight,
            ready,
            timeout,
            failure_streak,
            ..
        } = self
        else {
            return None;
        };

        let (oldest_sequence, _) = *in_flight.front()?;
        loop {
            if let Some(detections) = ready.remove(&oldest_sequence) {
                let (_, frame) = in_flight.pop_front().unwrap();
                return Some(DetectedFrame { frame, detections });
            }
            match result_rx.recv_timeout(*timeout) {
                Ok(result) => {
                    // Results for abandoned frames are discarded
                    if result.sequence >= oldest_sequence {
                        ready.insert(result.sequence, result.detections);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Detection result for frame {oldest_sequence} timed out; abandoning");
                    failure_streak.fetch_add(1, Ordering::Relaxed);
                    let (_, frame) = in_flight.pop_front().unwrap();
                    return Some(DetectedFrame {
                        frame,
                        detections: Vec::new(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let (_, frame) = in_flight.pop_front().unwrap();
                    return Some(DetectedFrame {
                        frame,
                        detections: Vec::new(),
                    });
                }
            }
        }
    }

    /// Flush every in-flight frame, in order.
    pub fn drain(&mut self) -> Vec<DetectedFrame> {
        let mut completed = Vec::new();
        while let Some(done) = self.collect_oldest() {
            completed.push(done);
        }
        completed
    }

    /// Current consecutive-failure streak of the detection path.
    #[must_use]
    pub fn failure_streak(&self) -> u32 {
        match self {
            DetectorStage::Inline { detector } => detector.consecutive_failures(),
            DetectorStage::Pool { failure_streak, .. } => failure_streak.load(Ordering::Relaxed),
        }
    }

    /// Apply threshold deltas in place. Pooled contexts are rebuilt by the
    /// manager on threshold changes instead.
    pub fn apply_thresholds(&mut self, confidence: Option<f32>, nms: Option<f32>) {
        if let DetectorStage::Inline { detector } = self {
            if let Some(threshold) = confidence {
                detector.apply_confidence_threshold(threshold);
            }
            if let Some(threshold) = nms {
                detector.apply_nms_threshold(threshold);
            }
        }
    }

    /// Rebuild detector contexts after repeated failures.
    pub fn reinitialize(&mut self) -> Result<(), DetectorError> {
        match self {
            DetectorStage::Inline { detector } => detector.reinitialize(),
            DetectorStage::Pool {
                submit_tx, workers, ..
            } => {
                for _ in 0..workers.len() {
                    let _ = submit_tx.send(PoolJob::Reinit);
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            DetectorStage::Inline { detector } => detector.describe(),
            DetectorStage::Pool { workers, .. } => {
                format!("detector pool ({} workers)", workers.len())
            }
        }
    }

    /// Stop workers, abandoning results still in flight. Worker contexts are
    /// reset on their next initialize, so abandonment cannot corrupt
    /// subsequent calls.
    pub fn shutdown(self) {
        if let DetectorStage::Pool {
            submit_tx, workers, ..
        } = self
        {
            for _ in 0..workers.len() {
                let _ = submit_tx.send(PoolJob::Shutdown);
            }
            drop(submit_tx);
            for handle in workers {
                let _ = handle.join();
            }
        }
    }
}
