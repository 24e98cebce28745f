//! Pipeline health and counters
//!
//! Lock-free counters updated from the stage threads, read by the manager's
//! status query. The healthy predicate is: last frame within twice the
//! nominal frame interval and no fatal detector error in the last 30
//! seconds.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// FPS moving-average window, in frames
const FPS_EMA_WINDOW: f64 = 64.0;

/// Fatal detector errors poison health for this long (ms)
const FATAL_DETECTOR_HOLD_MS: i64 = 30_000;

/// Wall clock in Unix milliseconds.
#[must_use]
pub fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared health state of one pipeline.
pub struct PipelineHealth {
    nominal_fps: u32,
    processed: AtomicU64,
    dropped: AtomicU64,
    sink_dropped: AtomicU64,
    inference_errors: AtomicU64,
    events_published: AtomicU64,
    /// EMA of instantaneous FPS, stored as f64 bits
    fps_ema_bits: AtomicU64,
    last_frame_ms: AtomicI64,
    fatal_detector_ms: AtomicI64,
    preview_clients: AtomicU32,
    stopped: AtomicBool,
    last_error: Mutex<Option<(String, String)>>,
}

impl PipelineHealth {
    #[must_use]
    pub fn new(nominal_fps: u32) -> Self {
        Self {
            nominal_fps: nominal_fps.max(1),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            inference_errors: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            fps_ema_bits: AtomicU64::new(0f64.to_bits()),
            last_frame_ms: AtomicI64::new(0),
            fatal_detector_ms: AtomicI64::new(0),
            preview_clients: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Record one processed frame and fold its instantaneous rate into the
    /// FPS average.
    pub fn record_frame(&self) {
        let now = wall_ms();
        let previous = self.last_frame_ms.swap(now, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);

        if previous > 0 && now > previous {
            let instantaneous = 1000.0 / (now - previous) as f64;
            let mut current = f64::from_bits(self.fps_ema_bits.load(Ordering::Relaxed));
            current += (instantaneous - current) / FPS_EMA_WINDOW;
            self.fps_ema_bits.store(current.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn record_dropped_frame(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_drop(&self) {
        self.sink_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_error(&self) {
        self.inference_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_detector_error(&self) {
        self.fatal_detector_ms.store(wall_ms(), Ordering::Relaxed);
    }

    pub fn set_last_error(&self, code: &str, message: &str) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some((code.to_string(), message.to_string()));
        }
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn add_preview_client(&self) {
        self.preview_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_preview_client(&self) {
        let _ = self
            .preview_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    #[must_use]
    pub fn healthy(&self) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }
        let now = wall_ms();
        let last_frame = self.last_frame_ms.load(Ordering::Relaxed);
        let frame_deadline_ms = 2_000 / i64::from(self.nominal_fps);
        if last_frame == 0 || now - last_frame > frame_deadline_ms {
            return false;
        }
        let fatal = self.fatal_detector_ms.load(Ordering::Relaxed);
        fatal == 0 || now - fatal > FATAL_DETECTOR_HOLD_MS
    }

    /// Point-in-time copy for the status query.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.healthy(),
            fps: f64::from_bits(self.fps_ema_bits.load(Ordering::Relaxed)),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            preview_clients: self.preview_clients.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|slot| slot.clone()),
        }
    }
}

/// Status-query view of a pipeline's health.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub fps: f64,
    pub processed: u64,
    pub dropped: u64,
    pub sink_dropped: u64,
    pub inference_errors: u64,
    pub events_published: u64,
    pub preview_clients: u32,
    /// `(code, message)` of the most recent fault
    pub last_error: Option<(String, String)>,
}
