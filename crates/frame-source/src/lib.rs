//! Frame acquisition for the analytics pipelines
//!
//! Opens RTSP, HTTP progressive and local-file URLs through FFmpeg, decodes
//! to shared RGB frames at a bounded rate, and reconnects transient failures
//! with full-jitter exponential backoff. Authentication and unsupported-
//! codec failures are fatal and surface to the owning pipeline.
//!
//! # Example
//! ```no_run
//! use visionguard_frame_source::{FrameProducer, ReconnectingSource};
//! use visionguard_frame_source::decoder::FrameSourceConfig;
//! use visionguard_common::VideoSourceConfig;
//!
//! # fn main() -> visionguard_common::Result<()> {
//! let source = VideoSourceConfig::test_source("cam1", "rtsp://10.0.0.5/stream1");
//! let mut producer = ReconnectingSource::new(FrameSourceConfig::from_video_source(&source));
//! let frame = producer.next_frame()?;
//! println!("frame {} at {}ns", frame.sequence, frame.timestamp_ns);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod decoder;
pub mod test_pattern;

pub use backoff::{Backoff, BackoffConfig};
pub use decoder::{open, FrameSourceConfig, Session};
pub use test_pattern::TestPatternSource;

use tracing::{info, warn};
use visionguard_common::{AnalyticsError, Frame, Result};

/// Blocking frame producer driven by a pipeline's source thread.
pub trait FrameProducer: Send {
    /// Produce the next frame, blocking on decode, pacing and reconnect
    /// backoff. Fatal errors (`AuthFailed`, `UnsupportedSource`,
    /// `ReconnectDeadline`, `EndOfStream` for finite sources) end the
    /// session.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Release transport resources. Idempotent.
    fn close(&mut self);
}

/// FFmpeg source with automatic reconnection.
///
/// Transient errors trigger backoff-and-reopen up to the configured
/// deadline; sequence numbers restart at zero on each reconnect. Live
/// sources treat end-of-stream as a transient disconnection, finite sources
/// surface it.
pub struct ReconnectingSource {
    config: FrameSourceConfig,
    session: Option<Session>,
    backoff: Backoff,
}

impl ReconnectingSource {
    #[must_use]
    pub fn new(config: FrameSourceConfig) -> Self {
        let backoff = Backoff::new(config.reconnect.clone());
        Self {
            config,
            session: None,
            backoff,
        }
    }

    fn ensure_session(&mut self) -> Result<&mut Session> {
        loop {
            if self.session.is_some() {
                return Ok(self.session.as_mut().unwrap());
            }
            match decoder::open(&self.config) {
                Ok(session) => {
                    self.backoff.reset();
                    self.session = Some(session);
                }
                Err(e) if is_fatal_open_error(&e) => {
                    warn!("Source {} failed fatally: {e}", self.config.url);
                    return Err(e);
                }
                Err(e) => {
                    let attempts = self.backoff.attempts();
                    match self.backoff.next_delay() {
                        Some(delay) => {
                            info!(
                                "Source {} unavailable ({e}); retrying in {:?}",
                                self.config.url, delay
                            );
                            std::thread::sleep(delay);
                        }
                        None => {
                            warn!(
                                "Source {} reconnect deadline exceeded after {attempts} attempts",
                                self.config.url
                            );
                            return Err(AnalyticsError::ReconnectDeadline(attempts));
                        }
                    }
                }
            }
        }
    }
}

impl FrameProducer for ReconnectingSource {
    fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let is_live = self.config.is_live();
            let session = self.ensure_session()?;
            match session.read() {
                Ok(frame) => return Ok(frame),
                Err(AnalyticsError::EndOfStream) if !is_live => {
                    return Err(AnalyticsError::EndOfStream);
                }
                Err(AnalyticsError::Decode(message)) => {
                    // Per-frame decode errors skip the frame; the session
                    // stays up
                    warn!("Decode error on {}: {message}", self.config.url);
                    continue;
                }
                Err(e) => {
                    // Anything else drops the session and goes through the
                    // backoff reconnect path
                    warn!(
                        "Source {} interrupted ({e}); scheduling reconnect",
                        self.config.url
                    );
                    if let Some(session) = self.session.take() {
                        session.close();
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

fn is_fatal_open_error(error: &AnalyticsError) -> bool {
    matches!(
        error,
        AnalyticsError::AuthFailed(_) | AnalyticsError::UnsupportedSource(_)
    )
}
