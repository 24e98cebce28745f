//! Synthetic frame source
//!
//! Generates a moving-rectangle test pattern in the decoder's output format
//! so the full pipeline can run without media files or a camera.

use crate::FrameProducer;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};
use visionguard_common::{Frame, Result};

/// Test pattern generator.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    /// Stop after this many frames (None = endless)
    frame_limit: Option<u64>,
    /// Sleep between frames to emulate a live source
    paced: bool,
    sequence: u64,
    last_emit: Option<Instant>,
}

impl TestPatternSource {
    #[must_use]
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            frame_limit: None,
            paced: true,
            sequence: 0,
            last_emit: None,
        }
    }

    /// Unpaced variant for tests: frames come out as fast as they are asked
    /// for, with synthetic timestamps spaced at the nominal FPS.
    #[must_use]
    pub fn unpaced(width: u32, height: u32, fps: u32, frame_limit: u64) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            frame_limit: Some(frame_limit),
            paced: false,
            sequence: 0,
            last_emit: None,
        }
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, Rgb([32, 32, 32]));

        // A white square orbiting the frame, one lap per 100 frames
        let lap = (self.sequence % 100) as f32 / 100.0;
        let angle = lap * std::f32::consts::TAU;
        let center_x = self.width as f32 / 2.0 + angle.cos() * self.width as f32 / 4.0;
        let center_y = self.height as f32 / 2.0 + angle.sin() * self.height as f32 / 4.0;

        let half = (self.width.min(self.height) / 10) as i32;
        for dy in -half..half {
            for dx in -half..half {
                let x = center_x as i32 + dx;
                let y = center_y as i32 + dy;
                if x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height {
                    image.put_pixel(x as u32, y as u32, Rgb([235, 235, 235]));
                }
            }
        }
        image
    }
}

impl FrameProducer for TestPatternSource {
    fn next_frame(&mut self) -> Result<Frame> {
        if let Some(limit) = self.frame_limit {
            if self.sequence >= limit {
                return Err(visionguard_common::AnalyticsError::EndOfStream);
            }
        }

        if self.paced {
            let interval = Duration::from_secs_f64(1.0 / f64::from(self.fps));
            if let Some(last) = self.last_emit {
                let since = last.elapsed();
                if since < interval {
                    std::thread::sleep(interval - since);
                }
            }
            self.last_emit = Some(Instant::now());
        }

        let frame_interval_ns = 1_000_000_000i64 / i64::from(self.fps);
        let frame = Frame::new(
            self.sequence,
            self.sequence as i64 * frame_interval_ns,
            self.render(),
        );
        self.sequence += 1;
        Ok(frame)
    }

    fn close(&mut self) {}
}
