//! Attribute-provider capability
//!
//! The engine does not analyze person attributes itself; it hands cropped
//! detections to an external provider through the `AttributeProvider`
//! capability. This crate owns the contract types, the per-track sampling
//! throttle (at most one crop per track per N frames, minimum crop size),
//! and the tokio worker that batches requests to the provider.

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use visionguard_common::{BBox, PersonStatisticsConfig};

/// Default sampling interval in frames
pub const DEFAULT_SAMPLE_INTERVAL: u64 = 30;

/// Minimum crop edge for attribute analysis, in pixels
pub const MIN_CROP_SIZE: u32 = 64;

/// Attribute provider errors
#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),
}

/// One person crop handed to the provider.
#[derive(Debug, Clone)]
pub struct PersonDetection {
    /// Box in original-frame coordinates
    pub bbox: BBox,
    /// Cropped pixels for the box
    pub crop: Arc<RgbImage>,
    pub track_id: u64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgeGroup {
    Child,
    Young,
    Middle,
    Senior,
    #[default]
    Unknown,
}

/// Provider verdict for one crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersonAttributes {
    pub gender: Gender,
    pub age_group: AgeGroup,
    pub gender_confidence: f32,
    pub age_confidence: f32,
    /// Crop quality estimate in [0, 1]
    pub quality_score: f32,
    pub has_mask: bool,
}

impl PersonAttributes {
    /// Downgrade verdicts whose confidence falls below the configured
    /// per-camera thresholds to `Unknown`.
    #[must_use]
    pub fn thresholded(mut self, gender_threshold: f32, age_threshold: f32) -> Self {
        if self.gender_confidence < gender_threshold {
            self.gender = Gender::Unknown;
        }
        if self.age_confidence < age_threshold {
            self.age_group = AgeGroup::Unknown;
        }
        self
    }
}

/// External attribute analysis capability.
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Analyze a batch of crops. The result runs parallel to the input.
    async fn analyze(
        &self,
        detections: &[PersonDetection],
    ) -> Result<Vec<PersonAttributes>, AttributeError>;
}

/// Provider that reports every attribute unknown. Used when person
/// statistics are disabled or no real provider is wired.
#[derive(Debug, Default)]
pub struct NullAttributeProvider;

#[async_trait]
impl AttributeProvider for NullAttributeProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn analyze(
        &self,
        detections: &[PersonDetection],
    ) -> Result<Vec<PersonAttributes>, AttributeError> {
        Ok(vec![PersonAttributes::default(); detections.len()])
    }
}

/// Per-track sampling throttle: a track is sampled at most once per
/// `interval_frames`, and only when its crop is at least the minimum size.
pub struct AttributeSampler {
    interval_frames: u64,
    min_crop_size: u32,
    last_sampled: HashMap<u64, u64>,
}

impl AttributeSampler {
    #[must_use]
    pub fn new(interval_frames: u64, min_crop_size: u32) -> Self {
        Self {
            interval_frames: interval_frames.max(1),
            min_crop_size,
            last_sampled: HashMap::new(),
        }
    }

    /// Whether to sample `track_id` at frame `sequence` for a crop of the
    /// given box. Records the sample when it returns true.
    pub fn should_sample(&mut self, track_id: u64, sequence: u64, bbox: &BBox) -> bool {
        if (bbox.width as u32) < self.min_crop_size || (bbox.height as u32) < self.min_crop_size {
            return false;
        }
        match self.last_sampled.get(&track_id) {
            Some(&last) if sequence < last + self.interval_frames => false,
            _ => {
                self.last_sampled.insert(track_id, sequence);
                true
            }
        }
    }

    /// Drop bookkeeping for a removed track.
    pub fn forget(&mut self, track_id: u64) {
        self.last_sampled.remove(&track_id);
    }
}

impl Default for AttributeSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL, MIN_CROP_SIZE)
    }
}

/// Resolved attributes for one track.
pub type AttributeResult = (u64, PersonAttributes);

/// Spawn the attribute worker: batches crops from `requests` and calls the
/// provider, emitting `(track_id, attributes)` pairs. Verdicts below the
/// configured gender/age confidence thresholds are downgraded to `Unknown`
/// before they are cached or emitted. Results for cached tracks are served
/// without a provider round trip when caching is enabled.
///
/// The worker exits when the request channel closes.
pub fn spawn_attribute_worker(
    provider: Arc<dyn AttributeProvider>,
    config: PersonStatisticsConfig,
    mut requests: mpsc::Receiver<PersonDetection>,
    results: mpsc::Sender<AttributeResult>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = config.batch_size.max(1);
        let mut cache: HashMap<u64, PersonAttributes> = HashMap::new();
        let mut batch: Vec<PersonDetection> = Vec::with_capacity(batch_size);

        loop {
            // Fill a batch, flushing the remainder when the channel drains
            let closed = loop {
                match requests.try_recv() {
                    Ok(detection) => {
                        if config.enable_caching {
                            if let Some(cached) = cache.get(&detection.track_id) {
                                let _ = results.send((detection.track_id, cached.clone())).await;
                                continue;
                            }
                        }
                        batch.push(detection);
                        if batch.len() >= batch_size {
                            break false;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if batch.is_empty() {
                            // Block for the next request
                            match requests.recv().await {
                                Some(detection) => {
                                    if config.enable_caching {
                                        if let Some(cached) = cache.get(&detection.track_id) {
                                            let _ = results
                                                .send((detection.track_id, cached.clone()))
                                                .await;
                                            continue;
                                        }
                                    }
                                    batch.push(detection);
                                    if batch.len() >= batch_size {
                                        break false;
                                    }
                                    continue;
                                }
                                None => break true,
                            }
                        }
                        break false;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break true,
                }
            };

            if !batch.is_empty() {
                match provider.analyze(&batch).await {
                    Ok(attributes) => {
                        for (detection, attribute) in batch.iter().zip(attributes) {
                            let attribute = attribute
                                .thresholded(config.gender_threshold, config.age_threshold);
                            if config.enable_caching {
                                cache.insert(detection.track_id, attribute.clone());
                            }
                            let _ = results.send((detection.track_id, attribute)).await;
                        }
                    }
                    Err(e) => {
                        warn!("Attribute provider '{}' failed: {e}", provider.name());
                    }
                }
                debug!("Attribute batch of {} processed", batch.len());
                batch.clear();
            }

            if closed {
                break;
            }
        }
        debug!("Attribute worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(80, 120))
    }

    fn person(track_id: u64) -> PersonDetection {
        PersonDetection {
            bbox: BBox::new(0.0, 0.0, 80.0, 120.0),
            crop: crop(),
            track_id,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_sampler_respects_interval() {
        let mut sampler = AttributeSampler::new(30, 64);
        let bbox = BBox::new(0.0, 0.0, 80.0, 120.0);
        assert!(sampler.should_sample(1, 0, &bbox));
        assert!(!sampler.should_sample(1, 10, &bbox));
        assert!(!sampler.should_sample(1, 29, &bbox));
        assert!(sampler.should_sample(1, 30, &bbox));
        // Independent per track
        assert!(sampler.should_sample(2, 10, &bbox));
    }

    #[test]
    fn test_sampler_rejects_small_crops() {
        let mut sampler = AttributeSampler::default();
        let small = BBox::new(0.0, 0.0, 63.0, 120.0);
        assert!(!sampler.should_sample(1, 0, &small));
        let short = BBox::new(0.0, 0.0, 80.0, 40.0);
        assert!(!sampler.should_sample(1, 0, &short));
    }

    #[test]
    fn test_sampler_forget_resets() {
        let mut sampler = AttributeSampler::new(30, 64);
        let bbox = BBox::new(0.0, 0.0, 80.0, 120.0);
        assert!(sampler.should_sample(1, 0, &bbox));
        sampler.forget(1);
        assert!(sampler.should_sample(1, 1, &bbox));
    }

    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl AttributeProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn analyze(
            &self,
            detections: &[PersonDetection],
        ) -> Result<Vec<PersonAttributes>, AttributeError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(detections
                .iter()
                .map(|_| PersonAttributes {
                    gender: Gender::Female,
                    age_group: AgeGroup::Young,
                    gender_confidence: 0.9,
                    age_confidence: 0.8,
                    quality_score: 0.7,
                    has_mask: false,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_worker_resolves_batches() {
        let provider = Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = PersonStatisticsConfig {
            enabled: true,
            batch_size: 2,
            enable_caching: false,
            ..Default::default()
        };
        let (request_tx, request_rx) = mpsc::channel(8);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let worker = spawn_attribute_worker(provider.clone(), config, request_rx, result_tx);

        request_tx.send(person(1)).await.unwrap();
        request_tx.send(person(2)).await.unwrap();
        drop(request_tx);

        let first = result_rx.recv().await.unwrap();
        let second = result_rx.recv().await.unwrap();
        assert_eq!(first.1.gender, Gender::Female);
        assert_eq!(
            {
                let mut ids = vec![first.0, second.0];
                ids.sort_unstable();
                ids
            },
            vec![1, 2]
        );
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_serves_cached_tracks_without_calls() {
        let provider = Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = PersonStatisticsConfig {
            enabled: true,
            batch_size: 1,
            enable_caching: true,
            ..Default::default()
        };
        let (request_tx, request_rx) = mpsc::channel(8);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let worker = spawn_attribute_worker(provider.clone(), config, request_rx, result_tx);

        request_tx.send(person(1)).await.unwrap();
        let _ = result_rx.recv().await.unwrap();
        request_tx.send(person(1)).await.unwrap();
        let _ = result_rx.recv().await.unwrap();
        drop(request_tx);
        worker.await.unwrap();

        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thresholds_downgrade_weak_verdicts() {
        let attributes = PersonAttributes {
            gender: Gender::Female,
            age_group: AgeGroup::Young,
            gender_confidence: 0.9,
            age_confidence: 0.4,
            quality_score: 0.7,
            has_mask: false,
        };

        // Weak age verdict drops to Unknown, the confident gender survives
        let gated = attributes.clone().thresholded(0.6, 0.5);
        assert_eq!(gated.gender, Gender::Female);
        assert_eq!(gated.age_group, AgeGroup::Unknown);

        // Strict gender threshold drops that side too
        let gated = attributes.clone().thresholded(0.95, 0.3);
        assert_eq!(gated.gender, Gender::Unknown);
        assert_eq!(gated.age_group, AgeGroup::Young);

        // Zero thresholds keep everything
        let gated = attributes.thresholded(0.0, 0.0);
        assert_eq!(gated.gender, Gender::Female);
        assert_eq!(gated.age_group, AgeGroup::Young);
    }

    #[tokio::test]
    async fn test_worker_applies_confidence_thresholds() {
        // The counting provider reports gender at 0.9 and age at 0.8; a
        // strict gender threshold leaves only the age verdict standing.
        let provider = Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = PersonStatisticsConfig {
            enabled: true,
            gender_threshold: 0.95,
            age_threshold: 0.5,
            batch_size: 1,
            enable_caching: false,
        };
        let (request_tx, request_rx) = mpsc::channel(8);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let worker = spawn_attribute_worker(provider, config, request_rx, result_tx);

        request_tx.send(person(1)).await.unwrap();
        drop(request_tx);

        let (track_id, attributes) = result_rx.recv().await.unwrap();
        assert_eq!(track_id, 1);
        assert_eq!(attributes.gender, Gender::Unknown);
        assert_eq!(attributes.age_group, AgeGroup::Young);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_null_provider_reports_unknown() {
        let provider = NullAttributeProvider;
        let attributes = provider.analyze(&[person(1)]).await.unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].gender, Gender::Unknown);
        assert_eq!(attributes[0].age_group, AgeGroup::Unknown);
    }

    #[test]
    fn test_attribute_serde_round_trip() {
        let attributes = PersonAttributes {
            gender: Gender::Male,
            age_group: AgeGroup::Senior,
            gender_confidence: 0.8,
            age_confidence: 0.6,
            quality_score: 0.9,
            has_mask: true,
        };
        let json = serde_json::to_string(&attributes).unwrap();
        assert!(json.contains("\"male\""));
        assert!(json.contains("\"senior\""));
        let decoded: PersonAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, attributes);
    }
}
