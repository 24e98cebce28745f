//! Multi-object tracking with Kalman prediction and cascade association
//!
//! Associates per-frame detections with persistent per-camera track ids.
//! Detections are partitioned by confidence; high-confidence detections are
//! matched against live tracks on an IoU (optionally appearance-fused) cost,
//! and low-confidence detections get a second chance against lost tracks to
//! recover short occlusions.
//!
//! # Features
//! - Eight-state constant-velocity Kalman filter per track
//! - Confidence-cascade association with greedy assignment
//! - Optional appearance fusion (cosine similarity on L2-normalized vectors)
//! - New / Tracked / Lost / Removed lifetime state machine
//! - Strictly increasing track ids, never reused within a process
//!
//! # Example
//! ```no_run
//! use visionguard_tracker::{Tracker, TrackerConfig};
//!
//! let mut tracker = Tracker::new(TrackerConfig::default());
//! // For each frame, pass detections from the detector
//! // let tracks = tracker.update(&detections);
//! ```

pub mod kalman;

use kalman::KalmanFilter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use visionguard_common::{BBox, Detection};

/// Appearance EMA learning rate
const APPEARANCE_EMA_ALPHA: f32 = 0.3;

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Confidence at or above which a detection is "high" (default 0.6)
    pub high_confidence_threshold: f32,
    /// Minimum confidence for a detection to participate at all (default 0.5)
    pub track_confidence_threshold: f32,
    /// Match acceptance threshold on IoU-only cost (default 0.8)
    pub iou_match_threshold: f32,
    /// Match acceptance threshold on the combined cost (default 0.5)
    pub combined_match_threshold: f32,
    /// Appearance weight in the combined cost (default 0.3)
    pub appearance_weight: f32,
    /// Relaxed IoU threshold for the low-confidence recovery pass (default 0.4)
    pub recover_match_threshold: f32,
    /// Frames a lost track survives without an update (default 30)
    pub max_lost_frames: u32,
    /// Minimum age for a removed track to enter the statistics (default 3)
    pub min_track_length: u32,
    /// Cap on simultaneously held tracks; oldest-lost are evicted first
    pub max_active_tracks: usize,
    /// Frames without an update after which the appearance vector is cleared
    pub reid_timeout_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_confidence_threshold: 0.6,
            track_confidence_threshold: 0.5,
            iou_match_threshold: 0.8,
            combined_match_threshold: 0.5,
            appearance_weight: 0.3,
            recover_match_threshold: 0.4,
            max_lost_frames: 30,
            min_track_length: 3,
            max_active_tracks: 128,
            reid_timeout_frames: 30,
        }
    }
}

/// Track lifetime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    /// First observation, not yet confirmed
    New,
    /// Confirmed and updated this frame or recently
    Tracked,
    /// Missed at least one association round
    Lost,
    /// Evicted; id is retired permanently
    Removed,
}

/// Public snapshot of one track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub class_id: u8,
    pub class_name: String,
    pub bbox: BBox,
    /// Center velocity in pixels per frame
    pub velocity: (f32, f32),
    pub state: TrackState,
    /// Frames since creation
    pub age: u32,
    /// Successful associations
    pub hits: u32,
    pub frames_since_update: u32,
    /// Confidence of the last associated detection
    pub confidence: f32,
    /// L2-normalized appearance vector, if one has been supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<Vec<f32>>,
}

/// Aggregate lifetime statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    pub tracks_created: u64,
    pub tracks_removed: u64,
    /// Removed tracks long enough to count (`age >= min_track_length`)
    pub tracks_recorded: u64,
    pub total_recorded_age: u64,
}

impl TrackerStats {
    /// Mean age of recorded tracks, in frames.
    #[must_use]
    pub fn average_track_age(&self) -> f64 {
        if self.tracks_recorded == 0 {
            0.0
        } else {
            self.total_recorded_age as f64 / self.tracks_recorded as f64
        }
    }
}

struct TrackedObject {
    id: u64,
    class_id: u8,
    class_name: String,
    kalman: KalmanFilter,
    state: TrackState,
    age: u32,
    hits: u32,
    frames_since_update: u32,
    confidence: f32,
    feature: Option<Vec<f32>>,
}

impl TrackedObject {
    fn new(id: u64, detection: &Detection, feature: Option<Vec<f32>>) -> Self {
        Self {
            id,
            class_id: detection.class_id,
            class_name: detection.class_name.clone(),
            kalman: KalmanFilter::new(&detection.bbox),
            state: TrackState::New,
            age: 0,
            hits: 1,
            frames_since_update: 0,
            confidence: detection.confidence,
            feature: feature.map(l2_normalized),
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.age += 1;
        self.frames_since_update += 1;
    }

    fn apply_update(&mut self, detection: &Detection, feature: Option<&[f32]>) {
        self.kalman.update(&detection.bbox);
        self.hits += 1;
        self.frames_since_update = 0;
        self.confidence = detection.confidence;
        self.state = match self.state {
            TrackState::New if self.hits >= 2 => TrackState::Tracked,
            TrackState::New => TrackState::New,
            _ => TrackState::Tracked,
        };
        if let Some(fresh) = feature {
            self.feature = Some(match self.feature.take() {
                Some(existing) => ema_feature(&existing, fresh),
                None => l2_normalized(fresh.to_vec()),
            });
        }
    }

    fn snapshot(&self) -> Track {
        Track {
            id: self.id,
            class_id: self.class_id,
            class_name: self.class_name.clone(),
            bbox: self.kalman.bbox(),
            velocity: self.kalman.velocity(),
            state: self.state,
            age: self.age,
            hits: self.hits,
            frames_since_update: self.frames_since_update,
            confidence: self.confidence,
            feature: self.feature.clone(),
        }
    }
}

/// Per-camera multi-object tracker.
pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<TrackedObject>,
    next_id: u64,
    stats: TrackerStats,
    removed: Vec<Track>,
}

impl Tracker {
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        info!("Creating tracker: {:?}", config);
        Self {
            config,
            tracks: Vec::with_capacity(50),
            next_id: 1,
            stats: TrackerStats::default(),
            removed: Vec::new(),
        }
    }

    /// Advance one frame without appearance features.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        self.update_with_features(detections, &[])
    }

    /// Advance one frame. `features` runs parallel to `detections`; an empty
    /// slice means no appearance information this frame.
    pub fn update_with_features(
        &mut self,
        detections: &[Detection],
        features: &[Option<Vec<f32>>],
    ) -> Vec<Track> {
        // Prediction runs once per frame for every live and lost track
        // before association.
        for track in &mut self.tracks {
            track.predict();
        }

        // Confidence cascade partition; detections below the track threshold
        // are discarded outright.
        let mut high_indices = Vec::with_capacity(detections.len());
        let mut low_indices = Vec::new();
        for (index, detection) in detections.iter().enumerate() {
            if detection.confidence >= self.config.high_confidence_threshold {
                high_indices.push(index);
            } else if detection.confidence >= self.config.track_confidence_threshold {
                low_indices.push(index);
            }
        }
        debug!(
            "Associating {} high / {} low detections against {} tracks",
            high_indices.len(),
            low_indices.len(),
            self.tracks.len()
        );

        // Pass 1: high detections vs active (New | Tracked) tracks.
        let active: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| {
                matches!(self.tracks[i].state, TrackState::New | TrackState::Tracked)
            })
            .collect();
        let matches = self.greedy_match(&active, &high_indices, detections, features, None);

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_detections = vec![false; detections.len()];
        for &(track_index, detection_index) in &matches {
            self.tracks[track_index]
                .apply_update(&detections[detection_index], feature_at(features, detection_index));
            matched_tracks[track_index] = true;
            matched_detections[detection_index] = true;
        }

        // Pass 1b: remaining high detections vs lost tracks (re-acquisition
        // after occlusion at the normal threshold).
        let lost: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| self.tracks[i].state == TrackState::Lost && !matched_tracks[i])
            .collect();
        let remaining_high: Vec<usize> = high_indices
            .iter()
            .copied()
            .filter(|&d| !matched_detections[d])
            .collect();
        let recovered = self.greedy_match(&lost, &remaining_high, detections, features, None);
        for &(track_index, detection_index) in &recovered {
            self.tracks[track_index]
                .apply_update(&detections[detection_index], feature_at(features, detection_index));
            matched_tracks[track_index] = true;
            matched_detections[detection_index] = true;
        }

        // Unmatched active tracks go lost before the relaxed pass.
        for (index, track) in self.tracks.iter_mut().enumerate() {
            if !matched_tracks[index]
                && matches!(track.state, TrackState::New | TrackState::Tracked)
            {
                track.state = TrackState::Lost;
            }
        }

        // Pass 2: low detections vs lost tracks at the relaxed threshold.
        let lost: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| self.tracks[i].state == TrackState::Lost && !matched_tracks[i])
            .collect();
        let remaining_low: Vec<usize> = low_indices
            .iter()
            .copied()
            .filter(|&d| !matched_detections[d])
            .collect();
        let relaxed = self.greedy_match(
            &lost,
            &remaining_low,
            detections,
            features,
            Some(self.config.recover_match_threshold),
        );
        for &(track_index, detection_index) in &relaxed {
            self.tracks[track_index]
                .apply_update(&detections[detection_index], feature_at(features, detection_index));
            matched_tracks[track_index] = true;
            matched_detections[detection_index] = true;
        }

        // Unmatched high detections seed new tracks. Ids are strictly
        // increasing and never reused within the process.
        for &detection_index in &high_indices {
            if matched_detections[detection_index] {
                continue;
            }
            let track = TrackedObject::new(
                self.next_id,
                &detections[detection_index],
                feature_at(features, detection_index).map(<[f32]>::to_vec),
            );
            self.next_id += 1;
            self.stats.tracks_created += 1;
            self.tracks.push(track);
        }

        self.expire_and_evict();

        // Appearance vectors go stale past the ReID timeout.
        for track in &mut self.tracks {
            if track.frames_since_update > self.config.reid_timeout_frames {
                track.feature = None;
            }
        }

        self.tracks.iter().map(TrackedObject::snapshot).collect()
    }

    /// Tracks removed since the last call, in eviction order.
    pub fn take_removed(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.removed)
    }

    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    #[must_use]
    pub fn active_track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Greedy assignment over a track/detection candidate set. The score per
    /// pair is IoU, or the appearance-fused combination when both sides
    /// carry a vector; `threshold_override` replaces the per-pair threshold
    /// (used by the relaxed recovery pass).
    fn greedy_match(
        &self,
        track_indices: &[usize],
        detection_indices: &[usize],
        detections: &[Detection],
        features: &[Option<Vec<f32>>],
        threshold_override: Option<f32>,
    ) -> Vec<(usize, usize)> {
        if track_indices.is_empty() || detection_indices.is_empty() {
            return Vec::new();
        }

        // Score and acceptance threshold per pair
        let mut scores = vec![vec![(0.0f32, 1.0f32); detection_indices.len()]; track_indices.len()];
        for (row, &track_index) in track_indices.iter().enumerate() {
            let track = &self.tracks[track_index];
            let predicted = track.kalman.bbox();
            for (col, &detection_index) in detection_indices.iter().enumerate() {
                let detection = &detections[detection_index];
                let iou = predicted.iou(&detection.bbox);
                let (score, threshold) =
                    match (track.feature.as_deref(), feature_at(features, detection_index)) {
                        (Some(track_feature), Some(detection_feature)) => {
                            let similarity = cosine_similarity(track_feature, detection_feature);
                            let weight = self.config.appearance_weight;
                            (
                                (1.0 - weight) * iou + weight * similarity,
                                self.config.combined_match_threshold,
                            )
                        }
                        _ => (iou, self.config.iou_match_threshold),
                    };
                scores[row][col] = (score, threshold_override.unwrap_or(threshold));
            }
        }

        // Greedy: repeatedly take the best remaining pair above its threshold.
        let mut matches = Vec::with_capacity(track_indices.len().min(detection_indices.len()));
        let mut used_rows = vec![false; track_indices.len()];
        let mut used_cols = vec![false; detection_indices.len()];
        loop {
            let mut best: Option<(usize, usize, f32)> = None;
            for row in 0..track_indices.len() {
                if used_rows[row] {
                    continue;
                }
                for col in 0..detection_indices.len() {
                    if used_cols[col] {
                        continue;
                    }
                    let (score, threshold) = scores[row][col];
                    if score < threshold {
                        continue;
                    }
                    if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                        best = Some((row, col, score));
                    }
                }
            }
            match best {
                Some((row, col, _)) => {
                    used_rows[row] = true;
                    used_cols[col] = true;
                    matches.push((track_indices[row], detection_indices[col]));
                }
                None => break,
            }
        }
        matches
    }

    /// Remove expired lost tracks and enforce the active-track cap.
    fn expire_and_evict(&mut self) {
        let max_lost = self.config.max_lost_frames;
        let min_length = self.config.min_track_length;

        let mut index = 0;
        while index < self.tracks.len() {
            let expired = self.tracks[index].state == TrackState::Lost
                && self.tracks[index].frames_since_update > max_lost;
            if expired {
                let mut track = self.tracks.swap_remove(index);
                track.state = TrackState::Removed;
                self.record_removal(&track, min_length);
                self.removed.push(track.snapshot());
            } else {
                index += 1;
            }
        }

        // Association overflow: evict oldest-lost first, never live tracks.
        while self.tracks.len() > self.config.max_active_tracks {
            let oldest_lost = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.state == TrackState::Lost)
                .max_by_key(|(_, t)| t.frames_since_update)
                .map(|(i, _)| i);
            match oldest_lost {
                Some(index) => {
                    let mut track = self.tracks.swap_remove(index);
                    track.state = TrackState::Removed;
                    self.record_removal(&track, min_length);
                    self.removed.push(track.snapshot());
                }
                None => break,
            }
        }
    }

    fn record_removal(&mut self, track: &TrackedObject, min_length: u32) {
        self.stats.tracks_removed += 1;
        if track.age >= min_length {
            self.stats.tracks_recorded += 1;
            self.stats.total_recorded_age += u64::from(track.age);
        }
        debug!(
            "Track {} removed (age {}, {} frames since update)",
            track.id, track.age, track.frames_since_update
        );
    }
}

fn feature_at(features: &[Option<Vec<f32>>], index: usize) -> Option<&[f32]> {
    features.get(index).and_then(|feature| feature.as_deref())
}

/// Cosine similarity. Inputs are produced L2-normalized, so this is the dot
/// product; mismatched lengths score zero.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2-normalize a vector in place of its owner.
#[must_use]
pub fn l2_normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn ema_feature(existing: &[f32], fresh: &[f32]) -> Vec<f32> {
    if existing.len() != fresh.len() {
        return l2_normalized(fresh.to_vec());
    }
    let blended: Vec<f32> = existing
        .iter()
        .zip(fresh.iter())
        .map(|(old, new)| (1.0 - APPEARANCE_EMA_ALPHA) * old + APPEARANCE_EMA_ALPHA * new)
        .collect();
    l2_normalized(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: f32, y: f32, confidence: f32) -> Detection {
        Detection::new(0, "person", confidence, BBox::new(x, y, 50.0, 100.0))
    }

    #[test]
    fn test_track_ids_positive_and_increasing() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let tracks = tracker.update(&[detection(0.0, 0.0, 0.9), detection(300.0, 0.0, 0.9)]);
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.id > 0));
        assert!(tracks[0].id < tracks[1].id);
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let mut tracker = Tracker::new(TrackerConfig {
            max_lost_frames: 1,
            ..Default::default()
        });
        let tracks = tracker.update(&[detection(0.0, 0.0, 0.9)]);
        let first_id = tracks[0].id;

        // Let the track expire
        for _ in 0..3 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.active_track_count(), 0);

        let tracks = tracker.update(&[detection(0.0, 0.0, 0.9)]);
        assert!(tracks[0].id > first_id);
    }

    #[test]
    fn test_fsm_new_to_tracked() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let tracks = tracker.update(&[detection(100.0, 100.0, 0.9)]);
        assert_eq!(tracks[0].state, TrackState::New);

        let tracks = tracker.update(&[detection(101.0, 100.0, 0.9)]);
        assert_eq!(tracks[0].state, TrackState::Tracked);
        assert_eq!(tracks[0].hits, 2);
    }

    #[test]
    fn test_fsm_tracked_to_lost_and_back() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[detection(100.0, 100.0, 0.9)]);
        tracker.update(&[detection(100.0, 100.0, 0.9)]);

        let tracks = tracker.update(&[]);
        assert_eq!(tracks[0].state, TrackState::Lost);

        // High-confidence re-detection recovers the same id
        let tracks = tracker.update(&[detection(100.0, 100.0, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].state, TrackState::Tracked);
    }

    #[test]
    fn test_removed_tracks_exceed_max_lost_frames() {
        let config = TrackerConfig::default();
        let max_lost = config.max_lost_frames;
        let mut tracker = Tracker::new(config);
        tracker.update(&[detection(100.0, 100.0, 0.9)]);
        tracker.update(&[detection(100.0, 100.0, 0.9)]);

        for _ in 0..=max_lost + 1 {
            tracker.update(&[]);
        }
        let removed = tracker.take_removed();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].state, TrackState::Removed);
        assert!(removed[0].frames_since_update > max_lost);
        assert_eq!(tracker.active_track_count(), 0);
    }

    #[test]
    fn test_below_track_threshold_is_discarded() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let tracks = tracker.update(&[detection(100.0, 100.0, 0.4)]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_low_confidence_does_not_seed_tracks() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        // 0.55 is above the track threshold but below high: no new track
        let tracks = tracker.update(&[detection(100.0, 100.0, 0.55)]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_low_confidence_recovers_lost_track() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[detection(100.0, 100.0, 0.9)]);
        tracker.update(&[detection(100.0, 100.0, 0.9)]);
        tracker.update(&[]); // goes lost

        let tracks = tracker.update(&[detection(102.0, 100.0, 0.55)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].state, TrackState::Tracked);
    }

    #[test]
    fn test_one_detection_matches_exactly_one_track() {
        // Two live tracks at the same spot: a single detection is assigned
        // to exactly one of them by greedy assignment.
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[detection(100.0, 100.0, 0.9), detection(104.0, 100.0, 0.9)]);
        let tracks = tracker.update(&[detection(102.0, 100.0, 0.9)]);
        let tracked: Vec<_> = tracks
            .iter()
            .filter(|t| t.frames_since_update == 0)
            .collect();
        assert_eq!(tracked.len(), 1);
    }

    #[test]
    fn test_appearance_breaks_iou_tie() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let feature_a = l2_normalized(vec![1.0, 0.0, 0.0]);
        let feature_b = l2_normalized(vec![0.0, 1.0, 0.0]);

        // Two overlapping tracks distinguished only by appearance
        tracker.update_with_features(
            &[detection(100.0, 100.0, 0.9), detection(110.0, 100.0, 0.9)],
            &[Some(feature_a.clone()), Some(feature_b.clone())],
        );

        let tracks = tracker.update_with_features(
            &[detection(105.0, 100.0, 0.9)],
            &[Some(feature_b.clone())],
        );
        let matched: Vec<_> = tracks
            .iter()
            .filter(|t| t.frames_since_update == 0)
            .collect();
        assert_eq!(matched.len(), 1);
        let similarity = cosine_similarity(matched[0].feature.as_ref().unwrap(), &feature_b);
        assert!(similarity > 0.9, "matched wrong track: {similarity}");
    }

    #[test]
    fn test_feature_ema_stays_unit_norm() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let feature_1 = l2_normalized(vec![1.0, 0.0]);
        let feature_2 = l2_normalized(vec![0.6, 0.8]);

        tracker.update_with_features(&[detection(100.0, 100.0, 0.9)], &[Some(feature_1)]);
        let tracks = tracker
            .update_with_features(&[detection(100.0, 100.0, 0.9)], &[Some(feature_2.clone())]);

        let feature = tracks[0].feature.as_ref().unwrap();
        let norm: f32 = feature.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        // Moved toward the fresh vector but not all the way
        let similarity = cosine_similarity(feature, &feature_2);
        assert!(similarity > 0.3 && similarity < 0.999);
    }

    #[test]
    fn test_feature_cleared_after_reid_timeout() {
        let mut tracker = Tracker::new(TrackerConfig {
            reid_timeout_frames: 2,
            ..Default::default()
        });
        let feature = l2_normalized(vec![1.0, 0.0]);
        tracker.update_with_features(&[detection(100.0, 100.0, 0.9)], &[Some(feature)]);

        tracker.update(&[]);
        tracker.update(&[]);
        let tracks = tracker.update(&[]);
        assert!(tracks[0].feature.is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest_lost_first() {
        let mut tracker = Tracker::new(TrackerConfig {
            max_active_tracks: 2,
            ..Default::default()
        });
        // Track 1 becomes the oldest-lost
        tracker.update(&[detection(0.0, 0.0, 0.9)]);
        tracker.update(&[]);
        tracker.update(&[]);
        // Two more tracks push the count over the cap
        tracker.update(&[detection(300.0, 0.0, 0.9), detection(600.0, 0.0, 0.9)]);

        assert_eq!(tracker.active_track_count(), 2);
        let removed = tracker.take_removed();
        assert_eq!(removed.len(), 1);
        // The evicted track is the stale one near the origin
        assert!(removed[0].bbox.x < 100.0);
    }

    #[test]
    fn test_stats_record_long_tracks_only() {
        let mut tracker = Tracker::new(TrackerConfig {
            max_lost_frames: 1,
            min_track_length: 3,
            ..Default::default()
        });
        // Short-lived track: one observation, then gone
        tracker.update(&[detection(0.0, 0.0, 0.9)]);
        for _ in 0..3 {
            tracker.update(&[]);
        }
        let stats = tracker.stats();
        assert_eq!(stats.tracks_removed, 1);
        assert_eq!(stats.tracks_recorded, 0);

        // Long-lived track enters the statistics
        for _ in 0..6 {
            tracker.update(&[detection(50.0, 0.0, 0.9)]);
        }
        for _ in 0..3 {
            tracker.update(&[]);
        }
        let stats = tracker.stats();
        assert_eq!(stats.tracks_removed, 2);
        assert_eq!(stats.tracks_recorded, 1);
        assert!(stats.average_track_age() >= 3.0);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        let a = l2_normalized(vec![3.0, 4.0]);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }
}
