//! Global identity registry
//!
//! Maps `(camera_id, local_track_id)` to process-wide global track ids.
//! First sighting allocates; an appearance match above the similarity
//! threshold against a recently-active entry from any camera inherits that
//! entry's global id instead. A single read-write lock covers the registry:
//! many readers resolving ids, few writers allocating or re-binding.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use visionguard_analyzer::{IdentityMatch, IdentityResolver};
use visionguard_tracker::cosine_similarity;

/// Cross-camera matching configuration
#[derive(Debug, Clone)]
pub struct ReidConfig {
    /// Cosine similarity threshold τ_g; clamped to [0.5, 0.95]
    pub similarity_threshold: f32,
    /// Candidates considered per bind, sorted by similarity
    pub max_candidates: usize,
    /// Only entries active within this window are candidates
    pub temporal_window_ms: i64,
}

impl Default for ReidConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            max_candidates: 5,
            temporal_window_ms: 30_000,
        }
    }
}

impl ReidConfig {
    /// Apply the configured bounds.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.similarity_threshold = self.similarity_threshold.clamp(0.5, 0.95);
        self.max_candidates = self.max_candidates.max(1);
        self
    }
}

struct FeatureEntry {
    camera_id: String,
    local_track_id: u64,
    global_id: u64,
    feature: Vec<f32>,
    last_seen_ms: i64,
}

struct RegistryInner {
    next_global_id: u64,
    bindings: HashMap<(String, u64), u64>,
    features: Vec<FeatureEntry>,
}

/// Process-wide identity registry. Initialize at startup, tear down last.
pub struct GlobalIdentityRegistry {
    config: ReidConfig,
    inner: RwLock<RegistryInner>,
}

impl GlobalIdentityRegistry {
    #[must_use]
    pub fn new(config: ReidConfig) -> Self {
        Self {
            config: config.clamped(),
            inner: RwLock::new(RegistryInner {
                next_global_id: 1,
                bindings: HashMap::new(),
                features: Vec::new(),
            }),
        }
    }

    /// Number of live global identities bound.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.inner.read().map(|inner| inner.bindings.len()).unwrap_or(0)
    }

    /// Drop all state for a camera when its pipeline is removed. Feature
    /// entries stay inside the temporal window so a subject walking to
    /// another camera can still be re-identified.
    pub fn remove_camera(&self, camera_id: &str) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        inner.bindings.retain(|(camera, _), _| camera != camera_id);
    }

    fn allocate(inner: &mut RegistryInner) -> u64 {
        let id = inner.next_global_id;
        inner.next_global_id += 1;
        id
    }
}

impl IdentityResolver for GlobalIdentityRegistry {
    fn global_track_id(&self, camera_id: &str, local_track_id: u64) -> u64 {
        let key = (camera_id.to_string(), local_track_id);
        if let Ok(inner) = self.inner.read() {
            if let Some(&global_id) = inner.bindings.get(&key) {
                return global_id;
            }
        }
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        // Double-check after the lock upgrade
        if let Some(&global_id) = inner.bindings.get(&key) {
            return global_id;
        }
        let global_id = Self::allocate(&mut inner);
        inner.bindings.insert(key, global_id);
        debug!("Allocated global id {global_id} for {camera_id}:{local_track_id}");
        global_id
    }

    fn bind_by_feature(
        &self,
        camera_id: &str,
        local_track_id: u64,
        feature: &[f32],
        timestamp_ms: i64,
    ) -> (u64, Vec<IdentityMatch>) {
        let Ok(mut inner) = self.inner.write() else {
            return (0, Vec::new());
        };

        // Stale entries leave the candidate pool permanently
        let window = self.config.temporal_window_ms;
        inner
            .features
            .retain(|entry| timestamp_ms - entry.last_seen_ms <= window * 2);

        // Candidates: recently-active entries from any other local track
        let mut candidates: Vec<IdentityMatch> = inner
            .features
            .iter()
            .filter(|entry| {
                (entry.camera_id != camera_id || entry.local_track_id != local_track_id)
                    && timestamp_ms - entry.last_seen_ms <= window
            })
            .map(|entry| IdentityMatch {
                camera_id: entry.camera_id.clone(),
                local_track_id: entry.local_track_id,
                global_track_id: entry.global_id,
                similarity: cosine_similarity(&entry.feature, feature),
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(self.config.max_candidates);

        let key = (camera_id.to_string(), local_track_id);
        let best_match = candidates
            .first()
            .filter(|candidate| candidate.similarity >= self.config.similarity_threshold);

        let global_id = match best_match {
            Some(matched) => {
                // Inherit (possibly re-binding this local track)
                let inherited = matched.global_track_id;
                debug!(
                    "Track {camera_id}:{local_track_id} inherits global id {inherited} \
                     (similarity {:.2})",
                    matched.similarity
                );
                inner.bindings.insert(key, inherited);
                inherited
            }
            None => match inner.bindings.get(&key) {
                Some(&existing) => existing,
                None => {
                    let allocated = Self::allocate(&mut inner);
                    inner.bindings.insert(key, allocated);
                    allocated
                }
            },
        };

        // Record this sighting for future matches
        match inner.features.iter_mut().find(|entry| {
            entry.camera_id == camera_id && entry.local_track_id == local_track_id
        }) {
            Some(entry) => {
                entry.feature = feature.to_vec();
                entry.last_seen_ms = timestamp_ms;
                entry.global_id = global_id;
            }
            None => inner.features.push(FeatureEntry {
                camera_id: camera_id.to_string(),
                local_track_id,
                global_id,
                feature: feature.to_vec(),
                last_seen_ms: timestamp_ms,
            }),
        }

        let matches = candidates
            .into_iter()
            .filter(|candidate| candidate.similarity >= self.config.similarity_threshold)
            .collect();
        (global_id, matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visionguard_tracker::l2_normalized;

    /// Unit vectors with the requested cosine similarity to `[1, 0]`.
    fn vector_with_similarity(similarity: f32) -> Vec<f32> {
        l2_normalized(vec![similarity, (1.0 - similarity * similarity).sqrt()])
    }

    #[test]
    fn test_allocation_is_stable_per_local_track() {
        let registry = GlobalIdentityRegistry::new(ReidConfig::default());
        let first = registry.global_track_id("cam_a", 1);
        let second = registry.global_track_id("cam_a", 1);
        assert_eq!(first, second);
        assert!(first > 0);

        let other = registry.global_track_id("cam_a", 2);
        assert_ne!(first, other);
    }

    #[test]
    fn test_cross_camera_match_shares_identity() {
        // cos(fA, fB) = 0.82 >= τ_g = 0.7 within the window
        let registry = GlobalIdentityRegistry::new(ReidConfig::default());
        let feature_a = l2_normalized(vec![1.0, 0.0]);
        let feature_b = vector_with_similarity(0.82);

        let (global_a, matches_a) = registry.bind_by_feature("cam_a", 1, &feature_a, 1_000);
        assert!(matches_a.is_empty());

        let (global_b, matches_b) = registry.bind_by_feature("cam_b", 7, &feature_b, 9_000);
        assert_eq!(global_a, global_b);
        assert_eq!(matches_b.len(), 1);
        assert!((matches_b[0].similarity - 0.82).abs() < 1e-3);
    }

    #[test]
    fn test_high_threshold_keeps_identities_distinct() {
        let registry = GlobalIdentityRegistry::new(ReidConfig {
            similarity_threshold: 0.9,
            ..Default::default()
        });
        let feature_a = l2_normalized(vec![1.0, 0.0]);
        let feature_b = vector_with_similarity(0.82);

        let (global_a, _) = registry.bind_by_feature("cam_a", 1, &feature_a, 1_000);
        let (global_b, matches) = registry.bind_by_feature("cam_b", 7, &feature_b, 9_000);
        assert_ne!(global_a, global_b);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_temporal_window_excludes_old_sightings() {
        let registry = GlobalIdentityRegistry::new(ReidConfig::default());
        let feature_a = l2_normalized(vec![1.0, 0.0]);
        let feature_b = vector_with_similarity(0.95);

        registry.bind_by_feature("cam_a", 1, &feature_a, 1_000);
        // 40s later: outside the 30s window
        let (_, matches) = registry.bind_by_feature("cam_b", 7, &feature_b, 41_000);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_candidates_bounded_and_sorted() {
        let registry = GlobalIdentityRegistry::new(ReidConfig {
            max_candidates: 3,
            similarity_threshold: 0.5,
            ..Default::default()
        });
        for track in 0..8 {
            let feature = vector_with_similarity(0.6 + 0.04 * track as f32);
            registry.bind_by_feature("cam_a", track, &feature, 1_000);
        }
        let probe = l2_normalized(vec![1.0, 0.0]);
        let (_, matches) = registry.bind_by_feature("cam_b", 99, &probe, 2_000);
        assert!(matches.len() <= 3);
        for pair in matches.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn test_threshold_clamped_to_bounds() {
        let config = ReidConfig {
            similarity_threshold: 0.2,
            ..Default::default()
        }
        .clamped();
        assert!((config.similarity_threshold - 0.5).abs() < f32::EPSILON);

        let config = ReidConfig {
            similarity_threshold: 0.99,
            ..Default::default()
        }
        .clamped();
        assert!((config.similarity_threshold - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_remove_camera_clears_bindings() {
        let registry = GlobalIdentityRegistry::new(ReidConfig::default());
        registry.global_track_id("cam_a", 1);
        registry.global_track_id("cam_b", 1);
        assert_eq!(registry.binding_count(), 2);
        registry.remove_camera("cam_a");
        assert_eq!(registry.binding_count(), 1);
    }
}
