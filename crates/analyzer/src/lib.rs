//! Rule-based behavior analysis
//!
//! Consumes tracker output for one camera and produces structured behavior
//! events: ROI membership on the representative point, dwell-time intrusion
//! rules, overlap conflict resolution by priority and time window, and
//! cross-camera identity through the manager's registry.
//!
//! All analyzer mutation happens under the owning pipeline's lock; ROI and
//! rule CRUD are serialized against frame processing by the same lock.

pub mod roi;

pub use roi::{parse_time_of_day, Roi, TimeWindow};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use visionguard_common::{
    AnalyticsError, BehaviorEvent, Clock, Point, Result,
};
use visionguard_tracker::{Track, TrackState};

/// Trajectory ring capacity per object
const TRAJECTORY_CAP: usize = 100;

/// Objects unseen for this long are pruned from analyzer state
const OBJECT_PRUNE_MS: i64 = 30_000;

/// An ROI plus a dwell threshold that emits an event when satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrusionRule {
    pub id: String,
    /// The ROI this rule watches
    pub roi_id: String,
    /// Continuous dwell required before the event fires, in seconds
    pub min_duration_secs: f32,
    /// Confidence stamped on emitted events
    pub confidence: f32,
    pub enabled: bool,
}

impl IntrusionRule {
    #[must_use]
    pub fn new(id: &str, roi_id: &str, min_duration_secs: f32) -> Self {
        Self {
            id: id.to_string(),
            roi_id: roi_id.to_string(),
            min_duration_secs,
            confidence: 0.7,
            enabled: true,
        }
    }
}

/// One cross-camera appearance match candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub camera_id: String,
    pub local_track_id: u64,
    pub global_track_id: u64,
    pub similarity: f32,
}

/// Capability handle into the manager's global identity registry. The
/// analyzer holds this by `Arc` only; pipelines never own the manager.
pub trait IdentityResolver: Send + Sync {
    /// Stable global id for a camera-local track; allocates on first query.
    fn global_track_id(&self, camera_id: &str, local_track_id: u64) -> u64;

    /// Match the feature against recently-active entries from all cameras;
    /// inherits an existing global id above the similarity threshold or
    /// allocates a new one. Returns the id plus the candidate matches.
    fn bind_by_feature(
        &self,
        camera_id: &str,
        local_track_id: u64,
        feature: &[f32],
        timestamp_ms: i64,
    ) -> (u64, Vec<IdentityMatch>);
}

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Objects narrower than this are ignored (pixels)
    pub min_object_width: f32,
    /// Objects shorter than this are ignored (pixels)
    pub min_object_height: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_object_width: 20.0,
            min_object_height: 20.0,
        }
    }
}

/// Per-rule dwell bookkeeping.
#[derive(Debug, Clone)]
struct RuleDwell {
    entered_ms: i64,
    /// Set after emission; suppresses re-fire until exit + re-entry
    fired: bool,
}

/// Per-object analyzer state.
#[derive(Debug, Clone)]
pub struct ObjectState {
    pub track_id: u64,
    pub position: Point,
    pub velocity: (f32, f32),
    /// Bounded history of (timestamp_ms, representative point)
    pub trajectory: VecDeque<(i64, Point)>,
    /// First-entry timestamp per ROI id
    pub roi_entry_ms: HashMap<String, i64>,
    rule_dwell: HashMap<String, RuleDwell>,
    pub global_id: Option<u64>,
    pub matches: Vec<IdentityMatch>,
    pub last_seen_ms: i64,
}

impl ObjectState {
    fn new(track_id: u64) -> Self {
        Self {
            track_id,
            position: Point::new(0.0, 0.0),
            velocity: (0.0, 0.0),
            trajectory: VecDeque::with_capacity(TRAJECTORY_CAP),
            roi_entry_ms: HashMap::new(),
            rule_dwell: HashMap::new(),
            global_id: None,
            matches: Vec::new(),
            last_seen_ms: 0,
        }
    }

    fn push_trajectory(&mut self, timestamp_ms: i64, point: Point) {
        if self.trajectory.len() >= TRAJECTORY_CAP {
            self.trajectory.pop_front();
        }
        self.trajectory.push_back((timestamp_ms, point));
    }
}

/// How an overlapping-ROI conflict was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictResolution {
    Single,
    Priority,
    TimeWindow,
    LexicographicId,
}

impl ConflictResolution {
    fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Single => "single",
            ConflictResolution::Priority => "priority",
            ConflictResolution::TimeWindow => "time_window",
            ConflictResolution::LexicographicId => "lexicographic_id",
        }
    }
}

/// Per-camera behavior analyzer.
pub struct BehaviorAnalyzer {
    camera_id: String,
    config: AnalyzerConfig,
    clock: Arc<dyn Clock>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    rois: Vec<Roi>,
    rules: Vec<IntrusionRule>,
    objects: HashMap<u64, ObjectState>,
    events_emitted: u64,
}

impl BehaviorAnalyzer {
    #[must_use]
    pub fn new(camera_id: &str, config: AnalyzerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            config,
            clock,
            resolver: None,
            rois: Vec::new(),
            rules: Vec::new(),
            objects: HashMap::new(),
            events_emitted: 0,
        }
    }

    /// Attach the global identity registry capability.
    pub fn set_resolver(&mut self, resolver: Arc<dyn IdentityResolver>) {
        self.resolver = Some(resolver);
    }

    /// Add or replace a ROI. Invalid polygons and priorities are rejected;
    /// unparseable time windows are accepted and logged as always-active.
    pub fn add_roi(&mut self, roi: Roi) -> Result<()> {
        roi.validate()?;
        if roi.time_window() == TimeWindow::Invalid {
            warn!(
                "ROI '{}' on camera {} has an invalid time window; treating as always active",
                roi.id, self.camera_id
            );
        }
        match self.rois.iter_mut().find(|existing| existing.id == roi.id) {
            Some(existing) => *existing = roi,
            None => self.rois.push(roi),
        }
        Ok(())
    }

    pub fn remove_roi(&mut self, roi_id: &str) -> bool {
        let before = self.rois.len();
        self.rois.retain(|roi| roi.id != roi_id);
        for object in self.objects.values_mut() {
            object.roi_entry_ms.remove(roi_id);
        }
        self.rois.len() != before
    }

    /// Add or replace an intrusion rule. The referenced ROI must exist.
    pub fn add_rule(&mut self, rule: IntrusionRule) -> Result<()> {
        if !self.rois.iter().any(|roi| roi.id == rule.roi_id) {
            return Err(AnalyticsError::InvalidConfig(format!(
                "rule '{}' references unknown ROI '{}'",
                rule.id, rule.roi_id
            )));
        }
        match self.rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != rule_id);
        for object in self.objects.values_mut() {
            object.rule_dwell.remove(rule_id);
        }
        self.rules.len() != before
    }

    #[must_use]
    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    #[must_use]
    pub fn rules(&self) -> &[IntrusionRule] {
        &self.rules
    }

    /// Visualization-path access to per-object state.
    #[must_use]
    pub fn object_state(&self, track_id: u64) -> Option<&ObjectState> {
        self.objects.get(&track_id)
    }

    #[must_use]
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }

    /// Drop state for a removed track.
    pub fn remove_object(&mut self, track_id: u64) {
        self.objects.remove(&track_id);
    }

    /// Process one frame's tracks and emit any satisfied intrusion events.
    ///
    /// `timestamp_ms` is the frame capture timestamp; wall-clock time-of-day
    /// gating reads the injected clock.
    pub fn process_tracks(&mut self, tracks: &[Track], timestamp_ms: i64) -> Vec<BehaviorEvent> {
        let time_of_day = self.clock.time_of_day();
        let mut events = Vec::new();

        for track in tracks {
            if track.state != TrackState::Tracked {
                continue;
            }
            // Sub-minimum-size objects are not tracked by the analyzer
            if track.bbox.width < self.config.min_object_width
                || track.bbox.height < self.config.min_object_height
            {
                continue;
            }

            let point = track.bbox.bottom_center();
            let state = self
                .objects
                .entry(track.id)
                .or_insert_with(|| ObjectState::new(track.id));
            state.position = point;
            state.velocity = track.velocity;
            state.last_seen_ms = timestamp_ms;
            state.push_trajectory(timestamp_ms, point);

            // Currently-active ROIs containing the representative point
            let containing: Vec<usize> = self
                .rois
                .iter()
                .enumerate()
                .filter(|(_, roi)| roi.is_active_at(time_of_day) && roi.contains(point))
                .map(|(index, _)| index)
                .collect();

            // Exit clears entry stamps and dwell state for departed ROIs
            let containing_ids: HashSet<&str> = containing
                .iter()
                .map(|&index| self.rois[index].id.as_str())
                .collect();
            state
                .roi_entry_ms
                .retain(|roi_id, _| containing_ids.contains(roi_id.as_str()));
            let rules = &self.rules;
            state.rule_dwell.retain(|rule_id, _| {
                rules
                    .iter()
                    .find(|rule| &rule.id == rule_id)
                    .map(|rule| containing_ids.contains(rule.roi_id.as_str()))
                    .unwrap_or(false)
            });

            if containing.is_empty() {
                continue;
            }

            // Record first-entry stamps for every containing ROI
            for &index in &containing {
                let roi_id = self.rois[index].id.clone();
                state.roi_entry_ms.entry(roi_id).or_insert(timestamp_ms);
            }

            let (selected_index, resolution) = Self::resolve_conflict(&self.rois, &containing);
            let selected = &self.rois[selected_index];

            // Cross-camera identity: bind by appearance when a feature is
            // available, otherwise just resolve the stable id.
            if let Some(resolver) = &self.resolver {
                match &track.feature {
                    Some(feature) => {
                        let (global_id, matches) = resolver.bind_by_feature(
                            &self.camera_id,
                            track.id,
                            feature,
                            timestamp_ms,
                        );
                        state.global_id = Some(global_id);
                        state.matches = matches;
                    }
                    None => {
                        if state.global_id.is_none() {
                            state.global_id =
                                Some(resolver.global_track_id(&self.camera_id, track.id));
                        }
                    }
                }
            }

            // A ROI shadowed by a higher-priority selection accumulates no
            // dwell: its rules' entry stamps slide forward every frame it
            // stays unselected, so dwell restarts at reselection.
            for rule in self.rules.iter().filter(|rule| {
                rule.enabled
                    && rule.roi_id != selected.id
                    && containing_ids.contains(rule.roi_id.as_str())
            }) {
                if let Some(dwell) = state.rule_dwell.get_mut(&rule.id) {
                    dwell.entered_ms = timestamp_ms;
                }
            }

            // Dwell evaluation for the selected ROI's enabled rules. One ROI
            // is selected per object per frame, so overlapping rules on
            // other ROIs cannot double-fire.
            for rule in self.rules.iter().filter(|rule| {
                rule.enabled && rule.roi_id == selected.id
            }) {
                let dwell = state
                    .rule_dwell
                    .entry(rule.id.clone())
                    .or_insert(RuleDwell {
                        entered_ms: timestamp_ms,
                        fired: false,
                    });
                if dwell.fired {
                    continue;
                }
                let dwell_ms = timestamp_ms - dwell.entered_ms;
                if dwell_ms < (rule.min_duration_secs * 1000.0) as i64 {
                    continue;
                }

                dwell.fired = true;
                // Entry stamp for this rule's ROI clears on emission
                state.roi_entry_ms.remove(&selected.id);

                let mut metadata = BTreeMap::new();
                metadata.insert(
                    "duration".to_string(),
                    format!("{:.1}s", dwell_ms as f64 / 1000.0),
                );
                metadata.insert("roi".to_string(), selected.name.clone());
                metadata.insert(
                    "selected_priority".to_string(),
                    selected.priority.to_string(),
                );
                metadata.insert("resolution".to_string(), resolution.as_str().to_string());
                if containing.len() > 1 {
                    let listing = containing
                        .iter()
                        .map(|&index| {
                            let roi = &self.rois[index];
                            format!("{} (P{})", roi.id, roi.priority)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    metadata.insert("conflicting_rois".to_string(), listing);
                }

                let event = BehaviorEvent {
                    event_type: "intrusion".to_string(),
                    rule_id: rule.id.clone(),
                    object_id: track.id,
                    global_identity: state.global_id.map(|id| id.to_string()),
                    camera_id: self.camera_id.clone(),
                    bbox: track.bbox,
                    confidence: rule.confidence,
                    timestamp_ms,
                    metadata,
                };
                debug!(
                    "Intrusion: camera {} object {} rule {} after {:.1}s",
                    self.camera_id,
                    track.id,
                    rule.id,
                    dwell_ms as f64 / 1000.0
                );
                self.events_emitted += 1;
                events.push(event);
            }
        }

        self.prune_stale_objects(timestamp_ms);
        events
    }

    /// Pick one ROI from the containing set: highest priority, then explicit
    /// time window beats none, then lexicographic id.
    fn resolve_conflict(rois: &[Roi], containing: &[usize]) -> (usize, ConflictResolution) {
        debug_assert!(!containing.is_empty());
        if containing.len() == 1 {
            return (containing[0], ConflictResolution::Single);
        }

        let mut ordered: Vec<usize> = containing.to_vec();
        ordered.sort_by(|&a, &b| {
            let (roi_a, roi_b) = (&rois[a], &rois[b]);
            roi_b
                .priority
                .cmp(&roi_a.priority)
                .then(roi_b.has_explicit_window().cmp(&roi_a.has_explicit_window()))
                .then(roi_a.id.cmp(&roi_b.id))
        });

        let winner = ordered[0];
        let runner_up = ordered[1];
        let resolution = if rois[winner].priority != rois[runner_up].priority {
            ConflictResolution::Priority
        } else if rois[winner].has_explicit_window() != rois[runner_up].has_explicit_window() {
            ConflictResolution::TimeWindow
        } else {
            ConflictResolution::LexicographicId
        };
        (winner, resolution)
    }

    fn prune_stale_objects(&mut self, timestamp_ms: i64) {
        let before = self.objects.len();
        self.objects
            .retain(|_, object| timestamp_ms - object.last_seen_ms <= OBJECT_PRUNE_MS);
        let pruned = before - self.objects.len();
        if pruned > 0 {
            info!(
                "Pruned {pruned} stale analyzer objects on camera {}",
                self.camera_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visionguard_common::{BBox, ManualClock};

    /// A tracked person whose bbox bottom-center is at (x, y).
    fn tracked(id: u64, x: f32, y: f32) -> Track {
        Track {
            id,
            class_id: 0,
            class_name: "person".to_string(),
            bbox: BBox::new(x - 25.0, y - 100.0, 50.0, 100.0),
            velocity: (0.0, 0.0),
            state: TrackState::Tracked,
            age: 10,
            hits: 10,
            frames_since_update: 0,
            confidence: 0.9,
            feature: None,
        }
    }

    fn analyzer_at_noon() -> BehaviorAnalyzer {
        let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
        BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock)
    }

    fn default_zone() -> Roi {
        Roi::rectangle("default_zone", 100.0, 100.0, 500.0, 400.0, 3)
    }

    #[test]
    fn test_intrusion_happy_path() {
        // One ROI, minDuration = 5s, detection every 100ms for 6s: exactly
        // one event, at ~5s, with the dwell duration in the metadata.
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("default_intrusion", "default_zone", 5.0))
            .unwrap();

        let mut events = Vec::new();
        for step in 0..60 {
            let timestamp_ms = step * 100;
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms));
        }

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, "intrusion");
        assert_eq!(event.rule_id, "default_intrusion");
        assert!((event.confidence - 0.7).abs() < 1e-6);
        assert!((event.timestamp_ms - 5000).abs() <= 200);
        let duration = event.metadata.get("duration").unwrap();
        assert!(duration.starts_with("5.0") || duration.starts_with("5.1"), "{duration}");
    }

    #[test]
    fn test_no_event_before_min_duration() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("default_intrusion", "default_zone", 5.0))
            .unwrap();

        for step in 0..40 {
            let events = analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], step * 100);
            assert!(events.is_empty(), "fired early at {}ms", step * 100);
        }
    }

    #[test]
    fn test_refire_requires_exit_and_reentry() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule", "default_zone", 1.0))
            .unwrap();

        let mut timestamp_ms = 0;
        let mut total = 0usize;
        // Dwell long past the threshold: exactly one event
        for _ in 0..50 {
            total += analyzer
                .process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms)
                .len();
            timestamp_ms += 100;
        }
        assert_eq!(total, 1);

        // Leave the zone, then come back and dwell again
        for _ in 0..5 {
            analyzer.process_tracks(&[tracked(1, 50.0, 250.0)], timestamp_ms);
            timestamp_ms += 100;
        }
        for _ in 0..15 {
            total += analyzer
                .process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms)
                .len();
            timestamp_ms += 100;
        }
        assert_eq!(total, 2);
    }

    #[test]
    fn test_overlap_resolved_by_priority() {
        let mut analyzer = analyzer_at_noon();
        let mut roi_a = Roi::rectangle("roi_a", 100.0, 100.0, 500.0, 400.0, 2);
        roi_a.name = "roi_a".into();
        let mut roi_b = Roi::rectangle("roi_b", 150.0, 150.0, 450.0, 350.0, 5);
        roi_b.name = "roi_b".into();
        analyzer.add_roi(roi_a).unwrap();
        analyzer.add_roi(roi_b).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_a", "roi_a", 1.0))
            .unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_b", "roi_b", 1.0))
            .unwrap();

        let mut events = Vec::new();
        for step in 0..20 {
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], step * 100));
        }

        // Only the high-priority ROI's rule fires
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.rule_id, "rule_b");
        assert_eq!(event.metadata.get("selected_priority").unwrap(), "5");
        assert_eq!(event.metadata.get("resolution").unwrap(), "priority");
        let conflicts = event.metadata.get("conflicting_rois").unwrap();
        assert!(conflicts.contains("roi_a (P2)"), "{conflicts}");
        assert!(conflicts.contains("roi_b (P5)"), "{conflicts}");
    }

    #[test]
    fn test_shadowed_roi_accumulates_no_dwell() {
        // ROI_A is shadowed mid-dwell by a higher-priority windowed ROI;
        // the shadowed interval must not count toward A's dwell, and the
        // dwell restarts when A regains selection.
        let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
        let mut analyzer =
            BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock.clone());

        let roi_a = Roi::rectangle("roi_a", 100.0, 100.0, 500.0, 400.0, 2);
        let mut roi_b = Roi::rectangle("roi_b", 100.0, 100.0, 500.0, 400.0, 5);
        roi_b.start_time = Some("13:00".into());
        roi_b.end_time = Some("14:00".into());
        analyzer.add_roi(roi_a).unwrap();
        analyzer.add_roi(roi_b).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_a", "roi_a", 2.5))
            .unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_b", "roi_b", 60.0))
            .unwrap();

        let mut events = Vec::new();
        let mut timestamp_ms = 0;
        // A selected, dwell building but below the 2.5s threshold
        for _ in 0..20 {
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms));
            timestamp_ms += 100;
        }
        assert!(events.is_empty());

        // B's window opens: A is shadowed for one second
        clock.set_time_of_day(13, 30);
        for _ in 0..10 {
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms));
            timestamp_ms += 100;
        }
        assert!(events.is_empty());

        // Window closes, A reselected: the pre-shadow dwell is not credited,
        // so the rule fires ~2.5s after reselection, not immediately
        clock.set_time_of_day(12, 0);
        let reselected_ms = timestamp_ms;
        for _ in 0..30 {
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms));
            timestamp_ms += 100;
        }
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.rule_id, "rule_a");
        assert!(
            event.timestamp_ms - reselected_ms >= 2400,
            "fired {}ms after reselection",
            event.timestamp_ms - reselected_ms
        );
        let duration = event.metadata.get("duration").unwrap();
        let value: f64 = duration.trim_end_matches('s').parse().unwrap();
        assert!((value - 2.5).abs() <= 0.2, "duration {duration}");
    }

    #[test]
    fn test_equal_priority_tie_breaks_on_window_then_id() {
        let mut analyzer = analyzer_at_noon();
        let mut windowed = Roi::rectangle("windowed", 100.0, 100.0, 500.0, 400.0, 3);
        windowed.start_time = Some("00:00".into());
        windowed.end_time = Some("23:59".into());
        let plain = Roi::rectangle("plain", 100.0, 100.0, 500.0, 400.0, 3);
        analyzer.add_roi(plain).unwrap();
        analyzer.add_roi(windowed).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_w", "windowed", 0.5))
            .unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule_p", "plain", 0.5))
            .unwrap();

        let mut events = Vec::new();
        for step in 0..10 {
            events.extend(analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], step * 100));
        }
        assert_eq!(events.len(), 1);
        // More specific (explicitly windowed) ROI wins the tie
        assert_eq!(events[0].rule_id, "rule_w");
        assert_eq!(events[0].metadata.get("resolution").unwrap(), "time_window");
    }

    #[test]
    fn test_night_window_gates_events() {
        let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
        let mut analyzer =
            BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock.clone());
        let mut zone = default_zone();
        zone.start_time = Some("22:00".into());
        zone.end_time = Some("06:00".into());
        analyzer.add_roi(zone).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("night_rule", "default_zone", 1.0))
            .unwrap();

        // At noon the window is closed: no events however long the dwell
        let mut timestamp_ms = 0;
        for _ in 0..30 {
            let events = analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms);
            assert!(events.is_empty());
            timestamp_ms += 100;
        }

        // After dark the same stream fires
        clock.set_time_of_day(23, 0);
        let mut total = 0usize;
        for _ in 0..30 {
            total += analyzer
                .process_tracks(&[tracked(1, 300.0, 250.0)], timestamp_ms)
                .len();
            timestamp_ms += 100;
        }
        assert_eq!(total, 1);
    }

    #[test]
    fn test_small_objects_ignored() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule", "default_zone", 0.5))
            .unwrap();

        let mut tiny = tracked(1, 300.0, 250.0);
        tiny.bbox = BBox::new(295.0, 245.0, 10.0, 10.0);
        for step in 0..30 {
            let events = analyzer.process_tracks(&[tiny.clone()], step * 100);
            assert!(events.is_empty());
        }
        assert!(analyzer.object_state(1).is_none());
    }

    #[test]
    fn test_rule_against_unknown_roi_rejected() {
        let mut analyzer = analyzer_at_noon();
        let err = analyzer
            .add_rule(IntrusionRule::new("rule", "nope", 1.0))
            .unwrap_err();
        assert_eq!(err.code(), "E_CFG_INVALID");
    }

    #[test]
    fn test_trajectory_capped() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        for step in 0..250 {
            analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], step * 100);
        }
        let state = analyzer.object_state(1).unwrap();
        assert_eq!(state.trajectory.len(), TRAJECTORY_CAP);
    }

    #[test]
    fn test_trajectory_covers_dwell_interval() {
        // The emitting object's trajectory includes an in-ROI point at
        // event.ts - min_duration.
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule", "default_zone", 2.0))
            .unwrap();

        let mut fired_at = None;
        for step in 0..40 {
            let events = analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], step * 100);
            if let Some(event) = events.first() {
                fired_at = Some(event.timestamp_ms);
                break;
            }
        }
        let fired_at = fired_at.expect("event fired");
        let state = analyzer.object_state(1).unwrap();
        let target = fired_at - 2000;
        let zone = default_zone();
        assert!(state
            .trajectory
            .iter()
            .any(|&(ts, p)| ts == target && zone.contains(p)));
    }

    #[test]
    fn test_stale_objects_pruned() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer.process_tracks(&[tracked(1, 300.0, 250.0)], 0);
        assert!(analyzer.object_state(1).is_some());

        // Far-future frame from another object prunes the stale state
        analyzer.process_tracks(&[tracked(2, 300.0, 250.0)], OBJECT_PRUNE_MS + 1000);
        assert!(analyzer.object_state(1).is_none());
        assert!(analyzer.object_state(2).is_some());
    }

    #[test]
    fn test_lost_tracks_do_not_analyze() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        analyzer
            .add_rule(IntrusionRule::new("rule", "default_zone", 0.0))
            .unwrap();
        let mut track = tracked(1, 300.0, 250.0);
        track.state = TrackState::Lost;
        let events = analyzer.process_tracks(&[track], 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_roi_crud_replaces_and_removes() {
        let mut analyzer = analyzer_at_noon();
        analyzer.add_roi(default_zone()).unwrap();
        assert_eq!(analyzer.rois().len(), 1);

        // Replacing by id keeps a single entry
        let mut replacement = default_zone();
        replacement.priority = 5;
        analyzer.add_roi(replacement).unwrap();
        assert_eq!(analyzer.rois().len(), 1);
        assert_eq!(analyzer.rois()[0].priority, 5);

        assert!(analyzer.remove_roi("default_zone"));
        assert!(!analyzer.remove_roi("default_zone"));
        assert!(analyzer.rois().is_empty());
    }
}
