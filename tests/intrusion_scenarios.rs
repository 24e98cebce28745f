//! End-to-end intrusion scenarios: synthetic detections through the tracker
//! and behavior analyzer.

use std::sync::Arc;
use visionguard_analyzer::{AnalyzerConfig, BehaviorAnalyzer, IntrusionRule, Roi};
use visionguard_common::{BBox, BehaviorEvent, Detection, ManualClock};
use visionguard_tracker::{Tracker, TrackerConfig};

/// A person detection whose bbox center is (300, 250).
fn person_detection() -> Detection {
    Detection::new(0, "person", 0.9, BBox::new(275.0, 200.0, 50.0, 100.0))
}

fn analyzer_with_zone(clock: Arc<ManualClock>) -> BehaviorAnalyzer {
    let mut analyzer = BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock);
    analyzer
        .add_roi(Roi {
            id: "default_zone".to_string(),
            name: "default_zone".to_string(),
            polygon: vec![
                visionguard_common::Point::new(100.0, 100.0),
                visionguard_common::Point::new(500.0, 100.0),
                visionguard_common::Point::new(500.0, 400.0),
                visionguard_common::Point::new(100.0, 400.0),
            ],
            enabled: true,
            priority: 3,
            start_time: None,
            end_time: None,
        })
        .unwrap();
    analyzer
        .add_rule(IntrusionRule::new("default_intrusion", "default_zone", 5.0))
        .unwrap();
    analyzer
}

/// Feed the detection stream at 100 ms intervals for `seconds`, collecting
/// emitted events.
fn run_stream(
    tracker: &mut Tracker,
    analyzer: &mut BehaviorAnalyzer,
    seconds: f64,
) -> Vec<BehaviorEvent> {
    let mut events = Vec::new();
    let steps = (seconds * 10.0) as i64;
    for step in 0..steps {
        let timestamp_ms = step * 100;
        let tracks = tracker.update(&[person_detection()]);
        for removed in tracker.take_removed() {
            analyzer.remove_object(removed.id);
        }
        events.extend(analyzer.process_tracks(&tracks, timestamp_ms));
    }
    events
}

#[test]
fn s1_intrusion_happy_path() {
    let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
    let mut tracker = Tracker::new(TrackerConfig::default());
    let mut analyzer = analyzer_with_zone(clock);

    let events = run_stream(&mut tracker, &mut analyzer, 6.0);

    assert_eq!(events.len(), 1, "exactly one event expected");
    let event = &events[0];
    assert_eq!(event.event_type, "intrusion");
    assert_eq!(event.rule_id, "default_intrusion");
    assert_eq!(event.camera_id, "cam1");
    assert!((event.confidence - 0.7).abs() < 1e-6);
    // Fires at ~5 s (the track confirms one frame in)
    assert!(
        (event.timestamp_ms - 5000).abs() <= 200,
        "fired at {} ms",
        event.timestamp_ms
    );
    let duration = event.metadata.get("duration").expect("duration metadata");
    let value: f64 = duration.trim_end_matches('s').parse().unwrap();
    assert!((value - 5.0).abs() <= 0.2, "duration {duration}");
}

#[test]
fn s2_overlap_priority() {
    let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
    let mut tracker = Tracker::new(TrackerConfig::default());
    let mut analyzer = BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock);

    let mut roi_a = Roi::rectangle("roi_a", 100.0, 100.0, 500.0, 400.0, 2);
    roi_a.name = "roi_a".to_string();
    let mut roi_b = Roi::rectangle("roi_b", 120.0, 120.0, 480.0, 380.0, 5);
    roi_b.name = "roi_b".to_string();
    analyzer.add_roi(roi_a).unwrap();
    analyzer.add_roi(roi_b).unwrap();
    analyzer
        .add_rule(IntrusionRule::new("rule_a", "roi_a", 5.0))
        .unwrap();
    analyzer
        .add_rule(IntrusionRule::new("rule_b", "roi_b", 5.0))
        .unwrap();

    let events = run_stream(&mut tracker, &mut analyzer, 6.0);

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.rule_id, "rule_b");
    assert_eq!(event.metadata.get("selected_priority").unwrap(), "5");
    let conflicts = event.metadata.get("conflicting_rois").unwrap();
    assert!(conflicts.contains("roi_a (P2)"), "{conflicts}");
    assert!(conflicts.contains("roi_b (P5)"), "{conflicts}");
}

#[test]
fn s3_time_window_gates_by_wall_clock() {
    let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
    let mut tracker = Tracker::new(TrackerConfig::default());
    let mut analyzer = BehaviorAnalyzer::new("cam1", AnalyzerConfig::default(), clock.clone());

    let mut zone = Roi::rectangle("night_zone", 100.0, 100.0, 500.0, 400.0, 3);
    zone.start_time = Some("22:00".to_string());
    zone.end_time = Some("06:00".to_string());
    analyzer.add_roi(zone).unwrap();
    analyzer
        .add_rule(IntrusionRule::new("night_rule", "night_zone", 5.0))
        .unwrap();

    // At noon the schedule keeps the zone inactive: no events
    let events = run_stream(&mut tracker, &mut analyzer, 6.0);
    assert!(events.is_empty(), "no event expected at 12:00");

    // After the fakeclock advance to 23:00 the same stream fires
    clock.set_time_of_day(23, 0);
    let events = run_stream(&mut tracker, &mut analyzer, 6.0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, "night_rule");
}

#[test]
fn events_survive_the_sink_format() {
    // Property 8 at the scenario level: an emitted event serialized through
    // the sink format decodes identically.
    let clock = Arc::new(ManualClock::starting_at_time(12, 0, 0));
    let mut tracker = Tracker::new(TrackerConfig::default());
    let mut analyzer = analyzer_with_zone(clock);

    let events = run_stream(&mut tracker, &mut analyzer, 6.0);
    assert_eq!(events.len(), 1);

    let encoded = serde_json::to_string(&events[0]).unwrap();
    let decoded: BehaviorEvent = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, events[0]);
}
