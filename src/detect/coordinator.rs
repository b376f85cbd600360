//! Hybrid perception: a class-aware detector with a drift-prone tracker behind it.

use anyhow::anyhow;
use serde::Deserialize;
use std::path::PathBuf;

use crate::detect::distance::DistanceEstimator;
use crate::detect::registry::SharedBackend;
use crate::detect::result::{Candidate, CandidateKind, Detection, DetectionSource};
use crate::detect::tracker::{TrackerSettings, VisualTracker};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerceptionSettings {
    /// Detector backend name ("color", "tract", "scripted"), or "auto" for the
    /// first class-aware backend with color as the fallback.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub model_input_size: u32,
    pub min_confidence: f32,
    pub color_min_area_px: u32,
    /// Below this last-known range the detector is unreliable and the tracker may
    /// stand in for it.
    pub near_threshold_cm: f32,
    pub distance: DistanceEstimator,
    pub tracker: TrackerSettings,
}

impl Default for PerceptionSettings {
    fn default() -> Self {
        Self {
            backend: "color".to_string(),
            model_path: None,
            labels_path: None,
            model_input_size: 640,
            min_confidence: 0.5,
            color_min_area_px: 500,
            near_threshold_cm: 15.0,
            distance: DistanceEstimator::default(),
            tracker: TrackerSettings::default(),
        }
    }
}

/// Result of one perception cycle.
#[derive(Clone, Debug, Default)]
pub struct PerceptionOutcome {
    /// Best detection for the current target, if any.
    pub primary: Option<Detection>,
    /// Every detector candidate that passed the label and confidence filters.
    pub candidates: Vec<Detection>,
}

#[derive(Clone, Debug)]
struct TrackAnchor {
    label: String,
    kind: CandidateKind,
    confidence: f32,
    distance_cm: Option<f32>,
    width_px: f32,
}

/// Fuses the detector with the fallback tracker.
///
/// Fresh detector evidence always wins and re-seeds the tracker. The tracker is
/// only consulted when the detector misses and the last known range is inside
/// the near threshold; any other miss discards the tracker session.
pub struct HybridPerception {
    detector: SharedBackend,
    tracker: Box<dyn VisualTracker>,
    estimator: DistanceEstimator,
    min_confidence: f32,
    near_threshold_cm: f32,
    target: Option<String>,
    last_known_distance: Option<f32>,
    anchor: Option<TrackAnchor>,
}

impl HybridPerception {
    pub fn new(
        detector: SharedBackend,
        tracker: Box<dyn VisualTracker>,
        settings: &PerceptionSettings,
    ) -> Self {
        Self {
            detector,
            tracker,
            estimator: settings.distance.clone(),
            min_confidence: settings.min_confidence,
            near_threshold_cm: settings.near_threshold_cm,
            target: None,
            last_known_distance: None,
            anchor: None,
        }
    }

    /// Restrict detections to `target` (case-insensitive). Clears all history.
    pub fn set_target(&mut self, target: Option<String>) {
        if self.target != target {
            log::info!("HybridPerception: target filter set to {:?}", target);
        }
        self.target = target;
        self.last_known_distance = None;
        self.anchor = None;
        self.tracker.reset();
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn last_known_distance(&self) -> Option<f32> {
        self.last_known_distance
    }

    pub fn tracker_active(&self) -> bool {
        self.tracker.is_active()
    }

    pub fn process(&mut self, frame: &Frame) -> PerceptionOutcome {
        let raw = match self.run_detector(frame) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("HybridPerception: detector failed on frame {}: {:#}", frame.seq, err);
                Vec::new()
            }
        };
        let mut matching: Vec<Candidate> = raw
            .into_iter()
            .filter(|c| c.confidence >= self.min_confidence)
            .filter(|c| {
                self.target
                    .as_deref()
                    .map_or(true, |t| c.label.eq_ignore_ascii_case(t))
            })
            .collect();
        matching.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let candidates: Vec<Detection> = matching
            .iter()
            .map(|c| {
                let distance = self.estimator.estimate(&c.label, c.bbox.w);
                Detection::from_candidate(c, frame.width, frame.height, distance, DetectionSource::Detector)
            })
            .collect();

        let primary = match matching.first() {
            Some(best) => Some(self.accept_detector_hit(frame, best, &candidates[0])),
            None => self.continue_tracker(frame),
        };

        PerceptionOutcome {
            primary,
            candidates,
        }
    }

    fn run_detector(&self, frame: &Frame) -> anyhow::Result<Vec<Candidate>> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        detector.detect(frame)
    }

    fn accept_detector_hit(&mut self, frame: &Frame, best: &Candidate, detection: &Detection) -> Detection {
        self.tracker.init(frame, best.bbox);
        let distance = detection.distance_cm();
        if distance.is_some() {
            self.last_known_distance = distance;
        }
        self.anchor = Some(TrackAnchor {
            label: best.label.clone(),
            kind: best.kind,
            confidence: best.confidence,
            distance_cm: distance.or(self.last_known_distance),
            width_px: best.bbox.w,
        });
        detection.clone()
    }

    fn continue_tracker(&mut self, frame: &Frame) -> Option<Detection> {
        let near = self
            .last_known_distance
            .map_or(false, |d| d < self.near_threshold_cm);
        if !near || !self.tracker.is_active() {
            if self.tracker.is_active() {
                log::debug!("HybridPerception: detector miss outside near zone, dropping tracker");
                self.tracker.reset();
            }
            return None;
        }
        let anchor = self.anchor.clone()?;

        let Some(bbox) = self.tracker.update(frame) else {
            log::info!(
                "HybridPerception: tracker failed to re-acquire {} (last known {:?} cm)",
                anchor.label,
                self.last_known_distance
            );
            self.tracker.reset();
            return None;
        };

        let distance = anchor
            .distance_cm
            .and_then(|d| DistanceEstimator::carry_by_scale(d, anchor.width_px, bbox.w));
        if distance.is_some() {
            self.last_known_distance = distance;
        }
        let candidate = Candidate {
            label: anchor.label,
            confidence: anchor.confidence,
            bbox,
            kind: anchor.kind,
        };
        Some(Detection::from_candidate(
            &candidate,
            frame.width,
            frame.height,
            distance,
            DetectionSource::Tracker,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{ScriptHandle, ScriptedBackend};
    use crate::detect::result::BBox;
    use crate::detect::tracker::TemplateTracker;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    /// Tracker double that always "finds" a fixed box and counts calls.
    struct FixedTracker {
        active: bool,
        bbox: Option<BBox>,
        inits: Arc<Mutex<u32>>,
    }

    impl VisualTracker for FixedTracker {
        fn init(&mut self, _frame: &Frame, _bbox: BBox) {
            self.active = true;
            if let Ok(mut n) = self.inits.lock() {
                *n += 1;
            }
        }
        fn update(&mut self, _frame: &Frame) -> Option<BBox> {
            self.bbox
        }
        fn reset(&mut self) {
            self.active = false;
        }
        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn perception(tracker: Box<dyn VisualTracker>) -> (HybridPerception, ScriptHandle) {
        let backend = ScriptedBackend::new(Vec::new());
        let script = backend.script();
        let shared: SharedBackend = Arc::new(Mutex::new(backend));
        let mut p = HybridPerception::new(shared, tracker, &PerceptionSettings::default());
        p.set_target(Some("cup".to_string()));
        (p, script)
    }

    fn cup(width: f32, confidence: f32) -> Candidate {
        Candidate::object("cup", confidence, BBox::centered(320.0, 240.0, width, width))
    }

    #[test]
    fn detector_hit_always_wins_over_active_tracker() -> Result<()> {
        let inits = Arc::new(Mutex::new(0));
        let tracker = FixedTracker {
            active: true,
            bbox: Some(BBox::new(0.0, 0.0, 500.0, 500.0)),
            inits: inits.clone(),
        };
        let (mut p, script) = perception(Box::new(tracker));
        let frame = Frame::filled(640, 480, [0, 0, 0])?;

        // 8cm cup at 1424px focal: 1424px wide is 8cm away.
        for width in [200.0, 600.0, 1424.0] {
            script.push(vec![cup(width, 0.8)])?;
            let out = p.process(&frame);
            let primary = out.primary.ok_or_else(|| anyhow!("no detection"))?;
            assert_eq!(primary.source(), DetectionSource::Detector);
            assert_eq!(primary.bbox().w, width);
        }
        assert_eq!(*inits.lock().map_err(|_| anyhow!("poisoned"))?, 3);
        Ok(())
    }

    #[test]
    fn tracker_covers_misses_only_inside_near_zone() -> Result<()> {
        let tracker = FixedTracker {
            active: false,
            bbox: Some(BBox::centered(300.0, 240.0, 1424.0 * 2.0, 100.0)),
            inits: Arc::new(Mutex::new(0)),
        };
        let (mut p, script) = perception(Box::new(tracker));
        let frame = Frame::filled(640, 480, [0, 0, 0])?;

        // Far away (80cm): a miss yields nothing and drops the tracker.
        script.push(vec![cup(142.4, 0.9)])?;
        assert!(p.process(&frame).primary.is_some());
        script.push(Vec::new())?;
        assert!(p.process(&frame).primary.is_none());
        assert!(!p.tracker_active());

        // Close (8cm): a miss is covered by the tracker with range carried by scale.
        script.push(vec![cup(1424.0, 0.9)])?;
        assert!(p.process(&frame).primary.is_some());
        script.push(Vec::new())?;
        let covered = p.process(&frame).primary.ok_or_else(|| anyhow!("tracker miss"))?;
        assert_eq!(covered.source(), DetectionSource::Tracker);
        assert_eq!(covered.label(), "cup");
        let d = covered.distance_cm().unwrap_or_default();
        assert!((d - 4.0).abs() < 1e-3, "carried distance {}", d);
        Ok(())
    }

    #[test]
    fn filters_by_label_and_confidence() -> Result<()> {
        let (mut p, script) = perception(Box::new(TemplateTracker::default()));
        let frame = Frame::filled(64, 48, [0, 0, 0])?;
        script.push(vec![
            Candidate::object("bottle", 0.99, BBox::new(0.0, 0.0, 10.0, 10.0)),
            cup(10.0, 0.3),
            cup(12.0, 0.6),
            cup(14.0, 0.7),
        ])?;
        let out = p.process(&frame);
        assert_eq!(out.candidates.len(), 2);
        let primary = out.primary.ok_or_else(|| anyhow!("no detection"))?;
        assert_eq!(primary.bbox().w, 14.0);
        Ok(())
    }
}
