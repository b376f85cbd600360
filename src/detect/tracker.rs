//! Class-agnostic fallback tracker.
//!
//! The tracker follows whatever appearance it was seeded with. It has no notion of
//! the target class and drifts over time, so the coordinator only consults it
//! inside the detector's close-range failure zone and re-seeds it on every fresh
//! detector hit.

use serde::Deserialize;

use crate::detect::result::BBox;
use crate::frame::Frame;

/// Tracker contract used by the hybrid coordinator.
pub trait VisualTracker: Send {
    /// Start a new session from `bbox` in `frame`, replacing any previous one.
    fn init(&mut self, frame: &Frame, bbox: BBox);

    /// Locate the target in `frame`. `None` means the tracker lost it; the session
    /// stays alive until `reset` so the caller decides when to discard it.
    fn update(&mut self, frame: &Frame) -> Option<BBox>;

    /// Discard the session.
    fn reset(&mut self);

    fn is_active(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerSettings {
    /// Template samples per side.
    pub grid: usize,
    /// Search window half-size as a fraction of the box size.
    pub search_fraction: f32,
    /// Candidate positions per side of the search window.
    pub search_steps: usize,
    /// Relative box scales tried at every position.
    pub scales: Vec<f32>,
    /// Mean absolute luma difference above which a match is rejected.
    pub max_mean_diff: f32,
    /// Weight of the newest appearance when refreshing the template.
    pub template_blend: f32,
    /// Boxes narrower than this are considered lost.
    pub min_box_px: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            grid: 16,
            search_fraction: 0.5,
            search_steps: 8,
            scales: vec![0.95, 1.0, 1.05],
            max_mean_diff: 28.0,
            template_blend: 0.2,
            min_box_px: 4.0,
        }
    }
}

/// Internal template state. Owned by the tracker only.
#[derive(Clone, Debug)]
struct TrackerSession {
    template: Vec<f32>,
    bbox: BBox,
}

/// Grid-sampled luma template matcher with a small multi-scale local search.
pub struct TemplateTracker {
    settings: TrackerSettings,
    session: Option<TrackerSession>,
}

impl TemplateTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    pub fn current_bbox(&self) -> Option<BBox> {
        self.session.as_ref().map(|s| s.bbox)
    }

    fn sample(&self, frame: &Frame, bbox: &BBox) -> Vec<f32> {
        let n = self.settings.grid.max(2);
        let mut out = Vec::with_capacity(n * n);
        for j in 0..n {
            let y = bbox.y + (j as f32 + 0.5) * bbox.h / n as f32;
            for i in 0..n {
                let x = bbox.x + (i as f32 + 0.5) * bbox.w / n as f32;
                out.push(frame.luma_at(x as i64, y as i64));
            }
        }
        out
    }

    fn score(template: &[f32], candidate: &[f32]) -> f32 {
        let total: f32 = template
            .iter()
            .zip(candidate)
            .map(|(a, b)| (a - b).abs())
            .sum();
        total / template.len().max(1) as f32
    }
}

impl Default for TemplateTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}

impl VisualTracker for TemplateTracker {
    fn init(&mut self, frame: &Frame, bbox: BBox) {
        let bbox = bbox.clamp_to(frame.width, frame.height);
        if bbox.w < self.settings.min_box_px || bbox.h < self.settings.min_box_px {
            self.session = None;
            return;
        }
        let template = self.sample(frame, &bbox);
        self.session = Some(TrackerSession { template, bbox });
    }

    fn update(&mut self, frame: &Frame) -> Option<BBox> {
        let session = self.session.as_ref()?;
        let prev = session.bbox;
        let (pcx, pcy) = prev.center();
        let steps = self.settings.search_steps.max(1) as i32;
        let reach_x = prev.w * self.settings.search_fraction;
        let reach_y = prev.h * self.settings.search_fraction;

        let mut best: Option<(f32, BBox)> = None;
        for &scale in &self.settings.scales {
            let w = prev.w * scale;
            let h = prev.h * scale;
            for sy in -steps..=steps {
                for sx in -steps..=steps {
                    let cx = pcx + reach_x * sx as f32 / steps as f32;
                    let cy = pcy + reach_y * sy as f32 / steps as f32;
                    let candidate = BBox::centered(cx, cy, w, h);
                    let score = Self::score(&session.template, &self.sample(frame, &candidate));
                    if best.map_or(true, |(s, _)| score < s) {
                        best = Some((score, candidate));
                    }
                }
            }
        }

        let (score, found) = best?;
        if score > self.settings.max_mean_diff {
            log::debug!("TemplateTracker: lost target (mean diff {:.1})", score);
            return None;
        }
        let found = found.clamp_to(frame.width, frame.height);
        if found.w < self.settings.min_box_px || found.h < self.settings.min_box_px {
            return None;
        }

        let fresh = self.sample(frame, &found);
        let alpha = self.settings.template_blend.clamp(0.0, 1.0);
        let session = self.session.as_mut()?;
        for (t, f) in session.template.iter_mut().zip(fresh) {
            *t = *t * (1.0 - alpha) + f * alpha;
        }
        session.bbox = found;
        Some(found)
    }

    fn reset(&mut self) {
        self.session = None;
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }
}
