use serde::Deserialize;
use std::collections::HashMap;

/// Pinhole-model range estimation from apparent width.
///
/// `distance = known_width_cm * focal_length_px / pixel_width`. Labels without a
/// configured width fall back to `default_width_cm` when one is set.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistanceEstimator {
    pub focal_length_px: f32,
    pub known_widths_cm: HashMap<String, f32>,
    pub default_width_cm: Option<f32>,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        let known_widths_cm = [
            ("cube", 4.0),
            ("bottle", 4.0),
            ("cup", 8.0),
            ("cell phone", 7.0),
            ("book", 15.0),
            ("mouse", 6.0),
            ("keyboard", 30.0),
        ]
        .into_iter()
        .map(|(label, width)| (label.to_string(), width))
        .collect();
        Self {
            focal_length_px: 1424.0,
            known_widths_cm,
            // Color mode targets are the 4cm cubes.
            default_width_cm: Some(4.0),
        }
    }
}

impl DistanceEstimator {
    pub fn known_width(&self, label: &str) -> Option<f32> {
        self.known_widths_cm
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(label))
            .map(|(_, width)| *width)
            .or(self.default_width_cm)
    }

    /// Estimated range in centimetres, or `None` when the width is unknown or degenerate.
    pub fn estimate(&self, label: &str, pixel_width: f32) -> Option<f32> {
        if !is_positive(pixel_width) || !is_positive(self.focal_length_px) {
            return None;
        }
        let width = self.known_width(label)?;
        Some(width * self.focal_length_px / pixel_width)
    }

    /// Carry a reference range to a new apparent width of the same object.
    pub fn carry_by_scale(reference_cm: f32, reference_px: f32, pixel_width: f32) -> Option<f32> {
        if !is_positive(reference_px) || !is_positive(pixel_width) {
            return None;
        }
        Some(reference_cm * reference_px / pixel_width)
    }
}

fn is_positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}
