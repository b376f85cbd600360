use anyhow::Result;
use serde::Deserialize;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BBox, Candidate};
use crate::frame::Frame;

/// HSV bounds on the 0-180 hue / 0-255 saturation and value scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct HsvRange {
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl HsvRange {
    pub const fn new(low: [u8; 3], high: [u8; 3]) -> Self {
        Self { low, high }
    }

    fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| hsv[i] >= self.low[i] && hsv[i] <= self.high[i])
    }
}

/// A named color made of one or more hue bands (red wraps around 0).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ColorClass {
    pub name: String,
    pub ranges: Vec<HsvRange>,
}

impl ColorClass {
    fn matches(&self, hsv: [u8; 3]) -> bool {
        self.ranges.iter().any(|range| range.contains(hsv))
    }
}

pub fn default_color_classes() -> Vec<ColorClass> {
    vec![
        ColorClass {
            name: "red".to_string(),
            ranges: vec![
                HsvRange::new([0, 120, 70], [10, 255, 255]),
                HsvRange::new([170, 120, 70], [180, 255, 255]),
            ],
        },
        ColorClass {
            name: "blue".to_string(),
            ranges: vec![HsvRange::new([94, 80, 2], [126, 255, 255])],
        },
        ColorClass {
            name: "green".to_string(),
            ranges: vec![HsvRange::new([25, 52, 72], [102, 255, 255])],
        },
        ColorClass {
            name: "yellow".to_string(),
            ranges: vec![HsvRange::new([20, 100, 100], [30, 255, 255])],
        },
    ]
}

/// Color segmentation backend.
///
/// Thresholds every pixel against each color class, then reports the connected
/// components (4-neighbourhood) whose area reaches `min_area_px`. Confidence is the
/// fraction of the component's bounding box covered by the mask.
pub struct ColorBackend {
    classes: Vec<ColorClass>,
    min_area_px: u32,
}

impl ColorBackend {
    pub fn new(classes: Vec<ColorClass>, min_area_px: u32) -> Self {
        Self {
            classes,
            min_area_px,
        }
    }

    fn components(&self, mask: &[bool], width: usize, height: usize) -> Vec<(BBox, u32)> {
        let mut visited = vec![false; mask.len()];
        let mut stack = Vec::new();
        let mut found = Vec::new();
        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let (mut x0, mut y0, mut x1, mut y1) = (width, height, 0usize, 0usize);
            let mut count = 0u32;
            while let Some(idx) = stack.pop() {
                let (x, y) = (idx % width, idx / width);
                count += 1;
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
                let mut visit = |n: usize| {
                    if mask[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(idx - 1);
                }
                if x + 1 < width {
                    visit(idx + 1);
                }
                if y > 0 {
                    visit(idx - width);
                }
                if y + 1 < height {
                    visit(idx + width);
                }
            }
            if count >= self.min_area_px {
                let bbox = BBox::new(
                    x0 as f32,
                    y0 as f32,
                    (x1 - x0 + 1) as f32,
                    (y1 - y0 + 1) as f32,
                );
                found.push((bbox, count));
            }
        }
        found
    }
}

impl Default for ColorBackend {
    fn default() -> Self {
        Self::new(default_color_classes(), 500)
    }
}

impl DetectorBackend for ColorBackend {
    fn name(&self) -> &'static str {
        "color"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ColorSegmentation)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let hsv: Vec<[u8; 3]> = frame
            .pixels()
            .chunks_exact(3)
            .map(|px| rgb_to_hsv([px[0], px[1], px[2]]))
            .collect();

        let mut candidates = Vec::new();
        for class in &self.classes {
            let mask: Vec<bool> = hsv.iter().map(|&p| class.matches(p)).collect();
            for (bbox, count) in self.components(&mask, width, height) {
                let fill = (count as f32 / bbox.area()).min(1.0);
                candidates.push(Candidate::color(&class.name, fill, bbox));
            }
        }
        candidates.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));
        Ok(candidates)
    }
}

/// RGB to HSV with hue halved into 0..=180.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(|c| c as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = max - min;
    let s = if max > 0.0 { diff / max * 255.0 } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / diff
    } else if max == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    [
        (h / 2.0).round() as u8,
        s.round() as u8,
        max.round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FrameSource, SyntheticConfig, SyntheticSource};

    #[test]
    fn hsv_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        assert_eq!(rgb_to_hsv([40, 40, 40])[1], 0);
    }

    #[test]
    fn finds_synthetic_square() -> Result<()> {
        let mut cfg = SyntheticConfig::new("stub://color", 160, 120);
        cfg.target_rgb = [30, 60, 220];
        cfg.square_px = 30;
        let mut source = SyntheticSource::new(cfg);
        source.open()?;
        let frame = source.read_frame()?;

        let mut backend = ColorBackend::new(default_color_classes(), 100);
        let candidates = backend.detect(&frame)?;
        assert_eq!(candidates.len(), 1);
        let blob = &candidates[0];
        assert_eq!(blob.label, "blue");
        assert!(blob.confidence > 0.95);
        let (cx, cy) = blob.bbox.center();
        let (ex, ey) = source.target_center(frame.seq);
        assert!((cx - ex).abs() <= 1.5 && (cy - ey).abs() <= 1.5);
        Ok(())
    }

    #[test]
    fn small_blobs_are_ignored() -> Result<()> {
        let mut frame = Frame::filled(20, 20, [100, 100, 100])?.into_pixels();
        frame[0..3].copy_from_slice(&[255, 0, 0]);
        let frame = Frame::new(frame, 20, 20, 1)?;
        let mut backend = ColorBackend::new(default_color_classes(), 4);
        assert!(backend.detect(&frame)?.is_empty());
        Ok(())
    }
}
