//! Annotated frames for the video stream.

use anyhow::{Context, Result};

use crate::detect::{Detection, DetectionSource};
use crate::frame::Frame;

const CROSSHAIR: [u8; 3] = [255, 255, 255];
const DETECTOR_BOX: [u8; 3] = [0, 255, 0];
const TRACKER_BOX: [u8; 3] = [255, 200, 0];

/// Copy of the frame with a center crosshair and the primary detection drawn on it.
pub fn render_overlay(frame: &Frame, primary: Option<&Detection>) -> Vec<u8> {
    let mut canvas = Canvas {
        pixels: frame.pixels().to_vec(),
        width: frame.width as i64,
        height: frame.height as i64,
    };
    let cx = canvas.width / 2;
    let cy = canvas.height / 2;
    canvas.hline(cx - 10, cx + 10, cy, CROSSHAIR);
    canvas.vline(cx, cy - 10, cy + 10, CROSSHAIR);

    if let Some(detection) = primary {
        let color = match detection.source() {
            DetectionSource::Tracker => TRACKER_BOX,
            _ => DETECTOR_BOX,
        };
        let b = detection.bbox();
        let (x0, y0) = (b.x as i64, b.y as i64);
        let (x1, y1) = ((b.x + b.w) as i64, (b.y + b.h) as i64);
        for t in 0..2 {
            canvas.hline(x0, x1, y0 + t, color);
            canvas.hline(x0, x1, y1 - t, color);
            canvas.vline(x0 + t, y0, y1, color);
            canvas.vline(x1 - t, y0, y1, color);
        }
        let (dx, dy) = detection.center();
        for oy in -2..=2 {
            canvas.hline(dx as i64 - 2, dx as i64 + 2, dy as i64 + oy, color);
        }
    }
    canvas.pixels
}

pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(pixels, width, height, image::ExtendedColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(out)
}

/// Render and encode in one step.
pub fn render_jpeg(frame: &Frame, primary: Option<&Detection>, quality: u8) -> Result<Vec<u8>> {
    let pixels = render_overlay(frame, primary);
    encode_jpeg(&pixels, frame.width, frame.height, quality)
}

struct Canvas {
    pixels: Vec<u8>,
    width: i64,
    height: i64,
}

impl Canvas {
    fn put(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.pixels[idx..idx + 3].copy_from_slice(&color);
    }

    fn hline(&mut self, x0: i64, x1: i64, y: i64, color: [u8; 3]) {
        for x in x0.min(x1)..=x0.max(x1) {
            self.put(x, y, color);
        }
    }

    fn vline(&mut self, x: i64, y0: i64, y1: i64, color: [u8; 3]) {
        for y in y0.min(y1)..=y0.max(y1) {
            self.put(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Candidate};

    #[test]
    fn overlay_marks_center_and_box() -> Result<()> {
        let frame = Frame::filled(64, 48, [0, 0, 0])?;
        let detection = Detection::from_candidate(
            &Candidate::color("red", 1.0, BBox::new(4.0, 4.0, 10.0, 10.0)),
            64,
            48,
            None,
            DetectionSource::Detector,
        );
        let pixels = render_overlay(&frame, Some(&detection));
        let at = |x: usize, y: usize| {
            let i = (y * 64 + x) * 3;
            [pixels[i], pixels[i + 1], pixels[i + 2]]
        };
        assert_eq!(at(32, 24), CROSSHAIR);
        assert_eq!(at(4, 4), DETECTOR_BOX);
        assert_eq!(at(40, 40), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn encodes_a_decodable_jpeg() -> Result<()> {
        let frame = Frame::filled(32, 24, [10, 200, 30])?;
        let jpeg = render_jpeg(&frame, None, 80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        Ok(())
    }
}
