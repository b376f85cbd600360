use serde::Serialize;
use std::time::Instant;

/// Axis-aligned box in pixel coordinates (top-left origin).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Box of size `w` x `h` centered on (`cx`, `cy`).
    pub fn centered(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Intersect with the image rectangle.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let x0 = self.x.clamp(0.0, width as f32);
        let y0 = self.y.clamp(0.0, height as f32);
        let x1 = (self.x + self.w).clamp(0.0, width as f32);
        let y1 = (self.y + self.h).clamp(0.0, height as f32);
        BBox::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Offset of a point from the image center. Positive `y` means above center.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PixelError {
    pub x: f32,
    pub y: f32,
}

impl PixelError {
    pub fn from_center(center: (f32, f32), width: u32, height: u32) -> Self {
        Self {
            x: center.0 - width as f32 / 2.0,
            y: height as f32 / 2.0 - center.1,
        }
    }
}

/// Which component produced a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Detector,
    Tracker,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Object,
    Color,
}

/// Raw backend output before the coordinator adds geometry and provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub kind: CandidateKind,
}

impl Candidate {
    pub fn object(label: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            bbox,
            kind: CandidateKind::Object,
        }
    }

    pub fn color(label: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            kind: CandidateKind::Color,
            ..Self::object(label, confidence, bbox)
        }
    }
}

/// Class-aware detection from a neural detector (or the tracker continuing one).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub pixel_error: PixelError,
    pub distance_cm: Option<f32>,
    pub source: DetectionSource,
    #[serde(skip_serializing)]
    pub timestamp: Instant,
}

/// Color-segmentation blob.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColorDetection {
    pub color: String,
    /// Fraction of the bounding box covered by the mask.
    pub fill: f32,
    pub bbox: BBox,
    pub pixel_error: PixelError,
    pub distance_cm: Option<f32>,
    pub source: DetectionSource,
    #[serde(skip_serializing)]
    pub timestamp: Instant,
}

/// A published detection. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detection {
    Object(ObjectDetection),
    Color(ColorDetection),
}

impl Detection {
    /// Build a detection from a candidate box in a `width` x `height` frame.
    pub fn from_candidate(
        candidate: &Candidate,
        width: u32,
        height: u32,
        distance_cm: Option<f32>,
        source: DetectionSource,
    ) -> Self {
        let pixel_error = PixelError::from_center(candidate.bbox.center(), width, height);
        let timestamp = Instant::now();
        match candidate.kind {
            CandidateKind::Object => Detection::Object(ObjectDetection {
                label: candidate.label.clone(),
                confidence: candidate.confidence,
                bbox: candidate.bbox,
                pixel_error,
                distance_cm,
                source,
                timestamp,
            }),
            CandidateKind::Color => Detection::Color(ColorDetection {
                color: candidate.label.clone(),
                fill: candidate.confidence,
                bbox: candidate.bbox,
                pixel_error,
                distance_cm,
                source,
                timestamp,
            }),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Detection::Object(d) => &d.label,
            Detection::Color(d) => &d.color,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Detection::Object(d) => d.confidence,
            Detection::Color(d) => d.fill,
        }
    }

    pub fn bbox(&self) -> BBox {
        match self {
            Detection::Object(d) => d.bbox,
            Detection::Color(d) => d.bbox,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox().center()
    }

    pub fn pixel_error(&self) -> PixelError {
        match self {
            Detection::Object(d) => d.pixel_error,
            Detection::Color(d) => d.pixel_error,
        }
    }

    pub fn distance_cm(&self) -> Option<f32> {
        match self {
            Detection::Object(d) => d.distance_cm,
            Detection::Color(d) => d.distance_cm,
        }
    }

    pub fn source(&self) -> DetectionSource {
        match self {
            Detection::Object(d) => d.source,
            Detection::Color(d) => d.source,
        }
    }

    pub fn timestamp(&self) -> Instant {
        match self {
            Detection::Object(d) => d.timestamp,
            Detection::Color(d) => d.timestamp,
        }
    }

    pub fn kind(&self) -> CandidateKind {
        match self {
            Detection::Object(_) => CandidateKind::Object,
            Detection::Color(_) => CandidateKind::Color,
        }
    }

    pub fn matches_label(&self, target: &str) -> bool {
        self.label().eq_ignore_ascii_case(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_error_is_positive_above_and_right() {
        let err = PixelError::from_center((400.0, 100.0), 640, 480);
        assert_eq!(err, PixelError { x: 80.0, y: 140.0 });
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn clamp_to_image_trims_overhang() {
        let clamped = BBox::new(-5.0, 470.0, 20.0, 20.0).clamp_to(640, 480);
        assert_eq!(clamped, BBox::new(0.0, 470.0, 15.0, 10.0));
    }

    #[test]
    fn accessors_cover_both_variants() {
        let bbox = BBox::centered(320.0, 240.0, 40.0, 40.0);
        let color = Detection::from_candidate(
            &Candidate::color("red", 0.9, bbox),
            640,
            480,
            Some(30.0),
            DetectionSource::Detector,
        );
        assert_eq!(color.label(), "red");
        assert_eq!(color.pixel_error(), PixelError::default());
        assert_eq!(color.distance_cm(), Some(30.0));
        assert!(color.matches_label("RED"));

        let object = Detection::from_candidate(
            &Candidate::object("cup", 0.7, bbox),
            640,
            480,
            None,
            DetectionSource::Tracker,
        );
        assert_eq!(object.kind(), CandidateKind::Object);
        assert_eq!(object.source(), DetectionSource::Tracker);
        assert_eq!(object.distance_cm(), None);
    }
}
