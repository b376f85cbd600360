use anyhow::Result;

use crate::detect::result::Candidate;
use crate::frame::Frame;

/// Detection capabilities supported by backends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Class-labelled objects ("cup", "bottle", ...).
    ObjectDetection,
    /// Blobs of a named color.
    ColorSegmentation,
}

/// Detector backend trait.
///
/// Backends are black boxes to the rest of the crate: given a frame they return
/// candidate boxes with a label and confidence. They must not keep a reference to
/// the frame past the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame. Candidates may be unsorted and unfiltered.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
