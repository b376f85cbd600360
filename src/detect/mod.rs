mod backend;
pub mod backends;
pub mod coordinator;
pub mod distance;
mod registry;
mod result;
pub mod tracker;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{ColorBackend, ScriptedBackend};
pub use coordinator::{HybridPerception, PerceptionOutcome, PerceptionSettings};
pub use distance::DistanceEstimator;
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{
    BBox, Candidate, CandidateKind, ColorDetection, Detection, DetectionSource, ObjectDetection,
    PixelError,
};
pub use tracker::{TemplateTracker, TrackerSettings, VisualTracker};

use anyhow::Result;

/// Register the backends available in this build and select the configured one.
pub fn build_detector(settings: &PerceptionSettings) -> Result<SharedBackend> {
    let mut registry = BackendRegistry::new();
    registry.register(ColorBackend::new(
        backends::default_color_classes(),
        settings.color_min_area_px,
    ));

    #[cfg(feature = "backend-tract")]
    if let Some(model_path) = &settings.model_path {
        let labels = match &settings.labels_path {
            Some(path) => backends::TractBackend::load_labels(path)?,
            None => Vec::new(),
        };
        let backend = backends::TractBackend::new(model_path, settings.model_input_size, labels)?
            .with_threshold(settings.min_confidence);
        registry.register(backend);
    }

    // Scripted replays nothing here; keep it out of auto selection.
    let backend = match settings.backend.as_str() {
        "auto" => registry
            .backend_for_capability(DetectionCapability::ObjectDetection)
            .or_else(|_| registry.select(None))?,
        name => {
            registry.register(ScriptedBackend::new(Vec::new()));
            registry.select(Some(name))?
        }
    };
    {
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow::anyhow!("backend lock poisoned"))?;
        guard.warm_up()?;
        log::info!(
            "detector backend '{}' selected (registered: {})",
            guard.name(),
            registry.list().join(", ")
        );
    }
    Ok(backend)
}
