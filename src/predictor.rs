//! Correction predictors: pixel error (plus optional range) to an angular delta.
//!
//! The controller treats every predictor the same way. Which one runs is a
//! configuration choice: `proportional` always uses the fixed-gain fallback,
//! `learned` loads a frozen artifact and falls back to proportional when the
//! artifact is missing or unreadable.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait CorrectionPredictor: Send + Sync {
    fn name(&self) -> &str;

    /// Suggested delta in degrees. The sign follows the error; the caller maps it
    /// onto the joint direction.
    fn predict(&self, error_px: f32, distance_cm: Option<f32>) -> f32;
}

/// Fixed-sign proportional step.
#[derive(Clone, Debug)]
pub struct ProportionalPredictor {
    gain: f32,
}

impl ProportionalPredictor {
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl CorrectionPredictor for ProportionalPredictor {
    fn name(&self) -> &str {
        "proportional"
    }

    fn predict(&self, error_px: f32, _distance_cm: Option<f32>) -> f32 {
        error_px * self.gain
    }
}

// ----------------------------------------------------------------------------
// First-order TSK fuzzy model
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
struct FuzzyRule {
    centers: Vec<f32>,
    sigmas: Vec<f32>,
    /// One weight per input followed by the bias.
    coefficients: Vec<f32>,
}

#[derive(Clone, Debug, Deserialize)]
struct FuzzyArtifact {
    inputs: usize,
    rules: Vec<FuzzyRule>,
    /// Range substituted when the model takes distance but none is known.
    #[serde(default)]
    default_distance_cm: Option<f32>,
}

/// Takagi-Sugeno-Kang inference with Gaussian memberships, loaded from JSON.
#[derive(Clone, Debug)]
pub struct FuzzyPredictor {
    name: String,
    artifact: FuzzyArtifact,
}

impl FuzzyPredictor {
    pub fn from_json(name: &str, raw: &str) -> Result<Self> {
        let artifact: FuzzyArtifact =
            serde_json::from_str(raw).context("invalid fuzzy predictor artifact")?;
        if artifact.inputs == 0 || artifact.inputs > 2 {
            return Err(anyhow!("fuzzy predictor must take 1 or 2 inputs"));
        }
        if artifact.rules.is_empty() {
            return Err(anyhow!("fuzzy predictor has no rules"));
        }
        for (i, rule) in artifact.rules.iter().enumerate() {
            if rule.centers.len() != artifact.inputs
                || rule.sigmas.len() != artifact.inputs
                || rule.coefficients.len() != artifact.inputs + 1
            {
                return Err(anyhow!("rule {} does not match {} inputs", i, artifact.inputs));
            }
            if rule.sigmas.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err(anyhow!("rule {} has a non-positive sigma", i));
            }
        }
        Ok(Self {
            name: name.to_string(),
            artifact,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read predictor {}", path.display()))?;
        Self::from_json(&path.display().to_string(), &raw)
    }
}

impl CorrectionPredictor for FuzzyPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, error_px: f32, distance_cm: Option<f32>) -> f32 {
        let mut x = vec![error_px];
        if self.artifact.inputs == 2 {
            x.push(
                distance_cm
                    .or(self.artifact.default_distance_cm)
                    .unwrap_or(0.0),
            );
        }
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;
        for rule in &self.artifact.rules {
            let firing: f32 = x
                .iter()
                .zip(rule.centers.iter().zip(&rule.sigmas))
                .map(|(xi, (c, s))| (-(xi - c).powi(2) / (2.0 * s * s)).exp())
                .product();
            let bias = rule.coefficients[self.artifact.inputs];
            let output: f32 = x
                .iter()
                .zip(&rule.coefficients)
                .map(|(xi, w)| xi * w)
                .sum::<f32>()
                + bias;
            weighted += firing * output;
            total += firing;
        }
        if total <= f32::EPSILON {
            0.0
        } else {
            weighted / total
        }
    }
}

// ----------------------------------------------------------------------------
// ONNX regressor
// ----------------------------------------------------------------------------

#[cfg(feature = "backend-tract")]
pub struct OnnxPredictor {
    name: String,
    inputs: usize,
    model: tract_onnx::prelude::SimplePlan<
        tract_onnx::prelude::TypedFact,
        Box<dyn tract_onnx::prelude::TypedOp>,
    >,
}

#[cfg(feature = "backend-tract")]
impl OnnxPredictor {
    /// Load a `[1, inputs] -> [1, 1]` regressor.
    pub fn load(path: &Path, inputs: usize) -> Result<Self> {
        use tract_onnx::prelude::*;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to load ONNX predictor {}", path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, inputs)))?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self {
            name: path.display().to_string(),
            inputs,
            model,
        })
    }
}

#[cfg(feature = "backend-tract")]
impl CorrectionPredictor for OnnxPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, error_px: f32, distance_cm: Option<f32>) -> f32 {
        use tract_onnx::prelude::*;
        let mut x = vec![error_px];
        if self.inputs == 2 {
            x.push(distance_cm.unwrap_or(0.0));
        }
        let input = match tract_ndarray::Array2::from_shape_vec((1, self.inputs), x) {
            Ok(input) => input.into_tensor(),
            Err(err) => {
                log::warn!("OnnxPredictor: bad input shape: {}", err);
                return 0.0;
            }
        };
        let output = self
            .model
            .run(tvec!(input.into()))
            .and_then(|out| {
                let first = out.first().ok_or_else(|| anyhow!("no output"))?;
                let view = first.to_array_view::<f32>()?;
                view.iter().next().copied().ok_or_else(|| anyhow!("empty output"))
            });
        match output {
            Ok(value) => value,
            Err(err) => {
                log::warn!("OnnxPredictor: inference failed: {:#}", err);
                0.0
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Selection
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorStrategy {
    Proportional,
    Learned,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictorSettings {
    pub strategy: PredictorStrategy,
    pub artifact: Option<PathBuf>,
    /// Inputs of an ONNX artifact (1 = error, 2 = error and range).
    pub inputs: usize,
    /// Degrees per pixel for the proportional fallback.
    pub gain: f32,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            strategy: PredictorStrategy::Learned,
            artifact: None,
            inputs: 1,
            gain: 0.05,
        }
    }
}

/// Build the configured predictor. Never fails: problems with a learned artifact
/// are logged and the proportional fallback is returned instead.
pub fn load_predictor(settings: &PredictorSettings) -> Arc<dyn CorrectionPredictor> {
    let fallback =
        || Arc::new(ProportionalPredictor::new(settings.gain)) as Arc<dyn CorrectionPredictor>;
    if settings.strategy == PredictorStrategy::Proportional {
        return fallback();
    }
    let Some(path) = &settings.artifact else {
        log::warn!(
            "predictor: no artifact configured, using proportional gain {}",
            settings.gain
        );
        return fallback();
    };
    match load_artifact(path, settings.inputs) {
        Ok(predictor) => {
            log::info!("predictor: loaded {}", predictor.name());
            predictor
        }
        Err(err) => {
            log::warn!(
                "predictor: {:#}; using proportional gain {}",
                err,
                settings.gain
            );
            fallback()
        }
    }
}

fn load_artifact(path: &Path, inputs: usize) -> Result<Arc<dyn CorrectionPredictor>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Arc::new(FuzzyPredictor::load(path)?)),
        #[cfg(feature = "backend-tract")]
        Some("onnx") => Ok(Arc::new(OnnxPredictor::load(path, inputs)?)),
        _ => {
            let _ = inputs;
            Err(anyhow!(
                "unsupported predictor artifact {} (expected .json{})",
                path.display(),
                if cfg!(feature = "backend-tract") { " or .onnx" } else { "" }
            ))
        }
    }
}
