use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::actuator::{ArmSettings, SerialSettings};
use crate::api::ApiConfig;
use crate::detect::PerceptionSettings;
use crate::ingest::CameraSettings;
use crate::kinematics::PlanarArm;
use crate::pipeline::PipelineSettings;
use crate::predictor::{PredictorSettings, PredictorStrategy};
use crate::servo::ServoSettings;

pub const CONFIG_ENV: &str = "GRASP_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GraspdConfigFile {
    api: Option<ApiConfig>,
    camera: Option<CameraSettings>,
    pipeline: Option<PipelineSettings>,
    perception: Option<PerceptionSettings>,
    serial: Option<SerialSettings>,
    arm: Option<ArmSettings>,
    servo: Option<ServoSettings>,
    predictor_x: Option<PredictorSettings>,
    predictor_y: Option<PredictorSettings>,
    kinematics: Option<PlanarArm>,
}

/// Fully resolved daemon configuration: file values, then environment overrides.
#[derive(Debug, Clone)]
pub struct GraspdConfig {
    pub api: ApiConfig,
    pub camera: CameraSettings,
    pub pipeline: PipelineSettings,
    pub perception: PerceptionSettings,
    pub serial: SerialSettings,
    pub arm: ArmSettings,
    pub servo: ServoSettings,
    pub predictor_x: PredictorSettings,
    pub predictor_y: PredictorSettings,
    pub kinematics: PlanarArm,
}

impl Default for GraspdConfig {
    fn default() -> Self {
        Self::from_file(GraspdConfigFile::default())
    }
}

/// Vertical corrections default to the fixed-gain step; only X ships a learned model.
fn default_predictor_y() -> PredictorSettings {
    PredictorSettings {
        strategy: PredictorStrategy::Proportional,
        ..PredictorSettings::default()
    }
}

impl GraspdConfig {
    /// Load from the file named by `GRASP_CONFIG` (if set) and apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GraspdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GraspdConfigFile) -> Self {
        Self {
            api: file.api.unwrap_or_default(),
            camera: file.camera.unwrap_or_default(),
            pipeline: file.pipeline.unwrap_or_default(),
            perception: file.perception.unwrap_or_default(),
            serial: file.serial.unwrap_or_default(),
            arm: file.arm.unwrap_or_default(),
            servo: file.servo.unwrap_or_default(),
            predictor_x: file.predictor_x.unwrap_or_default(),
            predictor_y: file.predictor_y.unwrap_or_else(default_predictor_y),
            kinematics: file.kinematics.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("GRASP_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(devices) = non_empty_env("GRASP_CAMERA_DEVICES") {
            let parsed = split_csv(&devices);
            if !parsed.is_empty() {
                self.camera.devices = parsed;
            }
        }
        if let Some(port) = non_empty_env("GRASP_SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud) = non_empty_env("GRASP_SERIAL_BAUD") {
            self.serial.baud = baud
                .parse()
                .map_err(|_| anyhow!("GRASP_SERIAL_BAUD must be an integer baud rate"))?;
        }
        if let Some(path) = non_empty_env("GRASP_PREDICTOR_X") {
            self.predictor_x.strategy = PredictorStrategy::Learned;
            self.predictor_x.artifact = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("GRASP_PREDICTOR_Y") {
            self.predictor_y.strategy = PredictorStrategy::Learned;
            self.predictor_y.artifact = Some(PathBuf::from(path));
        }
        if let Some(flag) = non_empty_env("GRASP_SIMULATE") {
            self.serial.simulate = parse_flag(&flag)
                .ok_or_else(|| anyhow!("GRASP_SIMULATE must be one of 1/0/true/false"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api
            .addr
            .parse::<SocketAddr>()
            .with_context(|| format!("api.addr '{}' is not a socket address", self.api.addr))?;
        if self.camera.devices.is_empty() {
            return Err(anyhow!("camera.devices must list at least one device"));
        }
        if self.camera.target_fps == 0 || self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera fps and geometry must be non-zero"));
        }
        if self.camera.read_timeout_ms == 0 {
            return Err(anyhow!("camera.read_timeout_ms must be non-zero"));
        }
        self.pipeline.validate()?;
        if !(0.0..=1.0).contains(&self.perception.min_confidence) {
            return Err(anyhow!("perception.min_confidence must be within 0..=1"));
        }
        if self.serial.baud == 0 {
            return Err(anyhow!("serial.baud must be non-zero"));
        }
        let profile = self.arm.build_profile()?;
        if profile.home.channel_count() != profile.channel_count() {
            return Err(anyhow!(
                "arm home pose has {} channels but the profile drives {}",
                profile.home.channel_count(),
                profile.channel_count()
            ));
        }
        for (channel, home) in profile.home.channels().into_iter().enumerate() {
            let limit = profile
                .spec(channel)
                .map(|spec| spec.effective())
                .ok_or_else(|| anyhow!("arm home pose has more channels than the profile"))?;
            if limit.min > limit.max {
                return Err(anyhow!("arm channel {} has an inverted range", channel));
            }
            if !limit.contains(home) {
                return Err(anyhow!(
                    "arm home pose channel {} ({}) is outside {}..={}",
                    channel,
                    home,
                    limit.min,
                    limit.max
                ));
            }
        }
        self.servo.validate()?;
        // One zone drives both the tracker fallback and the commit-on-loss grasp.
        if (self.servo.near_threshold_cm - self.perception.near_threshold_cm).abs() > f32::EPSILON {
            return Err(anyhow!(
                "servo.near_threshold_cm ({}) must equal perception.near_threshold_cm ({})",
                self.servo.near_threshold_cm,
                self.perception.near_threshold_cm
            ));
        }
        if self.kinematics.upper_arm_cm <= 0.0 || self.kinematics.forearm_cm <= 0.0 {
            return Err(anyhow!("kinematics link lengths must be positive"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GraspdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
