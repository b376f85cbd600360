use serde::{Deserialize, Serialize};

use super::ActuatorError;

/// Ordered joint angles (degrees) plus the gripper scalar.
///
/// On the wire the gripper is the last channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub joints: Vec<f32>,
    pub gripper: f32,
}

impl Pose {
    pub fn new(joints: Vec<f32>, gripper: f32) -> Self {
        Self { joints, gripper }
    }

    /// Split a flat channel list; the last value is the gripper.
    pub fn from_channels(channels: &[f32]) -> Result<Self, ActuatorError> {
        let Some((gripper, joints)) = channels.split_last() else {
            return Err(ActuatorError::Arity {
                expected: 1,
                actual: 0,
            });
        };
        Ok(Self {
            joints: joints.to_vec(),
            gripper: *gripper,
        })
    }

    pub fn channels(&self) -> Vec<f32> {
        let mut out = self.joints.clone();
        out.push(self.gripper);
        out
    }

    pub fn channel_count(&self) -> usize {
        self.joints.len() + 1
    }

    /// Channel value by wire index.
    pub fn channel(&self, index: usize) -> Option<f32> {
        if index == self.joints.len() {
            Some(self.gripper)
        } else {
            self.joints.get(index).copied()
        }
    }

    pub fn set_channel(&mut self, index: usize, value: f32) {
        if index == self.joints.len() {
            self.gripper = value;
        } else if let Some(joint) = self.joints.get_mut(index) {
            *joint = value;
        }
    }

    pub fn with_joint(mut self, index: usize, value: f32) -> Self {
        if let Some(joint) = self.joints.get_mut(index) {
            *joint = value;
        }
        self
    }

    pub fn with_gripper(mut self, value: f32) -> Self {
        self.gripper = value;
        self
    }
}

/// Closed angle interval in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub min: f32,
    pub max: f32,
}

impl JointLimit {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One servo channel: mechanical range, optional narrower safety range, wiring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointSpec {
    pub name: String,
    pub range: JointLimit,
    #[serde(default)]
    pub safety: Option<JointLimit>,
    /// Servo mounted mirrored: physical = min + max - logical.
    #[serde(default)]
    pub inverted: bool,
}

impl JointSpec {
    pub fn new(name: &str, min: f32, max: f32) -> Self {
        Self {
            name: name.to_string(),
            range: JointLimit::new(min, max),
            safety: None,
            inverted: false,
        }
    }

    pub fn with_safety(mut self, min: f32, max: f32) -> Self {
        self.safety = Some(JointLimit::new(min, max));
        self
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }

    /// The range a command may actually use: mechanical range intersected with safety.
    pub fn effective(&self) -> JointLimit {
        match self.safety {
            Some(safety) => JointLimit::new(
                self.range.min.max(safety.min),
                self.range.max.min(safety.max),
            ),
            None => self.range,
        }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        self.effective().clamp(value)
    }

    pub fn to_physical(&self, logical: f32) -> f32 {
        if self.inverted {
            self.range.min + self.range.max - logical
        } else {
            logical
        }
    }
}

/// Joint layout of an arm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmProfile {
    pub joints: Vec<JointSpec>,
    pub gripper: JointSpec,
    /// Channel order for sequenced moves; defaults to wire order.
    #[serde(default)]
    pub sequence: Vec<usize>,
    pub home: Pose,
}

pub const BASE: usize = 0;
pub const SHOULDER: usize = 1;
pub const ELBOW: usize = 2;
pub const WRIST_PITCH: usize = 3;
pub const WRIST_ROLL: usize = 4;

impl ArmProfile {
    /// `channels` identical servos over `[min, max]`; the last one is the gripper.
    pub fn uniform(channels: usize, min: f32, max: f32) -> Self {
        let joint_count = channels.saturating_sub(1);
        let joints = (0..joint_count)
            .map(|i| JointSpec::new(&format!("joint{}", i), min, max))
            .collect();
        let mid = (min + max) / 2.0;
        Self {
            joints,
            gripper: JointSpec::new("gripper", min, max),
            sequence: Vec::new(),
            home: Pose::new(vec![mid; joint_count], mid),
        }
    }

    /// Five-joint desktop arm with a servo gripper.
    pub fn six_dof() -> Self {
        Self {
            joints: vec![
                JointSpec::new("base", 0.0, 180.0),
                JointSpec::new("shoulder", 0.0, 180.0),
                JointSpec::new("elbow", 0.0, 180.0).with_safety(0.0, 150.0),
                JointSpec::new("wrist_pitch", 0.0, 180.0),
                JointSpec::new("wrist_roll", 0.0, 180.0),
            ],
            gripper: JointSpec::new("gripper", 0.0, 180.0).with_safety(120.0, 170.0),
            sequence: Vec::new(),
            home: Pose::new(vec![23.0, 100.0, 140.0, 90.0, 12.0], 155.0),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.joints.len() + 1
    }

    pub fn spec(&self, channel: usize) -> Option<&JointSpec> {
        if channel == self.joints.len() {
            Some(&self.gripper)
        } else {
            self.joints.get(channel)
        }
    }

    pub fn sequence_order(&self) -> Vec<usize> {
        if self.sequence.is_empty() {
            (0..self.channel_count()).collect()
        } else {
            self.sequence.clone()
        }
    }

    /// Check arity and finiteness without touching values.
    pub fn validate(&self, pose: &Pose) -> Result<(), ActuatorError> {
        if pose.channel_count() != self.channel_count() {
            return Err(ActuatorError::Arity {
                expected: self.channel_count(),
                actual: pose.channel_count(),
            });
        }
        for (channel, value) in pose.channels().into_iter().enumerate() {
            if !value.is_finite() {
                return Err(ActuatorError::NonFinite { channel, value });
            }
        }
        Ok(())
    }

    /// Clamp every channel into its effective range. Assumes a validated pose.
    pub fn clamp(&self, pose: &Pose) -> Pose {
        Pose {
            joints: pose
                .joints
                .iter()
                .zip(&self.joints)
                .map(|(value, spec)| spec.clamp(*value))
                .collect(),
            gripper: self.gripper.clamp(pose.gripper),
        }
    }

    /// Channel values as transmitted, after inversion.
    pub fn to_physical(&self, pose: &Pose) -> Vec<f32> {
        let mut out: Vec<f32> = pose
            .joints
            .iter()
            .zip(&self.joints)
            .map(|(value, spec)| spec.to_physical(*value))
            .collect();
        out.push(self.gripper.to_physical(pose.gripper));
        out
    }
}
