//! Actuator interface.
//!
//! Every command is validated (arity, finite values), clamped into each channel's
//! effective range and mirrored for inverted servos before it reaches the wire.
//! Validation happens before any byte is written, so a malformed pose never moves
//! the arm.

mod link;
mod pose;
pub mod protocol;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub use link::{
    open_serial, ConnectionHandle, SentFrames, SerialSettings, ServoLink, SimulatedLink,
};
#[cfg(feature = "serial-hardware")]
pub use link::SerialPortLink;
pub use pose::{
    ArmProfile, JointLimit, JointSpec, Pose, BASE, ELBOW, SHOULDER, WRIST_PITCH, WRIST_ROLL,
};

use protocol::encode_frame;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("pose has {actual} channels, arm expects {expected}")]
    Arity { expected: usize, actual: usize },
    #[error("channel {channel} is not a finite angle ({value})")]
    NonFinite { channel: usize, value: f32 },
    #[error("malformed pose: {0}")]
    Malformed(String),
    #[error("cannot connect to servo controller on {port}: {reason}")]
    Connection { port: String, reason: String },
    #[error("servo link failure: {0}")]
    Link(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    /// All channels in one frame.
    Direct,
    /// One channel per frame, each followed by a settle pause.
    Sequenced,
}

/// A validated, clamped pose ready for transmission.
#[derive(Clone, Debug, PartialEq)]
pub struct ServoCommand {
    pose: Pose,
    mode: MoveMode,
}

impl ServoCommand {
    pub fn new(requested: &Pose, mode: MoveMode, profile: &ArmProfile) -> Result<Self, ActuatorError> {
        profile.validate(requested)?;
        Ok(Self {
            pose: profile.clamp(requested),
            mode,
        })
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn mode(&self) -> MoveMode {
        self.mode
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArmSettings {
    /// "six_dof" or "uniform".
    pub profile: String,
    /// Channel count for the uniform profile.
    pub channels: usize,
    /// Pause after each channel of a sequenced move.
    pub sequenced_settle_ms: u64,
    /// Full profile override; takes precedence over `profile`.
    pub custom: Option<ArmProfile>,
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            profile: "six_dof".to_string(),
            channels: 6,
            sequenced_settle_ms: 300,
            custom: None,
        }
    }
}

impl ArmSettings {
    pub fn build_profile(&self) -> anyhow::Result<ArmProfile> {
        if let Some(custom) = &self.custom {
            return Ok(custom.clone());
        }
        match self.profile.as_str() {
            "six_dof" => Ok(ArmProfile::six_dof()),
            "uniform" if self.channels >= 1 => Ok(ArmProfile::uniform(self.channels, 0.0, 180.0)),
            other => Err(anyhow::anyhow!(
                "unknown arm profile '{}' (channels={})",
                other,
                self.channels
            )),
        }
    }
}

/// Seam between motion planning and the physical arm.
pub trait ArmDriver: Send {
    fn profile(&self) -> &ArmProfile;

    /// Last commanded (clamped, logical) pose.
    fn current_pose(&self) -> Pose;

    fn move_to(&mut self, pose: &Pose) -> Result<Pose, ActuatorError>;

    fn move_to_sequenced(&mut self, pose: &Pose) -> Result<Pose, ActuatorError>;
}

pub type SharedArm = Arc<Mutex<dyn ArmDriver>>;

/// Serial-driven arm.
pub struct Actuator {
    profile: ArmProfile,
    connection: ConnectionHandle,
    current: Pose,
    sequenced_settle: Duration,
}

impl Actuator {
    pub fn new(profile: ArmProfile, link: Box<dyn ServoLink>, ack_timeout: Duration) -> Self {
        let current = profile.home.clone();
        Self {
            profile,
            connection: ConnectionHandle::new(link, ack_timeout),
            current,
            sequenced_settle: Duration::ZERO,
        }
    }

    pub fn with_sequenced_settle(mut self, settle: Duration) -> Self {
        self.sequenced_settle = settle;
        self
    }

    /// Open the configured serial port.
    pub fn connect(profile: ArmProfile, serial: &SerialSettings) -> Result<Self, ActuatorError> {
        let link = open_serial(serial)?;
        Ok(Self::new(
            profile,
            link,
            Duration::from_millis(serial.ack_timeout_ms),
        ))
    }

    /// Open the serial port, or fall back to a simulated arm when that fails or
    /// simulation is requested.
    pub fn connect_or_simulate(profile: ArmProfile, serial: &SerialSettings) -> Self {
        if serial.simulate {
            log::info!("Actuator: simulation requested, not opening {}", serial.port);
            return Self::simulated(profile);
        }
        match Self::connect(profile.clone(), serial) {
            Ok(actuator) => actuator,
            Err(err) => {
                log::warn!("Actuator: {}; continuing with a simulated arm", err);
                Self::simulated(profile)
            }
        }
    }

    pub fn simulated(profile: ArmProfile) -> Self {
        Self::new(profile, Box::new(SimulatedLink::new()), Duration::ZERO)
    }

    pub fn is_simulated(&self) -> bool {
        self.connection.is_simulated()
    }

    pub fn describe(&self) -> String {
        self.connection.describe()
    }

    pub fn execute(&mut self, command: &ServoCommand) -> Result<Pose, ActuatorError> {
        match command.mode() {
            MoveMode::Direct => self.transmit(command.pose().clone()),
            MoveMode::Sequenced => self.sequence(command.pose()),
        }
    }

    fn transmit(&mut self, pose: Pose) -> Result<Pose, ActuatorError> {
        let frame = encode_frame(&self.profile.to_physical(&pose));
        log::debug!("Actuator: sending {}", frame);
        self.connection.send(&frame)?;
        self.current = pose;
        Ok(self.current.clone())
    }

    fn sequence(&mut self, target: &Pose) -> Result<Pose, ActuatorError> {
        for channel in self.profile.sequence_order() {
            let Some(value) = target.channel(channel) else {
                continue;
            };
            if self.current.channel(channel) == Some(value) {
                continue;
            }
            let mut step = self.current.clone();
            step.set_channel(channel, value);
            self.transmit(step)?;
            if !self.sequenced_settle.is_zero() {
                std::thread::sleep(self.sequenced_settle);
            }
        }
        // Channels missing from a custom order still have to land on target.
        if &self.current != target {
            self.transmit(target.clone())?;
        }
        Ok(self.current.clone())
    }
}

impl ArmDriver for Actuator {
    fn profile(&self) -> &ArmProfile {
        &self.profile
    }

    fn current_pose(&self) -> Pose {
        self.current.clone()
    }

    fn move_to(&mut self, pose: &Pose) -> Result<Pose, ActuatorError> {
        let command = ServoCommand::new(pose, MoveMode::Direct, &self.profile)?;
        self.execute(&command)
    }

    fn move_to_sequenced(&mut self, pose: &Pose) -> Result<Pose, ActuatorError> {
        let command = ServoCommand::new(pose, MoveMode::Sequenced, &self.profile)?;
        self.execute(&command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_move_sends_one_physical_frame() -> Result<(), ActuatorError> {
        let mut profile = ArmProfile::uniform(3, 0.0, 180.0);
        profile.joints[1] = JointSpec::new("wrist", 0.0, 180.0).inverted();
        let link = SimulatedLink::new();
        let sent = link.sent();
        let mut arm = Actuator::new(profile, Box::new(link), Duration::ZERO);

        let landed = arm.move_to(&Pose::new(vec![10.0, 30.0], 200.0))?;
        assert_eq!(landed, Pose::new(vec![10.0, 30.0], 180.0));
        assert_eq!(sent.all(), vec!["<10,150,180>".to_string()]);
        Ok(())
    }

    #[test]
    fn malformed_pose_never_reaches_the_wire() {
        let link = SimulatedLink::new();
        let sent = link.sent();
        let mut arm = Actuator::new(ArmProfile::uniform(3, 0.0, 180.0), Box::new(link), Duration::ZERO);
        assert!(arm.move_to(&Pose::new(vec![1.0], 2.0)).is_err());
        assert!(arm.move_to_sequenced(&Pose::new(vec![1.0, f32::INFINITY], 2.0)).is_err());
        assert!(sent.is_empty());
    }

    #[test]
    fn missing_serial_port_downgrades_to_simulation() {
        let serial = SerialSettings {
            port: "/dev/does-not-exist".to_string(),
            ..SerialSettings::default()
        };
        assert!(matches!(
            Actuator::connect(ArmProfile::six_dof(), &serial),
            Err(ActuatorError::Connection { .. })
        ));
        let arm = Actuator::connect_or_simulate(ArmProfile::six_dof(), &serial);
        assert!(arm.is_simulated());
        assert_eq!(arm.current_pose(), ArmProfile::six_dof().home);
    }
}
