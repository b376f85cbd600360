use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Coarse phase name, used for status reporting and per-phase limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Searching,
    Aligning,
    Approaching,
    Grasping,
    Complete,
    Failed,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Searching => "SEARCHING",
            Phase::Aligning => "ALIGNING",
            Phase::Approaching => "APPROACHING",
            Phase::Grasping => "GRASPING",
            Phase::Complete => "COMPLETE",
            Phase::Failed => "FAILED",
            Phase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Axis being centered while aligning. X drives the base, Y the elbow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AlignAxis {
    X,
    Y,
}

#[derive(Clone, Debug, PartialEq, Error, Serialize)]
pub enum FailureReason {
    #[error("{phase} timed out")]
    Timeout { phase: Phase },
    #[error("{phase} exceeded its iteration limit")]
    IterationLimit { phase: Phase },
    #[error("target at reach {reach_cm:.1} cm, height {height_cm:.1} cm is outside the arm's envelope")]
    Unreachable { reach_cm: f32, height_cm: f32 },
    #[error("object lost (last known distance {})", fmt_distance(.last_known_cm))]
    ObjectLost { last_known_cm: Option<f32> },
    #[error("actuator fault: {message}")]
    Actuator { message: String },
}

fn fmt_distance(value: &Option<f32>) -> String {
    match value {
        Some(cm) => format!("{:.1} cm", cm),
        None => "unknown".to_string(),
    }
}

/// Servoing state machine. Each variant carries only the data its phase needs.
#[derive(Clone, Debug, PartialEq)]
pub enum ServoState {
    Searching {
        /// +1 sweeps toward the upper base limit, -1 toward the lower.
        sweep_dir: f32,
    },
    Aligning {
        axis: AlignAxis,
        centered_frames: u32,
        missed: u32,
    },
    Approaching {
        /// Forward advances issued so far.
        iteration: u32,
        missed: u32,
    },
    Grasping {
        gap_cm: f32,
    },
    Complete,
    Failed(FailureReason),
}

impl ServoState {
    pub fn searching() -> Self {
        ServoState::Searching { sweep_dir: 1.0 }
    }

    pub fn phase(&self) -> Phase {
        match self {
            ServoState::Searching { .. } => Phase::Searching,
            ServoState::Aligning { .. } => Phase::Aligning,
            ServoState::Approaching { .. } => Phase::Approaching,
            ServoState::Grasping { .. } => Phase::Grasping,
            ServoState::Complete => Phase::Complete,
            ServoState::Failed(_) => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServoState::Complete | ServoState::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            ServoState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Point-in-time view of a servoing session for the control surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServoStatus {
    pub phase: Phase,
    pub target: Option<String>,
    /// 0.0 at start, 1.0 once the grasp completes.
    pub progress: f32,
    /// Last error, kept after the session ends.
    pub error: Option<String>,
    pub iteration: u64,
    pub distance_cm: Option<f32>,
    pub running: bool,
}

impl ServoStatus {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            target: None,
            progress: 0.0,
            error: None,
            iteration: 0,
            distance_cm: None,
            running: false,
        }
    }
}

impl Default for ServoStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_render_context() {
        let lost = FailureReason::ObjectLost {
            last_known_cm: Some(22.5),
        };
        assert_eq!(lost.to_string(), "object lost (last known distance 22.5 cm)");
        let timeout = FailureReason::Timeout {
            phase: Phase::Aligning,
        };
        assert_eq!(timeout.to_string(), "ALIGNING timed out");
    }

    #[test]
    fn terminal_states() {
        assert!(ServoState::Complete.is_terminal());
        assert!(ServoState::Failed(FailureReason::IterationLimit {
            phase: Phase::Searching
        })
        .is_terminal());
        assert!(!ServoState::searching().is_terminal());
        assert_eq!(ServoState::Grasping { gap_cm: 3.0 }.phase(), Phase::Grasping);
    }
}
