//! Visual Grasp
//!
//! Camera-guided grasping for small serial-driven robotic arms.
//!
//! # Architecture
//!
//! Frames flow from a [`ingest::FrameSource`] through the capture pipeline into a
//! shared detection slot; the servoing controller polls that slot and drives the
//! arm through the actuator interface, closing the loop on the next frame.
//!
//! - `frame`: immutable RGB frame snapshots shared between threads
//! - `ingest`: camera sources (synthetic `stub://`, V4L2) and reopen helpers
//! - `detect`: detector backends, fallback tracker, hybrid perception coordinator
//! - `pipeline`: capture, inference and watchdog loops over [`pipeline::SharedState`]
//! - `actuator`: pose clamping, the `<a1,...,an>` serial protocol, direct and sequenced moves
//! - `kinematics`: planar two-link reach solver
//! - `predictor`: pixel error to angular correction predictors
//! - `servo`: search/align/approach/grasp state machine and session service
//! - `display`: annotated JPEG frames for the video stream
//! - `api`: loopback control and streaming endpoints

pub mod actuator;
pub mod api;
pub mod config;
pub mod detect;
pub mod display;
pub mod frame;
pub mod ingest;
pub mod kinematics;
pub mod pipeline;
pub mod predictor;
pub mod servo;

pub use actuator::{
    Actuator, ActuatorError, ArmDriver, ArmProfile, MoveMode, Pose, ServoCommand, SharedArm,
};
pub use detect::{
    BBox, Candidate, Detection, DetectionSource, DistanceEstimator, HybridPerception,
    PixelError,
};
pub use frame::Frame;
pub use ingest::{FrameSource, InterruptHandle, SourceFactory, SyntheticSource};
pub use kinematics::{Kinematics, PlanarArm};
pub use pipeline::{CapturePipeline, DetectionSnapshot, PipelineControl, SharedState};
pub use predictor::{load_predictor, CorrectionPredictor, ProportionalPredictor};
pub use servo::{ServoControl, ServoController, ServoState, ServoStatus, ServoingService};
