use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use crate::actuator::{ArmDriver, MoveMode, Pose, SharedArm, BASE, ELBOW, SHOULDER};
use crate::detect::{Detection, PixelError};
use crate::kinematics::Kinematics;
use crate::pipeline::DetectionFeed;
use crate::predictor::CorrectionPredictor;

use super::state::{AlignAxis, FailureReason, Phase, ServoState, ServoStatus};

/// Solutions the profile would move by more than this are treated as unreachable.
const CLAMP_TOLERANCE_DEG: f32 = 0.5;

/// Granularity at which cancellable settles notice a stop request.
const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseLimit {
    pub timeout_ms: u64,
    pub max_iterations: u32,
}

impl PhaseLimit {
    pub const fn new(timeout_ms: u64, max_iterations: u32) -> Self {
        Self {
            timeout_ms,
            max_iterations,
        }
    }
}

impl Default for PhaseLimit {
    fn default() -> Self {
        Self::new(30_000, 100)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServoSettings {
    /// Pixel error treated as centered.
    pub deadzone_px: f32,
    pub required_centered_frames: u32,
    /// Consecutive cycles without the target before it counts as lost.
    pub lost_tolerance: u32,
    pub max_step_deg: f32,
    pub min_move_deg: f32,
    pub sweep_step_deg: f32,
    pub sweep_min_deg: f32,
    pub sweep_max_deg: f32,
    /// Center the Y axis (elbow) after X before approaching.
    pub align_vertical: bool,
    /// Joint delta sign per unit of predicted correction.
    pub axis_sign_x: f32,
    pub axis_sign_y: f32,
    pub blind_zone_cm: f32,
    pub near_threshold_cm: f32,
    pub approach_step_cm: f32,
    pub overshoot_cm: f32,
    pub lift_cm: f32,
    /// Shoulder raise used when the lift point is outside the envelope.
    pub lift_fallback_deg: f32,
    pub gripper_open_deg: f32,
    pub gripper_closed_deg: f32,
    /// Detections older than this are ignored.
    pub detection_max_age_ms: u64,
    pub search: PhaseLimit,
    pub align: PhaseLimit,
    pub approach: PhaseLimit,
    // Fixed settle delays: how long the arm is given to stop moving before the
    // next detection is trusted.
    pub settle_start_ms: u64,
    pub settle_search_ms: u64,
    pub settle_align_ms: u64,
    pub settle_approach_ms: u64,
    pub settle_grasp_ms: u64,
    pub stop_join_timeout_ms: u64,
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            deadzone_px: 20.0,
            required_centered_frames: 3,
            lost_tolerance: 5,
            max_step_deg: 30.0,
            min_move_deg: 1.0,
            sweep_step_deg: 1.0,
            sweep_min_deg: 0.0,
            sweep_max_deg: 180.0,
            align_vertical: true,
            axis_sign_x: 1.0,
            axis_sign_y: -1.0,
            blind_zone_cm: 5.0,
            near_threshold_cm: 15.0,
            approach_step_cm: 1.0,
            overshoot_cm: 2.0,
            lift_cm: 5.0,
            lift_fallback_deg: 15.0,
            gripper_open_deg: 170.0,
            gripper_closed_deg: 120.0,
            detection_max_age_ms: 1_000,
            search: PhaseLimit::new(60_000, 400),
            align: PhaseLimit::new(15_000, 100),
            approach: PhaseLimit::new(60_000, 150),
            settle_start_ms: 1_500,
            settle_search_ms: 300,
            settle_align_ms: 1_000,
            settle_approach_ms: 500,
            settle_grasp_ms: 1_000,
            stop_join_timeout_ms: 1_000,
        }
    }
}

impl ServoSettings {
    /// Same thresholds with every settle delay removed.
    pub fn without_settle(mut self) -> Self {
        self.settle_start_ms = 0;
        self.settle_search_ms = 0;
        self.settle_align_ms = 0;
        self.settle_approach_ms = 0;
        self.settle_grasp_ms = 0;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadzone_px <= 0.0 {
            return Err(anyhow!("servo.deadzone_px must be positive"));
        }
        if self.required_centered_frames == 0 {
            return Err(anyhow!("servo.required_centered_frames must be at least 1"));
        }
        if self.blind_zone_cm <= 0.0 || self.blind_zone_cm >= self.near_threshold_cm {
            return Err(anyhow!(
                "servo.blind_zone_cm ({}) must be positive and below near_threshold_cm ({})",
                self.blind_zone_cm,
                self.near_threshold_cm
            ));
        }
        if self.min_move_deg < 0.0 || self.max_step_deg < self.min_move_deg {
            return Err(anyhow!(
                "servo step bounds invalid: min_move_deg {} max_step_deg {}",
                self.min_move_deg,
                self.max_step_deg
            ));
        }
        if self.sweep_step_deg <= 0.0 || self.sweep_min_deg >= self.sweep_max_deg {
            return Err(anyhow!("servo sweep range or step invalid"));
        }
        if self.axis_sign_x == 0.0 || self.axis_sign_y == 0.0 {
            return Err(anyhow!("servo axis signs must be non-zero"));
        }
        if self.approach_step_cm <= 0.0 {
            return Err(anyhow!("servo.approach_step_cm must be positive"));
        }
        Ok(())
    }

    fn limit(&self, phase: Phase) -> Option<&PhaseLimit> {
        match phase {
            Phase::Searching => Some(&self.search),
            Phase::Aligning => Some(&self.align),
            Phase::Approaching => Some(&self.approach),
            _ => None,
        }
    }

    fn settle(&self, phase: Phase) -> Duration {
        let ms = match phase {
            Phase::Searching => self.settle_search_ms,
            Phase::Aligning => self.settle_align_ms,
            Phase::Approaching => self.settle_approach_ms,
            Phase::Grasping => self.settle_grasp_ms,
            _ => 0,
        };
        Duration::from_millis(ms)
    }
}

/// Hardware and models the controller drives.
#[derive(Clone)]
pub struct ServoRig {
    pub arm: SharedArm,
    pub kinematics: Arc<dyn Kinematics>,
    pub predictor_x: Arc<dyn CorrectionPredictor>,
    pub predictor_y: Arc<dyn CorrectionPredictor>,
}

/// Everything one servoing run accumulates.
#[derive(Clone, Debug)]
pub struct ServoingSession {
    pub target: String,
    pub state: ServoState,
    /// Base angle once the X axis was centered.
    pub aligned_base: Option<f32>,
    pub last_known_cm: Option<f32>,
    pub last_error: Option<PixelError>,
    pub started_at: Instant,
    pub phase_started_at: Instant,
    pub phase_iterations: u32,
    pub steps: u64,
    pub progress: f32,
    /// Phases entered, in order, starting with SEARCHING.
    pub history: Vec<Phase>,
    approach_start_gap: Option<f32>,
}

impl ServoingSession {
    fn new(target: &str) -> Self {
        let now = Instant::now();
        Self {
            target: target.to_string(),
            state: ServoState::searching(),
            aligned_base: None,
            last_known_cm: None,
            last_error: None,
            started_at: now,
            phase_started_at: now,
            phase_iterations: 0,
            steps: 0,
            progress: 0.0,
            history: vec![Phase::Searching],
            approach_start_gap: None,
        }
    }
}

type StepResult<T = ServoState> = std::result::Result<T, FailureReason>;

/// Search, align, approach and grasp one target.
///
/// Each [`step`](Self::step) reads the detection feed once and issues at most one
/// physical step; GRASPING runs its whole open-loop motion inside a single step.
pub struct ServoController {
    settings: ServoSettings,
    rig: ServoRig,
    feed: Box<dyn DetectionFeed>,
    session: ServoingSession,
    cancel: Arc<AtomicBool>,
}

impl ServoController {
    pub fn new(
        settings: ServoSettings,
        rig: ServoRig,
        feed: Box<dyn DetectionFeed>,
        target: &str,
    ) -> Self {
        Self {
            settings,
            rig,
            feed,
            session: ServoingSession::new(target),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag with the owner. Raising it ends [`run`](Self::run) at the
    /// next step boundary and cuts short the settle after parking and after each
    /// step. The open-loop grasp motion is never cut short.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &ServoState {
        &self.session.state
    }

    pub fn session(&self) -> &ServoingSession {
        &self.session
    }

    /// Point perception at the target and park the arm at its home pose.
    pub fn begin(&mut self) -> &ServoState {
        let target = self.session.target.clone();
        self.feed.request_target(Some(&target));
        let parked = self
            .arm()
            .map(|arm| arm.profile().home.clone())
            .and_then(|home| self.command(&home, MoveMode::Direct));
        if let Err(reason) = parked {
            self.transition(ServoState::Failed(reason));
            return &self.session.state;
        }
        log::info!("Servo: started for '{}'", target);
        self.settle_unless_cancelled(Duration::from_millis(self.settings.settle_start_ms));
        self.session.phase_started_at = Instant::now();
        &self.session.state
    }

    pub fn step(&mut self) -> &ServoState {
        if self.session.state.is_terminal() {
            return &self.session.state;
        }
        let phase = self.session.state.phase();
        if let Some(reason) = self.check_limits(phase) {
            self.transition(ServoState::Failed(reason));
            return &self.session.state;
        }
        self.session.phase_iterations += 1;
        self.session.steps += 1;

        let detection = self.read_detection();
        let next = match self.session.state.clone() {
            ServoState::Searching { sweep_dir } => self.search(sweep_dir, detection),
            ServoState::Aligning {
                axis,
                centered_frames,
                missed,
            } => self.align(axis, centered_frames, missed, detection),
            ServoState::Approaching { iteration, missed } => {
                self.approach(iteration, missed, detection)
            }
            ServoState::Grasping { gap_cm } => self.grasp(gap_cm),
            terminal => Ok(terminal),
        };
        let next = next.unwrap_or_else(ServoState::Failed);
        let terminal = next.is_terminal();
        self.transition(next);
        if !terminal {
            self.settle_unless_cancelled(self.settings.settle(phase));
        }
        &self.session.state
    }

    /// Step until a terminal state or until the cancel flag is raised. Cancellation
    /// is only observed between steps. Returns true when the run was cancelled.
    pub fn run(&mut self, mut on_step: impl FnMut(&ServoStatus)) -> bool {
        while !self.session.state.is_terminal() {
            if self.is_cancelled() {
                return true;
            }
            self.step();
            on_step(&self.status(true));
        }
        false
    }

    pub fn status(&self, running: bool) -> ServoStatus {
        ServoStatus {
            phase: self.session.state.phase(),
            target: Some(self.session.target.clone()),
            progress: self.session.progress,
            error: self.session.state.failure().map(|reason| reason.to_string()),
            iteration: self.session.steps,
            distance_cm: self.session.last_known_cm,
            running,
        }
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    fn search(&mut self, sweep_dir: f32, detection: Option<Detection>) -> StepResult {
        if detection.is_some() {
            return Ok(aligning(AlignAxis::X, 0, 0));
        }
        let pose = self.current_pose()?;
        let base = pose.channel(BASE).unwrap_or(90.0);
        let (min, max) = (self.settings.sweep_min_deg, self.settings.sweep_max_deg);
        let mut dir = sweep_dir;
        let mut next = base + dir * self.settings.sweep_step_deg;
        if next <= min || next >= max {
            dir = -dir;
            next = next.clamp(min, max);
        }
        self.command(&pose.with_joint(BASE, next), MoveMode::Direct)?;
        Ok(ServoState::Searching { sweep_dir: dir })
    }

    fn align(
        &mut self,
        axis: AlignAxis,
        centered_frames: u32,
        missed: u32,
        detection: Option<Detection>,
    ) -> StepResult {
        let Some(detection) = detection else {
            let missed = missed + 1;
            if missed > self.settings.lost_tolerance {
                log::warn!(
                    "Servo: lost '{}' for {} cycles while aligning {:?} (last error {:?}); searching again",
                    self.session.target,
                    missed,
                    axis,
                    self.session.last_error
                );
                return Ok(ServoState::searching());
            }
            return Ok(aligning(axis, 0, missed));
        };

        let error = detection.pixel_error();
        let e = match axis {
            AlignAxis::X => error.x,
            AlignAxis::Y => error.y,
        };
        if e.abs() < self.settings.deadzone_px {
            let centered_frames = centered_frames + 1;
            if centered_frames < self.settings.required_centered_frames {
                return Ok(aligning(axis, centered_frames, 0));
            }
            if axis == AlignAxis::X {
                self.session.aligned_base = self.current_pose()?.channel(BASE);
                if self.settings.align_vertical {
                    return Ok(aligning(AlignAxis::Y, 0, 0));
                }
            }
            let pose = self.current_pose()?;
            self.command(
                &pose.with_gripper(self.settings.gripper_open_deg),
                MoveMode::Direct,
            )?;
            return Ok(ServoState::Approaching {
                iteration: 0,
                missed: 0,
            });
        }

        let (joint, predictor, sign) = match axis {
            AlignAxis::X => (BASE, self.rig.predictor_x.clone(), self.settings.axis_sign_x),
            AlignAxis::Y => (ELBOW, self.rig.predictor_y.clone(), self.settings.axis_sign_y),
        };
        let delta = self.correction(predictor.as_ref(), sign, e, detection.distance_cm());
        log::debug!(
            "Servo: align {:?} error {:.0}px -> {} {:+.2} deg",
            axis,
            e,
            predictor.name(),
            delta
        );
        self.nudge(joint, delta)?;
        Ok(aligning(axis, 0, 0))
    }

    fn approach(
        &mut self,
        iteration: u32,
        missed: u32,
        detection: Option<Detection>,
    ) -> StepResult {
        let Some(detection) = detection else {
            let missed = missed + 1;
            return match self.session.last_known_cm {
                Some(last) if last < self.settings.near_threshold_cm => {
                    log::info!(
                        "Servo: '{}' vanished at {:.1} cm (inside blind approach range), grasping",
                        self.session.target,
                        last
                    );
                    Ok(ServoState::Grasping { gap_cm: last })
                }
                last if missed > self.settings.lost_tolerance => {
                    Err(FailureReason::ObjectLost { last_known_cm: last })
                }
                _ => Ok(ServoState::Approaching { iteration, missed }),
            };
        };

        let gap = detection
            .distance_cm()
            .filter(|cm| *cm > 0.0)
            .or(self.session.last_known_cm);
        if let Some(gap) = gap {
            self.session.approach_start_gap.get_or_insert(gap);
            if gap <= self.settings.blind_zone_cm {
                return Ok(ServoState::Grasping { gap_cm: gap });
            }
        }

        let ex = detection.pixel_error().x;
        if ex.abs() >= self.settings.deadzone_px {
            let delta = self.correction(
                self.rig.predictor_x.as_ref(),
                self.settings.axis_sign_x,
                ex,
                gap,
            );
            self.nudge(BASE, delta)?;
            return Ok(ServoState::Approaching { iteration, missed: 0 });
        }

        let advance = match gap {
            Some(gap) => self
                .settings
                .approach_step_cm
                .min(gap - self.settings.blind_zone_cm),
            None => self.settings.approach_step_cm,
        };
        let pose = self.current_pose()?;
        let (reach, height) = self.rig.kinematics.planar(&pose);
        let next = self.solve_pose(&pose, reach + advance, height)?;
        log::debug!(
            "Servo: approach #{} reach {:.1} -> {:.1} cm (gap {:?})",
            iteration + 1,
            reach,
            reach + advance,
            gap
        );
        self.command(&next, MoveMode::Direct)?;
        Ok(ServoState::Approaching {
            iteration: iteration + 1,
            missed: 0,
        })
    }

    fn grasp(&mut self, gap_cm: f32) -> StepResult {
        let settle = self.settings.settle(Phase::Grasping);
        let pose = self.current_pose()?;
        let (reach, height) = self.rig.kinematics.planar(&pose);
        let target_reach = reach + gap_cm + self.settings.overshoot_cm;
        log::info!(
            "Servo: grasping '{}' gap {:.1} cm, reach {:.1} -> {:.1} cm",
            self.session.target,
            gap_cm,
            reach,
            target_reach
        );

        let reached = self
            .solve_pose(&pose, target_reach, height)?
            .with_gripper(self.settings.gripper_open_deg);
        let reached = self.command(&reached, MoveMode::Direct)?;
        sleep(settle);

        let closed = self.command(
            &reached.with_gripper(self.settings.gripper_closed_deg),
            MoveMode::Direct,
        )?;
        sleep(settle);

        let lifted = match self.solve_pose(&closed, target_reach, height + self.settings.lift_cm) {
            Ok(pose) => pose,
            Err(_) => {
                let shoulder = closed.channel(SHOULDER).unwrap_or(90.0);
                closed
                    .clone()
                    .with_joint(SHOULDER, shoulder + self.settings.lift_fallback_deg)
            }
        };
        self.command(&lifted, MoveMode::Sequenced)?;
        Ok(ServoState::Complete)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn read_detection(&mut self) -> Option<Detection> {
        let snapshot = self.feed.latest();
        let max_age = Duration::from_millis(self.settings.detection_max_age_ms);
        let detection = snapshot
            .primary
            .as_ref()
            .filter(|d| d.matches_label(&self.session.target))
            .filter(|d| d.timestamp().elapsed() <= max_age)
            .cloned()?;
        self.session.last_error = Some(detection.pixel_error());
        if let Some(cm) = detection.distance_cm().filter(|cm| *cm > 0.0) {
            self.session.last_known_cm = Some(cm);
        }
        Some(detection)
    }

    fn check_limits(&self, phase: Phase) -> Option<FailureReason> {
        let limit = self.settings.limit(phase)?;
        if self.session.phase_started_at.elapsed() > Duration::from_millis(limit.timeout_ms) {
            return Some(FailureReason::Timeout { phase });
        }
        if self.session.phase_iterations >= limit.max_iterations {
            return Some(FailureReason::IterationLimit { phase });
        }
        None
    }

    fn transition(&mut self, next: ServoState) {
        let from = self.session.state.phase();
        let to = next.phase();
        if from != to {
            match &next {
                ServoState::Failed(reason) => log::warn!(
                    "Servo: {} -> FAILED for '{}': {} (step {}, last error {:?}, last distance {:?})",
                    from,
                    self.session.target,
                    reason,
                    self.session.steps,
                    self.session.last_error,
                    self.session.last_known_cm
                ),
                _ => log::info!(
                    "Servo: {} -> {} for '{}' (step {}, last distance {:?})",
                    from,
                    to,
                    self.session.target,
                    self.session.steps,
                    self.session.last_known_cm
                ),
            }
            self.session.phase_started_at = Instant::now();
            self.session.phase_iterations = 0;
            self.session.history.push(to);
        }
        self.session.state = next;
        self.session.progress = self.progress();
    }

    fn progress(&self) -> f32 {
        match &self.session.state {
            ServoState::Searching { .. } => 0.1,
            ServoState::Aligning {
                axis: AlignAxis::X,
                ..
            } => 0.2,
            ServoState::Aligning {
                axis: AlignAxis::Y,
                ..
            } => 0.25,
            ServoState::Approaching { .. } => {
                let blind = self.settings.blind_zone_cm;
                let ratio = match (self.session.approach_start_gap, self.session.last_known_cm) {
                    (Some(start), Some(now)) if start > blind => {
                        (1.0 - (now - blind) / (start - blind)).clamp(0.0, 1.0)
                    }
                    _ => 0.0,
                };
                0.3 + 0.5 * ratio
            }
            ServoState::Grasping { .. } => 0.85,
            ServoState::Complete => 1.0,
            ServoState::Failed(_) => self.session.progress,
        }
    }

    /// Predicted joint delta for a pixel error, bounded to `[min_move, max_step]`.
    fn correction(
        &self,
        predictor: &dyn CorrectionPredictor,
        sign: f32,
        error_px: f32,
        distance_cm: Option<f32>,
    ) -> f32 {
        let raw = sign * predictor.predict(error_px, distance_cm);
        let raw = if raw.is_finite() { raw } else { 0.0 };
        let max = self.settings.max_step_deg;
        let delta = raw.clamp(-max, max);
        if delta.abs() >= self.settings.min_move_deg {
            return delta;
        }
        let direction = if delta != 0.0 {
            delta.signum()
        } else {
            sign * error_px.signum()
        };
        direction * self.settings.min_move_deg
    }

    fn solve_pose(&self, pose: &Pose, reach_cm: f32, height_cm: f32) -> StepResult<Pose> {
        let unreachable = FailureReason::Unreachable {
            reach_cm,
            height_cm,
        };
        let (shoulder, elbow) = self
            .rig
            .kinematics
            .solve(reach_cm, height_cm)
            .ok_or_else(|| unreachable.clone())?;
        let arm = self.arm()?;
        let profile = arm.profile();
        for (channel, value) in [(SHOULDER, shoulder), (ELBOW, elbow)] {
            let clamped = profile.spec(channel).map(|s| s.clamp(value)).unwrap_or(value);
            if (clamped - value).abs() > CLAMP_TOLERANCE_DEG {
                return Err(unreachable);
            }
        }
        Ok(pose
            .clone()
            .with_joint(SHOULDER, shoulder)
            .with_joint(ELBOW, elbow))
    }

    fn nudge(&self, joint: usize, delta: f32) -> StepResult<Pose> {
        let pose = self.current_pose()?;
        let value = pose.channel(joint).unwrap_or(90.0) + delta;
        self.command(&pose.with_joint(joint, value), MoveMode::Direct)
    }

    fn arm(&self) -> StepResult<MutexGuard<'_, dyn ArmDriver + 'static>> {
        self.rig.arm.lock().map_err(|_| FailureReason::Actuator {
            message: "arm lock poisoned".to_string(),
        })
    }

    fn settle_unless_cancelled(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(CANCEL_POLL));
        }
    }

    fn current_pose(&self) -> StepResult<Pose> {
        Ok(self.arm()?.current_pose())
    }

    fn command(&self, pose: &Pose, mode: MoveMode) -> StepResult<Pose> {
        let mut arm = self.arm()?;
        let result = match mode {
            MoveMode::Direct => arm.move_to(pose),
            MoveMode::Sequenced => arm.move_to_sequenced(pose),
        };
        result.map_err(|err| FailureReason::Actuator {
            message: err.to_string(),
        })
    }
}

fn aligning(axis: AlignAxis, centered_frames: u32, missed: u32) -> ServoState {
    ServoState::Aligning {
        axis,
        centered_frames,
        missed,
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Actuator, ArmProfile};
    use crate::kinematics::PlanarArm;
    use crate::pipeline::DetectionSnapshot;
    use crate::predictor::ProportionalPredictor;
    use std::sync::Mutex;

    struct EmptyFeed;

    impl DetectionFeed for EmptyFeed {
        fn latest(&mut self) -> Arc<DetectionSnapshot> {
            Arc::new(DetectionSnapshot::empty())
        }

        fn request_target(&mut self, _target: Option<&str>) {}
    }

    fn controller(gain: f32) -> ServoController {
        let arm: SharedArm = Arc::new(Mutex::new(Actuator::simulated(ArmProfile::uniform(
            6, 0.0, 180.0,
        ))));
        let predictor: Arc<dyn CorrectionPredictor> = Arc::new(ProportionalPredictor::new(gain));
        let rig = ServoRig {
            arm,
            kinematics: Arc::new(PlanarArm::default()),
            predictor_x: predictor.clone(),
            predictor_y: predictor,
        };
        ServoController::new(
            ServoSettings::default().without_settle(),
            rig,
            Box::new(EmptyFeed),
            "cube",
        )
    }

    #[test]
    fn correction_is_clamped_and_floored() {
        let c = controller(0.5);
        let p = ProportionalPredictor::new(0.5);
        assert_eq!(c.correction(&p, 1.0, 200.0, None), 30.0);
        assert_eq!(c.correction(&p, -1.0, 200.0, None), -30.0);
        assert_eq!(c.correction(&p, 1.0, 1.0, None), 1.0);
        assert_eq!(c.correction(&p, -1.0, 1.0, None), -1.0);
    }

    #[test]
    fn search_sweeps_and_reverses_at_limit() {
        let mut c = controller(0.05);
        c.settings.sweep_step_deg = 50.0;
        c.step();
        c.step();
        assert_eq!(c.state(), &ServoState::Searching { sweep_dir: -1.0 });
        let base = c.current_pose().map(|p| p.channel(BASE)).ok().flatten();
        assert_eq!(base, Some(180.0));
    }

    #[test]
    fn iteration_limit_fails_the_phase() {
        let mut c = controller(0.05);
        c.settings.search = PhaseLimit::new(60_000, 3);
        for _ in 0..4 {
            c.step();
        }
        assert_eq!(
            c.state(),
            &ServoState::Failed(FailureReason::IterationLimit {
                phase: Phase::Searching
            })
        );
    }

    #[test]
    fn blind_zone_must_sit_inside_near_threshold() {
        let mut settings = ServoSettings::default();
        assert!(settings.validate().is_ok());
        settings.blind_zone_cm = 15.0;
        assert!(settings.validate().is_err());
    }
}
