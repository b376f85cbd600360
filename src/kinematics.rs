//! Planar reach kinematics.
//!
//! The base rotates the arm plane; shoulder and elbow form a two-link chain in
//! that plane. Servo conventions: the shoulder angle is the upper link's
//! elevation from horizontal, the elbow angle is the interior angle between the
//! links (180 = straight).

use serde::Deserialize;

use crate::actuator::{Pose, BASE, ELBOW, SHOULDER};

/// Kinematics collaborator used by the approach and grasp phases.
pub trait Kinematics: Send + Sync {
    /// Shoulder and elbow angles placing the wrist at (`reach_cm`, `height_cm`) in the
    /// arm plane, or `None` when the point is outside the envelope.
    fn solve(&self, reach_cm: f32, height_cm: f32) -> Option<(f32, f32)>;

    /// Wrist position (x, y, z) in centimetres, base frame.
    fn forward(&self, pose: &Pose) -> (f32, f32, f32);

    /// Wrist position in the arm plane: (reach, height).
    fn planar(&self, pose: &Pose) -> (f32, f32);
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanarArm {
    pub upper_arm_cm: f32,
    pub forearm_cm: f32,
}

impl Default for PlanarArm {
    fn default() -> Self {
        Self {
            upper_arm_cm: 15.0,
            forearm_cm: 13.0,
        }
    }
}

impl Kinematics for PlanarArm {
    fn solve(&self, reach_cm: f32, height_cm: f32) -> Option<(f32, f32)> {
        let (l1, l2) = (self.upper_arm_cm, self.forearm_cm);
        let d = reach_cm.hypot(height_cm);
        if !d.is_finite() || d <= (l1 - l2).abs() || d > l1 + l2 {
            return None;
        }
        let cos_elbow = ((l1 * l1 + l2 * l2 - d * d) / (2.0 * l1 * l2)).clamp(-1.0, 1.0);
        let cos_inner = ((l1 * l1 + d * d - l2 * l2) / (2.0 * l1 * d)).clamp(-1.0, 1.0);
        let elbow = cos_elbow.acos().to_degrees();
        let shoulder = (height_cm.atan2(reach_cm) + cos_inner.acos()).to_degrees();
        if !(0.0..=180.0).contains(&shoulder) || !(0.0..=180.0).contains(&elbow) {
            return None;
        }
        Some((shoulder, elbow))
    }

    fn forward(&self, pose: &Pose) -> (f32, f32, f32) {
        let (reach, height) = self.planar(pose);
        let base = pose.joints.get(BASE).copied().unwrap_or(90.0).to_radians();
        (reach * base.cos(), reach * base.sin(), height)
    }

    fn planar(&self, pose: &Pose) -> (f32, f32) {
        let shoulder = pose.joints.get(SHOULDER).copied().unwrap_or(90.0);
        let elbow = pose.joints.get(ELBOW).copied().unwrap_or(180.0);
        let a1 = shoulder.to_radians();
        let a2 = (shoulder + elbow - 180.0).to_radians();
        (
            self.upper_arm_cm * a1.cos() + self.forearm_cm * a2.cos(),
            self.upper_arm_cm * a1.sin() + self.forearm_cm * a2.sin(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(shoulder: f32, elbow: f32) -> Pose {
        Pose::new(vec![90.0, shoulder, elbow, 90.0, 90.0], 150.0)
    }

    #[test]
    fn straight_arm_reaches_full_length() {
        let arm = PlanarArm::default();
        let (r, h) = arm.planar(&pose(0.0, 180.0));
        assert!((r - 28.0).abs() < 1e-4 && h.abs() < 1e-4);
    }

    #[test]
    fn solve_inverts_planar() {
        let arm = PlanarArm::default();
        for (reach, height) in [(12.0, 10.0), (20.0, 5.0), (8.0, 18.0), (25.0, -2.0)] {
            let Some((s, e)) = arm.solve(reach, height) else {
                panic!("({}, {}) should be reachable", reach, height);
            };
            let (r, h) = arm.planar(&pose(s, e));
            assert!((r - reach).abs() < 1e-3, "reach {} vs {}", r, reach);
            assert!((h - height).abs() < 1e-3, "height {} vs {}", h, height);
        }
    }

    #[test]
    fn outside_envelope_is_unreachable() {
        let arm = PlanarArm::default();
        assert_eq!(arm.solve(30.0, 0.0), None);
        assert_eq!(arm.solve(1.0, 0.0), None);
    }

    #[test]
    fn forward_rotates_by_base() {
        let arm = PlanarArm::default();
        let (x, y, z) = arm.forward(&Pose::new(vec![0.0, 0.0, 180.0], 150.0));
        assert!((x - 28.0).abs() < 1e-4 && y.abs() < 1e-4 && z.abs() < 1e-4);
    }
}
