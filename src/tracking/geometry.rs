//! Pointing geometry.
//!
//! Conventions, fixed by the instrument head:
//!
//! * The inertial unit reports orientation as a quaternion quantized by
//!   16383; yaw is about the vertical axis.
//! * The head is mounted rotated against the inertial unit, so the head
//!   frame is the sensed frame times a fixed yaw offset.
//! * Solar azimuth (clockwise from north) maps to a signed bearing: east of
//!   north is negative, west of north positive, so a bearing is the yaw the
//!   head must hold to face away from the sun's side.
//! * Heading error is the yaw of the rotation taking the head to the target,
//!   positive counterclockwise, in degrees.

use crate::config::StepperSettings;
use crate::gateway::RawQuaternion;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Quantization divisor for raw quaternion components.
pub const QUATERNION_DIVISOR: f64 = 16383.0;

/// Decode a quantized quaternion into a unit rotation.
pub fn decode_attitude(raw: RawQuaternion) -> UnitQuaternion<f64> {
    let q = Quaternion::new(
        f64::from(raw.w) / QUATERNION_DIVISOR,
        f64::from(raw.x) / QUATERNION_DIVISOR,
        f64::from(raw.y) / QUATERNION_DIVISOR,
        f64::from(raw.z) / QUATERNION_DIVISOR,
    );
    UnitQuaternion::from_quaternion(q)
}

/// A rotation of `degrees` about the vertical axis.
pub fn yaw_rotation(degrees: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), degrees.to_radians())
}

/// Orientation of the sensor head given a raw attitude sample and the fixed
/// mounting offset between inertial unit and head.
pub fn head_orientation(
    raw: RawQuaternion,
    mount_offset: &UnitQuaternion<f64>,
) -> UnitQuaternion<f64> {
    decode_attitude(raw) * mount_offset
}

/// Map a solar azimuth in [0, 360) to a signed bearing in (-180, 180].
pub fn normalize_bearing(azimuth: f64) -> f64 {
    if azimuth < 180.0 {
        -azimuth
    } else {
        360.0 - azimuth
    }
}

/// The orientation the head should hold for a given bearing.
pub fn solar_target(bearing: f64) -> UnitQuaternion<f64> {
    yaw_rotation(bearing)
}

/// Signed yaw, in degrees, of the rotation taking `head` to `target`.
pub fn heading_error(head: &UnitQuaternion<f64>, target: &UnitQuaternion<f64>) -> f64 {
    (head.inverse() * target).euler_angles().2.to_degrees()
}

/// Drivetrain ratios turning a yaw error into motor steps.
#[derive(Debug, Clone, Copy)]
pub struct StepConversion {
    /// Motor step angle at full step, degrees.
    pub step_angle_deg: f64,
    /// Gearbox reduction on the motor shaft.
    pub gearbox_ratio: f64,
    /// Teeth on the slew ring.
    pub ring_teeth: f64,
    /// Teeth on the drive pinion.
    pub pinion_teeth: f64,
}

impl StepConversion {
    /// Steps for a yaw error, truncated toward zero.
    pub fn steps_for(&self, error_deg: f64) -> i32 {
        let output_step_deg = self.step_angle_deg / self.gearbox_ratio;
        (error_deg / output_step_deg * (self.ring_teeth / self.pinion_teeth)) as i32
    }
}

impl From<&StepperSettings> for StepConversion {
    fn from(settings: &StepperSettings) -> Self {
        Self {
            step_angle_deg: settings.step_angle_deg,
            gearbox_ratio: settings.gearbox_ratio,
            ring_teeth: settings.ring_teeth,
            pinion_teeth: settings.pinion_teeth,
        }
    }
}

/// Steps to command for a heading error, or `None` when the error sits
/// inside the deadband or rounds to no whole step.
pub fn correction_steps(
    error_deg: f64,
    threshold_deg: f64,
    conversion: &StepConversion,
) -> Option<i32> {
    if error_deg.abs() <= threshold_deg {
        return None;
    }
    let steps = conversion.steps_for(error_deg);
    if steps == 0 {
        None
    } else {
        Some(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drivetrain() -> StepConversion {
        StepConversion {
            step_angle_deg: 1.8,
            gearbox_ratio: 50.0,
            ring_teeth: 128.0,
            pinion_teeth: 48.0,
        }
    }

    #[test]
    fn bearing_is_signed_east_negative() {
        assert_eq!(normalize_bearing(0.0), 0.0);
        assert_eq!(normalize_bearing(90.0), -90.0);
        assert_eq!(normalize_bearing(180.0), 180.0);
        assert_eq!(normalize_bearing(270.0), 90.0);
        assert_eq!(normalize_bearing(359.0), 1.0);
    }

    #[test]
    fn ten_degrees_is_740_steps() {
        let conversion = drivetrain();
        assert_eq!(conversion.steps_for(10.0), 740);
        assert_eq!(conversion.steps_for(-10.0), -740);
    }

    #[test]
    fn deadband_and_zero_step_errors_command_nothing() {
        let conversion = drivetrain();
        assert_eq!(correction_steps(5.0, 5.0, &conversion), None);
        assert_eq!(correction_steps(-4.9, 5.0, &conversion), None);
        assert_eq!(correction_steps(5.1, 5.0, &conversion), Some(377));
        assert_eq!(correction_steps(-5.1, 5.0, &conversion), Some(-377));
        // Above threshold but under one whole step.
        assert_eq!(correction_steps(0.01, 0.001, &conversion), None);
    }

    #[test]
    fn heading_error_is_the_yaw_between_orientations() {
        let head = yaw_rotation(20.0);
        let target = yaw_rotation(30.0);
        assert!((heading_error(&head, &target) - 10.0).abs() < 1e-9);
        assert!((heading_error(&target, &head) + 10.0).abs() < 1e-9);
    }

    #[test]
    fn quantized_attitude_decodes_close_to_the_true_yaw() {
        let raw = RawQuaternion {
            w: ((45f64).to_radians().cos() * QUATERNION_DIVISOR) as i16,
            x: 0,
            y: 0,
            z: ((45f64).to_radians().sin() * QUATERNION_DIVISOR) as i16,
        };
        let yaw = decode_attitude(raw).euler_angles().2.to_degrees();
        assert!((yaw - 90.0).abs() < 0.02, "yaw {yaw}");
    }

    #[test]
    fn mount_offset_rotates_the_head_frame() {
        let offset = yaw_rotation(-109.0);
        let level = RawQuaternion {
            w: QUATERNION_DIVISOR as i16,
            x: 0,
            y: 0,
            z: 0,
        };
        let head = head_orientation(level, &offset);
        let yaw = head.euler_angles().2.to_degrees();
        assert!((yaw + 109.0).abs() < 1e-6, "yaw {yaw}");
    }

    #[test]
    fn fractional_step_check_matches_the_drivetrain() {
        // Error that lands between whole steps truncates toward zero.
        let conversion = drivetrain();
        assert_eq!(conversion.steps_for(0.05), 3);
        assert_eq!(conversion.steps_for(-0.05), -3);
    }
}
