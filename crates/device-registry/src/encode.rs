use serde::{Deserialize, Serialize};
use servo_transport::control_table::servo;
use std::f64::consts::PI;

/// Goal for one joint. `None` leaves the servo's own profile/limit in place.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointTarget {
    /// rad
    pub position: f64,
    /// rad/s
    #[serde(default)]
    pub velocity: Option<f64>,
    /// A
    #[serde(default)]
    pub effort: Option<f64>,
}

impl JointTarget {
    pub fn position(position: f64) -> Self {
        Self {
            position,
            velocity: None,
            effort: None,
        }
    }
}

/// Offsets between a servo's zero and the joint's zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JointCalibration {
    pub mounting_offset: f64,
    pub joint_offset: f64,
}

impl JointCalibration {
    pub fn total(&self) -> f64 {
        self.mounting_offset + self.joint_offset
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const OFF: Rgba = Rgba {
        r: 0,
        g: 0,
        b: 0,
        a: 0,
    };

    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

pub fn rad_to_ticks(rad: f64) -> i32 {
    let ticks = (rad * servo::TICKS_PER_REV / (2.0 * PI)).round();
    servo::CENTER_TICKS + ticks.clamp(i32::MIN as f64 / 2.0, i32::MAX as f64 / 2.0) as i32
}

pub fn ticks_to_rad(ticks: i32) -> f64 {
    f64::from(ticks - servo::CENTER_TICKS) * 2.0 * PI / servo::TICKS_PER_REV
}

/// rad/s to profile velocity units; 0 means unlimited.
pub fn velocity_to_profile(rad_s: Option<f64>) -> u32 {
    let Some(v) = rad_s.filter(|v| v.is_finite()) else {
        return 0;
    };
    let rpm = v.abs() * 60.0 / (2.0 * PI);
    (rpm / servo::VELOCITY_UNIT_RPM).round().min(u32::MAX as f64) as u32
}

pub fn amps_to_current(amps: f64) -> i16 {
    let raw = (amps.abs() * 1000.0 / servo::CURRENT_UNIT_MA).round();
    raw.min(f64::from(i16::MAX)) as i16
}

/// Profile velocity + goal position block for one servo.
pub fn encode_goal(target: &JointTarget, cal: &JointCalibration) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::from(servo::GOAL_BLOCK.len));
    out.extend_from_slice(&velocity_to_profile(target.velocity).to_le_bytes());
    out.extend_from_slice(&rad_to_ticks(target.position + cal.total()).to_le_bytes());
    out
}

pub fn encode_current_limit(amps: f64) -> Vec<u8> {
    amps_to_current(amps).to_le_bytes().to_vec()
}

pub fn encode_leds(colors: &[Rgba]) -> Vec<u8> {
    colors.iter().flat_map(|c| [c.r, c.g, c.b, c.a]).collect()
}

pub fn encode_flag(on: bool) -> [u8; 1] {
    [u8::from(on)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rad_is_center_ticks() {
        assert_eq!(rad_to_ticks(0.0), 2048);
        assert_eq!(rad_to_ticks(PI), 4096);
        assert!((ticks_to_rad(1024) + PI / 2.0).abs() < 1e-9);
    }

    #[test]
    fn goal_applies_offsets_and_velocity() {
        let cal = JointCalibration {
            mounting_offset: PI / 2.0,
            joint_offset: 0.0,
        };
        let target = JointTarget {
            position: 0.0,
            velocity: Some(2.0 * PI * 0.229 / 60.0 * 10.0),
            effort: None,
        };
        let bytes = encode_goal(&target, &cal);
        assert_eq!(bytes.len(), 8);
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 10);
        assert_eq!(i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 3072);
    }

    #[test]
    fn unset_velocity_means_unlimited_profile() {
        assert_eq!(velocity_to_profile(None), 0);
        assert_eq!(velocity_to_profile(Some(f64::NAN)), 0);
    }

    #[test]
    fn current_limit_saturates() {
        assert_eq!(amps_to_current(1.0e6), i16::MAX);
        assert_eq!(amps_to_current(0.269), 100);
    }

    #[test]
    fn leds_are_packed_rgba() {
        let bytes = encode_leds(&[Rgba::new(1, 2, 3, 4), Rgba::OFF]);
        assert_eq!(bytes, vec![1, 2, 3, 4, 0, 0, 0, 0]);
    }
}
