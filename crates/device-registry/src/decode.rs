use crate::encode::{ticks_to_rad, JointCalibration};
use serde::{Deserialize, Serialize};
use servo_transport::control_table::{core_board, foot_sensor, sensor_board, servo};
use std::f64::consts::PI;

/// Present state of one servo in joint space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorState {
    /// rad
    pub position: f64,
    /// rad/s
    pub velocity: f64,
    /// A
    pub effort: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuReading {
    /// rad/s
    pub angular_velocity: [f64; 3],
    /// m/s^2
    pub linear_acceleration: [f64; 3],
    /// quaternion x, y, z, w
    pub orientation: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FootPressure {
    pub cells: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ButtonState {
    pub pressed: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoreStatus {
    pub power_on: bool,
    /// V
    pub vcc: f64,
    /// V
    pub vbat: f64,
}

fn f32_at(data: &[u8], offset: usize) -> f64 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[offset..offset + 4]);
    f64::from(f32::from_le_bytes(b))
}

fn i32_at(data: &[u8], offset: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[offset..offset + 4]);
    i32::from_le_bytes(b)
}

/// Decode the present current/velocity/position block of a servo.
pub fn decode_actuator_state(data: &[u8], cal: &JointCalibration) -> Option<ActuatorState> {
    if data.len() < usize::from(servo::PRESENT_STATE.len) {
        return None;
    }
    let current = i16::from_le_bytes([data[0], data[1]]);
    let velocity = i32_at(data, 2);
    let position = i32_at(data, 6);

    Some(ActuatorState {
        position: ticks_to_rad(position) - cal.total(),
        velocity: f64::from(velocity) * servo::VELOCITY_UNIT_RPM * 2.0 * PI / 60.0,
        effort: f64::from(current) * servo::CURRENT_UNIT_MA / 1000.0,
    })
}

pub fn decode_imu(data: &[u8]) -> Option<ImuReading> {
    if data.len() < usize::from(sensor_board::IMU.len) {
        return None;
    }
    let v = |i: usize| f32_at(data, i * 4);
    let reading = ImuReading {
        angular_velocity: [v(0), v(1), v(2)],
        linear_acceleration: [v(3), v(4), v(5)],
        orientation: [v(6), v(7), v(8), v(9)],
    };
    let finite = reading
        .angular_velocity
        .iter()
        .chain(&reading.linear_acceleration)
        .chain(&reading.orientation)
        .all(|x| x.is_finite());
    finite.then_some(reading)
}

pub fn decode_foot(data: &[u8]) -> Option<FootPressure> {
    if data.len() < usize::from(foot_sensor::CELLS.len) {
        return None;
    }
    Some(FootPressure {
        cells: [
            f32_at(data, 0),
            f32_at(data, 4),
            f32_at(data, 8),
            f32_at(data, 12),
        ],
    })
}

pub fn decode_buttons(data: &[u8]) -> Option<ButtonState> {
    let n = usize::from(sensor_board::BUTTONS.len);
    if data.len() < n {
        return None;
    }
    Some(ButtonState {
        pressed: data[..n].iter().map(|&b| b != 0).collect(),
    })
}

pub fn decode_core(data: &[u8]) -> Option<CoreStatus> {
    if data.len() < usize::from(core_board::STATUS.len) {
        return None;
    }
    Some(CoreStatus {
        power_on: data[0] != 0,
        vcc: f64::from(u16::from_le_bytes([data[1], data[2]])) / 1000.0,
        vbat: f64::from(u16::from_le_bytes([data[3], data[4]])) / 1000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actuator_state_removes_offsets() {
        let mut data = Vec::new();
        data.extend_from_slice(&100i16.to_le_bytes());
        data.extend_from_slice(&(-10i32).to_le_bytes());
        data.extend_from_slice(&3072i32.to_le_bytes());
        let cal = JointCalibration {
            mounting_offset: PI / 2.0,
            joint_offset: 0.0,
        };
        let s = decode_actuator_state(&data, &cal).unwrap();
        assert!(s.position.abs() < 1e-9);
        assert!((s.effort - 0.269).abs() < 1e-9);
        assert!(s.velocity < 0.0);
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert!(decode_actuator_state(&[0; 9], &JointCalibration::default()).is_none());
        assert!(decode_imu(&[0; 39]).is_none());
        assert!(decode_foot(&[0; 15]).is_none());
        assert!(decode_buttons(&[0; 2]).is_none());
        assert!(decode_core(&[0; 4]).is_none());
    }

    #[test]
    fn imu_rejects_nan() {
        let mut data: Vec<u8> = (0..10).flat_map(|_| 1.0f32.to_le_bytes()).collect();
        data[0..4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(decode_imu(&data).is_none());
    }

    #[test]
    fn core_status_in_volts() {
        let mut data = vec![1];
        data.extend_from_slice(&12_000u16.to_le_bytes());
        data.extend_from_slice(&15_500u16.to_le_bytes());
        let s = decode_core(&data).unwrap();
        assert!(s.power_on);
        assert!((s.vcc - 12.0).abs() < 1e-9);
        assert!((s.vbat - 15.5).abs() < 1e-9);
    }
}
