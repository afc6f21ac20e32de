//! Model numbers and register maps of the devices found on the buses.
//!
//! Servo registers follow the Dynamixel protocol 2.0 control table shared by
//! the MX(2.0) and X series. The sensor and power boards run custom firmware
//! that mimics that layout.

use crate::RegisterRange;

/// Model numbers reported in ping replies.
pub mod model {
    pub const CORE_BOARD: u16 = 0xABBA;
    pub const SENSOR_BOARD: u16 = 0xBAFF;
    /// Foot pressure boards currently report 0.
    pub const FOOT_SENSOR: u16 = 0;
    pub const MX64: u16 = 311;
    pub const MX106: u16 = 321;
    pub const XH540: u16 = 1100;

    pub const SERVOS: [u16; 3] = [MX64, MX106, XH540];

    pub fn is_servo(model_number: u16) -> bool {
        SERVOS.contains(&model_number)
    }
}

pub mod servo {
    use super::RegisterRange;

    pub const TORQUE_ENABLE: u16 = 64;
    pub const GOAL_CURRENT: u16 = 102;
    pub const PROFILE_VELOCITY: u16 = 112;
    pub const GOAL_POSITION: u16 = 116;
    pub const PRESENT_CURRENT: u16 = 126;
    pub const PRESENT_VELOCITY: u16 = 128;
    pub const PRESENT_POSITION: u16 = 132;

    /// Present current (2) + present velocity (4) + present position (4).
    pub const PRESENT_STATE: RegisterRange = RegisterRange::new(PRESENT_CURRENT, 10);
    /// Profile velocity (4) + goal position (4).
    pub const GOAL_BLOCK: RegisterRange = RegisterRange::new(PROFILE_VELOCITY, 8);

    pub const TICKS_PER_REV: f64 = 4096.0;
    pub const CENTER_TICKS: i32 = 2048;
    /// rpm per velocity LSB
    pub const VELOCITY_UNIT_RPM: f64 = 0.229;
    /// mA per current LSB
    pub const CURRENT_UNIT_MA: f64 = 2.69;
}

pub mod core_board {
    use super::RegisterRange;

    pub const POWER_ENABLE: u16 = 10;
    /// power on (1) + VCC mV (2) + VBAT mV (2)
    pub const STATUS: RegisterRange = RegisterRange::new(36, 5);
}

pub mod sensor_board {
    use super::RegisterRange;

    /// gyro xyz, accel xyz, orientation quaternion xyzw; all f32 LE
    pub const IMU: RegisterRange = RegisterRange::new(36, 40);
    /// one byte per button
    pub const BUTTONS: RegisterRange = RegisterRange::new(76, 3);
    pub const LED_BASE: u16 = 80;
    pub const BYTES_PER_LED: u16 = 4;
    pub const TABLE_SIZE: u16 = 256;

    /// Registers of `count` LEDs starting at LED `start_number`, or `None`
    /// if they do not fit in the control table.
    pub fn led_block(start_number: u16, count: u16) -> Option<RegisterRange> {
        let start = u32::from(LED_BASE) + u32::from(start_number) * u32::from(BYTES_PER_LED);
        let len = u32::from(count) * u32::from(BYTES_PER_LED);
        if start + len > u32::from(TABLE_SIZE) {
            return None;
        }
        Some(RegisterRange::new(
            u16::try_from(start).ok()?,
            u16::try_from(len).ok()?,
        ))
    }
}

pub mod foot_sensor {
    use super::RegisterRange;

    /// four load cells, f32 LE each
    pub const CELLS: RegisterRange = RegisterRange::new(36, 16);
}

#[cfg(test)]
mod tests {
    use super::sensor_board::led_block;
    use super::RegisterRange;

    #[test]
    fn led_block_stays_inside_the_table() {
        assert_eq!(led_block(0, 3), Some(RegisterRange::new(80, 12)));
        // 80 + 44 * 4 = 256, exactly full
        assert_eq!(led_block(40, 4), Some(RegisterRange::new(240, 16)));
        assert_eq!(led_block(40, 5), None);
        assert_eq!(led_block(20_000, 1), None);
        assert_eq!(led_block(u16::MAX, u16::MAX), None);
    }
}
