use super::{due, DeviceReadout, Readable, Reading};
use crate::error::DeviceError;
use device_registry::{decode_buttons, decode_foot, decode_imu};
use servo_transport::control_table::{foot_sensor, sensor_board};
use servo_transport::{Address, RegisterRange, ServoBus};

fn read_block(
    bus: &mut dyn ServoBus,
    name: &str,
    address: Address,
    range: RegisterRange,
) -> Result<Vec<u8>, DeviceError> {
    bus.read(address, range)
        .map_err(|e| DeviceError::transport(name, e))
}

#[derive(Debug, Clone)]
pub struct ImuSensor {
    name: String,
    address: Address,
    frame: String,
}

impl ImuSensor {
    pub fn new(name: &str, address: Address, frame: &str) -> Self {
        Self {
            name: name.to_string(),
            address,
            frame: frame.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn frame(&self) -> &str {
        &self.frame
    }
}

impl Readable for ImuSensor {
    fn read(&mut self, bus: &mut dyn ServoBus, _cycle: u64) -> Vec<DeviceReadout> {
        let result = read_block(bus, &self.name, self.address, sensor_board::IMU).and_then(|d| {
            decode_imu(&d)
                .map(Reading::Imu)
                .ok_or_else(|| DeviceError::malformed(&self.name, "non-finite imu sample"))
        });
        vec![DeviceReadout::new(&self.name, result)]
    }
}

#[derive(Debug, Clone)]
pub struct FootPressureSensor {
    name: String,
    address: Address,
}

impl FootPressureSensor {
    pub fn new(name: &str, address: Address) -> Self {
        Self {
            name: name.to_string(),
            address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

impl Readable for FootPressureSensor {
    fn read(&mut self, bus: &mut dyn ServoBus, _cycle: u64) -> Vec<DeviceReadout> {
        let result = read_block(bus, &self.name, self.address, foot_sensor::CELLS).and_then(|d| {
            decode_foot(&d)
                .map(Reading::Foot)
                .ok_or_else(|| DeviceError::malformed(&self.name, "short load cell block"))
        });
        vec![DeviceReadout::new(&self.name, result)]
    }
}

/// Buttons on the sensor board. Polled every `read_rate` cycles.
#[derive(Debug, Clone)]
pub struct ButtonPanel {
    name: String,
    address: Address,
    read_rate: u32,
}

impl ButtonPanel {
    pub fn new(name: &str, address: Address, read_rate: u32) -> Self {
        Self {
            name: name.to_string(),
            address,
            read_rate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

impl Readable for ButtonPanel {
    fn read(&mut self, bus: &mut dyn ServoBus, cycle: u64) -> Vec<DeviceReadout> {
        if !due(cycle, self.read_rate) {
            return vec![DeviceReadout::new(&self.name, Ok(Reading::NotDue))];
        }
        let result =
            read_block(bus, &self.name, self.address, sensor_board::BUTTONS).and_then(|d| {
                decode_buttons(&d)
                    .map(Reading::Buttons)
                    .ok_or_else(|| DeviceError::malformed(&self.name, "short button block"))
            });
        vec![DeviceReadout::new(&self.name, result)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servo_transport::control_table::model;
    use servo_transport::MockBus;

    #[test]
    fn imu_decodes_poked_sample() {
        let mut bus = MockBus::new("port1").with_device(241, model::SENSOR_BOARD);
        let mut raw = Vec::new();
        for v in [0.0f32, 0.0, 0.5, 0.0, 0.0, 9.81, 0.0, 0.0, 0.0, 1.0] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        bus.handle().poke(241, sensor_board::IMU.start, &raw).unwrap();

        let mut imu = ImuSensor::new("imu", 241, "imu_frame");
        let out = imu.read(&mut bus, 0);
        match &out[0].result {
            Ok(Reading::Imu(r)) => {
                assert_eq!(r.angular_velocity[2], 0.5);
                assert_eq!(r.orientation[3], 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nan_imu_sample_is_malformed() {
        let mut bus = MockBus::new("port1").with_device(241, model::SENSOR_BOARD);
        bus.handle()
            .poke(241, sensor_board::IMU.start, &f32::NAN.to_le_bytes())
            .unwrap();
        let mut imu = ImuSensor::new("imu", 241, "imu_frame");
        let out = imu.read(&mut bus, 0);
        assert!(matches!(out[0].result, Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn buttons_skip_cycles_below_read_rate() {
        let mut bus = MockBus::new("port1").with_device(241, model::SENSOR_BOARD);
        bus.handle().poke(241, sensor_board::BUTTONS.start, &[0, 1, 0]).unwrap();
        let mut panel = ButtonPanel::new("buttons", 241, 3);

        let first = panel.read(&mut bus, 0);
        assert_eq!(
            first[0].result.as_ref().ok(),
            Some(&Reading::Buttons(device_registry::ButtonState {
                pressed: vec![false, true, false]
            }))
        );
        assert!(matches!(panel.read(&mut bus, 1)[0].result, Ok(Reading::NotDue)));
        assert!(matches!(panel.read(&mut bus, 2)[0].result, Ok(Reading::NotDue)));
        assert_eq!(bus.stats().reads(), 1);
    }

    #[test]
    fn silent_foot_is_no_reply() {
        let mut bus = MockBus::new("port3").with_device(101, model::FOOT_SENSOR);
        bus.handle().set_responsive(101, false).unwrap();
        let mut foot = FootPressureSensor::new("l_foot", 101);
        let out = foot.read(&mut bus, 0);
        assert!(matches!(out[0].result, Err(DeviceError::NoReply { .. })));
    }
}
