use crate::{DeviceDescriptor, DeviceKind, DeviceParams, HardwareConfig, RegistryError};
use servo_transport::control_table::sensor_board;
use servo_transport::MAX_DEVICE_ID;
use std::collections::{HashMap, HashSet};

impl HardwareConfig {
    /// Check the table invariants: unique names, known buses, unique
    /// (bus, address) pairs and sane kind parameters.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut ports = HashSet::new();
        for p in &self.ports {
            if !ports.insert(p.name.as_str()) {
                return Err(RegistryError::DuplicatePort(p.name.clone()));
            }
        }

        let mut names = HashSet::new();
        let mut addresses: HashMap<(&str, u8), &str> = HashMap::new();
        for d in &self.devices {
            if !names.insert(d.name.as_str()) {
                return Err(RegistryError::DuplicateDevice(d.name.clone()));
            }
            if !ports.contains(d.bus.as_str()) {
                return Err(RegistryError::UnknownBus {
                    device: d.name.clone(),
                    bus: d.bus.clone(),
                });
            }
            if d.address > MAX_DEVICE_ID {
                return Err(RegistryError::ReservedAddress {
                    device: d.name.clone(),
                    address: d.address,
                });
            }
            if let Some(first) = addresses.insert((d.bus.as_str(), d.address), d.name.as_str()) {
                return Err(RegistryError::DuplicateAddress {
                    bus: d.bus.clone(),
                    address: d.address,
                    first: first.to_string(),
                    second: d.name.clone(),
                });
            }
            check_params(d)?;
        }
        Ok(())
    }

    /// Devices declared on one port, in ascending address order.
    pub fn devices_on(&self, bus: &str) -> Vec<&DeviceDescriptor> {
        let mut out: Vec<_> = self.devices.iter().filter(|d| d.bus == bus).collect();
        out.sort_by_key(|d| d.address);
        out
    }

    pub fn joint_names(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|d| d.expected_kind() == DeviceKind::Actuator)
            .map(|d| d.name.as_str())
            .collect()
    }
}

fn check_params(d: &DeviceDescriptor) -> Result<(), RegistryError> {
    let invalid = |reason| RegistryError::InvalidParam {
        device: d.name.clone(),
        reason,
    };
    match &d.params {
        DeviceParams::Core { read_rate } | DeviceParams::Buttons { read_rate } => {
            if *read_rate == 0 {
                return Err(invalid("read_rate must be at least 1"));
            }
        }
        DeviceParams::Leds {
            led_count,
            start_number,
        } => {
            if *led_count == 0 {
                return Err(invalid("led_count must be at least 1"));
            }
            if sensor_board::led_block(*start_number, *led_count).is_none() {
                return Err(invalid("leds do not fit in the sensor board control table"));
            }
        }
        DeviceParams::Actuator {
            mounting_offset,
            joint_offset,
        } => {
            if !mounting_offset.is_finite() || !joint_offset.is_finite() {
                return Err(invalid("offsets must be finite"));
            }
        }
        DeviceParams::Imu { .. } | DeviceParams::FootPressure => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortDescriptor;
    use servo_transport::BROADCAST_ID;

    fn port(name: &str) -> PortDescriptor {
        PortDescriptor {
            name: name.to_string(),
            device_file: format!("/dev/{name}"),
            baud_rate: 2_000_000,
            protocol_version: 2,
        }
    }

    fn servo(name: &str, bus: &str, address: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            bus: bus.to_string(),
            address,
            model_number: None,
            mandatory: false,
            params: DeviceParams::Actuator {
                mounting_offset: 0.0,
                joint_offset: 0.0,
            },
        }
    }

    fn config(devices: Vec<DeviceDescriptor>) -> HardwareConfig {
        HardwareConfig {
            ports: vec![port("a"), port("b")],
            devices,
            hub: Default::default(),
        }
    }

    #[test]
    fn same_address_on_different_buses_is_fine() {
        let cfg = config(vec![servo("x", "a", 1), servo("y", "b", 1)]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_address_on_one_bus_is_rejected() {
        let cfg = config(vec![servo("x", "a", 1), servo("y", "a", 1)]);
        assert!(matches!(
            cfg.validate(),
            Err(RegistryError::DuplicateAddress { address: 1, .. })
        ));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let cfg = config(vec![servo("x", "a", 1), servo("x", "b", 2)]);
        assert_eq!(
            cfg.validate(),
            Err(RegistryError::DuplicateDevice("x".to_string()))
        );
    }

    #[test]
    fn unknown_bus_is_rejected() {
        let cfg = config(vec![servo("x", "c", 1)]);
        assert!(matches!(
            cfg.validate(),
            Err(RegistryError::UnknownBus { .. })
        ));
    }

    #[test]
    fn reserved_addresses_are_rejected() {
        assert!(config(vec![servo("x", "a", MAX_DEVICE_ID)]).validate().is_ok());
        for address in [0xFD, BROADCAST_ID, 0xFF] {
            let cfg = config(vec![servo("x", "a", address)]);
            assert_eq!(
                cfg.validate(),
                Err(RegistryError::ReservedAddress {
                    device: "x".to_string(),
                    address,
                })
            );
        }
    }

    fn leds(start_number: u16, led_count: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            params: DeviceParams::Leds {
                led_count,
                start_number,
            },
            ..servo("leds", "a", 242)
        }
    }

    #[test]
    fn led_panel_must_fit_the_control_table() {
        assert!(config(vec![leds(0, 3)]).validate().is_ok());
        assert!(config(vec![leds(40, 4)]).validate().is_ok());
        for bad in [leds(40, 5), leds(20_000, 1)] {
            assert!(matches!(
                config(vec![bad]).validate(),
                Err(RegistryError::InvalidParam { .. })
            ));
        }
    }

    #[test]
    fn devices_on_bus_are_ordered_by_address() {
        let cfg = config(vec![servo("c", "a", 9), servo("a", "a", 2), servo("b", "b", 1)]);
        let names: Vec<_> = cfg.devices_on("a").iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
