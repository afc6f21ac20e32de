use crate::devices::{Device, DeviceReadout};
use crate::error::{DeviceError, HubError, Result};
use crate::types::BusId;
use device_registry::{JointTarget, PortDescriptor, Rgba};
use servo_transport::ServoBus;
use std::fmt;
use tracing::{debug, error, info};

/// An open bus driver together with the port name it was declared under.
pub struct BusPort {
    pub name: String,
    pub driver: Box<dyn ServoBus>,
}

impl BusPort {
    pub fn new(name: &str, driver: Box<dyn ServoBus>) -> Self {
        Self {
            name: name.to_string(),
            driver,
        }
    }
}

impl fmt::Debug for BusPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusPort")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Open every declared port with `opener`. The first failure aborts startup.
pub fn open_ports<F>(ports: &[PortDescriptor], mut opener: F) -> Result<Vec<BusPort>>
where
    F: FnMut(&PortDescriptor) -> servo_transport::Result<Box<dyn ServoBus>>,
{
    let mut out = Vec::with_capacity(ports.len());
    for desc in ports {
        let driver = opener(desc).map_err(|source| {
            error!(port = %desc.name, device_file = %desc.device_file, error = %source, "could not open port");
            HubError::PortOpen {
                port: desc.name.clone(),
                source,
            }
        })?;
        info!(port = %desc.name, device_file = %desc.device_file, baud = desc.baud_rate, "port opened");
        out.push(BusPort::new(&desc.name, driver));
    }
    Ok(out)
}

/// Opener for real serial adapters.
#[cfg(feature = "serial")]
pub fn open_serial(desc: &PortDescriptor) -> servo_transport::Result<Box<dyn ServoBus>> {
    let bus = servo_transport::SerialServoBus::open_with(
        &desc.device_file,
        desc.baud_rate,
        desc.protocol_version,
        std::time::Duration::from_millis(5),
    )?;
    Ok(Box::new(bus))
}

/// One simulated bus per declared port, populated with every declared device
/// answering with its expected model number.
#[cfg(feature = "mock")]
pub fn simulated_ports(
    config: &device_registry::HardwareConfig,
) -> (Vec<BusPort>, Vec<servo_transport::MockHandle>) {
    use servo_transport::MockBus;

    config
        .ports
        .iter()
        .map(|p| {
            let bus = config
                .devices_on(&p.name)
                .into_iter()
                .fold(MockBus::new(&p.device_file), |bus, d| {
                    bus.with_device(d.address, d.expected_model())
                });
            let handle = bus.handle();
            (BusPort::new(&p.name, Box::new(bus)), handle)
        })
        .unzip()
}

/// Commands routed to one bus for one write cycle.
#[derive(Debug, Default, Clone)]
pub(crate) struct BusCommands {
    pub joints: Vec<(String, JointTarget)>,
    pub leds: Vec<(String, usize, Rgba)>,
    pub power: Vec<(String, bool)>,
}

impl BusCommands {
    pub fn is_empty(&self) -> bool {
        self.joints.is_empty() && self.leds.is_empty() && self.power.is_empty()
    }

    /// Keep only what must survive a skipped cycle. Joint goals are superseded
    /// by the next command anyway.
    pub fn retained(self) -> Self {
        Self {
            joints: Vec::new(),
            leds: self.leds,
            power: self.power,
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.joints.extend(other.joints);
        self.leds.extend(other.leds);
        self.power.extend(other.power);
    }
}

/// Sole owner of one bus driver and the devices bound on it.
#[derive(Debug)]
pub(crate) struct BusWorker {
    pub id: BusId,
    pub port: BusPort,
    /// Service order: ascending first address.
    pub devices: Vec<Device>,
}

impl BusWorker {
    pub fn new(id: BusId, port: BusPort, mut devices: Vec<Device>) -> Self {
        devices.sort_by_key(Device::first_address);
        Self { id, port, devices }
    }

    pub fn name(&self) -> &str {
        &self.port.name
    }

    /// Initialise every device in order. Failures are collected, not short-circuited.
    pub fn init_all(&mut self) -> Vec<DeviceError> {
        let bus = self.port.driver.as_mut();
        let mut errors = Vec::new();
        for device in &mut self.devices {
            if let Err(e) = device.init(bus) {
                errors.push(e);
            }
        }
        debug!(bus = %self.port.name, devices = self.devices.len(), failed = errors.len(), "bus initialised");
        errors
    }

    pub fn read_all(&mut self, cycle: u64) -> Vec<DeviceReadout> {
        let bus = self.port.driver.as_mut();
        self.devices
            .iter_mut()
            .filter_map(Device::as_readable)
            .flat_map(|d| d.read(bus, cycle))
            .collect()
    }

    pub fn write_all(&mut self, commands: BusCommands) -> Vec<DeviceError> {
        for (joint, target) in commands.joints {
            if !self.devices.iter_mut().any(|d| d.stage_joint(&joint, target)) {
                debug!(bus = %self.port.name, joint = %joint, "joint not on this bus");
            }
        }
        for (panel, index, color) in commands.leds {
            self.devices
                .iter_mut()
                .any(|d| d.stage_led(&panel, index, color));
        }
        for (core, on) in commands.power {
            self.devices.iter_mut().any(|d| d.stage_power(&core, on));
        }

        let bus = self.port.driver.as_mut();
        self.devices
            .iter_mut()
            .filter_map(Device::as_writable)
            .filter_map(|d| d.write(bus).err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{CoreBoard, ImuSensor, Reading};
    use servo_transport::control_table::model;
    use servo_transport::{MockBus, TransportError};

    #[test]
    fn open_ports_stops_at_first_failure() {
        let ports = vec![
            PortDescriptor {
                name: "a".into(),
                device_file: "/dev/a".into(),
                baud_rate: 4_000_000,
                protocol_version: 2,
            },
            PortDescriptor {
                name: "b".into(),
                device_file: "/dev/b".into(),
                baud_rate: 4_000_000,
                protocol_version: 2,
            },
        ];
        let err = open_ports(&ports, |d| {
            if d.name == "b" {
                Err(TransportError::PortNotFound(d.device_file.clone()))
            } else {
                Ok(Box::new(MockBus::new(&d.device_file)) as Box<dyn ServoBus>)
            }
        })
        .unwrap_err();
        assert!(matches!(err, HubError::PortOpen { ref port, .. } if port == "b"));
    }

    #[test]
    fn failing_device_does_not_stop_siblings() {
        let bus = MockBus::new("p")
            .with_device(1, model::CORE_BOARD)
            .with_device(241, model::SENSOR_BOARD);
        let handle = bus.handle();
        let mut worker = BusWorker::new(
            BusId(0),
            BusPort::new("p", Box::new(bus)),
            vec![
                Device::Imu(ImuSensor::new("imu", 241, "imu")),
                Device::Core(CoreBoard::new("core", 1, 1)),
            ],
        );
        assert_eq!(worker.devices[0].name(), "core");

        handle.set_responsive(1, false).unwrap();
        let errors = worker.init_all();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].device(), "core");

        let out = worker.read_all(0);
        assert_eq!(out.len(), 2);
        assert!(out[0].result.is_err());
        assert!(matches!(out[1].result, Ok(Reading::Imu(_))));
    }
}
