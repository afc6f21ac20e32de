//! Device interfaces bound to a bus.
//!
//! Each variant knows its own register layout. The bus driver is passed in on
//! every call; a device never holds on to it.

mod actuator;
mod boards;
mod sensors;

pub use actuator::{Actuator, ActuatorBus};
pub use boards::{CoreBoard, LedPanel};
pub use sensors::{ButtonPanel, FootPressureSensor, ImuSensor};

use crate::error::DeviceError;
use device_registry::{
    ActuatorState, ButtonState, CoreStatus, DeviceKind, FootPressure, ImuReading, JointTarget,
    Rgba,
};
use servo_transport::{Address, ServoBus};

/// Telemetry decoded from one device.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Joint(ActuatorState),
    Imu(ImuReading),
    Foot(FootPressure),
    Buttons(ButtonState),
    Core(CoreStatus),
    /// Skipped this cycle because of the device's read rate.
    NotDue,
}

/// Outcome of reading one named device (or one member of a group).
#[derive(Debug)]
pub struct DeviceReadout {
    pub name: String,
    pub result: Result<Reading, DeviceError>,
}

impl DeviceReadout {
    pub(crate) fn new(name: &str, result: Result<Reading, DeviceError>) -> Self {
        Self {
            name: name.to_string(),
            result,
        }
    }
}

pub trait Readable {
    /// Read telemetry. Groups report one readout per member so a failing
    /// member does not hide its siblings.
    fn read(&mut self, bus: &mut dyn ServoBus, cycle: u64) -> Vec<DeviceReadout>;
}

pub trait Writable {
    /// Push the pending command, if any.
    fn write(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError>;
}

pub(crate) fn due(cycle: u64, read_rate: u32) -> bool {
    read_rate <= 1 || cycle % u64::from(read_rate) == 0
}

#[derive(Debug)]
pub enum Device {
    Core(CoreBoard),
    Actuator(Actuator),
    ActuatorBus(ActuatorBus),
    Imu(ImuSensor),
    Foot(FootPressureSensor),
    Buttons(ButtonPanel),
    Leds(LedPanel),
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Device::Core(d) => d.name(),
            Device::Actuator(d) => d.name(),
            Device::ActuatorBus(d) => d.label(),
            Device::Imu(d) => d.name(),
            Device::Foot(d) => d.name(),
            Device::Buttons(d) => d.name(),
            Device::Leds(d) => d.name(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Core(_) => DeviceKind::Core,
            Device::Actuator(_) | Device::ActuatorBus(_) => DeviceKind::Actuator,
            Device::Imu(_) => DeviceKind::Imu,
            Device::Foot(_) => DeviceKind::FootPressure,
            Device::Buttons(_) => DeviceKind::Buttons,
            Device::Leds(_) => DeviceKind::Leds,
        }
    }

    /// Lowest address served by this device; defines the service order on a bus.
    pub fn first_address(&self) -> Address {
        match self {
            Device::Core(d) => d.address(),
            Device::Actuator(d) => d.address(),
            Device::ActuatorBus(d) => d.addresses().first().copied().unwrap_or(0),
            Device::Imu(d) => d.address(),
            Device::Foot(d) => d.address(),
            Device::Buttons(d) => d.address(),
            Device::Leds(d) => d.address(),
        }
    }

    /// Names this device reports readings under.
    pub fn member_names(&self) -> Vec<&str> {
        match self {
            Device::ActuatorBus(d) => d.members().iter().map(Actuator::name).collect(),
            other => vec![other.name()],
        }
    }

    pub fn init(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        match self {
            Device::Core(d) => d.init(bus),
            Device::Actuator(d) => d.init(bus),
            Device::ActuatorBus(d) => d.init(bus),
            Device::Leds(d) => d.init(bus),
            Device::Imu(_) | Device::Foot(_) | Device::Buttons(_) => Ok(()),
        }
    }

    pub fn as_readable(&mut self) -> Option<&mut dyn Readable> {
        match self {
            Device::Core(d) => Some(d),
            Device::Actuator(d) => Some(d),
            Device::ActuatorBus(d) => Some(d),
            Device::Imu(d) => Some(d),
            Device::Foot(d) => Some(d),
            Device::Buttons(d) => Some(d),
            Device::Leds(_) => None,
        }
    }

    pub fn as_writable(&mut self) -> Option<&mut dyn Writable> {
        match self {
            Device::Core(d) => Some(d),
            Device::Actuator(d) => Some(d),
            Device::ActuatorBus(d) => Some(d),
            Device::Leds(d) => Some(d),
            Device::Imu(_) | Device::Foot(_) | Device::Buttons(_) => None,
        }
    }

    /// Stage a joint goal if this device owns the joint.
    pub fn stage_joint(&mut self, joint: &str, target: JointTarget) -> bool {
        match self {
            Device::Actuator(d) if d.name() == joint => {
                d.stage(target);
                true
            }
            Device::ActuatorBus(d) => d.stage(joint, target),
            _ => false,
        }
    }

    pub fn stage_led(&mut self, panel: &str, index: usize, color: Rgba) -> bool {
        match self {
            Device::Leds(d) if d.name() == panel => d.set(index, color),
            _ => false,
        }
    }

    pub fn stage_power(&mut self, core: &str, on: bool) -> bool {
        match self {
            Device::Core(d) if d.name() == core => {
                d.set_power(on);
                true
            }
            _ => false,
        }
    }
}
