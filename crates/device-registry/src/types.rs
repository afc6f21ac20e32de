use serde::{Deserialize, Serialize};
use servo_transport::control_table::model;
use std::fmt;

/// Declared kind of a device on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Core,
    Actuator,
    Imu,
    FootPressure,
    Buttons,
    Leds,
}

impl DeviceKind {
    /// Model number a device of this kind is expected to report when the
    /// descriptor does not name one.
    pub fn default_model_number(self) -> u16 {
        match self {
            DeviceKind::Core => model::CORE_BOARD,
            DeviceKind::Actuator => model::MX64,
            DeviceKind::Imu | DeviceKind::Buttons | DeviceKind::Leds => model::SENSOR_BOARD,
            DeviceKind::FootPressure => model::FOOT_SENSOR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Core => "core",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Imu => "imu",
            DeviceKind::FootPressure => "foot_pressure",
            DeviceKind::Buttons => "buttons",
            DeviceKind::Leds => "leds",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn one() -> u32 {
    1
}

/// Kind-specific parameters, tagged by `kind` in the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceParams {
    Core {
        /// read every N-th cycle
        #[serde(default = "one")]
        read_rate: u32,
    },
    Actuator {
        #[serde(default)]
        mounting_offset: f64,
        #[serde(default)]
        joint_offset: f64,
    },
    Imu {
        #[serde(default)]
        frame: Option<String>,
    },
    FootPressure,
    Buttons {
        #[serde(default = "one")]
        read_rate: u32,
    },
    Leds {
        led_count: u16,
        #[serde(default)]
        start_number: u16,
    },
}

impl DeviceParams {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceParams::Core { .. } => DeviceKind::Core,
            DeviceParams::Actuator { .. } => DeviceKind::Actuator,
            DeviceParams::Imu { .. } => DeviceKind::Imu,
            DeviceParams::FootPressure => DeviceKind::FootPressure,
            DeviceParams::Buttons { .. } => DeviceKind::Buttons,
            DeviceParams::Leds { .. } => DeviceKind::Leds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct DeviceDescriptor {
    pub name: String,
    pub bus: String,
    pub address: u8,
    /// Expected ping reply; defaults per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_number: Option<u16>,
    /// Discovery fails while a mandatory device is missing. The core board
    /// is always mandatory, see [`DeviceDescriptor::is_mandatory`].
    #[serde(default)]
    pub mandatory: bool,
    #[serde(flatten)]
    pub params: DeviceParams,
}

impl DeviceDescriptor {
    pub fn expected_kind(&self) -> DeviceKind {
        self.params.kind()
    }

    /// Core boards switch servo power, so a run never goes ahead without one.
    pub fn is_mandatory(&self) -> bool {
        self.mandatory || self.expected_kind() == DeviceKind::Core
    }

    pub fn expected_model(&self) -> u16 {
        self.model_number
            .unwrap_or_else(|| self.expected_kind().default_model_number())
    }
}

fn protocol_two() -> u8 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PortDescriptor {
    pub name: String,
    pub device_file: String,
    pub baud_rate: u32,
    #[serde(default = "protocol_two")]
    pub protocol_version: u8,
}

/// Restricts which device kinds take part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    #[default]
    Full,
    OnlyImu,
    OnlyPressure,
}

impl BindingMode {
    pub fn admits(self, kind: DeviceKind) -> bool {
        match self {
            BindingMode::Full => true,
            BindingMode::OnlyImu => matches!(
                kind,
                DeviceKind::Core | DeviceKind::Imu | DeviceKind::Buttons | DeviceKind::Leds
            ),
            BindingMode::OnlyPressure => {
                matches!(kind, DeviceKind::Core | DeviceKind::FootPressure)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct DiscoverySettings {
    /// Fewer responders than this fails the pass.
    pub min_devices: usize,
    /// At or below this many responders the buses are probably unpowered.
    pub power_off_threshold: usize,
    /// Extra passes made while only optional devices are missing.
    pub partial_grace_passes: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff: f64,
    pub max_attempts: Option<u32>,
    /// Bind the actuators of one bus as a single sync read/write group.
    pub coalesce_actuators: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            min_devices: 2,
            power_off_threshold: 2,
            partial_grace_passes: 1,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 5000,
            backoff: 1.0,
            max_attempts: None,
            coalesce_actuators: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct CycleSettings {
    pub deadline_ms: u64,
    pub max_consecutive_deadline_misses: u32,
    pub init_timeout_ms: u64,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            deadline_ms: 10,
            max_consecutive_deadline_misses: 5,
            init_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct HubSettings {
    pub mode: BindingMode,
    pub discovery: DiscoverySettings,
    pub cycle: CycleSettings,
}

/// The full declared hardware: ports, devices and runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct HardwareConfig {
    pub ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub hub: HubSettings,
}
