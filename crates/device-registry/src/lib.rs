//! device-registry: YAML-driven table of serial ports and the devices chained on them

mod types;
pub use types::*;

mod error;
pub use error::RegistryError;

mod validate;

mod loader;
pub use loader::{load_config_file, parse_config};

mod encode;
pub use encode::{
    encode_current_limit, encode_flag, encode_goal, encode_leds, rad_to_ticks, ticks_to_rad,
    JointCalibration, JointTarget, Rgba,
};

mod decode;
pub use decode::{
    decode_actuator_state, decode_buttons, decode_core, decode_foot, decode_imu, ActuatorState,
    ButtonState, CoreStatus, FootPressure, ImuReading,
};
