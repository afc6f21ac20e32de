use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("duplicate port name: {0}")]
    DuplicatePort(String),
    #[error("duplicate device name: {0}")]
    DuplicateDevice(String),
    #[error("device {device} refers to unknown bus {bus}")]
    UnknownBus { device: String, bus: String },
    #[error("devices {first} and {second} share address {address} on bus {bus}")]
    DuplicateAddress {
        bus: String,
        address: u8,
        first: String,
        second: String,
    },
    #[error("device {device} uses reserved address {address}")]
    ReservedAddress { device: String, address: u8 },
    #[error("device {device}: {reason}")]
    InvalidParam { device: String, reason: &'static str },
}
