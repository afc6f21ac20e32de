//! servo-transport: bus drivers for daisy-chained servos and sensor boards
//!
//! This crate provides the [`ServoBus`] trait (ping, register read/write and
//! batched sync read/write against addressed devices), the Dynamixel protocol
//! 2.0 packet codec, and feature-gated backends. The default build enables a
//! `mock` backend so that binaries and tests run on any host without hardware.

mod types;
pub use types::{Address, DeviceSignature, PortInfo, RegisterRange, BROADCAST_ID, MAX_DEVICE_ID};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::ServoBus;

pub mod control_table;
pub mod protocol;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockHandle, MockStats};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialServoBus;
