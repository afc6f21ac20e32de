//! hardware-hub: one control interface over many servo buses
//!
//! Discovery pings the devices declared in a [`device_registry::HardwareConfig`]
//! and binds each responder to a device interface. The [`Aggregator`] then
//! initialises the buses and runs read/write cycles on all of them in
//! parallel, merging the results into one [`HardwareSnapshot`]. [`JointView`]
//! narrows that down to named joints for a control loop.

mod error;
pub use error::{DeviceError, HubError, Result};

mod types;
pub use types::{
    AggregatorState, BusId, DeviceId, HardwareSnapshot, JointCommand, JointReading, JointState,
    Sample,
};

mod events;
pub use events::{FailureHint, Fanout, HubEvent, RecordingSink, TelemetrySink, TracingSink};

mod metrics;
pub use metrics::{HubCounters, HubMetrics};

pub mod devices;

mod bus;
#[cfg(feature = "serial")]
pub use bus::open_serial;
#[cfg(feature = "mock")]
pub use bus::simulated_ports;
pub use bus::{open_ports, BusPort};

mod discovery;
pub use discovery::{Binding, Discovered, Discovery, RetryPolicy};

mod aggregator;
pub use aggregator::Aggregator;

mod joints;
pub use joints::JointView;

use device_registry::HardwareConfig;
use std::sync::Arc;

/// Discover, bind and initialise: returns an aggregator in the `Ready` state.
pub async fn bring_up(
    config: &HardwareConfig,
    ports: Vec<BusPort>,
    sink: Arc<dyn TelemetrySink>,
) -> Result<Aggregator> {
    let discovered = Discovery::new(config, sink.clone()).run(ports).await?;
    let mut hub = Aggregator::new(discovered, config.hub.cycle.clone(), sink);
    hub.init().await?;
    Ok(hub)
}
