//! Observability boundary: everything worth knowing about discovery, device
//! health and cycle timing is reported as a [`HubEvent`] to a [`TelemetrySink`].

use crate::types::AggregatorState;
use serde::Serialize;
use servo_transport::Address;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Best guess at why a discovery pass failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FailureHint {
    /// Almost nothing answered; the actuator power is probably off.
    PowerOff,
    /// Most devices answered; look for a bad cable or a dead device.
    MissingDevices,
}

impl fmt::Display for FailureHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureHint::PowerOff => f.write_str("power is probably off"),
            FailureHint::MissingDevices => f.write_str("some devices are missing"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum HubEvent {
    DiscoveryAttempt {
        attempt: u32,
        responded: usize,
        declared: usize,
    },
    DiscoveryFailed {
        attempt: u32,
        hint: FailureHint,
        missing: Vec<String>,
    },
    DiscoverySucceeded {
        bound: usize,
        missing: Vec<String>,
    },
    SignatureMismatch {
        name: String,
        address: Address,
        expected: u16,
        reported: u16,
    },
    DeviceStale {
        name: String,
        reason: String,
    },
    DeviceRecovered {
        name: String,
    },
    WriteFailed {
        name: String,
        reason: String,
    },
    DeadlineMiss {
        bus: String,
        budget: Duration,
        consecutive: u32,
    },
    StateChanged {
        from: AggregatorState,
        to: AggregatorState,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn report(&self, event: &HubEvent);
}

/// Logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn report(&self, event: &HubEvent) {
        match event {
            HubEvent::DiscoveryAttempt {
                attempt,
                responded,
                declared,
            } => debug!(attempt, responded, declared, "discovery pass finished"),
            HubEvent::DiscoveryFailed {
                attempt,
                hint: FailureHint::PowerOff,
                ..
            } => error!(attempt, "could not start hardware: power is off"),
            HubEvent::DiscoveryFailed {
                attempt, missing, ..
            } => error!(attempt, missing = ?missing, "could not ping all devices"),
            HubEvent::DiscoverySucceeded { bound, missing } if missing.is_empty() => {
                info!(bound, "hardware discovery successful")
            }
            HubEvent::DiscoverySucceeded { bound, missing } => {
                warn!(bound, missing = ?missing, "hardware discovery accepted with devices missing")
            }
            HubEvent::SignatureMismatch {
                name,
                address,
                expected,
                reported,
            } => warn!(
                device = %name,
                address,
                expected,
                reported,
                "model number does not match, binding as declared"
            ),
            HubEvent::DeviceStale { name, reason } => {
                warn!(device = %name, reason = %reason, "device telemetry stale")
            }
            HubEvent::DeviceRecovered { name } => info!(device = %name, "device answering again"),
            HubEvent::WriteFailed { name, reason } => {
                warn!(device = %name, reason = %reason, "device write failed")
            }
            HubEvent::DeadlineMiss {
                bus,
                budget,
                consecutive,
            } => warn!(bus = %bus, budget_ms = budget.as_millis() as u64, consecutive, "bus missed cycle deadline"),
            HubEvent::StateChanged { from, to } => info!(?from, ?to, "aggregator state changed"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HubEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HubEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&HubEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| pred(ev)).count())
            .unwrap_or(0)
    }
}

impl TelemetrySink for RecordingSink {
    fn report(&self, event: &HubEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Forwards each event to several sinks.
#[derive(Clone, Default)]
pub struct Fanout(pub Vec<Arc<dyn TelemetrySink>>);

impl TelemetrySink for Fanout {
    fn report(&self, event: &HubEvent) {
        for sink in &self.0 {
            sink.report(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_reaches_every_sink() {
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        let sinks: Vec<Arc<dyn TelemetrySink>> = vec![a.clone(), b.clone(), Arc::new(TracingSink)];
        let fan = Fanout(sinks);
        fan.report(&HubEvent::DeviceRecovered {
            name: "imu".into(),
        });
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.count(|e| matches!(e, HubEvent::DeviceRecovered { .. })), 1);
    }
}
