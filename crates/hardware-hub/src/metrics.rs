use crate::events::{HubEvent, TelemetrySink};
use crate::types::AggregatorState;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct HubCounters {
    pub discovery_attempts: IntCounter,
    pub discovery_failures: IntCounter,
    pub signature_mismatches: IntCounter,
    pub stale_reads: IntCounter,
    pub write_failures: IntCounter,
    pub deadline_misses: IntCounter,
    pub devices_bound: IntGauge,
    pub faulted: IntGauge,
}

/// Prometheus view of the hub's events.
#[derive(Clone)]
pub struct HubMetrics {
    pub registry: Registry,
    pub hub: HubCounters,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
}

fn gauge(name: &str, help: &str) -> Result<IntGauge, String> {
    IntGauge::new(name, help).map_err(|e| format!("metrics init error: {e}"))
}

impl HubMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let hub = HubCounters {
            discovery_attempts: counter("sr_hw_discovery_attempts", "Discovery passes run")?,
            discovery_failures: counter("sr_hw_discovery_failures", "Discovery passes rejected")?,
            signature_mismatches: counter(
                "sr_hw_signature_mismatches",
                "Devices whose model number differed from the table",
            )?,
            stale_reads: counter("sr_hw_stale_reads", "Device reads that left telemetry stale")?,
            write_failures: counter("sr_hw_write_failures", "Device writes that failed")?,
            deadline_misses: counter("sr_hw_deadline_misses", "Bus workers that missed a cycle")?,
            devices_bound: gauge("sr_hw_devices_bound", "Devices bound by the last discovery")?,
            faulted: gauge("sr_hw_faulted", "1 while the aggregator is faulted")?,
        };
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(hub.discovery_attempts.clone()),
            Box::new(hub.discovery_failures.clone()),
            Box::new(hub.signature_mismatches.clone()),
            Box::new(hub.stale_reads.clone()),
            Box::new(hub.write_failures.clone()),
            Box::new(hub.deadline_misses.clone()),
            Box::new(hub.devices_bound.clone()),
            Box::new(hub.faulted.clone()),
        ];
        for c in collectors {
            registry
                .register(c)
                .map_err(|e| format!("metrics register error: {e}"))?;
        }
        Ok(Self { registry, hub })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl TelemetrySink for HubMetrics {
    fn report(&self, event: &HubEvent) {
        let hub = &self.hub;
        match event {
            HubEvent::DiscoveryAttempt { .. } => hub.discovery_attempts.inc(),
            HubEvent::DiscoveryFailed { .. } => hub.discovery_failures.inc(),
            HubEvent::DiscoverySucceeded { bound, .. } => hub.devices_bound.set(*bound as i64),
            HubEvent::SignatureMismatch { .. } => hub.signature_mismatches.inc(),
            HubEvent::DeviceStale { .. } => hub.stale_reads.inc(),
            HubEvent::WriteFailed { .. } => hub.write_failures.inc(),
            HubEvent::DeadlineMiss { .. } => hub.deadline_misses.inc(),
            HubEvent::StateChanged { to, .. } => {
                hub.faulted.set(i64::from(*to == AggregatorState::Faulted))
            }
            HubEvent::DeviceRecovered { .. } => {}
        }
    }
}
