//! Finds the declared devices on the open buses and binds each responder to
//! its device interface.
//!
//! Every pass pings all admitted descriptors, one blocking worker per bus and
//! ascending addresses within a bus. A pass fails while fewer than
//! `min_devices` answer or a mandatory device is silent; failed passes are
//! retried according to the [`RetryPolicy`].

use crate::bus::{BusPort, BusWorker};
use crate::devices::{
    Actuator, ActuatorBus, ButtonPanel, CoreBoard, Device, FootPressureSensor, ImuSensor, LedPanel,
};
use crate::error::{HubError, Result};
use crate::events::{FailureHint, HubEvent, TelemetrySink};
use crate::types::{BusId, DeviceId};
use device_registry::{
    DeviceDescriptor, DeviceKind, DeviceParams, DiscoverySettings, HardwareConfig,
    JointCalibration,
};
use servo_transport::{Address, DeviceSignature};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Delay schedule between failed discovery passes.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&DiscoverySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(s: &DiscoverySettings) -> Self {
        Self {
            delay: Duration::from_millis(s.retry_delay_ms),
            backoff: s.backoff,
            max_delay: Duration::from_millis(s.max_retry_delay_ms.max(s.retry_delay_ms)),
            max_attempts: s.max_attempts,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff > 1.0 {
            self.backoff.powi(attempt.saturating_sub(1).min(64) as i32)
        } else {
            1.0
        };
        let secs = self.delay.as_secs_f64() * factor;
        if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// A declared device that answered and was bound.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub name: String,
    pub kind: DeviceKind,
    pub bus: String,
    pub address: Address,
    pub signature: DeviceSignature,
    pub device: DeviceId,
}

/// Outcome of a successful discovery: the bus workers owning their bound
/// devices, ready to hand to the aggregator.
#[derive(Debug)]
pub struct Discovered {
    pub(crate) workers: Vec<BusWorker>,
    bindings: Vec<Binding>,
    missing: Vec<String>,
    attempts: u32,
}

impl Discovered {
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Optional devices that never answered.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn bus_names(&self) -> Vec<&str> {
        self.workers.iter().map(BusWorker::name).collect()
    }

    /// Drop the bindings and give the ports back so discovery can run again.
    pub fn release(self) -> Vec<BusPort> {
        self.workers.into_iter().map(|w| w.port).collect()
    }
}

struct Target<'a> {
    desc: &'a DeviceDescriptor,
    signature: Option<DeviceSignature>,
}

struct PassReport {
    responded: usize,
    declared: usize,
    missing: Vec<String>,
    mandatory_missing: bool,
}

pub struct Discovery<'a> {
    config: &'a HardwareConfig,
    sink: Arc<dyn TelemetrySink>,
    policy: RetryPolicy,
}

impl<'a> Discovery<'a> {
    pub fn new(config: &'a HardwareConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            policy: RetryPolicy::from_settings(&config.hub.discovery),
            config,
            sink,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run passes until the verdict accepts or the policy gives up.
    pub async fn run(self, ports: Vec<BusPort>) -> Result<Discovered> {
        self.config.validate()?;
        let settings = &self.config.hub.discovery;
        let mode = self.config.hub.mode;

        let mut by_name: BTreeMap<String, BusPort> =
            ports.into_iter().map(|p| (p.name.clone(), p)).collect();
        let mut buses: Vec<(BusPort, Vec<Target<'_>>)> = Vec::new();
        for desc in &self.config.ports {
            let port = by_name
                .remove(&desc.name)
                .ok_or_else(|| HubError::MissingPort(desc.name.clone()))?;
            let mut targets = Vec::new();
            for d in self.config.devices_on(&desc.name) {
                if mode.admits(d.expected_kind()) {
                    targets.push(Target {
                        desc: d,
                        signature: None,
                    });
                } else {
                    info!(device = %d.name, kind = %d.expected_kind(), ?mode, "device excluded by mode");
                }
            }
            buses.push((port, targets));
        }
        for unused in by_name.keys() {
            debug!(port = %unused, "port not declared, ignored");
        }

        let mut attempt = 0u32;
        let mut grace_used = 0u32;
        loop {
            attempt += 1;
            buses = ping_all(buses).await?;
            let report = verdict(&buses);
            self.sink.report(&HubEvent::DiscoveryAttempt {
                attempt,
                responded: report.responded,
                declared: report.declared,
            });

            let hard_failure = report.responded < settings.min_devices || report.mandatory_missing;
            if !hard_failure && report.missing.is_empty() {
                return Ok(self.bind(buses, report.missing, attempt));
            }

            if !hard_failure {
                if grace_used >= settings.partial_grace_passes || self.policy.exhausted(attempt) {
                    return Ok(self.bind(buses, report.missing, attempt));
                }
                grace_used += 1;
                if grace_used == 1 {
                    debug!(attempt, missing = ?report.missing, "some optional devices silent, retrying quietly");
                } else {
                    self.sink.report(&HubEvent::DiscoveryFailed {
                        attempt,
                        hint: FailureHint::MissingDevices,
                        missing: report.missing.clone(),
                    });
                }
            } else {
                let hint = if report.responded <= settings.power_off_threshold {
                    FailureHint::PowerOff
                } else {
                    FailureHint::MissingDevices
                };
                self.sink.report(&HubEvent::DiscoveryFailed {
                    attempt,
                    hint,
                    missing: report.missing.clone(),
                });
                let err = HubError::DiscoveryIncomplete {
                    responded: report.responded,
                    declared: report.declared,
                    hint,
                    missing: report.missing,
                };
                if self.policy.exhausted(attempt) {
                    return Err(HubError::DiscoveryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
            }
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
        }
    }

    fn bind(
        &self,
        buses: Vec<(BusPort, Vec<Target<'_>>)>,
        missing: Vec<String>,
        attempts: u32,
    ) -> Discovered {
        let coalesce = self.config.hub.discovery.coalesce_actuators;
        let mut workers = Vec::with_capacity(buses.len());
        let mut bindings = Vec::new();

        for (index, (port, targets)) in buses.into_iter().enumerate() {
            let id = BusId(index);
            let responders: Vec<(&DeviceDescriptor, DeviceSignature)> = targets
                .iter()
                .filter_map(|t| t.signature.map(|s| (t.desc, s)))
                .collect();

            for (desc, sig) in &responders {
                let expected = desc.expected_model();
                if sig.model_number != expected {
                    self.sink.report(&HubEvent::SignatureMismatch {
                        name: desc.name.clone(),
                        address: desc.address,
                        expected,
                        reported: sig.model_number,
                    });
                }
            }

            let devices = build_devices(&port.name, &responders, coalesce);
            let worker = BusWorker::new(id, port, devices);
            for (desc, sig) in &responders {
                let slot = worker
                    .devices
                    .iter()
                    .position(|d| d.member_names().contains(&desc.name.as_str()))
                    .unwrap_or_default();
                bindings.push(Binding {
                    name: desc.name.clone(),
                    kind: desc.expected_kind(),
                    bus: worker.name().to_string(),
                    address: desc.address,
                    signature: *sig,
                    device: DeviceId { bus: id, slot },
                });
            }
            workers.push(worker);
        }

        self.sink.report(&HubEvent::DiscoverySucceeded {
            bound: bindings.len(),
            missing: missing.clone(),
        });
        Discovered {
            workers,
            bindings,
            missing,
            attempts,
        }
    }
}

/// Ping every target, all buses in parallel.
async fn ping_all<'a>(
    buses: Vec<(BusPort, Vec<Target<'a>>)>,
) -> Result<Vec<(BusPort, Vec<Target<'a>>)>> {
    let mut handles = Vec::with_capacity(buses.len());
    let mut targets_per_bus = Vec::with_capacity(buses.len());
    for (mut port, targets) in buses {
        let addresses: Vec<Address> = targets.iter().map(|t| t.desc.address).collect();
        handles.push(tokio::task::spawn_blocking(move || {
            let replies: Vec<Option<DeviceSignature>> = addresses
                .iter()
                .map(|&a| match port.driver.ping(a) {
                    Ok(sig) => sig,
                    Err(e) => {
                        debug!(port = %port.name, address = a, error = %e, "ping failed");
                        None
                    }
                })
                .collect();
            (port, replies)
        }));
        targets_per_bus.push(targets);
    }

    let mut out = Vec::with_capacity(handles.len());
    for (handle, mut targets) in handles.into_iter().zip(targets_per_bus) {
        let (port, replies) = handle
            .await
            .map_err(|e| HubError::Worker(e.to_string()))?;
        for (t, reply) in targets.iter_mut().zip(replies) {
            t.signature = reply;
        }
        out.push((port, targets));
    }
    Ok(out)
}

fn verdict(buses: &[(BusPort, Vec<Target<'_>>)]) -> PassReport {
    let targets = buses.iter().flat_map(|(_, t)| t);
    let mut report = PassReport {
        responded: 0,
        declared: 0,
        missing: Vec::new(),
        mandatory_missing: false,
    };
    for t in targets {
        report.declared += 1;
        if t.signature.is_some() {
            report.responded += 1;
        } else {
            report.missing.push(t.desc.name.clone());
            report.mandatory_missing |= t.desc.is_mandatory();
        }
    }
    report
}

fn build_devices(
    port: &str,
    responders: &[(&DeviceDescriptor, DeviceSignature)],
    coalesce: bool,
) -> Vec<Device> {
    let mut devices = Vec::new();
    let mut actuators = Vec::new();
    for (desc, _) in responders {
        let name = desc.name.as_str();
        let address = desc.address;
        let device = match &desc.params {
            DeviceParams::Core { read_rate } => Device::Core(CoreBoard::new(name, address, *read_rate)),
            DeviceParams::Actuator {
                mounting_offset,
                joint_offset,
            } => {
                let calibration = JointCalibration {
                    mounting_offset: *mounting_offset,
                    joint_offset: *joint_offset,
                };
                let actuator = Actuator::new(name, address, calibration);
                if coalesce {
                    actuators.push(actuator);
                    continue;
                }
                Device::Actuator(actuator)
            }
            DeviceParams::Imu { frame } => {
                Device::Imu(ImuSensor::new(name, address, frame.as_deref().unwrap_or(name)))
            }
            DeviceParams::FootPressure => Device::Foot(FootPressureSensor::new(name, address)),
            DeviceParams::Buttons { read_rate } => {
                Device::Buttons(ButtonPanel::new(name, address, *read_rate))
            }
            DeviceParams::Leds {
                led_count,
                start_number,
            } => Device::Leds(LedPanel::new(
                name,
                address,
                usize::from(*led_count),
                *start_number,
            )),
        };
        devices.push(device);
    }
    if !actuators.is_empty() {
        devices.push(Device::ActuatorBus(ActuatorBus::new(
            &format!("{port}/actuators"),
            actuators,
        )));
    }
    devices
}
