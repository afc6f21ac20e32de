//! Cyclic read/write over all buses.
//!
//! Each bus worker sits behind its own async mutex. An operation takes the
//! lock without waiting, runs the bus on the blocking pool and joins every
//! bus against one deadline. A worker that overruns keeps its lock until it
//! finishes, so its bus is skipped rather than driven twice.

use crate::bus::{BusCommands, BusPort, BusWorker};
use crate::devices::{Device, DeviceReadout, Reading};
use crate::discovery::Discovered;
use crate::error::{DeviceError, HubError, Result};
use crate::events::{HubEvent, TelemetrySink};
use crate::types::{AggregatorState, BusId, HardwareSnapshot, JointCommand, Sample};
use device_registry::{CycleSettings, DeviceKind, Rgba};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

type Job<T> = Box<dyn FnOnce(&mut BusWorker) -> T + Send + 'static>;

enum BusOutcome<T> {
    Done(T),
    /// Still running from an earlier cycle.
    Busy,
    Overrun,
    Crashed(String),
}

/// Where a named device lives and what it reports as.
#[derive(Clone, Copy, Debug)]
struct Route {
    bus: BusId,
    kind: DeviceKind,
}

pub struct Aggregator {
    state: AggregatorState,
    workers: Vec<Arc<Mutex<BusWorker>>>,
    bus_names: Vec<String>,
    routes: BTreeMap<String, Route>,
    led_counts: BTreeMap<String, usize>,
    pending: Vec<BusCommands>,
    snapshot: HardwareSnapshot,
    failing: BTreeSet<String>,
    consecutive_misses: u32,
    cycle: u64,
    last_write: Option<OffsetDateTime>,
    settings: CycleSettings,
    sink: Arc<dyn TelemetrySink>,
}

impl Aggregator {
    pub fn new(
        discovered: Discovered,
        settings: CycleSettings,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let mut routes = BTreeMap::new();
        let mut led_counts = BTreeMap::new();
        let mut snapshot = HardwareSnapshot::new(OffsetDateTime::now_utc());
        let mut bus_names = Vec::new();
        let mut workers = Vec::new();

        for worker in discovered.workers {
            let bus = worker.id;
            for device in &worker.devices {
                let kind = device.kind();
                if let Device::Leds(panel) = device {
                    led_counts.insert(panel.name().to_string(), panel.colors().len());
                }
                for name in device.member_names() {
                    routes.insert(name.to_string(), Route { bus, kind });
                    match kind {
                        DeviceKind::Actuator => {
                            snapshot.joints.entry(name);
                        }
                        DeviceKind::Imu => {
                            snapshot.imus.insert(name.to_string(), Sample::default());
                        }
                        DeviceKind::FootPressure => {
                            snapshot.feet.insert(name.to_string(), Sample::default());
                        }
                        DeviceKind::Buttons => {
                            snapshot.buttons.insert(name.to_string(), Sample::default());
                        }
                        DeviceKind::Core => {
                            snapshot.cores.insert(name.to_string(), Sample::default());
                        }
                        DeviceKind::Leds => {}
                    }
                }
            }
            bus_names.push(worker.name().to_string());
            workers.push(Arc::new(Mutex::new(worker)));
        }

        Self {
            state: AggregatorState::Uninitialized,
            pending: vec![BusCommands::default(); workers.len()],
            workers,
            bus_names,
            routes,
            led_counts,
            snapshot,
            failing: BTreeSet::new(),
            consecutive_misses: 0,
            cycle: 0,
            last_write: None,
            settings,
            sink,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn bus_names(&self) -> &[String] {
        &self.bus_names
    }

    /// Names of all bound joints, sorted.
    pub fn joint_names(&self) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(_, r)| r.kind == DeviceKind::Actuator)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Latest merged snapshot; entries never read are stale.
    pub fn last_snapshot(&self) -> &HardwareSnapshot {
        &self.snapshot
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    fn transition(&mut self, to: AggregatorState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        if to == AggregatorState::Faulted {
            error!(?from, "hardware aggregator faulted");
        }
        self.sink.report(&HubEvent::StateChanged { from, to });
    }

    fn require(&self, op: &'static str, expected: AggregatorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HubError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Initialise every bus concurrently. Any failure faults the aggregator.
    pub async fn init(&mut self) -> Result<()> {
        self.require("init", AggregatorState::Uninitialized)?;
        self.transition(AggregatorState::Initializing);

        let deadline = Instant::now() + Duration::from_millis(self.settings.init_timeout_ms);
        let jobs = self
            .all_buses()
            .map(|id| {
                let job: Job<Vec<DeviceError>> = Box::new(|w: &mut BusWorker| w.init_all());
                (id, job)
            })
            .collect();
        let outcomes = self.dispatch(jobs, deadline).await;

        let mut failure = None;
        for (id, outcome) in outcomes {
            let reason = match outcome {
                BusOutcome::Done(errors) if errors.is_empty() => continue,
                BusOutcome::Done(errors) => errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
                BusOutcome::Busy | BusOutcome::Overrun => "init timed out".to_string(),
                BusOutcome::Crashed(e) => e,
            };
            error!(bus = %self.bus_names[id.0], reason = %reason, "bus init failed");
            failure.get_or_insert(HubError::BusInit {
                bus: self.bus_names[id.0].clone(),
                reason,
            });
        }
        match failure {
            Some(err) => {
                self.transition(AggregatorState::Faulted);
                Err(err)
            }
            None => {
                self.transition(AggregatorState::Ready);
                Ok(())
            }
        }
    }

    /// Read every bus once and merge the results into the snapshot.
    pub async fn read(&mut self, at: OffsetDateTime) -> Result<&HardwareSnapshot> {
        self.require("read", AggregatorState::Ready)?;
        let cycle = self.cycle;
        self.cycle += 1;

        let jobs = self
            .all_buses()
            .map(|id| {
                let job: Job<Vec<DeviceReadout>> = Box::new(move |w: &mut BusWorker| w.read_all(cycle));
                (id, job)
            })
            .collect();
        let outcomes = self.dispatch(jobs, self.cycle_deadline()).await;

        let mut missed = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                BusOutcome::Done(readouts) => readouts.into_iter().for_each(|r| self.merge(r)),
                BusOutcome::Busy | BusOutcome::Overrun => {
                    self.mark_bus_stale(id);
                    missed.push(id);
                }
                BusOutcome::Crashed(e) => {
                    self.transition(AggregatorState::Faulted);
                    return Err(HubError::Worker(e));
                }
            }
        }
        self.account_deadline(&missed)?;

        self.snapshot.stamp = at;
        self.snapshot.cycle = cycle;
        debug!(cycle, stale = self.snapshot.stale_names().len(), "read cycle done");
        Ok(&self.snapshot)
    }

    /// Write joint goals plus any staged LED and power commands.
    ///
    /// Every joint name is checked before any bus is touched.
    pub async fn write(&mut self, command: &JointCommand, at: OffsetDateTime) -> Result<()> {
        self.require("write", AggregatorState::Ready)?;
        let unknown: Vec<String> = command
            .names()
            .filter(|n| {
                !self
                    .routes
                    .get(*n)
                    .is_some_and(|r| r.kind == DeviceKind::Actuator)
            })
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            return Err(HubError::UnknownJoints(unknown));
        }
        if let Some((name, _)) = command.iter().find(|(_, t)| !t.position.is_finite()) {
            return Err(HubError::InvalidCommand {
                name: name.clone(),
                reason: "position is not finite".to_string(),
            });
        }

        let mut per_bus = std::mem::replace(
            &mut self.pending,
            vec![BusCommands::default(); self.workers.len()],
        );
        for (name, target) in command.iter() {
            if let Some(route) = self.routes.get(name) {
                per_bus[route.bus.0].joints.push((name.clone(), *target));
            }
        }

        let mut retained: BTreeMap<BusId, BusCommands> = BTreeMap::new();
        let jobs = per_bus
            .into_iter()
            .enumerate()
            .map(|(i, cmds)| {
                retained.insert(BusId(i), cmds.clone().retained());
                let job: Job<Vec<DeviceError>> = Box::new(move |w: &mut BusWorker| w.write_all(cmds));
                (BusId(i), job)
            })
            .collect();
        let outcomes = self.dispatch(jobs, self.cycle_deadline()).await;

        let mut missed = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                BusOutcome::Done(errors) => {
                    for e in errors {
                        self.sink.report(&HubEvent::WriteFailed {
                            name: e.device().to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
                BusOutcome::Busy => {
                    if let Some(keep) = retained.remove(&id) {
                        self.pending[id.0].merge(keep);
                    }
                    missed.push(id);
                }
                BusOutcome::Overrun => missed.push(id),
                BusOutcome::Crashed(e) => {
                    self.transition(AggregatorState::Faulted);
                    return Err(HubError::Worker(e));
                }
            }
        }
        let on_time = missed.is_empty();
        self.account_deadline(&missed)?;
        if on_time {
            self.last_write = Some(at);
        }
        debug!(joints = command.len(), on_time, "write cycle done");
        Ok(())
    }

    /// When the last write completed within its deadline.
    pub fn last_write(&self) -> Option<OffsetDateTime> {
        self.last_write
    }

    /// Stage an LED colour for the next write.
    pub fn set_led(&mut self, panel: &str, index: usize, color: Rgba) -> Result<()> {
        if self.state == AggregatorState::Faulted {
            return Err(HubError::InvalidState {
                op: "set_led",
                state: self.state,
            });
        }
        let (bus, count) = match (self.routes.get(panel), self.led_counts.get(panel)) {
            (Some(r), Some(&count)) if r.kind == DeviceKind::Leds => (r.bus, count),
            _ => {
                return Err(HubError::UnknownDevice {
                    name: panel.to_string(),
                    kind: DeviceKind::Leds,
                })
            }
        };
        if index >= count {
            return Err(HubError::InvalidCommand {
                name: panel.to_string(),
                reason: format!("led index {index} out of range (panel has {count})"),
            });
        }
        self.pending[bus.0]
            .leds
            .push((panel.to_string(), index, color));
        Ok(())
    }

    /// Stage servo power on or off for the next write.
    pub fn set_power(&mut self, core: &str, on: bool) -> Result<()> {
        if self.state == AggregatorState::Faulted {
            return Err(HubError::InvalidState {
                op: "set_power",
                state: self.state,
            });
        }
        let bus = match self.routes.get(core) {
            Some(r) if r.kind == DeviceKind::Core => r.bus,
            _ => {
                return Err(HubError::UnknownDevice {
                    name: core.to_string(),
                    kind: DeviceKind::Core,
                })
            }
        };
        self.pending[bus.0].power.push((core.to_string(), on));
        Ok(())
    }

    /// Wait for every worker to go idle and hand the ports back.
    pub async fn shutdown(self) -> Result<Vec<BusPort>> {
        let mut ports = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers {
            let worker = loop {
                match Arc::try_unwrap(worker) {
                    Ok(w) => break w.into_inner(),
                    Err(shared) => {
                        drop(shared.lock().await);
                        tokio::task::yield_now().await;
                        worker = shared;
                    }
                }
            };
            ports.push(worker.port);
        }
        Ok(ports)
    }

    fn all_buses(&self) -> impl Iterator<Item = BusId> {
        (0..self.workers.len()).map(BusId)
    }

    fn cycle_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.settings.deadline_ms)
    }

    async fn dispatch<T: Send + 'static>(
        &self,
        jobs: Vec<(BusId, Job<T>)>,
        deadline: Instant,
    ) -> Vec<(BusId, BusOutcome<T>)> {
        let mut out = Vec::with_capacity(jobs.len());
        let mut running = Vec::with_capacity(jobs.len());
        for (id, job) in jobs {
            match self.workers[id.0].clone().try_lock_owned() {
                Ok(mut guard) => {
                    running.push((id, tokio::task::spawn_blocking(move || job(&mut *guard))));
                }
                Err(_) => out.push((id, BusOutcome::Busy)),
            }
        }
        for (id, handle) in running {
            let outcome = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(value)) => BusOutcome::Done(value),
                Ok(Err(e)) => BusOutcome::Crashed(e.to_string()),
                Err(_) => BusOutcome::Overrun,
            };
            out.push((id, outcome));
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    fn account_deadline(&mut self, missed: &[BusId]) -> Result<()> {
        if missed.is_empty() {
            self.consecutive_misses = 0;
            return Ok(());
        }
        self.consecutive_misses += 1;
        let budget = Duration::from_millis(self.settings.deadline_ms);
        for id in missed {
            self.sink.report(&HubEvent::DeadlineMiss {
                bus: self.bus_names[id.0].clone(),
                budget,
                consecutive: self.consecutive_misses,
            });
        }
        if self.consecutive_misses >= self.settings.max_consecutive_deadline_misses {
            self.transition(AggregatorState::Faulted);
            return Err(HubError::DeadlineExceeded {
                misses: self.consecutive_misses,
            });
        }
        Ok(())
    }

    fn merge(&mut self, readout: DeviceReadout) {
        let DeviceReadout { name, result } = readout;
        match result {
            Ok(Reading::NotDue) => return,
            Ok(reading) => {
                self.store(&name, reading);
                if self.failing.remove(&name) {
                    self.sink.report(&HubEvent::DeviceRecovered { name });
                }
            }
            Err(e) => {
                self.mark_stale(&name);
                if self.failing.insert(name.clone()) {
                    self.sink.report(&HubEvent::DeviceStale {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn store(&mut self, name: &str, reading: Reading) {
        let snap = &mut self.snapshot;
        match reading {
            Reading::Joint(s) => {
                let entry = snap.joints.entry(name);
                entry.position = s.position;
                entry.velocity = s.velocity;
                entry.effort = s.effort;
                entry.stale = false;
            }
            Reading::Imu(v) => snap.imus.entry(name.to_string()).or_default().update(v),
            Reading::Foot(v) => snap.feet.entry(name.to_string()).or_default().update(v),
            Reading::Buttons(v) => snap.buttons.entry(name.to_string()).or_default().update(v),
            Reading::Core(v) => snap.cores.entry(name.to_string()).or_default().update(v),
            Reading::NotDue => {}
        }
    }

    fn mark_stale(&mut self, name: &str) {
        let Some(route) = self.routes.get(name) else {
            return;
        };
        let snap = &mut self.snapshot;
        match route.kind {
            DeviceKind::Actuator => snap.joints.entry(name).stale = true,
            DeviceKind::Imu => set_stale(&mut snap.imus, name),
            DeviceKind::FootPressure => set_stale(&mut snap.feet, name),
            DeviceKind::Buttons => set_stale(&mut snap.buttons, name),
            DeviceKind::Core => set_stale(&mut snap.cores, name),
            DeviceKind::Leds => {}
        }
    }

    fn mark_bus_stale(&mut self, bus: BusId) {
        let names: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, r)| r.bus == bus)
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            self.mark_stale(&name);
        }
    }
}

fn set_stale<T>(map: &mut BTreeMap<String, Sample<T>>, name: &str) {
    if let Some(s) = map.get_mut(name) {
        s.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::simulated_ports;
    use crate::discovery::Discovery;
    use crate::events::RecordingSink;
    use device_registry::{parse_config, HardwareConfig, JointTarget};
    use servo_transport::{MockHandle, RegisterRange};
    use servo_transport::control_table::{core_board, sensor_board, servo};

    const CONFIG: &str = r#"
ports:
  - { name: port0, device_file: /dev/ttyUSB0, baud_rate: 4000000 }
  - { name: port1, device_file: /dev/ttyUSB1, baud_rate: 4000000 }
devices:
  - { name: core, bus: port0, address: 42, kind: core }
  - { name: HeadPan, bus: port0, address: 19, kind: actuator }
  - { name: HeadTilt, bus: port0, address: 20, kind: actuator, joint_offset: 0.1 }
  - { name: LKnee, bus: port1, address: 14, kind: actuator }
  - { name: RKnee, bus: port1, address: 15, kind: actuator }
  - { name: imu, bus: port1, address: 241, kind: imu }
  - { name: leds, bus: port1, address: 242, kind: leds, led_count: 3 }
hub:
  cycle:
    deadline_ms: 200
    max_consecutive_deadline_misses: 2
"#;

    fn config() -> HardwareConfig {
        parse_config(CONFIG).unwrap()
    }

    async fn ready(cfg: &HardwareConfig) -> (Aggregator, Vec<MockHandle>, Arc<RecordingSink>) {
        let (ports, handles) = simulated_ports(cfg);
        let sink = RecordingSink::new();
        let found = Discovery::new(cfg, sink.clone()).run(ports).await.unwrap();
        let mut hub = Aggregator::new(found, cfg.hub.cycle.clone(), sink.clone());
        hub.init().await.unwrap();
        (hub, handles, sink)
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let cfg = config();
        let (ports, _) = simulated_ports(&cfg);
        let found = Discovery::new(&cfg, RecordingSink::new())
            .run(ports)
            .await
            .unwrap();
        let mut hub = Aggregator::new(found, cfg.hub.cycle.clone(), RecordingSink::new());
        assert_eq!(hub.state(), AggregatorState::Uninitialized);
        assert!(matches!(
            hub.read(now()).await,
            Err(HubError::InvalidState { op: "read", .. })
        ));
        hub.init().await.unwrap();
        assert_eq!(hub.state(), AggregatorState::Ready);
        assert!(matches!(
            hub.init().await,
            Err(HubError::InvalidState { op: "init", .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_lists_every_bound_device() {
        let cfg = config();
        let (mut hub, _, _) = ready(&cfg).await;
        assert_eq!(hub.joint_names(), vec!["HeadPan", "HeadTilt", "LKnee", "RKnee"]);
        let snap = hub.read(now()).await.unwrap();
        assert_eq!(snap.joints.len(), 4);
        assert_eq!(snap.joints.stale_count(), 0);
        assert!(snap.imus["imu"].value.is_some());
        assert!(snap.cores["core"].value.is_some());
        // offsets are removed from the reported position
        let tilt = snap.joints.get("HeadTilt").unwrap();
        assert!((tilt.position + 0.1).abs() < 2e-3);
    }

    #[tokio::test]
    async fn written_goal_converges_on_read() {
        let cfg = config();
        let (mut hub, _, _) = ready(&cfg).await;
        let mut cmd = JointCommand::new();
        cmd.set("LKnee", JointTarget::position(0.5));
        cmd.set("HeadTilt", JointTarget::position(-0.3));

        for _ in 0..20 {
            hub.write(&cmd, now()).await.unwrap();
            hub.read(now()).await.unwrap();
        }
        let joints = &hub.last_snapshot().joints;
        let tick = 2.0 * std::f64::consts::PI / 4096.0;
        assert!((joints.get("LKnee").unwrap().position - 0.5).abs() <= tick);
        assert!((joints.get("HeadTilt").unwrap().position + 0.3).abs() <= tick);
    }

    #[tokio::test]
    async fn silent_servo_goes_stale_without_touching_siblings() {
        let cfg = config();
        let (mut hub, handles, sink) = ready(&cfg).await;
        hub.read(now()).await.unwrap();

        handles[1].set_responsive(14, false).unwrap();
        let snap = hub.read(now()).await.unwrap();
        assert!(snap.joints.get("LKnee").unwrap().stale);
        assert!(!snap.joints.get("RKnee").unwrap().stale);
        assert!(!snap.imus["imu"].stale);
        hub.read(now()).await.unwrap();
        assert_eq!(
            sink.count(|e| matches!(e, HubEvent::DeviceStale { name, .. } if name == "LKnee")),
            1
        );

        handles[1].set_responsive(14, true).unwrap();
        let snap = hub.read(now()).await.unwrap();
        assert!(!snap.joints.get("LKnee").unwrap().stale);
        assert_eq!(
            sink.count(|e| matches!(e, HubEvent::DeviceRecovered { name } if name == "LKnee")),
            1
        );
    }

    #[tokio::test]
    async fn unknown_joint_is_rejected_before_any_io() {
        let cfg = config();
        let (mut hub, handles, _) = ready(&cfg).await;
        let before: Vec<u64> = handles.iter().map(|h| h.stats().total()).collect();

        let mut cmd = JointCommand::new();
        cmd.set("LKnee", JointTarget::position(0.2));
        cmd.set("Tail", JointTarget::position(0.2));
        let err = hub.write(&cmd, now()).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownJoints(ref n) if n == &vec!["Tail".to_string()]));

        let after: Vec<u64> = handles.iter().map(|h| h.stats().total()).collect();
        assert_eq!(before, after);
        assert_eq!(hub.state(), AggregatorState::Ready);
    }

    #[tokio::test]
    async fn staged_led_is_written_on_next_cycle() {
        let cfg = config();
        let (mut hub, handles, _) = ready(&cfg).await;
        hub.set_led("leds", 1, Rgba::new(255, 0, 0, 0)).unwrap();
        assert!(matches!(
            hub.set_led("leds", 3, Rgba::OFF),
            Err(HubError::InvalidCommand { .. })
        ));
        assert!(matches!(
            hub.set_led("core", 0, Rgba::OFF),
            Err(HubError::UnknownDevice { .. })
        ));
        hub.write(&JointCommand::new(), now()).await.unwrap();

        let reg = sensor_board::LED_BASE + sensor_board::BYTES_PER_LED;
        let got = handles[1].peek(242, RegisterRange::new(reg, 4)).unwrap();
        assert_eq!(got, vec![255, 0, 0, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn led_staged_on_a_busy_bus_lands_on_the_next_write() {
        let mut cfg = config();
        cfg.hub.cycle.max_consecutive_deadline_misses = 5;
        let (mut hub, handles, _) = ready(&cfg).await;
        handles[1].set_latency(Duration::from_millis(300)).unwrap();

        hub.read(now()).await.unwrap();
        hub.set_led("leds", 2, Rgba::new(0, 0, 255, 0)).unwrap();
        hub.write(&JointCommand::new(), now()).await.unwrap();
        assert_eq!(hub.consecutive_misses(), 2);
        assert_eq!(hub.last_write(), None);

        handles[1].set_latency(Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let at = now();
        hub.write(&JointCommand::new(), at).await.unwrap();
        assert_eq!(hub.consecutive_misses(), 0);
        assert_eq!(hub.last_write(), Some(at));

        let reg = sensor_board::LED_BASE + 2 * sensor_board::BYTES_PER_LED;
        let got = handles[1].peek(242, RegisterRange::new(reg, 4)).unwrap();
        assert_eq!(got, vec![0, 0, 255, 0]);
    }

    #[tokio::test]
    async fn power_off_is_written_to_the_core_board() {
        let cfg = config();
        let (mut hub, handles, _) = ready(&cfg).await;
        let power = RegisterRange::new(core_board::POWER_ENABLE, 1);
        assert_eq!(handles[0].peek(42, power).unwrap(), vec![1]);

        assert!(matches!(
            hub.set_power("imu", false),
            Err(HubError::UnknownDevice { .. })
        ));
        hub.set_power("core", false).unwrap();
        hub.write(&JointCommand::new(), now()).await.unwrap();
        assert_eq!(handles[0].peek(42, power).unwrap(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_bus_during_init_faults() {
        let cfg = config();
        let (ports, handles) = simulated_ports(&cfg);
        let found = Discovery::new(&cfg, RecordingSink::new())
            .run(ports)
            .await
            .unwrap();
        let mut settings = cfg.hub.cycle.clone();
        settings.init_timeout_ms = 100;
        let mut hub = Aggregator::new(found, settings, RecordingSink::new());
        handles[1].set_latency(Duration::from_millis(300)).unwrap();

        let err = hub.init().await.unwrap_err();
        assert!(matches!(err, HubError::BusInit { ref bus, .. } if bus == "port1"));
        assert_eq!(hub.state(), AggregatorState::Faulted);

        handles[1].set_latency(Duration::ZERO).unwrap();
        assert_eq!(hub.shutdown().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn buses_are_serviced_in_parallel() {
        let cfg = config();
        let (mut hub, handles, _) = ready(&cfg).await;
        for h in &handles {
            h.set_latency(Duration::from_millis(50)).unwrap();
        }
        // port0: core + one group sync read = 100 ms; port1: imu + group = 100 ms
        let started = std::time::Instant::now();
        hub.read(now()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(180), "took {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_overruns_fault_the_aggregator() {
        let cfg = config();
        let (mut hub, handles, sink) = ready(&cfg).await;
        handles[1].set_latency(Duration::from_millis(300)).unwrap();

        // first overrun is tolerated
        hub.read(now()).await.unwrap();
        assert_eq!(hub.consecutive_misses(), 1);
        // bus still busy from the first cycle, skipped and counted
        let err = hub.read(now()).await.unwrap_err();
        assert!(matches!(err, HubError::DeadlineExceeded { misses: 2 }));
        assert_eq!(hub.state(), AggregatorState::Faulted);
        assert!(matches!(
            hub.write(&JointCommand::new(), now()).await,
            Err(HubError::InvalidState { .. })
        ));
        assert_eq!(sink.count(|e| matches!(e, HubEvent::DeadlineMiss { .. })), 2);
        assert!(hub.last_snapshot().joints.get("LKnee").unwrap().stale);

        handles[1].set_latency(Duration::ZERO).unwrap();
        let ports = hub.shutdown().await.unwrap();
        assert_eq!(ports.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_serializes_with_staleness() {
        let cfg = config();
        let (mut hub, _, _) = ready(&cfg).await;
        let snap = hub.read(now()).await.unwrap();
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["joints"]["LKnee"]["stale"], false);
        assert_eq!(json["imus"]["imu"]["stale"], false);
    }

    #[tokio::test]
    async fn torque_is_enabled_by_init() {
        let cfg = config();
        let (_hub, handles, _) = ready(&cfg).await;
        let reg = handles[1]
            .peek(15, RegisterRange::new(servo::TORQUE_ENABLE, 1))
            .unwrap();
        assert_eq!(reg, vec![1]);
    }
}
