use crate::control_table::{model, servo};
use crate::{
    Address, DeviceSignature, PortInfo, RegisterRange, Result, ServoBus, TransportError,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const MEMORY_SIZE: usize = 256;
/// Status error code for an out-of-range register access.
const ACCESS_ERROR: u8 = 0x07;

struct SimDevice {
    signature: DeviceSignature,
    memory: Vec<u8>,
    responsive: bool,
}

impl SimDevice {
    fn new(model_number: u16) -> Self {
        let mut memory = vec![0u8; MEMORY_SIZE];
        if model::is_servo(model_number) {
            let center = servo::CENTER_TICKS.to_le_bytes();
            let pos = usize::from(servo::PRESENT_POSITION);
            let goal = usize::from(servo::GOAL_POSITION);
            memory[pos..pos + 4].copy_from_slice(&center);
            memory[goal..goal + 4].copy_from_slice(&center);
        }
        Self {
            signature: DeviceSignature::new(model_number, 1),
            memory,
            responsive: true,
        }
    }

    fn is_servo(&self) -> bool {
        model::is_servo(self.signature.model_number)
    }

    fn i32_at(&self, addr: u16) -> i32 {
        let a = usize::from(addr);
        i32::from_le_bytes([
            self.memory[a],
            self.memory[a + 1],
            self.memory[a + 2],
            self.memory[a + 3],
        ])
    }

    fn set_i32(&mut self, addr: u16, v: i32) {
        let a = usize::from(addr);
        self.memory[a..a + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Move the present position one bounded step toward the goal.
    fn step(&mut self, max_step: i32) {
        if !self.is_servo() || self.memory[usize::from(servo::TORQUE_ENABLE)] == 0 {
            self.set_i32(servo::PRESENT_VELOCITY, 0);
            return;
        }
        let present = self.i32_at(servo::PRESENT_POSITION);
        let goal = self.i32_at(servo::GOAL_POSITION);
        let delta = (goal - present).clamp(-max_step, max_step);
        self.set_i32(servo::PRESENT_POSITION, present + delta);
        self.set_i32(servo::PRESENT_VELOCITY, delta);
    }

    fn load(&self, id: Address, range: RegisterRange) -> Result<Vec<u8>> {
        let start = usize::from(range.start);
        let end = usize::from(range.end());
        if end > self.memory.len() {
            return Err(TransportError::DeviceStatus {
                id,
                code: ACCESS_ERROR,
            });
        }
        Ok(self.memory[start..end].to_vec())
    }

    fn store(&mut self, id: Address, start: u16, data: &[u8]) -> Result<()> {
        let start = usize::from(start);
        let end = start + data.len();
        if end > self.memory.len() {
            return Err(TransportError::DeviceStatus {
                id,
                code: ACCESS_ERROR,
            });
        }
        self.memory[start..end].copy_from_slice(data);
        Ok(())
    }
}

struct MockState {
    devices: BTreeMap<Address, SimDevice>,
    latency: Duration,
    max_step_ticks: i32,
}

#[derive(Default)]
struct Counters {
    pings: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    sync_reads: AtomicU64,
    sync_writes: AtomicU64,
}

/// Shared transaction counters of one mock bus.
#[derive(Clone, Default)]
pub struct MockStats(Arc<Counters>);

impl MockStats {
    pub fn pings(&self) -> u64 {
        self.0.pings.load(Ordering::Relaxed)
    }
    pub fn reads(&self) -> u64 {
        self.0.reads.load(Ordering::Relaxed)
    }
    pub fn writes(&self) -> u64 {
        self.0.writes.load(Ordering::Relaxed)
    }
    pub fn sync_reads(&self) -> u64 {
        self.0.sync_reads.load(Ordering::Relaxed)
    }
    pub fn sync_writes(&self) -> u64 {
        self.0.sync_writes.load(Ordering::Relaxed)
    }

    /// Every transaction that touched the wire.
    pub fn total(&self) -> u64 {
        self.pings() + self.reads() + self.writes() + self.sync_reads() + self.sync_writes()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-process simulated bus. Each bus instance is independent.
///
/// Servos (by model number) track their goal position: every read of their
/// present state moves them a bounded number of ticks toward the goal while
/// torque is enabled.
pub struct MockBus {
    name: String,
    state: Arc<Mutex<MockState>>,
    stats: MockStats,
}

/// A cloneable view into a [`MockBus`] that stays usable after the bus has
/// been handed off.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    stats: MockStats,
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>> {
    state
        .lock()
        .map_err(|_| TransportError::Io("mock state poisoned".to_string()))
}

impl MockBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                devices: BTreeMap::new(),
                latency: Duration::ZERO,
                max_step_ticks: 200,
            })),
            stats: MockStats::default(),
        }
    }

    pub fn with_device(self, id: Address, model_number: u16) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.devices.insert(id, SimDevice::new(model_number));
        }
        self
    }

    /// Simulated round-trip time of every transaction.
    pub fn with_latency(self, latency: Duration) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.latency = latency;
        }
        self
    }

    pub fn with_max_step(self, ticks: i32) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.max_step_ticks = ticks.max(1);
        }
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    fn wait(&self) -> Result<()> {
        let latency = lock(&self.state)?.latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }
}

impl MockHandle {
    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    /// Make a device stop (or resume) answering.
    pub fn set_responsive(&self, id: Address, responsive: bool) -> Result<()> {
        let mut st = lock(&self.state)?;
        let dev = st
            .devices
            .get_mut(&id)
            .ok_or(TransportError::InvalidPacket("unknown mock device"))?;
        dev.responsive = responsive;
        Ok(())
    }

    pub fn set_latency(&self, latency: Duration) -> Result<()> {
        lock(&self.state)?.latency = latency;
        Ok(())
    }

    /// Inspect registers without counting a transaction.
    pub fn peek(&self, id: Address, range: RegisterRange) -> Result<Vec<u8>> {
        let st = lock(&self.state)?;
        let dev = st
            .devices
            .get(&id)
            .ok_or(TransportError::InvalidPacket("unknown mock device"))?;
        dev.load(id, range)
    }

    /// Set registers without counting a transaction.
    pub fn poke(&self, id: Address, start: u16, data: &[u8]) -> Result<()> {
        let mut st = lock(&self.state)?;
        let dev = st
            .devices
            .get_mut(&id)
            .ok_or(TransportError::InvalidPacket("unknown mock device"))?;
        dev.store(id, start, data)
    }
}

impl ServoBus for MockBus {
    fn open(device_file: &str, _baud_rate: u32) -> Result<Self> {
        Ok(Self::new(device_file))
    }

    fn list() -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ping(&mut self, id: Address) -> Result<Option<DeviceSignature>> {
        MockStats::bump(&self.stats.0.pings);
        self.wait()?;
        let st = lock(&self.state)?;
        Ok(st
            .devices
            .get(&id)
            .filter(|d| d.responsive)
            .map(|d| d.signature))
    }

    fn read(&mut self, id: Address, range: RegisterRange) -> Result<Vec<u8>> {
        MockStats::bump(&self.stats.0.reads);
        self.wait()?;
        let mut st = lock(&self.state)?;
        let max_step = st.max_step_ticks;
        let dev = match st.devices.get_mut(&id) {
            Some(d) if d.responsive => d,
            _ => return Err(TransportError::Timeout),
        };
        if range.overlaps(&servo::PRESENT_STATE) {
            dev.step(max_step);
        }
        dev.load(id, range)
    }

    fn write(&mut self, id: Address, start: u16, data: &[u8]) -> Result<()> {
        MockStats::bump(&self.stats.0.writes);
        self.wait()?;
        let mut st = lock(&self.state)?;
        match st.devices.get_mut(&id) {
            Some(d) if d.responsive => d.store(id, start, data),
            _ => Err(TransportError::Timeout),
        }
    }

    fn sync_read(
        &mut self,
        ids: &[Address],
        range: RegisterRange,
    ) -> Result<BTreeMap<Address, Vec<u8>>> {
        MockStats::bump(&self.stats.0.sync_reads);
        self.wait()?;
        let mut st = lock(&self.state)?;
        let max_step = st.max_step_ticks;
        let mut out = BTreeMap::new();
        for &id in ids {
            let Some(dev) = st.devices.get_mut(&id).filter(|d| d.responsive) else {
                continue;
            };
            if range.overlaps(&servo::PRESENT_STATE) {
                dev.step(max_step);
            }
            out.insert(id, dev.load(id, range)?);
        }
        Ok(out)
    }

    fn sync_write(&mut self, start: u16, data: &BTreeMap<Address, Vec<u8>>) -> Result<()> {
        MockStats::bump(&self.stats.0.sync_writes);
        self.wait()?;
        let mut st = lock(&self.state)?;
        // no status packets: silent devices simply miss the update
        for (id, bytes) in data {
            if let Some(dev) = st.devices.get_mut(id).filter(|d| d.responsive) {
                dev.store(*id, start, bytes)?;
            }
        }
        Ok(())
    }
}
