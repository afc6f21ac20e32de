use super::{DeviceReadout, Readable, Reading, Writable};
use crate::error::DeviceError;
use device_registry::{
    decode_actuator_state, encode_current_limit, encode_flag, encode_goal, ActuatorState,
    JointCalibration, JointTarget,
};
use servo_transport::control_table::servo;
use servo_transport::{Address, ServoBus};
use std::collections::BTreeMap;
use tracing::debug;

/// One servo driving one joint.
#[derive(Debug, Clone)]
pub struct Actuator {
    name: String,
    address: Address,
    calibration: JointCalibration,
    goal: Option<JointTarget>,
    /// Current limit last written, in register units.
    written_current: Option<Vec<u8>>,
    last: Option<ActuatorState>,
}

impl Actuator {
    pub fn new(name: &str, address: Address, calibration: JointCalibration) -> Self {
        Self {
            name: name.to_string(),
            address,
            calibration,
            goal: None,
            written_current: None,
            last: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn goal(&self) -> Option<&JointTarget> {
        self.goal.as_ref()
    }

    pub fn last_state(&self) -> Option<&ActuatorState> {
        self.last.as_ref()
    }

    pub fn stage(&mut self, target: JointTarget) {
        self.goal = Some(target);
    }

    fn decode(&mut self, data: &[u8]) -> Result<Reading, DeviceError> {
        let state = decode_actuator_state(data, &self.calibration)
            .ok_or_else(|| DeviceError::malformed(&self.name, "short present state"))?;
        self.last = Some(state);
        Ok(Reading::Joint(state))
    }

    /// Hold the present position so enabling torque does not make the joint jump.
    fn hold_present(&mut self) {
        if let Some(state) = self.last {
            self.goal = Some(JointTarget::position(state.position));
        }
    }

    /// Current limit bytes to send, if the goal asks for a new one.
    fn pending_current(&self) -> Option<Vec<u8>> {
        let effort = self.goal.as_ref()?.effort?;
        let bytes = encode_current_limit(effort);
        (self.written_current.as_ref() != Some(&bytes)).then_some(bytes)
    }

    pub fn init(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        bus.write(self.address, servo::TORQUE_ENABLE, &encode_flag(true))
            .map_err(|e| DeviceError::transport(&self.name, e))?;
        let data = bus
            .read(self.address, servo::PRESENT_STATE)
            .map_err(|e| DeviceError::transport(&self.name, e))?;
        self.decode(&data)?;
        self.hold_present();
        Ok(())
    }
}

impl Readable for Actuator {
    fn read(&mut self, bus: &mut dyn ServoBus, _cycle: u64) -> Vec<DeviceReadout> {
        let result = bus
            .read(self.address, servo::PRESENT_STATE)
            .map_err(|e| DeviceError::transport(&self.name, e))
            .and_then(|data| self.decode(&data));
        vec![DeviceReadout::new(&self.name, result)]
    }
}

impl Writable for Actuator {
    fn write(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        let Some(goal) = self.goal else {
            return Ok(());
        };
        if let Some(current) = self.pending_current() {
            bus.write(self.address, servo::GOAL_CURRENT, &current)
                .map_err(|e| DeviceError::transport(&self.name, e))?;
            self.written_current = Some(current);
        }
        bus.write(
            self.address,
            servo::GOAL_BLOCK.start,
            &encode_goal(&goal, &self.calibration),
        )
        .map_err(|e| DeviceError::transport(&self.name, e))
    }
}

/// All servos of one bus, serviced with one sync read and one sync write per
/// cycle instead of one transaction per servo.
#[derive(Debug, Clone)]
pub struct ActuatorBus {
    label: String,
    members: Vec<Actuator>,
    addresses: Vec<Address>,
}

impl ActuatorBus {
    pub fn new(label: &str, mut members: Vec<Actuator>) -> Self {
        members.sort_by_key(Actuator::address);
        let addresses = members.iter().map(Actuator::address).collect();
        Self {
            label: label.to_string(),
            members,
            addresses,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn members(&self) -> &[Actuator] {
        &self.members
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn stage(&mut self, joint: &str, target: JointTarget) -> bool {
        match self.members.iter_mut().find(|a| a.name == joint) {
            Some(a) => {
                a.stage(target);
                true
            }
            None => false,
        }
    }

    /// Enable torque on every servo in one sync write, then seed the goals
    /// from the present positions.
    pub fn init(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        let enable: BTreeMap<Address, Vec<u8>> = self
            .addresses
            .iter()
            .map(|&a| (a, encode_flag(true).to_vec()))
            .collect();
        bus.sync_write(servo::TORQUE_ENABLE, &enable)
            .map_err(|e| DeviceError::transport(&self.label, e))?;

        let replies = bus
            .sync_read(&self.addresses, servo::PRESENT_STATE)
            .map_err(|e| DeviceError::transport(&self.label, e))?;
        for member in &mut self.members {
            let data = replies
                .get(&member.address)
                .ok_or_else(|| DeviceError::no_reply(&member.name))?;
            member.decode(data)?;
            member.hold_present();
        }
        debug!(group = %self.label, servos = self.members.len(), "torque enabled");
        Ok(())
    }
}

impl Readable for ActuatorBus {
    fn read(&mut self, bus: &mut dyn ServoBus, _cycle: u64) -> Vec<DeviceReadout> {
        match bus.sync_read(&self.addresses, servo::PRESENT_STATE) {
            Ok(replies) => self
                .members
                .iter_mut()
                .map(|m| {
                    let result = match replies.get(&m.address) {
                        Some(data) => m.decode(data),
                        None => Err(DeviceError::no_reply(&m.name)),
                    };
                    DeviceReadout::new(&m.name, result)
                })
                .collect(),
            Err(e) => {
                debug!(group = %self.label, error = %e, "sync read failed");
                self.members
                    .iter()
                    .map(|m| DeviceReadout::new(&m.name, Err(DeviceError::transport(&m.name, e.clone()))))
                    .collect()
            }
        }
    }
}

impl Writable for ActuatorBus {
    fn write(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        let currents: BTreeMap<Address, Vec<u8>> = self
            .members
            .iter()
            .filter_map(|m| m.pending_current().map(|c| (m.address, c)))
            .collect();
        if !currents.is_empty() {
            bus.sync_write(servo::GOAL_CURRENT, &currents)
                .map_err(|e| DeviceError::transport(&self.label, e))?;
            for m in &mut self.members {
                if let Some(c) = currents.get(&m.address) {
                    m.written_current = Some(c.clone());
                }
            }
        }

        let goals: BTreeMap<Address, Vec<u8>> = self
            .members
            .iter()
            .filter_map(|m| {
                m.goal
                    .as_ref()
                    .map(|g| (m.address, encode_goal(g, &m.calibration)))
            })
            .collect();
        if goals.is_empty() {
            return Ok(());
        }
        bus.sync_write(servo::GOAL_BLOCK.start, &goals)
            .map_err(|e| DeviceError::transport(&self.label, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servo_transport::control_table::model;
    use servo_transport::{MockBus, RegisterRange};

    fn group(ids: &[Address]) -> ActuatorBus {
        ActuatorBus::new(
            "port0/actuators",
            ids.iter()
                .map(|&id| Actuator::new(&format!("j{id}"), id, JointCalibration::default()))
                .collect(),
        )
    }

    fn bus_with(ids: &[Address]) -> MockBus {
        ids.iter()
            .fold(MockBus::new("port0"), |b, &id| b.with_device(id, model::MX64))
    }

    #[test]
    fn members_are_serviced_in_address_order() {
        let g = group(&[9, 2, 5]);
        assert_eq!(g.addresses(), &[2, 5, 9]);
    }

    #[test]
    fn init_enables_torque_in_one_transaction_and_holds_position() {
        let mut bus = bus_with(&[1, 2, 3]);
        let stats = bus.stats();
        let mut g = group(&[1, 2, 3]);
        g.init(&mut bus).unwrap();

        assert_eq!(stats.sync_writes(), 1);
        assert_eq!(stats.sync_reads(), 1);
        assert_eq!(stats.writes() + stats.reads(), 0);
        let torque = bus.handle().peek(2, RegisterRange::new(servo::TORQUE_ENABLE, 1)).unwrap();
        assert_eq!(torque, vec![1]);
        for m in g.members() {
            assert!(m.goal().unwrap().position.abs() < 1e-9);
        }
    }

    #[test]
    fn one_sync_read_per_cycle_and_missing_member_is_isolated() {
        let mut bus = bus_with(&[1, 2, 3, 4]);
        let mut g = group(&[1, 2, 3, 4]);
        g.init(&mut bus).unwrap();
        bus.handle().set_responsive(3, false).unwrap();
        let before = bus.stats().sync_reads();

        let out = g.read(&mut bus, 0);
        assert_eq!(bus.stats().sync_reads(), before + 1);
        assert_eq!(out.len(), 4);
        let failed: Vec<_> = out
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(failed, vec!["j3"]);
    }

    #[test]
    fn current_limit_is_written_only_when_it_changes() {
        let mut bus = bus_with(&[1, 2]);
        let stats = bus.stats();
        let mut g = group(&[1, 2]);
        g.init(&mut bus).unwrap();
        let base = stats.sync_writes();

        let target = JointTarget {
            position: 0.2,
            velocity: None,
            effort: Some(1.0),
        };
        g.stage("j1", target);
        g.write(&mut bus).unwrap();
        assert_eq!(stats.sync_writes(), base + 2);

        g.write(&mut bus).unwrap();
        assert_eq!(stats.sync_writes(), base + 3);
    }

    #[test]
    fn single_actuator_reads_and_writes_individually() {
        let mut bus = bus_with(&[7]);
        let mut a = Actuator::new("knee", 7, JointCalibration::default());
        a.init(&mut bus).unwrap();
        a.stage(JointTarget::position(0.1));
        a.write(&mut bus).unwrap();
        let out = a.read(&mut bus, 0);
        assert!(matches!(out[0].result, Ok(Reading::Joint(_))));
        assert_eq!(bus.stats().sync_reads() + bus.stats().sync_writes(), 0);
    }
}
