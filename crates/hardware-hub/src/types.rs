use device_registry::{ButtonState, CoreStatus, FootPressure, ImuReading, JointTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Index of a bus in the aggregator's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BusId(pub usize);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus{}", self.0)
    }
}

/// Index of a device: its bus and its slot in that bus's service order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceId {
    pub bus: BusId,
    pub slot: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AggregatorState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal. Discovery and init must run again from scratch.
    Faulted,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct JointReading {
    pub position: f64,
    pub velocity: f64,
    pub effort: f64,
    /// Last good value is older than the current cycle.
    pub stale: bool,
}

impl JointReading {
    /// Placeholder for a joint that has never been read.
    pub fn unknown() -> Self {
        Self {
            position: 0.0,
            velocity: 0.0,
            effort: 0.0,
            stale: true,
        }
    }
}

/// Named joint states handed to the control loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JointState(BTreeMap<String, JointReading>);

impl JointState {
    pub fn get(&self, name: &str) -> Option<&JointReading> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JointReading)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn stale_count(&self) -> usize {
        self.0.values().filter(|r| r.stale).count()
    }

    pub(crate) fn entry(&mut self, name: &str) -> &mut JointReading {
        self.0
            .entry(name.to_string())
            .or_insert_with(JointReading::unknown)
    }
}

/// Named joint goals coming from the control loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JointCommand(BTreeMap<String, JointTarget>);

impl JointCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, target: JointTarget) -> &mut Self {
        self.0.insert(name.into(), target);
        self
    }

    /// Every named joint to position 0 at the given velocity.
    pub fn zero<'a>(names: impl IntoIterator<Item = &'a str>, velocity: Option<f64>) -> Self {
        names
            .into_iter()
            .map(|n| {
                (
                    n.to_string(),
                    JointTarget {
                        position: 0.0,
                        velocity,
                        effort: None,
                    },
                )
            })
            .collect()
    }

    /// Hold every joint at its last read position. Stale joints are left out.
    pub fn hold(state: &JointState, velocity: Option<f64>) -> Self {
        state
            .iter()
            .filter(|(_, r)| !r.stale)
            .map(|(n, r)| {
                (
                    n.clone(),
                    JointTarget {
                        position: r.position,
                        velocity,
                        effort: None,
                    },
                )
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&JointTarget> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JointTarget)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, JointTarget)> for JointCommand {
    fn from_iter<I: IntoIterator<Item = (String, JointTarget)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A sensor value with its staleness. `value` is `None` until the first good read.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample<T> {
    pub value: Option<T>,
    pub stale: bool,
}

impl<T> Default for Sample<T> {
    fn default() -> Self {
        Self {
            value: None,
            stale: true,
        }
    }
}

impl<T> Sample<T> {
    pub(crate) fn update(&mut self, value: T) {
        self.value = Some(value);
        self.stale = false;
    }
}

/// Everything read in one cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HardwareSnapshot {
    pub stamp: OffsetDateTime,
    pub cycle: u64,
    pub joints: JointState,
    pub imus: BTreeMap<String, Sample<ImuReading>>,
    pub feet: BTreeMap<String, Sample<FootPressure>>,
    pub buttons: BTreeMap<String, Sample<ButtonState>>,
    pub cores: BTreeMap<String, Sample<CoreStatus>>,
}

impl HardwareSnapshot {
    pub fn new(stamp: OffsetDateTime) -> Self {
        Self {
            stamp,
            cycle: 0,
            joints: JointState::default(),
            imus: BTreeMap::new(),
            feet: BTreeMap::new(),
            buttons: BTreeMap::new(),
            cores: BTreeMap::new(),
        }
    }

    /// Names of every entry currently flagged stale.
    pub fn stale_names(&self) -> Vec<&str> {
        let joints = self
            .joints
            .iter()
            .filter(|(_, r)| r.stale)
            .map(|(n, _)| n.as_str());
        let imus = stale_keys(&self.imus);
        let feet = stale_keys(&self.feet);
        let buttons = stale_keys(&self.buttons);
        let cores = stale_keys(&self.cores);
        joints
            .chain(imus)
            .chain(feet)
            .chain(buttons)
            .chain(cores)
            .collect()
    }
}

fn stale_keys<T>(map: &BTreeMap<String, Sample<T>>) -> impl Iterator<Item = &str> {
    map.iter()
        .filter(|(_, s)| s.stale)
        .map(|(n, _)| n.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_command_covers_every_name() {
        let cmd = JointCommand::zero(["LKnee", "RKnee"], Some(1.0));
        assert_eq!(cmd.names().collect::<Vec<_>>(), vec!["LKnee", "RKnee"]);
        assert_eq!(cmd.get("RKnee").unwrap().position, 0.0);
        assert_eq!(cmd.get("RKnee").unwrap().velocity, Some(1.0));
    }

    #[test]
    fn hold_skips_joints_without_a_reading() {
        let mut state = JointState::default();
        state.entry("LKnee");
        let read = state.entry("RKnee");
        read.position = 0.7;
        read.stale = false;

        let cmd = JointCommand::hold(&state, None);
        assert_eq!(cmd.names().collect::<Vec<_>>(), vec!["RKnee"]);
        assert_eq!(cmd.get("RKnee").unwrap().position, 0.7);
    }

    #[test]
    fn unread_entries_are_stale() {
        let mut snap = HardwareSnapshot::new(OffsetDateTime::UNIX_EPOCH);
        snap.joints.entry("HeadPan");
        snap.imus.insert("imu".into(), Sample::default());
        let mut feet = Sample::default();
        feet.update(FootPressure::default());
        snap.feet.insert("l_foot".into(), feet);

        assert_eq!(snap.stale_names(), vec!["HeadPan", "imu"]);
    }
}
