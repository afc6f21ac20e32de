use crate::aggregator::Aggregator;
use crate::error::Result;
use crate::types::{HardwareSnapshot, JointCommand, JointState};
use time::OffsetDateTime;

/// The control loop's view of the robot: named joints in, named joints out.
pub struct JointView {
    hub: Aggregator,
}

impl JointView {
    pub fn new(hub: Aggregator) -> Self {
        Self { hub }
    }

    pub fn joint_names(&self) -> Vec<&str> {
        self.hub.joint_names()
    }

    /// One entry per known joint. Joints that could not be read this cycle
    /// carry their last value flagged stale.
    pub async fn read(&mut self, at: OffsetDateTime) -> Result<JointState> {
        Ok(self.hub.read(at).await?.joints.clone())
    }

    /// Rejects the whole command, without bus traffic, if any name is unknown.
    pub async fn write(&mut self, command: &JointCommand, at: OffsetDateTime) -> Result<()> {
        self.hub.write(command, at).await
    }

    /// Sensor readings from the last read.
    pub fn snapshot(&self) -> &HardwareSnapshot {
        self.hub.last_snapshot()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.hub
    }

    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.hub
    }

    pub fn into_inner(self) -> Aggregator {
        self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bring_up;
    use crate::bus::simulated_ports;
    use crate::events::RecordingSink;
    use crate::HubError;
    use device_registry::parse_config;

    const CONFIG: &str = r#"
ports:
  - { name: port0, device_file: /dev/ttyUSB0, baud_rate: 4000000 }
devices:
  - { name: core, bus: port0, address: 42, kind: core }
  - { name: LAnklePitch, bus: port0, address: 16, kind: actuator, mounting_offset: 0.2 }
  - { name: RAnklePitch, bus: port0, address: 15, kind: actuator }
"#;

    #[tokio::test]
    async fn zero_pose_reaches_zero() {
        let cfg = parse_config(CONFIG).unwrap();
        let (ports, _) = simulated_ports(&cfg);
        let hub = bring_up(&cfg, ports, RecordingSink::new()).await.unwrap();
        let mut view = JointView::new(hub);

        let names: Vec<String> = view.joint_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["LAnklePitch", "RAnklePitch"]);
        let state = view.read(OffsetDateTime::now_utc()).await.unwrap();
        assert!((state.get("LAnklePitch").unwrap().position + 0.2).abs() < 1e-3);

        let zero = JointCommand::zero(names.iter().map(String::as_str), None);
        for _ in 0..5 {
            view.write(&zero, OffsetDateTime::now_utc()).await.unwrap();
            view.read(OffsetDateTime::now_utc()).await.unwrap();
        }
        let state = view.read(OffsetDateTime::now_utc()).await.unwrap();
        for (_, j) in state.iter() {
            assert!(j.position.abs() < 2e-3);
            assert!(!j.stale);
        }
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let cfg = parse_config(CONFIG).unwrap();
        let (ports, _) = simulated_ports(&cfg);
        let hub = bring_up(&cfg, ports, RecordingSink::new()).await.unwrap();
        let mut view = JointView::new(hub);
        let cmd = JointCommand::zero(["Neck"], None);
        assert!(matches!(
            view.write(&cmd, OffsetDateTime::now_utc()).await,
            Err(HubError::UnknownJoints(_))
        ));
    }
}
