use crate::types::HardwareConfig;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Parse and validate a hardware table from YAML text.
pub fn parse_config(raw: &str) -> anyhow::Result<HardwareConfig> {
    let cfg: HardwareConfig = serde_yaml::from_str(raw).context("parsing hardware yaml")?;
    cfg.validate().context("validating hardware table")?;
    Ok(cfg)
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<HardwareConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading hardware table: {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindingMode, DeviceKind, DeviceParams};

    const SAMPLE: &str = r#"
ports:
  - name: port0
    device_file: /dev/ttyUSB0
    baud_rate: 4000000
devices:
  - name: core
    bus: port0
    address: 42
    kind: core
    read_rate: 10
    mandatory: true
  - name: HeadPan
    bus: port0
    address: 19
    kind: actuator
    model_number: 321
    joint_offset: 0.1
  - name: l_foot
    bus: port0
    address: 101
    kind: foot_pressure
  - name: imu_leds
    bus: port0
    address: 241
    kind: leds
    led_count: 3
hub:
  mode: only_imu
  cycle:
    deadline_ms: 8
"#;

    #[test]
    fn parses_kind_tagged_descriptors() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.ports[0].protocol_version, 2);
        assert_eq!(cfg.devices.len(), 4);

        let core = &cfg.devices[0];
        assert!(core.mandatory);
        assert_eq!(core.params, DeviceParams::Core { read_rate: 10 });
        assert_eq!(core.expected_model(), 0xABBA);

        let pan = &cfg.devices[1];
        assert_eq!(pan.expected_kind(), DeviceKind::Actuator);
        assert!(!pan.is_mandatory());
        assert_eq!(pan.expected_model(), 321);
        assert_eq!(
            pan.params,
            DeviceParams::Actuator {
                mounting_offset: 0.0,
                joint_offset: 0.1
            }
        );

        assert_eq!(cfg.devices[2].params, DeviceParams::FootPressure);
        assert_eq!(
            cfg.devices[3].params,
            DeviceParams::Leds {
                led_count: 3,
                start_number: 0
            }
        );
    }

    #[test]
    fn partial_hub_settings_keep_defaults() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.hub.mode, BindingMode::OnlyImu);
        assert_eq!(cfg.hub.cycle.deadline_ms, 8);
        assert_eq!(cfg.hub.cycle.max_consecutive_deadline_misses, 5);
        assert_eq!(cfg.hub.discovery.min_devices, 2);
    }

    #[test]
    fn invalid_table_fails_to_load() {
        let raw = SAMPLE.replace("address: 101", "address: 19");
        assert!(parse_config(&raw).is_err());
    }
}
