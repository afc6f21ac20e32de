use super::{due, DeviceReadout, Readable, Reading, Writable};
use crate::error::DeviceError;
use device_registry::{decode_core, encode_flag, encode_leds, Rgba};
use servo_transport::control_table::{core_board, sensor_board};
use servo_transport::{Address, RegisterRange, ServoBus, TransportError};

/// Power distribution board. Switches servo power and reports supply voltages.
#[derive(Debug, Clone)]
pub struct CoreBoard {
    name: String,
    address: Address,
    read_rate: u32,
    power: bool,
    power_dirty: bool,
}

impl CoreBoard {
    pub fn new(name: &str, address: Address, read_rate: u32) -> Self {
        Self {
            name: name.to_string(),
            address,
            read_rate,
            power: true,
            power_dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn power(&self) -> bool {
        self.power
    }

    pub fn set_power(&mut self, on: bool) {
        if self.power != on {
            self.power = on;
            self.power_dirty = true;
        }
    }

    /// Switch servo power on.
    pub fn init(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        bus.write(self.address, core_board::POWER_ENABLE, &encode_flag(true))
            .map_err(|e| DeviceError::transport(&self.name, e))?;
        self.power = true;
        self.power_dirty = false;
        Ok(())
    }
}

impl Readable for CoreBoard {
    fn read(&mut self, bus: &mut dyn ServoBus, cycle: u64) -> Vec<DeviceReadout> {
        if !due(cycle, self.read_rate) {
            return vec![DeviceReadout::new(&self.name, Ok(Reading::NotDue))];
        }
        let result = bus
            .read(self.address, core_board::STATUS)
            .map_err(|e| DeviceError::transport(&self.name, e))
            .and_then(|d| {
                decode_core(&d)
                    .map(Reading::Core)
                    .ok_or_else(|| DeviceError::malformed(&self.name, "short status block"))
            });
        vec![DeviceReadout::new(&self.name, result)]
    }
}

impl Writable for CoreBoard {
    fn write(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        if !self.power_dirty {
            return Ok(());
        }
        bus.write(
            self.address,
            core_board::POWER_ENABLE,
            &encode_flag(self.power),
        )
        .map_err(|e| DeviceError::transport(&self.name, e))?;
        self.power_dirty = false;
        Ok(())
    }
}

/// RGB LEDs on the sensor board. Write only.
#[derive(Debug, Clone)]
pub struct LedPanel {
    name: String,
    address: Address,
    start_number: u16,
    colors: Vec<Rgba>,
    dirty: bool,
}

impl LedPanel {
    pub fn new(name: &str, address: Address, led_count: usize, start_number: u16) -> Self {
        Self {
            name: name.to_string(),
            address,
            start_number,
            colors: vec![Rgba::OFF; led_count],
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn colors(&self) -> &[Rgba] {
        &self.colors
    }

    /// Stage one LED colour. Returns false if `index` is out of range.
    pub fn set(&mut self, index: usize, color: Rgba) -> bool {
        match self.colors.get_mut(index) {
            Some(c) => {
                if *c != color {
                    *c = color;
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    fn block(&self) -> Result<RegisterRange, DeviceError> {
        u16::try_from(self.colors.len())
            .ok()
            .and_then(|count| sensor_board::led_block(self.start_number, count))
            .ok_or_else(|| {
                DeviceError::transport(
                    &self.name,
                    TransportError::InvalidPacket("led block past the control table"),
                )
            })
    }

    /// Turn every LED off.
    pub fn init(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        self.colors.iter_mut().for_each(|c| *c = Rgba::OFF);
        self.dirty = true;
        self.write(bus)
    }
}

impl Writable for LedPanel {
    fn write(&mut self, bus: &mut dyn ServoBus) -> Result<(), DeviceError> {
        if !self.dirty || self.colors.is_empty() {
            return Ok(());
        }
        let block = self.block()?;
        bus.write(self.address, block.start, &encode_leds(&self.colors))
            .map_err(|e| DeviceError::transport(&self.name, e))?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servo_transport::control_table::model;
    use servo_transport::MockBus;

    #[test]
    fn core_init_switches_power_on() {
        let mut bus = MockBus::new("port0").with_device(42, model::CORE_BOARD);
        let mut core = CoreBoard::new("core", 42, 1);
        core.init(&mut bus).unwrap();
        let reg = bus
            .handle()
            .peek(42, RegisterRange::new(core_board::POWER_ENABLE, 1))
            .unwrap();
        assert_eq!(reg, vec![1]);
    }

    #[test]
    fn core_status_decodes_voltages() {
        let mut bus = MockBus::new("port0").with_device(42, model::CORE_BOARD);
        let mut status = vec![1u8];
        status.extend_from_slice(&12_000u16.to_le_bytes());
        status.extend_from_slice(&15_500u16.to_le_bytes());
        bus.handle().poke(42, core_board::STATUS.start, &status).unwrap();

        let mut core = CoreBoard::new("core", 42, 1);
        match &core.read(&mut bus, 5)[0].result {
            Ok(Reading::Core(s)) => {
                assert!(s.power_on);
                assert!((s.vcc - 12.0).abs() < 1e-9);
                assert!((s.vbat - 15.5).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn power_is_written_only_when_changed() {
        let mut bus = MockBus::new("port0").with_device(42, model::CORE_BOARD);
        let mut core = CoreBoard::new("core", 42, 1);
        core.init(&mut bus).unwrap();
        core.write(&mut bus).unwrap();
        assert_eq!(bus.stats().writes(), 1);

        core.set_power(false);
        core.write(&mut bus).unwrap();
        core.write(&mut bus).unwrap();
        assert_eq!(bus.stats().writes(), 2);
        let reg = bus
            .handle()
            .peek(42, RegisterRange::new(core_board::POWER_ENABLE, 1))
            .unwrap();
        assert_eq!(reg, vec![0]);
    }

    #[test]
    fn leds_land_at_their_start_number() {
        let mut bus = MockBus::new("port1").with_device(241, model::SENSOR_BOARD);
        let mut leds = LedPanel::new("leds", 241, 3, 1);
        leds.init(&mut bus).unwrap();
        assert!(leds.set(2, Rgba::new(10, 20, 30, 0)));
        assert!(!leds.set(3, Rgba::new(1, 1, 1, 1)));
        leds.write(&mut bus).unwrap();

        let third = sensor_board::LED_BASE + 3 * sensor_board::BYTES_PER_LED;
        let reg = bus.handle().peek(241, RegisterRange::new(third, 4)).unwrap();
        assert_eq!(reg, vec![10, 20, 30, 0]);
    }

    #[test]
    fn leds_past_the_table_fail_without_bus_traffic() {
        let mut bus = MockBus::new("port1").with_device(241, model::SENSOR_BOARD);
        let mut leds = LedPanel::new("leds", 241, 2, 20_000);
        assert!(matches!(
            leds.init(&mut bus),
            Err(DeviceError::Transport { .. })
        ));
        assert_eq!(bus.stats().writes(), 0);
    }
}
