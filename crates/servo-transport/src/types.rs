use core::fmt;

/// Bus address of a device in a daisy chain.
pub type Address = u8;

/// Address every device listens to; no status packets are returned for it.
pub const BROADCAST_ID: Address = 0xFE;

/// Highest address a device may use. 0xFD and 0xFF clash with packet framing.
pub const MAX_DEVICE_ID: Address = 0xFC;

/// What a device answers to a ping: its model number and firmware version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DeviceSignature {
    pub model_number: u16,
    pub firmware: u8,
}

impl DeviceSignature {
    pub fn new(model_number: u16, firmware: u8) -> Self {
        Self {
            model_number,
            firmware,
        }
    }
}

impl fmt::Display for DeviceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model 0x{model:04X} fw {fw}",
            model = self.model_number,
            fw = self.firmware
        )
    }
}

/// A contiguous block of control-table registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RegisterRange {
    pub start: u16,
    pub len: u16,
}

impl RegisterRange {
    pub const fn new(start: u16, len: u16) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u16 {
        self.start.saturating_add(self.len)
    }

    pub fn contains(&self, addr: u16) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, other: &RegisterRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

#[derive(Clone, Debug)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let present = RegisterRange::new(126, 10);
        assert!(present.contains(135));
        assert!(!present.contains(136));
        assert!(!present.overlaps(&RegisterRange::new(136, 4)));
        assert!(present.overlaps(&RegisterRange::new(132, 4)));
        assert!(RegisterRange::new(120, 8).overlaps(&present));
    }
}
