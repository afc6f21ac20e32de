use crate::{Address, DeviceSignature, PortInfo, RegisterRange, Result};
use std::collections::BTreeMap;

/// A minimal blocking servo bus interface.
///
/// Implementations own exactly one physical transport. None of the methods
/// may be called concurrently on the same bus; callers serialize access.
pub trait ServoBus: Send {
    /// Open a bus on a device file (e.g. "/dev/ttyUSB0") at the given baud rate.
    fn open(device_file: &str, baud_rate: u32) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available ports for this backend.
    fn list() -> Result<Vec<PortInfo>>
    where
        Self: Sized;

    /// Name of the underlying port, for logs.
    fn name(&self) -> &str;

    /// Ping one address. `Ok(None)` means nothing answered in time.
    fn ping(&mut self, id: Address) -> Result<Option<DeviceSignature>>;

    /// Read a register block from one device.
    fn read(&mut self, id: Address, range: RegisterRange) -> Result<Vec<u8>>;

    /// Write a register block on one device and wait for its acknowledgement.
    fn write(&mut self, id: Address, start: u16, data: &[u8]) -> Result<()>;

    /// Read the same register block from several devices in one round trip.
    ///
    /// Devices that do not answer are absent from the returned map; only a
    /// transport-level failure is an error.
    fn sync_read(
        &mut self,
        ids: &[Address],
        range: RegisterRange,
    ) -> Result<BTreeMap<Address, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for &id in ids {
            match self.read(id, range) {
                Ok(data) => {
                    out.insert(id, data);
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Write per-device data of equal length starting at the same register.
    fn sync_write(&mut self, start: u16, data: &BTreeMap<Address, Vec<u8>>) -> Result<()> {
        for (&id, bytes) in data {
            self.write(id, start, bytes)?;
        }
        Ok(())
    }
}
