use crate::protocol::{self, instruction, StatusPacket};
use crate::{
    Address, DeviceSignature, PortInfo, RegisterRange, Result, ServoBus, TransportError,
    BROADCAST_ID,
};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Dynamixel protocol 2.0 over a half-duplex serial adapter.
pub struct SerialServoBus {
    port_path: String,
    port: Box<dyn SerialPort>,
    timeout: Duration,
    rx: Vec<u8>,
}

impl SerialServoBus {
    /// Open with an explicit protocol version and status timeout.
    pub fn open_with(
        path: &str,
        baud_rate: u32,
        protocol_version: u8,
        timeout: Duration,
    ) -> Result<Self> {
        if protocol_version != 2 {
            return Err(TransportError::Unsupported("only protocol 2.0 is implemented"));
        }
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
                _ => TransportError::Io(e.to_string()),
            })?;
        Ok(Self {
            port_path: path.to_string(),
            port,
            timeout,
            rx: Vec::with_capacity(256),
        })
    }

    fn send(&mut self, id: Address, inst: u8, params: &[u8]) -> Result<()> {
        // drop stale echoes and late replies from a previous transaction
        self.port.clear(ClearBuffer::Input).ok();
        self.rx.clear();
        let packet = protocol::encode_packet(id, inst, params)?;
        self.port
            .write_all(&packet)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Receive one status packet, waiting at most the configured timeout.
    fn recv_status(&mut self) -> Result<StatusPacket> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 128];
        loop {
            if let Some(start) = protocol::find_header(&self.rx) {
                if start > 0 {
                    self.rx.drain(..start);
                }
                match protocol::decode_status(&self.rx) {
                    Ok(Some((packet, used))) => {
                        self.rx.drain(..used);
                        if packet.alert() {
                            warn!(id = packet.id, port = %self.port_path, "hardware alert flag set");
                        }
                        return Ok(packet);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // resync on the next header
                        self.rx.drain(..protocol::HEADER.len());
                        debug!(error = %e, port = %self.port_path, "discarding corrupt packet");
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.rx.extend_from_slice(&buf[..n]),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(TransportError::Timeout),
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn recv_from(&mut self, id: Address) -> Result<StatusPacket> {
        loop {
            let packet = self.recv_status()?;
            if packet.id == id {
                return packet.check();
            }
            debug!(expected = id, got = packet.id, "ignoring status from other device");
        }
    }
}

impl ServoBus for SerialServoBus {
    fn open(device_file: &str, baud_rate: u32) -> Result<Self> {
        Self::open_with(device_file, baud_rate, 2, Duration::from_millis(5))
    }

    fn list() -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "usb-serial",
                _ => "serial",
            };
            out.push(PortInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.port_path
    }

    fn ping(&mut self, id: Address) -> Result<Option<DeviceSignature>> {
        self.send(id, instruction::PING, &[])?;
        match self.recv_from(id) {
            Ok(status) => status.signature().map(Some),
            Err(TransportError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, id: Address, range: RegisterRange) -> Result<Vec<u8>> {
        self.send(id, instruction::READ, &protocol::read_params(range))?;
        let status = self.recv_from(id)?;
        if status.params.len() < usize::from(range.len) {
            return Err(TransportError::InvalidPacket("short read reply"));
        }
        Ok(status.params)
    }

    fn write(&mut self, id: Address, start: u16, data: &[u8]) -> Result<()> {
        self.send(id, instruction::WRITE, &protocol::write_params(start, data))?;
        if id == BROADCAST_ID {
            return Ok(());
        }
        self.recv_from(id).map(|_| ())
    }

    fn sync_read(
        &mut self,
        ids: &[Address],
        range: RegisterRange,
    ) -> Result<BTreeMap<Address, Vec<u8>>> {
        self.send(
            BROADCAST_ID,
            instruction::SYNC_READ,
            &protocol::sync_read_params(range, ids),
        )?;
        let mut out = BTreeMap::new();
        for _ in ids {
            // devices answer in request order; a silent one ends the burst
            match self.recv_status() {
                Ok(status) if ids.contains(&status.id) => match status.check() {
                    Ok(s) if s.params.len() >= usize::from(range.len) => {
                        out.insert(s.id, s.params);
                    }
                    Ok(s) => debug!(id = s.id, "short sync read reply"),
                    Err(e) => debug!(error = %e, "sync read status error"),
                },
                Ok(status) => debug!(id = status.id, "unexpected sync read reply"),
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn sync_write(&mut self, start: u16, data: &BTreeMap<Address, Vec<u8>>) -> Result<()> {
        let params = protocol::sync_write_params(start, data)?;
        self.send(BROADCAST_ID, instruction::SYNC_WRITE, &params)
    }
}
