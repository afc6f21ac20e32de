//! Dynamixel protocol 2.0 framing.
//!
//! ```text
//! FF FF FD 00 | id | len_l len_h | instruction | params... | crc_l crc_h
//! ```
//! `len` counts everything after itself (instruction, params, crc). The
//! instruction/param field is byte-stuffed: `FF FF FD` is followed by an extra
//! `FD` on the wire.

use crate::{Address, DeviceSignature, RegisterRange, Result, TransportError};
use std::collections::BTreeMap;

pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
const STUFFING: [u8; 3] = [0xFF, 0xFF, 0xFD];
const MIN_PACKET: usize = 10;

pub mod instruction {
    pub const PING: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const STATUS: u8 = 0x55;
    pub const SYNC_READ: u8 = 0x82;
    pub const SYNC_WRITE: u8 = 0x83;
}

/// Hardware alert flag in the status error byte. Not a failure of the request.
pub const ALERT_BIT: u8 = 0x80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusPacket {
    pub id: Address,
    pub error: u8,
    pub params: Vec<u8>,
}

impl StatusPacket {
    pub fn alert(&self) -> bool {
        self.error & ALERT_BIT != 0
    }

    /// Turn a non-zero error code into an error.
    pub fn check(self) -> Result<Self> {
        let code = self.error & !ALERT_BIT;
        if code != 0 {
            return Err(TransportError::DeviceStatus { id: self.id, code });
        }
        Ok(self)
    }

    pub fn signature(&self) -> Result<DeviceSignature> {
        if self.params.len() < 3 {
            return Err(TransportError::InvalidPacket("short ping reply"));
        }
        let model = u16::from_le_bytes([self.params[0], self.params[1]]);
        Ok(DeviceSignature::new(model, self.params[2]))
    }
}

/// CRC-16 with polynomial 0x8005, zero init, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn ends_with_stuffing(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[buf.len() - 3..] == STUFFING
}

pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    for &b in body {
        out.push(b);
        if ends_with_stuffing(&out) {
            out.push(0xFD);
        }
    }
    out
}

pub fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        if ends_with_stuffing(&out) && body.get(i + 1) == Some(&0xFD) {
            i += 2;
            continue;
        }
        i += 1;
    }
    out
}

/// Frame one packet. Used for instructions, and for status packets in tests.
pub fn encode_packet(id: Address, instruction: u8, params: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(params.len() + 1);
    body.push(instruction);
    body.extend_from_slice(params);
    let body = stuff(&body);
    let len = u16::try_from(body.len() + 2)
        .map_err(|_| TransportError::InvalidPacket("packet too long"))?;

    let mut out = Vec::with_capacity(HEADER.len() + 3 + body.len() + 2);
    out.extend_from_slice(&HEADER);
    out.push(id);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

pub fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER.len()).position(|w| w == HEADER)
}

/// Try to decode one status packet from the start of `buf`.
///
/// `buf` must begin with a header (see [`find_header`]). Returns `Ok(None)`
/// when more bytes are needed, or the packet and the number of bytes it used.
pub fn decode_status(buf: &[u8]) -> Result<Option<(StatusPacket, usize)>> {
    if buf.len() < 7 {
        return Ok(None);
    }
    if buf[..4] != HEADER {
        return Err(TransportError::InvalidPacket("missing header"));
    }
    let len = usize::from(u16::from_le_bytes([buf[5], buf[6]]));
    let total = 7 + len;
    if total < MIN_PACKET + 1 {
        return Err(TransportError::InvalidPacket("status too short"));
    }
    if buf.len() < total {
        return Ok(None);
    }
    let expected = crc16(&buf[..total - 2]);
    let actual = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
    if expected != actual {
        return Err(TransportError::Checksum { expected, actual });
    }
    let body = unstuff(&buf[7..total - 2]);
    if body.len() < 2 {
        return Err(TransportError::InvalidPacket("status too short"));
    }
    if body[0] != instruction::STATUS {
        return Err(TransportError::InvalidPacket("not a status packet"));
    }
    let packet = StatusPacket {
        id: buf[4],
        error: body[1],
        params: body[2..].to_vec(),
    };
    Ok(Some((packet, total)))
}

pub fn read_params(range: RegisterRange) -> Vec<u8> {
    let mut p = Vec::with_capacity(4);
    p.extend_from_slice(&range.start.to_le_bytes());
    p.extend_from_slice(&range.len.to_le_bytes());
    p
}

pub fn write_params(start: u16, data: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(2 + data.len());
    p.extend_from_slice(&start.to_le_bytes());
    p.extend_from_slice(data);
    p
}

pub fn sync_read_params(range: RegisterRange, ids: &[Address]) -> Vec<u8> {
    let mut p = read_params(range);
    p.extend_from_slice(ids);
    p
}

pub fn sync_write_params(start: u16, data: &BTreeMap<Address, Vec<u8>>) -> Result<Vec<u8>> {
    let len = match data.values().next() {
        Some(first) => first.len(),
        None => return Err(TransportError::InvalidPacket("empty sync write")),
    };
    if data.values().any(|d| d.len() != len) {
        return Err(TransportError::InvalidPacket("sync write lengths differ"));
    }
    let len16 =
        u16::try_from(len).map_err(|_| TransportError::InvalidPacket("sync write too long"))?;
    let mut p = Vec::with_capacity(4 + data.len() * (len + 1));
    p.extend_from_slice(&start.to_le_bytes());
    p.extend_from_slice(&len16.to_le_bytes());
    for (&id, bytes) in data {
        p.push(id);
        p.extend_from_slice(bytes);
    }
    Ok(p)
}
