//! The underlying binary protocol of WCH ISP
//!
//! A [`Command`] knows its opcode, how to serialize its payload and how many
//! response bytes to wait for. Framing differs per link: USB packets carry a
//! bare header, serial frames add a preamble and a trailing checksum.

use scroll::Pwrite;

use crate::constants::{
    commands, IDENTIFY_BANNER, MAX_PACKET_SIZE, MAX_RECV_PAYLOAD, MAX_SEND_PAYLOAD,
    RESPONSE_HEADER_SIZE,
};
use crate::error::{Error, Result};

/// WCH ISP Command
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    /// Identify the MCU.
    /// Return the real `chip_id`, `device_type`.
    Identify,
    /// End ISP session.
    ///
    /// With `reason == 1` the device resets and never answers.
    IspEnd { reason: u8 },
    /// Send the ISP key seed to MCU.
    /// Return checksum of the XOR key(1 byte sum), or 0 on newer bootloaders.
    IspKey { seed: Vec<u8> },
    /// Erase the Code Flash, counted in sectors.
    Erase { sectors: u32 },
    /// Program the Code Flash.
    ///
    /// `data` is already xored with the session key.
    Program {
        address: u32,
        padding: u8,
        data: Vec<u8>,
    },
    /// Verify the Code Flash, same layout as `Program`.
    Verify {
        address: u32,
        padding: u8,
        data: Vec<u8>,
    },
    /// Read config blocks selected by `bit_mask`.
    ReadConfig { bit_mask: u16 },
    /// Write config blocks selected by `bit_mask`.
    WriteConfig { bit_mask: u16, data: Vec<u8> },
    /// Switch the serial link speed.
    SetBaud { baudrate: u32 },
}

impl Command {
    pub fn isp_end(reason: u8) -> Self {
        Command::IspEnd { reason }
    }

    pub fn isp_key(seed: Vec<u8>) -> Self {
        Command::IspKey { seed }
    }

    pub fn erase(sectors: u32) -> Self {
        Command::Erase { sectors }
    }

    pub fn program(address: u32, data: Vec<u8>) -> Self {
        Command::Program {
            address,
            padding: 0,
            data,
        }
    }

    pub fn verify(address: u32, data: Vec<u8>) -> Self {
        Command::Verify {
            address,
            padding: 0,
            data,
        }
    }

    pub fn read_config(bit_mask: u16) -> Self {
        Command::ReadConfig { bit_mask }
    }

    pub fn write_config(bit_mask: u16, data: Vec<u8>) -> Self {
        Command::WriteConfig { bit_mask, data }
    }

    pub fn set_baud(baudrate: u32) -> Self {
        Command::SetBaud { baudrate }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Identify => commands::IDENTIFY,
            Command::IspEnd { .. } => commands::ISP_END,
            Command::IspKey { .. } => commands::ISP_KEY,
            Command::Erase { .. } => commands::ERASE,
            Command::Program { .. } => commands::PROGRAM,
            Command::Verify { .. } => commands::VERIFY,
            Command::ReadConfig { .. } => commands::READ_CONFIG,
            Command::WriteConfig { .. } => commands::WRITE_CONFIG,
            Command::SetBaud { .. } => commands::SET_BAUD,
        }
    }

    /// Response payload size to wait for, `None` when the device stays silent.
    pub fn response_len(&self) -> Option<u16> {
        match self {
            Command::Identify => Some(2),
            Command::IspEnd { reason: 1 } => None,
            Command::ReadConfig { .. } => Some(MAX_RECV_PAYLOAD as u16),
            _ => Some(2),
        }
    }

    /// Serialize the payload, without any link framing.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Command::Identify => IDENTIFY_BANNER.to_vec(),
            Command::IspEnd { reason } => vec![*reason],
            Command::IspKey { seed } => seed.clone(),
            Command::Erase { sectors } => {
                let mut buf = vec![0u8; 4];
                buf.pwrite_with(*sectors, 0, scroll::LE)?;
                buf
            }
            Command::Program {
                address,
                padding,
                data,
            }
            | Command::Verify {
                address,
                padding,
                data,
            } => {
                // ADDR, PADDING, DATA
                let mut buf = vec![0u8; 4 + 1 + data.len()];
                buf.pwrite_with(*address, 0, scroll::LE)?;
                buf[4] = *padding;
                buf[5..].copy_from_slice(data);
                buf
            }
            Command::ReadConfig { bit_mask } => {
                let mut buf = vec![0u8; 2];
                buf.pwrite_with(*bit_mask, 0, scroll::LE)?;
                buf
            }
            Command::WriteConfig { bit_mask, data } => {
                let mut buf = vec![0u8; 2 + data.len()];
                buf.pwrite_with(*bit_mask, 0, scroll::LE)?;
                buf[2..].copy_from_slice(data);
                buf
            }
            Command::SetBaud { baudrate } => {
                let mut buf = vec![0u8; 4];
                buf.pwrite_with(*baudrate, 0, scroll::LE)?;
                buf
            }
        };
        if payload.len() > MAX_SEND_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                opcode: self.opcode(),
                len: payload.len(),
            });
        }
        Ok(payload)
    }
}

/// 8-bit truncated sum used by the serial link.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &val| acc.wrapping_add(val))
}

/// `[opcode, len_lo, len_hi, payload...]`
pub fn encode_usb_request(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_SEND_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            opcode,
            len: payload.len(),
        });
    }
    let mut buf = vec![0u8; 3 + payload.len()];
    buf[0] = opcode;
    buf.pwrite_with(payload.len() as u16, 1, scroll::LE)?;
    buf[3..].copy_from_slice(payload);
    Ok(buf)
}

/// Parse `[opcode, status, len_lo, len_hi, payload...]`.
pub fn decode_usb_response(opcode: u8, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::LengthMismatch {
            opcode,
            expected: RESPONSE_HEADER_SIZE,
            actual: raw.len(),
        });
    }
    if raw[0] != opcode {
        return Err(Error::ProtocolMismatch {
            expected: opcode,
            actual: raw[0],
        });
    }
    if raw[1] != 0 {
        return Err(Error::DeviceError {
            opcode,
            status: raw[1],
        });
    }
    let len = u16::from_le_bytes([raw[2], raw[3]]) as usize;
    let payload = &raw[RESPONSE_HEADER_SIZE..];
    if payload.len() != len {
        return Err(Error::LengthMismatch {
            opcode,
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(payload.to_vec())
}

pub const SERIAL_REQUEST_PREAMBLE: [u8; 2] = [0x57, 0xab];
pub const SERIAL_RESPONSE_PREAMBLE: [u8; 2] = [0x55, 0xaa];
/// Preamble, opcode, reserved byte and u16 length.
pub const SERIAL_RESPONSE_HEADER_SIZE: usize = 6;

/// `[0x57, 0xab, opcode, len_lo, len_hi, payload..., checksum]`
pub fn encode_serial_request(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let body = encode_usb_request(opcode, payload)?;
    let mut buf = Vec::with_capacity(body.len() + 3);
    buf.extend_from_slice(&SERIAL_REQUEST_PREAMBLE);
    buf.extend_from_slice(&body);
    buf.push(checksum(&body));
    Ok(buf)
}

/// Payload length announced by a serial response header.
pub fn serial_payload_len(header: &[u8; SERIAL_RESPONSE_HEADER_SIZE]) -> usize {
    u16::from_le_bytes([header[4], header[5]]) as usize
}

/// Parse `[0x55, 0xaa, opcode, 0x00, len_lo, len_hi, payload..., checksum]`.
///
/// Only an opcode mismatch or a truncated frame is fatal here; a bad
/// preamble, status byte or checksum is logged and the payload is kept.
pub fn decode_serial_response(opcode: u8, raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < SERIAL_RESPONSE_HEADER_SIZE + 1 {
        return Err(Error::LengthMismatch {
            opcode,
            expected: SERIAL_RESPONSE_HEADER_SIZE + 1,
            actual: raw.len(),
        });
    }
    if raw[..2] != SERIAL_RESPONSE_PREAMBLE {
        log::warn!("serial response preamble mismatch: {}", hex::encode(&raw[..2]));
    }
    if raw[2] != opcode {
        return Err(Error::ProtocolMismatch {
            expected: opcode,
            actual: raw[2],
        });
    }
    if raw[3] != 0 {
        log::warn!("serial response for 0x{:02x} carries status 0x{:02x}", opcode, raw[3]);
    }
    let len = u16::from_le_bytes([raw[4], raw[5]]) as usize;
    let end = SERIAL_RESPONSE_HEADER_SIZE + len;
    if raw.len() != end + 1 || len > MAX_PACKET_SIZE {
        return Err(Error::LengthMismatch {
            opcode,
            expected: len,
            actual: raw.len().saturating_sub(SERIAL_RESPONSE_HEADER_SIZE + 1),
        });
    }
    let expected = checksum(&raw[2..end]);
    if raw[end] != expected {
        log::warn!(
            "serial checksum mismatch for 0x{:02x}: got 0x{:02x}, expected 0x{:02x}",
            opcode,
            raw[end],
            expected
        );
    }
    Ok(raw[SERIAL_RESPONSE_HEADER_SIZE..end].to_vec())
}
