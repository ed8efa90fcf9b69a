//! In-memory bootloader used by the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use wch_isp::constants::{commands, config_mask, IDENTIFY_BANNER};
use wch_isp::session::{challenge_key, checksum_key};
use wch_isp::{Error, Result, Transport};

pub const FLASH_CAPACITY: usize = 512 * 1024;

/// A chip in bootloader mode. Program data is decoded with the session key
/// and stored by address, the way the real bootloader does it.
pub struct MockDevice {
    pub chip_id: u8,
    pub device_type: u8,
    pub uid: [u8; 8],
    pub btver: (u8, u8),
    pub config_words: [u32; 3],
    pub flash: Vec<u8>,
    /// Every request as `(opcode, payload)`.
    pub requests: Vec<(u8, Vec<u8>)>,
    /// Echo a wrong mask on the next READ_CONFIG.
    pub corrupt_next_mask: bool,
    /// Replace the ISP_KEY acknowledgement.
    pub key_ack_override: Option<u8>,
    pub erase_status: [u8; 2],
    /// Answer to ISP_END without reset.
    pub end_reply: Vec<u8>,
    /// Reject the PROGRAM chunk at this address.
    pub fail_program_at: Option<u32>,
    pub closed: bool,
    key: [u8; 8],
    pending: Option<Vec<u8>>,
}

impl MockDevice {
    pub fn new(device_type: u8, chip_id: u8) -> Self {
        MockDevice {
            chip_id,
            device_type,
            uid: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
            btver: (2, 9),
            config_words: [0x00ff_5aa5, 0xff00_ff00, 0xffff_ffff],
            flash: vec![0xff; FLASH_CAPACITY],
            requests: Vec::new(),
            corrupt_next_mask: false,
            key_ack_override: None,
            erase_status: [0, 0],
            end_reply: vec![0, 0],
            fail_program_at: None,
            closed: false,
            key: [0; 8],
            pending: None,
        }
    }

    pub fn ch559() -> Self {
        Self::new(0x11, 0x59)
    }

    pub fn requests_with(&self, opcode: u8) -> Vec<&[u8]> {
        self.requests
            .iter()
            .filter(|(op, _)| *op == opcode)
            .map(|(_, payload)| payload.as_slice())
            .collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.requests_with(opcode).len()
    }

    fn config_response(&mut self, mask: u16) -> Vec<u8> {
        let echo = if self.corrupt_next_mask {
            self.corrupt_next_mask = false;
            mask ^ config_mask::UID
        } else {
            mask
        };
        let mut resp = echo.to_le_bytes().to_vec();
        for (i, word) in self.config_words.iter().enumerate() {
            if mask & (1 << i) != 0 {
                resp.extend_from_slice(&word.to_le_bytes());
            }
        }
        if mask & config_mask::BTVER != 0 {
            resp.extend_from_slice(&[0, self.btver.0, self.btver.1, 0]);
        }
        if mask & config_mask::UID != 0 {
            resp.extend_from_slice(&self.uid);
        }
        resp
    }

    fn key_response(&mut self, seed: &[u8]) -> Vec<u8> {
        self.key = if seed.iter().all(|&b| b == 0) {
            checksum_key(&self.uid, self.chip_id)
        } else {
            // the host only sends non-zero challenges of valid length
            challenge_key(&self.uid, self.chip_id, seed).unwrap_or([0; 8])
        };
        let sum = self.key.iter().fold(0u8, |acc, &k| acc.wrapping_add(k));
        let ack = if self.btver >= (2, 7) || self.device_type == 0x10 {
            0
        } else {
            sum
        };
        vec![self.key_ack_override.unwrap_or(ack), 0]
    }

    fn decode_chunk(&self, payload: &[u8]) -> (u32, Vec<u8>) {
        let address = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(payload[4], 0, "chunk padding byte");
        let data = payload[5..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % 8])
            .collect();
        (address, data)
    }

    fn respond(&mut self, opcode: u8, payload: &[u8]) -> Option<Vec<u8>> {
        match opcode {
            commands::IDENTIFY => {
                assert_eq!(payload, IDENTIFY_BANNER);
                Some(vec![self.chip_id, self.device_type])
            }
            commands::READ_CONFIG => {
                let mask = u16::from_le_bytes([payload[0], payload[1]]);
                Some(self.config_response(mask))
            }
            commands::WRITE_CONFIG => {
                let mask = u16::from_le_bytes([payload[0], payload[1]]);
                assert_eq!(mask, config_mask::RDPR_USER_DATA_WPR);
                for (i, word) in payload[2..].chunks_exact(4).enumerate() {
                    self.config_words[i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                }
                Some(vec![0, 0])
            }
            commands::ISP_KEY => Some(self.key_response(payload)),
            commands::ERASE => Some(self.erase_status.to_vec()),
            commands::PROGRAM => {
                let (address, data) = self.decode_chunk(payload);
                if self.fail_program_at == Some(address) {
                    return Some(vec![0xfe, 0x00]);
                }
                let start = address as usize;
                self.flash[start..start + data.len()].copy_from_slice(&data);
                Some(vec![0, 0])
            }
            commands::VERIFY => {
                let (address, data) = self.decode_chunk(payload);
                let start = address as usize;
                if self.flash[start..start + data.len()] == data[..] {
                    Some(vec![0, 0])
                } else {
                    Some(vec![0xf5, 0x00])
                }
            }
            commands::SET_BAUD => Some(vec![0, 0]),
            commands::ISP_END if payload == [1] => None,
            commands::ISP_END => Some(self.end_reply.clone()),
            other => panic!("unexpected opcode 0x{:02x}", other),
        }
    }
}

impl Transport for MockDevice {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        self.requests.push((opcode, payload.to_vec()));
        self.pending = self.respond(opcode, payload);
        Ok(payload.len() + 3)
    }

    fn receive(&mut self, _opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        let mut resp = self.pending.take().ok_or(Error::TransportTimeout)?;
        resp.truncate(max_len as usize);
        Ok(resp)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Lets a test reach the device while a session owns the link.
pub struct SharedDevice(pub Rc<RefCell<MockDevice>>);

impl Transport for SharedDevice {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        self.0.borrow_mut().send(opcode, payload)
    }

    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        self.0.borrow_mut().receive(opcode, max_len)
    }

    fn close(&mut self) -> Result<()> {
        self.0.borrow_mut().close()
    }
}

/// Deterministic non-trivial image content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(7) as u8)
        .collect()
}
