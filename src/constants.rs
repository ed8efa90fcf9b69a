//! Protocol constants shared by every layer.
use std::time::Duration;

/// One USB bulk packet, also the upper bound of a serial frame body.
pub const MAX_PACKET_SIZE: usize = 64;

/// Request header on the USB link: opcode + u16 length.
pub const REQUEST_HEADER_SIZE: usize = 3;
/// Response header on the USB link: opcode + status + u16 length.
pub const RESPONSE_HEADER_SIZE: usize = 4;

/// Largest payload a single request may carry (61).
pub const MAX_SEND_PAYLOAD: usize = MAX_PACKET_SIZE - REQUEST_HEADER_SIZE;
/// Largest payload a single response may carry (60).
pub const MAX_RECV_PAYLOAD: usize = MAX_PACKET_SIZE - RESPONSE_HEADER_SIZE;

/// Address (u32) + padding byte in front of every program/verify chunk.
pub const CHUNK_HEADER_SIZE: usize = 5;
/// Data bytes per PROGRAM/VERIFY command (56).
pub const MAX_CHUNK_SIZE: usize = MAX_SEND_PAYLOAD - CHUNK_HEADER_SIZE;

/// Images are zero-padded to a multiple of this before flashing.
pub const IMAGE_ALIGNMENT: usize = 64;

/// Sector size used when the family is not in the database.
pub const DEFAULT_SECTOR_SIZE: u32 = 1024;

/// Bound on every single transport read or write.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// IDENTIFY payload. The first two bytes are reserved and sent as zero.
pub const IDENTIFY_BANNER: &[u8; 18] = b"\0\0MCU ISP & WCH.CN";

/// Length of the ISP_KEY seed sent by the host.
pub const KEY_SEED_LEN: usize = 30;

/// The CH56x family acknowledges ISP_KEY with zero on every bootloader.
pub const DEVICE_TYPE_CH56X: u8 = 0x10;

/// Words in the RDPR/USER, DATA and WPR image exchanged by READ_CONFIG and
/// WRITE_CONFIG.
pub const OPTION_WORDS: usize = 3;

/// RDPR value meaning "code flash readable".
pub const RDPR_UNPROTECTED: u32 = 0xa5;

pub mod commands {
    pub const IDENTIFY: u8 = 0xa1;
    pub const ISP_END: u8 = 0xa2;
    pub const ISP_KEY: u8 = 0xa3;
    pub const ERASE: u8 = 0xa4;
    pub const PROGRAM: u8 = 0xa5;
    pub const VERIFY: u8 = 0xa6;
    pub const READ_CONFIG: u8 = 0xa7;
    pub const WRITE_CONFIG: u8 = 0xa8;
    pub const DATA_ERASE: u8 = 0xa9;
    pub const DATA_PROGRAM: u8 = 0xaa;
    pub const DATA_READ: u8 = 0xab;
    pub const WRITE_OTP: u8 = 0xc3;
    pub const READ_OTP: u8 = 0xc4;
    pub const SET_BAUD: u8 = 0xc5;
}

/// READ_CONFIG / WRITE_CONFIG selector bits.
///
/// Blocks are returned packed in ascending bit order:
///
/// | bit | block                               | bytes |
/// |-----|-------------------------------------|-------|
/// | 0   | RDPR, nRDPR, USER, nUSER            | 4     |
/// | 1   | DATA0, nDATA0, DATA1, nDATA1        | 4     |
/// | 2   | WPR0..WPR3                          | 4     |
/// | 3   | bootloader version `[0, maj, min, 0]` | 4   |
/// | 4   | chip unique id                      | 8     |
pub mod config_mask {
    pub const RDPR_USER: u16 = 0x01;
    pub const DATA: u16 = 0x02;
    pub const WPR: u16 = 0x04;
    pub const RDPR_USER_DATA_WPR: u16 = 0x07;
    pub const BTVER: u16 = 0x08;
    pub const UID: u16 = 0x10;
    pub const ALL: u16 = 0x1f;
}

/// USB VID:PID pairs announced by the bootloader.
pub const USB_IDS: &[(u16, u16)] = &[(0x4348, 0x55e0), (0x1a86, 0x55e0)];
