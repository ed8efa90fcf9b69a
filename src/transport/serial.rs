//! Serial Transportation.
use std::{fmt::Display, io::Read, io::Write, thread::sleep, time::Duration};

use serialport::SerialPort;

use super::Transport;
use crate::constants::TRANSPORT_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{
    decode_serial_response, encode_serial_request, serial_payload_len,
    SERIAL_RESPONSE_HEADER_SIZE,
};

/// How long each strapping step holds the lines.
const STRAP_DELAY: Duration = Duration::from_millis(50);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Baudrate {
    #[default]
    #[value(name = "115200")]
    Baud115200,
    #[value(name = "460800")]
    Baud460800,
    #[value(name = "1m", alias = "1000000")]
    Baud1m,
    #[value(name = "2m", alias = "2000000")]
    Baud2m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud460800 => 460800,
            Baudrate::Baud1m => 1000000,
            Baudrate::Baud2m => 2000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// Serial link, optionally wired so that RTS drives BOOT0 and DTR drives RESET.
pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    lines_asserted: bool,
    closed: bool,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, Baudrate::default());
        let serial_port = serialport::new(port, Baudrate::default().into())
            .timeout(TRANSPORT_TIMEOUT)
            .open()?;
        Ok(SerialTransport {
            serial_port,
            lines_asserted: false,
            closed: false,
        })
    }

    pub fn open_nth(nth: usize) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::NoDevice),
        }
    }

    /// Change the host side speed, after the device acknowledged SET_BAUD.
    pub fn set_baudrate(&mut self, baudrate: impl Into<u32>) -> Result<()> {
        self.serial_port.set_baud_rate(baudrate.into())?;
        Ok(())
    }

    /// Hold BOOT0 high and pulse RESET so the chip comes up in its bootloader.
    ///
    /// BOOT0 stays asserted until [`Self::release_lines`] or close.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        log::debug!("strapping BOOT0 (RTS) and pulsing RESET (DTR)");
        self.lines_asserted = true;
        self.serial_port.write_request_to_send(true)?;
        self.serial_port.write_data_terminal_ready(true)?;
        sleep(STRAP_DELAY);
        self.serial_port.write_data_terminal_ready(false)?;
        sleep(STRAP_DELAY);
        self.serial_port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    /// Return RTS and DTR to their idle level.
    pub fn release_lines(&mut self) -> Result<()> {
        if self.lines_asserted {
            self.lines_asserted = false;
            self.serial_port.write_request_to_send(false)?;
            self.serial_port.write_data_terminal_ready(false)?;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        let raw = encode_serial_request(opcode, payload)?;
        self.serial_port.write_all(&raw)?;
        self.serial_port.flush()?;
        Ok(raw.len())
    }

    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        let mut header = [0u8; SERIAL_RESPONSE_HEADER_SIZE];
        self.serial_port.read_exact(&mut header)?;

        // Payload announced by the header, followed by the checksum byte.
        let mut frame = header.to_vec();
        frame.resize(SERIAL_RESPONSE_HEADER_SIZE + serial_payload_len(&header) + 1, 0);
        self.serial_port
            .read_exact(&mut frame[SERIAL_RESPONSE_HEADER_SIZE..])?;

        let mut payload = decode_serial_response(opcode, &frame)?;
        payload.truncate(max_len as usize);
        Ok(payload)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.release_lines()?;
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to release serial control lines: {}", e);
        }
    }
}
