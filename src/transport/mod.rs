//! Abstract Device transport interface.
use crate::error::Result;
use crate::protocol::Command;

pub use self::serial::{Baudrate, SerialTransport};
pub use self::usb::UsbTransport;

mod serial;
mod usb;

/// Abstraction of the transport layer.
/// Might be a USB bulk pair or a serial port; framing is the link's concern.
pub trait Transport {
    /// Frame and send one request, returns the number of bytes written.
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize>;

    /// Receive one response for `opcode`, returns its payload.
    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>>;

    /// Release the link. Safe to call more than once.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// One blocking request/response exchange.
    fn transfer(&mut self, cmd: Command) -> Result<Vec<u8>> {
        let opcode = cmd.opcode();
        let payload = cmd.payload()?;
        log::debug!("=> {:02x} {}", opcode, hex::encode(&payload));
        self.send(opcode, &payload)?;

        let Some(max_len) = cmd.response_len() else {
            return Ok(Vec::new());
        };
        let resp = self.receive(opcode, max_len)?;
        log::debug!("<= {:02x} {}", opcode, hex::encode(&resp));
        Ok(resp)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        (**self).send(opcode, payload)
    }

    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        (**self).receive(opcode, max_len)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        (**self).send(opcode, payload)
    }

    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        (**self).receive(opcode, max_len)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
