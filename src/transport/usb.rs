//! USB Transportation.
use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::Transport;
use crate::constants::{MAX_PACKET_SIZE, TRANSPORT_TIMEOUT, USB_IDS};
use crate::error::{Error, Result};
use crate::protocol::{decode_usb_response, encode_usb_request};

const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;

const INTERFACE: u8 = 0;

pub struct UsbTransport {
    device_handle: DeviceHandle<Context>,
    claimed: bool,
}

fn is_isp_device(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|desc| USB_IDS.contains(&(desc.vendor_id(), desc.product_id())))
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(is_isp_device)
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found WCH ISP USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(nth: usize) -> Result<UsbTransport> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .filter(is_isp_device)
            .nth(nth)
            .ok_or(Error::NoDevice)?;
        log::debug!("Found USB Device {:?}", device);

        let config = device.config_descriptor(0)?;

        let mut endpoint_out_found = false;
        let mut endpoint_in_found = false;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    endpoint_out_found |= endpoint.address() == ENDPOINT_OUT;
                    endpoint_in_found |= endpoint.address() == ENDPOINT_IN;
                }
            }
        }
        if !(endpoint_out_found && endpoint_in_found) {
            return Err(Error::TransportIo("USB endpoints not found".into()));
        }

        let device_handle = device.open()?;
        // Not supported on every platform, the claim below reports real failures.
        if let Err(e) = device_handle.set_auto_detach_kernel_driver(true) {
            log::debug!("auto detach kernel driver: {}", e);
        }
        device_handle.claim_interface(INTERFACE)?;

        Ok(UsbTransport {
            device_handle,
            claimed: true,
        })
    }
}

impl Transport for UsbTransport {
    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<usize> {
        let raw = encode_usb_request(opcode, payload)?;
        let n = self
            .device_handle
            .write_bulk(ENDPOINT_OUT, &raw, TRANSPORT_TIMEOUT)?;
        Ok(n)
    }

    fn receive(&mut self, opcode: u8, max_len: u16) -> Result<Vec<u8>> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let nread = self
            .device_handle
            .read_bulk(ENDPOINT_IN, &mut buf, TRANSPORT_TIMEOUT)?;
        let mut payload = decode_usb_response(opcode, &buf[..nread])?;
        payload.truncate(max_len as usize);
        Ok(payload)
    }

    fn close(&mut self) -> Result<()> {
        if self.claimed {
            self.claimed = false;
            self.device_handle.release_interface(INTERFACE)?;
        }
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to release USB interface: {}", e);
        }
    }
}
