//! Firmware file formats
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;

use crate::constants::IMAGE_ALIGNMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    Binary,
}

/// Flat firmware image starting at flash offset 0, zero-padded to
/// [`IMAGE_ALIGNMENT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: Vec<u8>,
    content_len: usize,
}

impl FlashImage {
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let content_len = data.len();
        data.resize(content_len.next_multiple_of(IMAGE_ALIGNMENT), 0);
        FlashImage { data, content_len }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = read_firmware_from_file(path)?;
        Ok(Self::from_bytes(raw))
    }

    /// Aligned size, the number of bytes written to flash.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size before padding.
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_record_text = raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r');
    if is_record_text {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Flatten Intel HEX records, addresses relative to the lowest one.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let Some(first) = sections.first() else {
        anyhow::bail!("firmware contains no data");
    };
    let start_address = first.0;
    // a short record sorted last may sit inside an earlier, longer one
    let end_address = sections
        .iter()
        .map(|(addr, sect)| *addr as usize + sect.len())
        .max()
        .unwrap_or(start_address as usize);
    if start_address != 0 {
        log::warn!(
            "firmware starts at 0x{:08x}, flashing it from offset 0",
            start_address
        );
    }

    let mut binary = vec![0u8; end_address - start_address as usize];
    let mut written_to = 0;
    for (addr, sect) in sections {
        let sect_start = (addr - start_address) as usize;
        anyhow::ensure!(
            sect_start >= written_to,
            "overlapping data at 0x{:08x}",
            addr
        );
        let sect_end = sect_start + sect.len();
        binary[sect_start..sect_end].copy_from_slice(&sect);
        written_to = sect_end;
    }
    Ok(binary)
}
