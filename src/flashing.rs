//! Chip flashing logic.
//!
//! [`Flashing`] owns one [`Session`] and drives the whole connect sequence:
//! identify, bootloader version, UID, database lookup, option bytes and the
//! key handshake. Afterwards it erases, programs and verifies flash, and
//! reads or rewrites the option bytes.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::constants::{commands, RDPR_UNPROTECTED};
use crate::device::{ChipDB, ConfigDecoder, Geometry};
use crate::error::{Error, Result};
use crate::format::FlashImage;
use crate::option_bytes::{OptionBytes, READ_PROTECTION};
use crate::protocol::Command;
use crate::session::{BootloaderVersion, KeyDerivation, Session};
use crate::transport::Transport;

/// Progress hook: `(action, bytes_done, bytes_total)`.
pub type ProgressFn = Box<dyn FnMut(&str, usize, usize)>;

/// Cooperative cancellation, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing flag, such as one raised by a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        CancelToken(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Program,
    Verify,
}

impl Pass {
    fn name(self) -> &'static str {
        match self {
            Pass::Program => "write",
            Pass::Verify => "verify",
        }
    }

    fn command(self, address: u32, data: Vec<u8>) -> Command {
        match self {
            Pass::Program => Command::program(address, data),
            Pass::Verify => Command::verify(address, data),
        }
    }

    fn failure(self, address: u32, status: [u8; 2]) -> Error {
        match self {
            Pass::Program => Error::ProgramFailed { address, status },
            Pass::Verify => Error::VerifyFailed { address, status },
        }
    }
}

pub struct Flashing<T: Transport> {
    session: Session<T>,
    /// Shared, so several connections can reuse one loaded database.
    db: Arc<ChipDB>,
    config: Config,
    chip_name: String,
    decoder: ConfigDecoder,
    geometry: Geometry,
    option_bytes: Option<OptionBytes>,
    /// Last RDPR/USER, DATA and WPR words read from the device.
    raw_config: Option<[u32; 3]>,
    progress: Option<ProgressFn>,
    cancel: CancelToken,
}

impl<T: Transport> Flashing<T> {
    /// Connect to the bootloader behind `transport` and establish the key.
    pub fn new(transport: T, db: Arc<ChipDB>, config: Config) -> Result<Self> {
        let mut session = Session::new(transport);
        let (chip_id, device_type) = session.identify()?;
        let btver = session.read_btver()?;
        session.read_uid()?;

        let resolved = db.resolve(device_type, chip_id);
        let chip_name = resolved.name();
        let decoder = resolved.config_decoder();
        let mut option_bytes = resolved.option_bytes()?;

        let raw_config = if config.read_option_bytes || resolved.needs_option_words() {
            Some(session.read_option_words()?)
        } else {
            None
        };
        if let (Some(ob), Some(words)) = (option_bytes.as_mut(), raw_config.as_ref()) {
            ob.import(words)?;
        }

        let geometry = resolved.geometry(raw_config.as_ref().map(|w| &w[..]));
        if geometry.flash_size.is_none() {
            if config.strict_geometry {
                return Err(Error::UnknownDevice {
                    device_type,
                    chip_id,
                });
            }
            log::warn!("flash size of {} is unknown, image size checks are disabled", resolved);
        }
        log::info!("Found chip: {} bootloader {}", resolved, btver);

        let strategy = KeyDerivation::select(config.key_mode);
        session.establish_key(&strategy)?;
        log::debug!("ISP key established");

        Ok(Flashing {
            session,
            db,
            config,
            chip_name,
            decoder,
            geometry,
            option_bytes,
            raw_config,
            progress: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn set_progress(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn database(&self) -> &Arc<ChipDB> {
        &self.db
    }

    pub fn chip_name(&self) -> &str {
        &self.chip_name
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn bootloader_version(&self) -> BootloaderVersion {
        self.session.bootloader_version()
    }

    pub fn option_bytes(&self) -> Option<&OptionBytes> {
        self.option_bytes.as_ref()
    }

    /// Truncated option byte assignments and other non-fatal problems.
    pub fn warnings(&self) -> Vec<Error> {
        self.option_bytes
            .as_ref()
            .map(OptionBytes::warnings)
            .unwrap_or_default()
    }

    pub fn dump_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Chip: {} [type 0x{:02x} id 0x{:02x}]",
            self.chip_name,
            self.session.device_type(),
            self.session.chip_id()
        );
        let _ = writeln!(out, "Chip UID: {}", self.session.uid_string());
        let _ = writeln!(out, "Bootloader: {}", self.bootloader_version());
        match self.geometry.flash_size {
            Some(size) => {
                let _ = writeln!(out, "Code flash: {}KiB", size / 1024);
            }
            None => {
                let _ = writeln!(out, "Code flash: unknown");
            }
        }
        if self.geometry.eeprom_size > 0 {
            let _ = writeln!(
                out,
                "EEPROM: {}B at 0x{:04x}",
                self.geometry.eeprom_size, self.geometry.eeprom_start_addr
            );
        }
        if let Some(sram) = self.geometry.sram_size {
            let _ = writeln!(out, "SRAM: {}KiB", sram / 1024);
        }
        if let Some(ob) = &self.option_bytes {
            if let Some(rdpr) = ob.value_of(READ_PROTECTION) {
                let _ = writeln!(out, "Code flash protected: {}", rdpr != RDPR_UNPROTECTED);
            }
        }
        out
    }

    fn report(&mut self, action: &str, done: usize, total: usize) {
        if let Some(progress) = self.progress.as_mut() {
            progress(action, done, total);
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Erase enough sectors for `total_size` bytes, returns the sector count.
    pub fn erase(&mut self, total_size: usize) -> Result<u32> {
        let sector_size = self.geometry.sector_size as usize;
        let mut sectors = u32::try_from(total_size.div_ceil(sector_size)).map_err(|_| {
            Error::ImageTooLarge {
                size: total_size,
                flash_size: u32::MAX,
            }
        })?;
        if let Some(max) = self.geometry.flash_sectors() {
            if sectors > max {
                log::warn!("erase of {} sectors clamped to {}", sectors, max);
                sectors = max;
            }
        }
        self.erase_sectors(sectors)?;
        Ok(sectors)
    }

    /// Erase the whole code flash.
    pub fn erase_all(&mut self) -> Result<u32> {
        let sectors = self.geometry.flash_sectors().ok_or(Error::UnknownDevice {
            device_type: self.session.device_type(),
            chip_id: self.session.chip_id(),
        })?;
        self.erase_sectors(sectors)?;
        Ok(sectors)
    }

    fn erase_sectors(&mut self, sectors: u32) -> Result<()> {
        self.check_cancel()?;
        self.report("erase", 0, sectors as usize);
        let resp = self.session.transfer_keyed(Command::erase(sectors))?;
        let status = two_byte_status(commands::ERASE, &resp)?;
        if status != [0, 0] {
            return Err(Error::EraseFailed { sectors, status });
        }
        self.report("erase", sectors as usize, sectors as usize);
        log::info!("Erased {} code flash sectors", sectors);
        Ok(())
    }

    /// Program `data` at offset 0, followed by the end-of-write marker.
    pub fn program(&mut self, data: &[u8]) -> Result<()> {
        self.run_pass(Pass::Program, data)
    }

    /// Compare flash content with `data`.
    pub fn verify(&mut self, data: &[u8]) -> Result<()> {
        self.run_pass(Pass::Verify, data)
    }

    fn run_pass(&mut self, pass: Pass, data: &[u8]) -> Result<()> {
        let total = data.len();
        if u32::try_from(total).is_err() {
            return Err(Error::ImageTooLarge {
                size: total,
                flash_size: u32::MAX,
            });
        }
        let key = *self.session.xor_key();
        let mut address = 0usize;

        for chunk in data.chunks(self.config.chunk_size) {
            self.check_cancel()?;
            self.report(pass.name(), address, total);

            let payload = chunk
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % key.len()])
                .collect();
            self.send_chunk(pass, address as u32, payload)?;
            address += chunk.len();
        }
        if pass == Pass::Program {
            self.send_chunk(pass, address as u32, Vec::new())?;
        }

        self.report(pass.name(), total, total);
        Ok(())
    }

    fn send_chunk(&mut self, pass: Pass, address: u32, payload: Vec<u8>) -> Result<()> {
        let cmd = pass.command(address, payload);
        let opcode = cmd.opcode();
        let resp = self.session.transfer_keyed(cmd)?;
        let status = two_byte_status(opcode, &resp)?;
        if status != [0, 0] {
            return Err(pass.failure(address, status));
        }
        Ok(())
    }

    fn check_image_size(&self, size: usize) -> Result<()> {
        match self.geometry.flash_size {
            Some(flash_size) if size > flash_size as usize => {
                Err(Error::ImageTooLarge { size, flash_size })
            }
            Some(_) => Ok(()),
            None if self.config.strict_geometry => Err(Error::UnknownDevice {
                device_type: self.session.device_type(),
                chip_id: self.session.chip_id(),
            }),
            None => {
                log::warn!("flash size unknown, skipping image size check");
                Ok(())
            }
        }
    }

    /// Size check, erase, program and, unless disabled, verify.
    pub fn flash(&mut self, image: &FlashImage) -> Result<()> {
        self.check_image_size(image.len())?;
        self.erase(image.len())?;
        self.program(image.as_bytes())?;
        log::info!("Programmed {} bytes", image.len());
        if self.config.verify_after_write {
            self.verify(image.as_bytes())?;
            log::info!("Verified {} bytes", image.len());
        }
        Ok(())
    }

    pub fn verify_image(&mut self, image: &FlashImage) -> Result<()> {
        self.check_image_size(image.len())?;
        self.verify(image.as_bytes())?;
        log::info!("Verified {} bytes", image.len());
        Ok(())
    }

    /// Fresh RDPR/USER, DATA and WPR words, imported into the schema.
    ///
    /// On a failed read the model keeps its previous state.
    pub fn read_option_bytes(&mut self) -> Result<[u32; 3]> {
        let words = self.session.read_option_words()?;
        if let Some(ob) = self.option_bytes.as_mut() {
            ob.import(&words)?;
        }
        self.raw_config = Some(words);
        Ok(words)
    }

    fn schema_mut(&mut self) -> Result<&mut OptionBytes> {
        let name = &self.chip_name;
        self.option_bytes
            .as_mut()
            .ok_or_else(|| Error::database(format!("no option byte schema for {}", name)))
    }

    pub fn modify_option_bytes(&mut self, assignments: &str) -> Result<()> {
        self.schema_mut()?.modify(assignments)
    }

    /// Export the schema over the last read words and WRITE_CONFIG them.
    pub fn write_option_bytes(&mut self) -> Result<()> {
        let mut words = match self.raw_config {
            Some(words) => words,
            None => self.session.read_option_words()?,
        };
        self.schema_mut()?.export(&mut words)?;
        self.session.write_option_words(&words)?;
        self.raw_config = Some(words);
        log::info!("Option bytes written");
        Ok(())
    }

    /// Clear read protection. Returns `false` when it was already off.
    pub fn unprotect(&mut self) -> Result<bool> {
        let mut words = self.session.read_option_words()?;
        let changed = match self.option_bytes.as_mut() {
            Some(ob) => {
                ob.import(&words)?;
                let changed = ob.unlock()?;
                if changed {
                    ob.export(&mut words)?;
                }
                changed
            }
            None => {
                if words[0] & 0xff == RDPR_UNPROTECTED {
                    false
                } else {
                    words[0] = (words[0] & !0xff) | RDPR_UNPROTECTED;
                    true
                }
            }
        };
        if changed {
            self.session.write_option_words(&words)?;
            log::info!("Code flash unprotected");
        } else {
            log::info!("Code flash already unprotected");
        }
        self.raw_config = Some(words);
        Ok(changed)
    }

    /// Human readable option bytes: the schema when there is one, the
    /// family decoder otherwise, else a hex dump.
    pub fn config_report(&mut self) -> Result<String> {
        let words = self.read_option_bytes()?;
        if let Some(ob) = &self.option_bytes {
            return Ok(ob.to_string());
        }
        if self.decoder == ConfigDecoder::Ch56x {
            return Ok(ch56x_report(words[2]));
        }
        let raw: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut out = Vec::new();
        hxdmp::hexdump(&raw, &mut out)
            .map_err(|e| Error::TransportIo(format!("hexdump: {}", e)))?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Speed up a serial link. The caller switches the host side after this
    /// returns.
    pub fn set_baud(&mut self, baudrate: u32) -> Result<()> {
        self.session.set_baud(baudrate)
    }

    /// End the session, resetting when the config asks for it.
    pub fn finish(self) -> Result<()> {
        let reset = self.config.reset_on_finish;
        self.end(reset)
    }

    /// End the session with a device reset.
    pub fn reset(self) -> Result<()> {
        self.end(true)
    }

    fn end(mut self, reset: bool) -> Result<()> {
        self.session.end(reset)?;
        if reset {
            log::info!("Device reset");
        }
        Ok(())
    }
}

/// First two response bytes, as carried by every write style command.
fn two_byte_status(opcode: u8, resp: &[u8]) -> Result<[u8; 2]> {
    match resp {
        [a, b, ..] => Ok([*a, *b]),
        _ => Err(Error::LengthMismatch {
            opcode,
            expected: 2,
            actual: resp.len(),
        }),
    }
}

bitfield::bitfield! {
    /// CH56x non-volatile config word.
    pub struct Ch56xConfig(u32);
    impl Debug;
    pub reset_en, _: 4;
    pub debug_en, _: 5;
    pub boot_en, _: 6;
    pub code_read_en, _: 7;
    pub lockup_rst_en, _: 29;
    pub u8, user_mem, _: 31, 30;
}

fn ch56x_report(word: u32) -> String {
    let cfg = Ch56xConfig(word);
    let flag = |on: bool| if on { "enabled" } else { "disabled" };
    let mut out = String::new();
    for (bit, name, on) in [
        (4, "RESET_EN", cfg.reset_en()),
        (5, "DEBUG_EN", cfg.debug_en()),
        (6, "BOOT_EN", cfg.boot_en()),
        (7, "CODE_READ_EN", cfg.code_read_en()),
        (29, "LOCKUP_RST_EN", cfg.lockup_rst_en()),
    ] {
        let _ = writeln!(out, "[{}] {} {}: {}", bit, name, on as u8, flag(on));
    }
    let user_mem = match cfg.user_mem() {
        0 => "RAMX 32KB + ROM 96KB",
        1 => "RAMX 64KB + ROM 64KB",
        _ => "RAMX 96KB + ROM 32KB",
    };
    let _ = writeln!(out, "[31:30] USER_MEM 0b{:02b}: {}", cfg.user_mem(), user_mem);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ch56x_config_fields() {
        let report = ch56x_report((1 << 4) | (1 << 7) | (0b01 << 30));
        assert!(report.contains("[4] RESET_EN 1: enabled"));
        assert!(report.contains("[5] DEBUG_EN 0: disabled"));
        assert!(report.contains("[7] CODE_READ_EN 1: enabled"));
        assert!(report.contains("[31:30] USER_MEM 0b01: RAMX 64KB + ROM 64KB"));
    }

    #[test]
    fn status_needs_two_bytes() {
        assert_eq!(two_byte_status(0xa4, &[0, 1, 9]).unwrap(), [0, 1]);
        assert!(matches!(
            two_byte_status(0xa4, &[0]),
            Err(Error::LengthMismatch { actual: 1, .. })
        ));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_follows_an_external_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken::from_flag(flag.clone());
        assert!(!token.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
    }
}
