//! Run configuration handed to the flashing engine.
use crate::constants::MAX_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::session::KeyMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Verify after programming in [`crate::Flashing::flash`].
    pub verify_after_write: bool,
    /// End the session with a device reset.
    pub reset_on_finish: bool,
    /// Data bytes per PROGRAM/VERIFY command, `1..=MAX_CHUNK_SIZE`.
    pub chunk_size: usize,
    pub key_mode: KeyMode,
    /// Refuse to flash when the flash size is unknown.
    pub strict_geometry: bool,
    /// Read and import option bytes while connecting.
    pub read_option_bytes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verify_after_write: true,
            reset_on_finish: false,
            chunk_size: MAX_CHUNK_SIZE,
            key_mode: KeyMode::default(),
            strict_geometry: false,
            read_option_bytes: true,
        }
    }
}

impl Config {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::invalid_assignment(format!(
                "chunk size {} outside 1..={}",
                chunk_size, MAX_CHUNK_SIZE
            )));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }
}
