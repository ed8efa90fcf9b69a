//! ISP session: identification, config reads and the XOR key handshake.
//!
//! A session walks `Disconnected -> Identified -> KeyEstablished -> Ended`.
//! Program and verify payloads are only meaningful once the key is
//! established, since the bootloader decodes them with the same key.

use std::fmt;

use rand::Rng;
use scroll::{Pread, LE};

use crate::constants::{commands, config_mask, DEVICE_TYPE_CH56X, KEY_SEED_LEN};
use crate::error::{Error, Result};
use crate::protocol::Command;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Identified,
    KeyEstablished,
    Ended,
}

/// Bootloader version, reported as `[0, major, minor, 0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BootloaderVersion {
    pub major: u8,
    pub minor: u8,
}

impl BootloaderVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        BootloaderVersion { major, minor }
    }

    /// `major << 8 | minor`
    pub const fn packed(&self) -> u16 {
        (self.major as u16) << 8 | self.minor as u16
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// From this version on the bootloader acknowledges ISP_KEY with zero.
pub const ZERO_ACK_VERSION: BootloaderVersion = BootloaderVersion::new(2, 7);

/// Config blocks of one READ_CONFIG response, split by mask bit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlocks {
    /// RDPR/USER, DATA and WPR words, `None` where not requested.
    pub words: [Option<u32>; 3],
    pub bootloader_version: Option<BootloaderVersion>,
    pub uid: Option<[u8; 8]>,
}

impl ConfigBlocks {
    /// Split `data` (mask echo already stripped) in ascending bit order.
    pub fn parse(mask: u16, data: &[u8]) -> Result<Self> {
        let mut blocks = ConfigBlocks::default();
        let mut offset = 0usize;

        for (i, bit) in [config_mask::RDPR_USER, config_mask::DATA, config_mask::WPR]
            .into_iter()
            .enumerate()
        {
            if mask & bit != 0 {
                blocks.words[i] = Some(take(data, &mut offset, 4)?.pread_with::<u32>(0, LE)?);
            }
        }
        if mask & config_mask::BTVER != 0 {
            let raw = take(data, &mut offset, 4)?;
            blocks.bootloader_version = Some(BootloaderVersion::new(raw[1], raw[2]));
        }
        if mask & config_mask::UID != 0 {
            let mut uid = [0u8; 8];
            uid.copy_from_slice(take(data, &mut offset, 8)?);
            blocks.uid = Some(uid);
        }
        Ok(blocks)
    }

    /// The three option words, missing ones as zero.
    pub fn option_words(&self) -> [u32; 3] {
        self.words.map(|w| w.unwrap_or(0))
    }
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let chunk = data
        .get(*offset..*offset + len)
        .ok_or(Error::LengthMismatch {
            opcode: commands::READ_CONFIG,
            expected: *offset + len,
            actual: data.len(),
        })?;
    *offset += len;
    Ok(chunk)
}

/// Key scheme requested by the caller, see [`KeyDerivation::select`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyMode {
    /// Checksum keyed, the scheme every supported bootloader accepts.
    #[default]
    Auto,
    Checksum,
    /// Legacy challenge derived key. Best effort only.
    Challenge,
}

/// Index pairs `(d, m)` picking `challenge[len / d * m]` for key bytes 0..7.
const CHALLENGE_INDEX: [(usize, usize); 7] = [(7, 4), (5, 1), (7, 1), (7, 6), (7, 3), (5, 3), (7, 5)];
/// Shortest challenge for which every index above is in range.
pub const MIN_CHALLENGE_LEN: usize = 29;

/// Session XOR key derivation, selected once per session before ISP_KEY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDerivation {
    /// All-zero seed, key = UID checksum. The ack must match `expected_ack`.
    Checksum,
    /// Host chosen challenge mixed into the key, the ack is informational.
    Challenge(Vec<u8>),
}

impl KeyDerivation {
    pub fn select(mode: KeyMode) -> Self {
        match mode {
            KeyMode::Auto | KeyMode::Checksum => KeyDerivation::Checksum,
            KeyMode::Challenge => KeyDerivation::Challenge(random_challenge()),
        }
    }

    /// Seed sent with ISP_KEY.
    pub fn seed(&self) -> Vec<u8> {
        match self {
            KeyDerivation::Checksum => vec![0u8; KEY_SEED_LEN],
            KeyDerivation::Challenge(challenge) => challenge.clone(),
        }
    }

    pub fn derive(&self, uid: &[u8; 8], chip_id: u8) -> Result<[u8; 8]> {
        match self {
            KeyDerivation::Checksum => Ok(checksum_key(uid, chip_id)),
            KeyDerivation::Challenge(challenge) => challenge_key(uid, chip_id, challenge),
        }
    }
}

fn random_challenge() -> Vec<u8> {
    let mut rng = rand::rng();
    (0..KEY_SEED_LEN)
        .map(|_| rng.random_range(1..=u8::MAX))
        .collect()
}

fn uid_checksum(uid: &[u8; 8]) -> u8 {
    uid.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
}

/// `[s; 7] ++ [s + chip_id]` where `s` is the UID checksum.
pub fn checksum_key(uid: &[u8; 8], chip_id: u8) -> [u8; 8] {
    let sum = uid_checksum(uid);
    let mut key = [sum; 8];
    key[7] = sum.wrapping_add(chip_id);
    key
}

/// Legacy key: UID checksum xored with seven challenge bytes.
pub fn challenge_key(uid: &[u8; 8], chip_id: u8, challenge: &[u8]) -> Result<[u8; 8]> {
    if challenge.len() < MIN_CHALLENGE_LEN {
        return Err(Error::InvalidChallenge(format!(
            "{} bytes, at least {} required",
            challenge.len(),
            MIN_CHALLENGE_LEN
        )));
    }
    if challenge.iter().all(|&b| b == 0) {
        return Err(Error::InvalidChallenge("all-zero challenge".into()));
    }
    let sum = uid_checksum(uid);
    let len = challenge.len();
    let mut key = [0u8; 8];
    for (k, (d, m)) in key.iter_mut().zip(CHALLENGE_INDEX) {
        *k = sum ^ challenge[len / d * m];
    }
    key[7] = chip_id.wrapping_add(key[0]);
    Ok(key)
}

/// Ack byte a checksum keyed handshake must receive.
pub fn expected_ack(key: &[u8; 8], version: BootloaderVersion, device_type: u8) -> u8 {
    if version >= ZERO_ACK_VERSION || device_type == DEVICE_TYPE_CH56X {
        0
    } else {
        key.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
    }
}

/// One connected chip on one transport.
pub struct Session<T: Transport> {
    transport: T,
    state: SessionState,
    chip_id: u8,
    device_type: u8,
    uid: [u8; 8],
    bootloader_version: BootloaderVersion,
    xor_key: [u8; 8],
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session {
            transport,
            state: SessionState::Disconnected,
            chip_id: 0,
            device_type: 0,
            uid: [0; 8],
            bootloader_version: BootloaderVersion::default(),
            xor_key: [0; 8],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    pub fn device_type(&self) -> u8 {
        self.device_type
    }

    pub fn uid(&self) -> &[u8; 8] {
        &self.uid
    }

    /// `aa-bb-...`, the form used to select a device by UID.
    pub fn uid_string(&self) -> String {
        self.uid
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn bootloader_version(&self) -> BootloaderVersion {
        self.bootloader_version
    }

    pub fn xor_key(&self) -> &[u8; 8] {
        &self.xor_key
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn ensure_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Identified | SessionState::KeyEstablished => Ok(()),
            actual => Err(Error::InvalidState {
                expected: SessionState::Identified,
                actual,
            }),
        }
    }

    /// Raw exchange for commands that need an established key.
    pub fn transfer_keyed(&mut self, cmd: Command) -> Result<Vec<u8>> {
        self.ensure_state(SessionState::KeyEstablished)?;
        self.transport.transfer(cmd)
    }

    /// Raw exchange on an identified session.
    pub fn transfer(&mut self, cmd: Command) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.transport.transfer(cmd)
    }

    /// Returns `(chip_id, device_type)`.
    pub fn identify(&mut self) -> Result<(u8, u8)> {
        let resp = self.transport.transfer(Command::Identify)?;
        if resp.len() < 2 {
            return Err(Error::LengthMismatch {
                opcode: commands::IDENTIFY,
                expected: 2,
                actual: resp.len(),
            });
        }
        if resp[0] == 0 && resp[1] == 0 {
            return Err(Error::NoDevice);
        }
        self.chip_id = resp[0];
        self.device_type = resp[1];
        self.state = SessionState::Identified;
        log::debug!(
            "identified chip id 0x{:02x} type 0x{:02x}",
            self.chip_id,
            self.device_type
        );
        Ok((self.chip_id, self.device_type))
    }

    /// READ_CONFIG, checking the echoed mask.
    pub fn read_config(&mut self, bit_mask: u16) -> Result<ConfigBlocks> {
        let resp = self.transfer(Command::read_config(bit_mask))?;
        if resp.len() < 2 {
            return Err(Error::LengthMismatch {
                opcode: commands::READ_CONFIG,
                expected: 2,
                actual: resp.len(),
            });
        }
        let echoed = resp.pread_with::<u16>(0, LE)?;
        if echoed != bit_mask {
            return Err(Error::ConfigMaskMismatch {
                expected: bit_mask,
                actual: echoed,
            });
        }
        ConfigBlocks::parse(bit_mask, &resp[2..])
    }

    pub fn read_btver(&mut self) -> Result<BootloaderVersion> {
        let blocks = self.read_config(config_mask::BTVER)?;
        self.bootloader_version = blocks.bootloader_version.unwrap_or_default();
        Ok(self.bootloader_version)
    }

    pub fn read_uid(&mut self) -> Result<[u8; 8]> {
        let blocks = self.read_config(config_mask::UID)?;
        self.uid = blocks.uid.unwrap_or_default();
        Ok(self.uid)
    }

    /// RDPR/USER, DATA and WPR words.
    pub fn read_option_words(&mut self) -> Result<[u32; 3]> {
        let blocks = self.read_config(config_mask::RDPR_USER_DATA_WPR)?;
        Ok(blocks.option_words())
    }

    pub fn write_option_words(&mut self, words: &[u32; 3]) -> Result<()> {
        let data: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let cmd = Command::write_config(config_mask::RDPR_USER_DATA_WPR, data);
        let opcode = cmd.opcode();
        let resp = self.transfer(cmd)?;
        check_status(opcode, &resp)
    }

    /// Send the key seed and check the device agrees on the derived key.
    pub fn establish_key(&mut self, strategy: &KeyDerivation) -> Result<[u8; 8]> {
        self.ensure_state(SessionState::Identified)?;
        let key = strategy.derive(&self.uid, self.chip_id)?;

        let resp = self.transport.transfer(Command::isp_key(strategy.seed()))?;
        let ack = *resp.first().ok_or(Error::LengthMismatch {
            opcode: commands::ISP_KEY,
            expected: 1,
            actual: 0,
        })?;

        match strategy {
            KeyDerivation::Checksum => {
                let expected = expected_ack(&key, self.bootloader_version, self.device_type);
                if ack != expected {
                    return Err(Error::KeyHandshakeFailed {
                        expected,
                        actual: ack,
                    });
                }
            }
            KeyDerivation::Challenge(_) => {
                log::debug!("challenge key ack 0x{:02x} (not checked)", ack);
            }
        }

        self.xor_key = key;
        self.state = SessionState::KeyEstablished;
        log::debug!("xor key {}", hex::encode(key));
        Ok(key)
    }

    /// Ask the bootloader to switch speed. The caller reconfigures the host side.
    pub fn set_baud(&mut self, baudrate: u32) -> Result<()> {
        let cmd = Command::set_baud(baudrate);
        let opcode = cmd.opcode();
        let resp = self.transfer(cmd)?;
        check_status(opcode, &resp)
    }

    /// ISP_END. With `reset` the device reboots and does not answer,
    /// otherwise it acknowledges with two zero bytes.
    ///
    /// The transport is closed even when the acknowledgement is bad.
    pub fn end(&mut self, reset: bool) -> Result<()> {
        self.ensure_open()?;
        let cmd = Command::isp_end(reset as u8);
        let opcode = cmd.opcode();
        let ack = self.transport.transfer(cmd).and_then(|resp| {
            if reset {
                Ok(())
            } else {
                check_status(opcode, &resp)
            }
        });
        self.state = SessionState::Ended;
        self.transport.close()?;
        ack
    }
}

/// Two-byte acknowledgements are `[0, 0]` on success.
fn check_status(opcode: u8, resp: &[u8]) -> Result<()> {
    if resp.len() < 2 {
        return Err(Error::LengthMismatch {
            opcode,
            expected: 2,
            actual: resp.len(),
        });
    }
    match resp[..2].iter().find(|&&b| b != 0) {
        Some(&status) => Err(Error::DeviceError { opcode, status }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_key_layout() {
        let uid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let key = checksum_key(&uid, 0x59);
        assert_eq!(&key[..7], &[36; 7]);
        assert_eq!(key[7], 36 + 0x59);
    }

    #[test]
    fn checksum_key_wraps() {
        let key = checksum_key(&[0xff; 8], 0x80);
        // 8 * 0xff = 0x7f8
        assert_eq!(key[0], 0xf8);
        assert_eq!(key[7], 0x78);
    }

    #[test]
    fn checksum_key_holds_for_many_uids() {
        for seed in 0u8..=255 {
            let uid = [seed, seed.wrapping_mul(3), 7, seed ^ 0x55, 0, 0xff, seed, 1];
            let sum = uid.iter().map(|&b| b as u32).sum::<u32>() % 256;
            let key = checksum_key(&uid, seed);
            assert!(key[..7].iter().all(|&k| k as u32 == sum));
            assert_eq!(key[7] as u32, (sum + seed as u32) % 256);
        }
    }

    #[test]
    fn ack_expectations() {
        let key = [1, 1, 1, 1, 1, 1, 1, 3];
        assert_eq!(expected_ack(&key, BootloaderVersion::new(2, 6), 0x11), 10);
        assert_eq!(expected_ack(&key, BootloaderVersion::new(2, 7), 0x11), 0);
        assert_eq!(expected_ack(&key, BootloaderVersion::new(3, 0), 0x19), 0);
        assert_eq!(expected_ack(&key, BootloaderVersion::new(1, 0), 0x10), 0);
    }

    #[test]
    fn challenge_key_picks_fixed_indices() {
        let challenge: Vec<u8> = (1..=30).collect();
        let uid = [0u8; 8];
        let key = challenge_key(&uid, 0x10, &challenge).unwrap();
        // len 30: indices 16, 6, 4, 24, 12, 18, 20
        assert_eq!(&key[..7], &[17, 7, 5, 25, 13, 19, 21]);
        assert_eq!(key[7], 0x10 + 17);
    }

    #[test]
    fn challenge_key_rejects_bad_challenges() {
        let uid = [0u8; 8];
        assert!(matches!(
            challenge_key(&uid, 0, &[1; 28]),
            Err(Error::InvalidChallenge(_))
        ));
        assert!(matches!(
            challenge_key(&uid, 0, &[0; 30]),
            Err(Error::InvalidChallenge(_))
        ));
        assert!(challenge_key(&uid, 0, &[1; 29]).is_ok());
    }

    #[test]
    fn random_challenge_has_no_zero_bytes() {
        let KeyDerivation::Challenge(c) = KeyDerivation::select(KeyMode::Challenge) else {
            panic!("expected challenge strategy");
        };
        assert_eq!(c.len(), KEY_SEED_LEN);
        assert!(c.iter().all(|&b| b != 0));
    }

    #[test]
    fn config_blocks_in_ascending_bit_order() {
        let mut data = vec![0xa5, 0x5a, 0xff, 0x00];
        data.extend_from_slice(&[0, 2, 9, 0]);
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let blocks = ConfigBlocks::parse(
            config_mask::RDPR_USER | config_mask::BTVER | config_mask::UID,
            &data,
        )
        .unwrap();
        assert_eq!(blocks.words, [Some(0x00ff5aa5), None, None]);
        assert_eq!(blocks.bootloader_version, Some(BootloaderVersion::new(2, 9)));
        assert_eq!(blocks.uid, Some([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn short_config_block_is_an_error() {
        assert!(matches!(
            ConfigBlocks::parse(config_mask::UID, &[1, 2, 3]),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn version_ordering_and_packing() {
        assert!(BootloaderVersion::new(2, 10) > ZERO_ACK_VERSION);
        assert!(BootloaderVersion::new(1, 99) < ZERO_ACK_VERSION);
        assert_eq!(BootloaderVersion::new(2, 7).packed(), 0x0207);
        assert_eq!(BootloaderVersion::new(2, 7).to_string(), "v2.7");
    }
}
