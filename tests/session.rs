mod common;

use common::MockDevice;
use wch_isp::constants::commands;
use wch_isp::protocol::Command;
use wch_isp::session::{BootloaderVersion, KeyDerivation, SessionState};
use wch_isp::{ChipDB, Error, Session};

#[test]
fn identify_and_resolve_ch559() {
    let db = ChipDB::load().unwrap();
    let mut dev = MockDevice::ch559();
    let mut session = Session::new(&mut dev);

    assert_eq!(session.identify().unwrap(), (0x59, 0x11));
    assert_eq!(session.state(), SessionState::Identified);

    let resolved = db.resolve(session.device_type(), session.chip_id());
    assert_eq!(resolved.name(), "CH559");
    let geometry = resolved.geometry(None);
    assert_eq!(geometry.flash_size, Some(60 * 1024));
    assert_eq!(geometry.eeprom_size, 1024);
}

#[test]
fn zero_identify_means_no_device() {
    let mut dev = MockDevice::new(0, 0);
    let mut session = Session::new(&mut dev);
    assert!(matches!(session.identify(), Err(Error::NoDevice)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn reads_uid_and_bootloader_version() {
    let mut dev = MockDevice::ch559();
    dev.btver = (2, 6);
    let uid = dev.uid;
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();

    assert_eq!(session.read_btver().unwrap(), BootloaderVersion::new(2, 6));
    assert_eq!(session.read_uid().unwrap(), uid);
    assert_eq!(session.uid_string(), "11-22-33-44-55-66-77-88");
}

#[test]
fn config_mask_mismatch_is_fatal() {
    let mut dev = MockDevice::ch559();
    dev.corrupt_next_mask = true;
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();

    let err = session.read_option_words().unwrap_err();
    assert!(matches!(
        err,
        Error::ConfigMaskMismatch {
            expected: 0x07,
            actual: 0x17
        }
    ));
    // next read is fine again
    assert_eq!(session.read_option_words().unwrap()[0], 0x00ff_5aa5);
}

#[test]
fn checksum_key_with_legacy_ack() {
    let mut dev = MockDevice::ch559();
    dev.btver = (2, 4);
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.read_btver().unwrap();
    session.read_uid().unwrap();

    let key = session.establish_key(&KeyDerivation::Checksum).unwrap();
    // UID sum 0x11 + .. + 0x88 = 0x264
    assert_eq!(&key[..7], &[0x64; 7]);
    assert_eq!(key[7], 0x64u8.wrapping_add(0x59));
    assert_eq!(session.state(), SessionState::KeyEstablished);

    let seed = dev.requests_with(commands::ISP_KEY)[0].to_vec();
    assert_eq!(seed, vec![0u8; 30]);
}

#[test]
fn wrong_ack_fails_the_handshake() {
    let mut dev = MockDevice::ch559();
    dev.key_ack_override = Some(0x42);
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.read_btver().unwrap();
    session.read_uid().unwrap();

    let err = session.establish_key(&KeyDerivation::Checksum).unwrap_err();
    assert!(matches!(
        err,
        Error::KeyHandshakeFailed {
            expected: 0,
            actual: 0x42
        }
    ));
    assert_eq!(session.state(), SessionState::Identified);
}

#[test]
fn ch56x_acks_zero_on_old_bootloaders() {
    let mut dev = MockDevice::new(0x10, 0x69);
    dev.btver = (1, 1);
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.read_btver().unwrap();
    session.read_uid().unwrap();
    assert!(session.establish_key(&KeyDerivation::Checksum).is_ok());
}

#[test]
fn challenge_ack_is_not_checked() {
    let mut dev = MockDevice::ch559();
    dev.key_ack_override = Some(0x99);
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.read_uid().unwrap();

    let challenge: Vec<u8> = (1..=30).collect();
    let key = session
        .establish_key(&KeyDerivation::Challenge(challenge.clone()))
        .unwrap();
    assert_eq!(session.xor_key(), &key);
    assert_eq!(dev.requests_with(commands::ISP_KEY)[0], &challenge[..]);
}

#[test]
fn keyed_commands_need_a_key() {
    let mut dev = MockDevice::ch559();
    let mut session = Session::new(&mut dev);
    assert!(matches!(
        session.transfer(Command::Identify),
        Err(Error::InvalidState { .. })
    ));
    session.identify().unwrap();
    assert!(matches!(
        session.transfer_keyed(Command::erase(1)),
        Err(Error::InvalidState {
            expected: SessionState::KeyEstablished,
            actual: SessionState::Identified
        })
    ));
    assert_eq!(dev.count(commands::ERASE), 0);
}

#[test]
fn end_with_reset_awaits_nothing() {
    let mut dev = MockDevice::ch559();
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.end(true).unwrap();
    assert_eq!(session.state(), SessionState::Ended);
    assert!(dev.closed);
    assert_eq!(dev.requests.last().unwrap(), &(commands::ISP_END, vec![1u8]));
}

#[test]
fn end_without_reset_reads_the_ack() {
    let mut dev = MockDevice::ch559();
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session.end(false).unwrap();
    assert_eq!(dev.requests.last().unwrap(), &(commands::ISP_END, vec![0u8]));
}

#[test]
fn write_option_words_little_endian() {
    let mut dev = MockDevice::ch559();
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    session
        .write_option_words(&[0x00ff_5aa5, 0x1234_5678, 0xffff_fff0])
        .unwrap();
    let payload = dev.requests_with(commands::WRITE_CONFIG)[0].to_vec();
    assert_eq!(&payload[..6], &[0x07, 0x00, 0xa5, 0x5a, 0xff, 0x00]);
    assert_eq!(dev.config_words, [0x00ff_5aa5, 0x1234_5678, 0xffff_fff0]);
}

#[test]
fn end_rejects_a_short_ack() {
    let mut dev = MockDevice::ch559();
    dev.end_reply = vec![0x55];
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    assert!(matches!(
        session.end(false),
        Err(Error::LengthMismatch {
            expected: 2,
            actual: 1,
            ..
        })
    ));
    assert_eq!(session.state(), SessionState::Ended);
    assert!(dev.closed);
}

#[test]
fn end_rejects_a_non_zero_ack() {
    let mut dev = MockDevice::ch559();
    dev.end_reply = vec![0x00, 0x01];
    let mut session = Session::new(&mut dev);
    session.identify().unwrap();
    assert!(matches!(
        session.end(false),
        Err(Error::DeviceError {
            opcode: commands::ISP_END,
            status: 0x01
        })
    ));
}
