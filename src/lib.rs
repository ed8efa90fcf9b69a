//! WCH ISP Protocol implementation.

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod option_bytes;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::config::Config;
pub use self::device::{Chip, ChipDB, Family, Geometry};
pub use self::error::{Error, Result};
pub use self::flashing::{CancelToken, Flashing};
pub use self::format::FlashImage;
pub use self::option_bytes::OptionBytes;
pub use self::protocol::Command;
pub use self::session::{KeyMode, Session};
pub use self::transport::Transport;
