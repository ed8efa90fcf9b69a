use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use signal_hook::consts::signal;

use wch_isp::flashing::ProgressFn;
use wch_isp::session::Session;
use wch_isp::transport::{Baudrate, SerialTransport, UsbTransport};
use wch_isp::{CancelToken, ChipDB, Config, FlashImage, Flashing, KeyMode, Transport};

#[derive(Parser)]
#[command(
    name = "wch-isp",
    version,
    about = "In-system programming tool for WCH microcontroller bootloaders"
)]
struct Cli {
    /// Turn debugging information on
    #[arg(long, short = 'v', global = true)]
    debug: bool,

    /// Log every frame and internal step
    #[arg(long, global = true)]
    trace: bool,

    /// Use the serial transport instead of USB
    #[arg(long, short, global = true)]
    serial: bool,

    /// Serial port, the first available one when omitted
    #[arg(long, short, global = true, requires = "serial")]
    port: Option<String>,

    /// Serial speed to switch to after connecting
    #[arg(long, short, global = true, value_enum, default_value_t)]
    baudrate: Baudrate,

    /// Enter the bootloader by strapping BOOT0 (RTS) and RESET (DTR)
    #[arg(long, global = true, requires = "serial")]
    strap: bool,

    /// Index of the device to use, see `list`
    #[arg(long, short = 'd', global = true, default_value_t = 0)]
    device: usize,

    /// Select the device by UID, `aa-bb-cc-...`
    #[arg(long, global = true, conflicts_with = "device")]
    uid: Option<String>,

    /// Reset the chip when done
    #[arg(long, short, global = true)]
    reset: bool,

    /// Show a progress bar while erasing, writing and verifying
    #[arg(long, global = true)]
    progress: bool,

    /// Directory with extra device description files
    #[arg(long, global = true)]
    devices: Option<PathBuf>,

    /// ISP key derivation scheme
    #[arg(long, global = true, value_enum, default_value = "auto")]
    key_mode: KeyMode,

    /// Refuse to flash chips whose flash size is unknown
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get info about current connected chip
    Info,
    /// List connected bootloaders
    List,
    /// Reset the target connected
    Reset,
    /// Erase the whole code flash
    Erase,
    /// Download to code flash
    #[command(alias = "write")]
    Flash {
        /// Binary or Intel HEX firmware
        path: PathBuf,
        /// Skip verification after writing
        #[arg(long)]
        no_verify: bool,
    },
    /// Verify flash content
    Verify {
        path: PathBuf,
    },
    /// Show or change the option bytes
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Remove code flash read protection
    #[command(alias = "remove-wp")]
    Unprotect,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Decode the current option bytes
    Show,
    /// Apply `NAME=value` assignments and write them back
    Set {
        /// e.g. "RDPR=0xa5, IWDG_SW=1"
        assignments: String,
    },
}

fn init_logger(cli: &Cli) {
    let level = if cli.trace {
        simplelog::LevelFilter::Trace
    } else if cli.debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
}

fn load_database(dir: Option<&Path>) -> Result<Arc<ChipDB>> {
    let db = match dir {
        Some(dir) => ChipDB::load_with_dir(dir)?,
        None => ChipDB::load()?,
    };
    Ok(Arc::new(db))
}

fn device_count(cli: &Cli) -> Result<usize> {
    if !cli.serial {
        return Ok(UsbTransport::scan_devices()?);
    }
    if cli.port.is_some() {
        return Ok(1);
    }
    Ok(SerialTransport::scan_ports()?.len())
}

fn open_serial(cli: &Cli, index: usize) -> Result<SerialTransport> {
    let mut transport = match &cli.port {
        Some(port) => SerialTransport::open(port)?,
        None => SerialTransport::open_nth(index)?,
    };
    if cli.strap {
        transport.enter_bootloader()?;
    }
    Ok(transport)
}

/// Open the link, switching serial speed through SET_BAUD when asked.
fn open_transport(cli: &Cli, index: usize) -> Result<Box<dyn Transport>> {
    if !cli.serial {
        return Ok(Box::new(UsbTransport::open_nth(index)?));
    }
    let mut transport = open_serial(cli, index)?;
    if cli.baudrate != Baudrate::default() {
        let mut session = Session::new(&mut transport);
        session.identify()?;
        session.set_baud(cli.baudrate.into())?;
        transport.set_baudrate(cli.baudrate)?;
        log::info!("Switched serial link to {} baud", cli.baudrate);
    }
    Ok(Box::new(transport))
}

/// Identify the bootloader at `index` without establishing a key.
fn probe(cli: &Cli, index: usize) -> Result<Session<Box<dyn Transport>>> {
    let transport: Box<dyn Transport> = if cli.serial {
        Box::new(open_serial(cli, index)?)
    } else {
        Box::new(UsbTransport::open_nth(index)?)
    };
    let mut session = Session::new(transport);
    session.identify()?;
    session.read_btver()?;
    session.read_uid()?;
    Ok(session)
}

fn find_by_uid(cli: &Cli, uid: &str) -> Result<usize> {
    for index in 0..device_count(cli)? {
        match probe(cli, index) {
            Ok(session) if session.uid_string().eq_ignore_ascii_case(uid) => return Ok(index),
            Ok(_) => (),
            Err(e) => log::debug!("device #{}: {}", index, e),
        }
    }
    anyhow::bail!("no device with UID {}", uid)
}

fn list_devices(cli: &Cli, db: &ChipDB) -> Result<()> {
    let count = device_count(cli)?;
    if count == 0 {
        log::warn!("No WCH ISP device found");
    }
    for index in 0..count {
        match probe(cli, index) {
            Ok(session) => {
                let chip = db.resolve(session.device_type(), session.chip_id());
                println!(
                    "#{} bootloader {} uid {} [0x{:02x} 0x{:02x}] {}",
                    index,
                    session.bootloader_version(),
                    session.uid_string(),
                    session.device_type(),
                    session.chip_id(),
                    chip.name()
                );
            }
            Err(e) => log::warn!("#{}: {}", index, e),
        }
    }
    Ok(())
}

fn progress_bar() -> Result<ProgressFn> {
    let style = ProgressStyle::with_template("{msg:>7} [{bar:40}] {pos}/{len}")?.progress_chars("##-");
    let mut current: Option<(String, ProgressBar)> = None;
    Ok(Box::new(move |action: &str, done: usize, total: usize| {
        if current.as_ref().is_none_or(|(name, _)| name != action) {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            let bar = ProgressBar::new(total as u64).with_style(style.clone());
            bar.set_message(action.to_string());
            current = Some((action.to_string(), bar));
        }
        if let Some((_, bar)) = current.as_ref() {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
            if done >= total {
                bar.finish();
            }
        }
    }))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logger(&cli);

    let db = load_database(cli.devices.as_deref())?;

    if let Commands::List = cli.command {
        list_devices(&cli, &db)?;
        return Ok(ExitCode::SUCCESS);
    }

    let index = match &cli.uid {
        Some(uid) => find_by_uid(&cli, uid)?,
        None => cli.device,
    };

    let config = Config {
        verify_after_write: !matches!(cli.command, Commands::Flash { no_verify: true, .. }),
        reset_on_finish: cli.reset,
        key_mode: cli.key_mode,
        strict_geometry: cli.strict,
        ..Config::default()
    };

    let transport = open_transport(&cli, index)?;
    let mut flashing = Flashing::new(transport, db, config).context("connecting to bootloader")?;
    if cli.progress {
        flashing.set_progress(progress_bar()?);
    }

    // First Ctrl-C stops at the next chunk, a second one exits.
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_default(signal::SIGINT, interrupted.clone())?;
    signal_hook::flag::register(signal::SIGINT, interrupted.clone())?;
    flashing.set_cancel_token(CancelToken::from_flag(interrupted));

    match &cli.command {
        Commands::List => unreachable!("handled before connecting"),
        Commands::Info => {
            print!("{}", flashing.dump_info());
        }
        Commands::Reset => {
            flashing.reset()?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Erase => {
            let sectors = flashing.erase_all()?;
            log::info!("Erased {} sectors", sectors);
        }
        Commands::Flash { path, .. } => {
            let image = FlashImage::load(path)?;
            log::info!("Firmware size: {}", image.len());
            flashing.flash(&image)?;
        }
        Commands::Verify { path } => {
            let image = FlashImage::load(path)?;
            log::info!("Firmware size: {}", image.len());
            flashing.verify_image(&image)?;
            log::info!("Verified!");
        }
        Commands::Config { command } => match command {
            None | Some(ConfigCommands::Show) => {
                print!("{}", flashing.config_report()?);
            }
            Some(ConfigCommands::Set { assignments }) => {
                flashing.read_option_bytes()?;
                flashing.modify_option_bytes(assignments)?;
                flashing.write_option_bytes()?;
                print!("{}", flashing.config_report()?);
            }
        },
        Commands::Unprotect => {
            if flashing.unprotect()? {
                // new option bytes are loaded on reset
                flashing.reset()?;
                return Ok(ExitCode::SUCCESS);
            }
        }
    }

    let warnings = flashing.warnings();
    flashing.finish()?;

    if warnings.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        for warning in warnings.iter() {
            log::warn!("{}", warning);
        }
        Ok(ExitCode::from(2))
    }
}
