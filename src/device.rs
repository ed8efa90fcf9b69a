//! MCU chip database, with chip-specific or chip-family-specific geometry
//! and option byte layouts.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{DEFAULT_SECTOR_SIZE, OPTION_WORDS};
use crate::error::{Error, Result};
use crate::option_bytes::{Bitfield, OptionBytes, Register};

/// Built-in device documents, searched after any user supplied ones.
const BUILTIN_DEVICES: &[(&str, &str)] = &[
    ("0x10-CH56x.yaml", include_str!("../devices/0x10-CH56x.yaml")),
    ("0x11-CH55x.yaml", include_str!("../devices/0x11-CH55x.yaml")),
    ("0x14-CH32F103.yaml", include_str!("../devices/0x14-CH32F103.yaml")),
    ("0x15-CH32V103.yaml", include_str!("../devices/0x15-CH32V103.yaml")),
    ("0x17-CH32V30x.yaml", include_str!("../devices/0x17-CH32V30x.yaml")),
    ("0x19-CH32V20x.yaml", include_str!("../devices/0x19-CH32V20x.yaml")),
];

/// A number in a device document, either a YAML integer or a string such
/// as `0x1F`, `0b10` or `60K`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(u64),
    Text(String),
}

impl Scalar {
    pub fn to_u64(&self) -> Result<u64> {
        match self {
            Scalar::Int(n) => Ok(*n),
            Scalar::Text(s) => {
                parse_size(s).ok_or_else(|| Error::database(format!("invalid number {:?}", s)))
            }
        }
    }

    fn to_u32(&self) -> Result<u32> {
        let n = self.to_u64()?;
        u32::try_from(n).map_err(|_| Error::database(format!("{} does not fit in 32 bits", n)))
    }
}

/// Decimal, `0x` hex or `0b` binary.
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse().ok()
    }
}

/// A number with an optional `K`/`KB`/`KiB` or `M`/`MB`/`MiB` suffix.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    for (suffix, unit) in [
        ("KiB", 1024),
        ("KB", 1024),
        ("K", 1024),
        ("MiB", 1024 * 1024),
        ("MB", 1024 * 1024),
        ("M", 1024 * 1024),
    ] {
        if let Some(n) = s.strip_suffix(suffix) {
            return parse_number(n)?.checked_mul(unit);
        }
    }
    parse_number(s)
}

fn de_u8<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let n = Scalar::deserialize(deserializer)?
        .to_u64()
        .map_err(D::Error::custom)?;
    u8::try_from(n).map_err(|_| D::Error::custom(format!("{} does not fit in a byte", n)))
}

fn de_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    Scalar::deserialize(deserializer)?
        .to_u32()
        .map_err(D::Error::custom)
}

const fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

/// Family specific interpretation of the raw config words when no
/// register schema is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigDecoder {
    #[default]
    Generic,
    Ch56x,
}

/// Nominal flash size of a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Scalar")]
pub enum FlashSize {
    Fixed(u32),
    /// Known only after reading the config register named by the family's
    /// `flash_config`.
    FromConfig,
}

impl TryFrom<Scalar> for FlashSize {
    type Error = Error;

    fn try_from(value: Scalar) -> Result<Self> {
        match value {
            Scalar::Text(ref s) if s.eq_ignore_ascii_case("auto") => Ok(FlashSize::FromConfig),
            other => Ok(FlashSize::Fixed(other.to_u32()?)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MemorySplit {
    #[serde(deserialize_with = "de_size")]
    pub flash: u32,
    #[serde(deserialize_with = "de_size")]
    pub sram: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFlashConfig {
    offset: Scalar,
    bit_range: [u8; 2],
    sizes: Vec<MemorySplit>,
}

/// Flash/SRAM split selected by a config register field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFlashConfig")]
pub struct FlashConfig {
    pub offset: u8,
    pub field: Bitfield,
    pub sizes: Vec<MemorySplit>,
}

impl TryFrom<RawFlashConfig> for FlashConfig {
    type Error = Error;

    fn try_from(raw: RawFlashConfig) -> Result<Self> {
        let offset = raw.offset.to_u64()?;
        let offset = u8::try_from(offset)
            .map_err(|_| Error::database(format!("flash_config offset {} too large", offset)))?;
        let [a, b] = raw.bit_range;
        Ok(FlashConfig {
            offset,
            field: Bitfield::new("flash_config", a, b)?,
            sizes: raw.sizes,
        })
    }
}

impl FlashConfig {
    /// The split selected by the imported config words.
    pub fn lookup(&self, option_words: &[u32]) -> Option<MemorySplit> {
        let word = option_words.get(self.offset as usize / 4)?;
        let index = self.field.value(*word) as usize;
        self.sizes.get(index).copied()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RegisterSet {
    /// Name of an entry in the family's `register_sets`.
    Named(String),
    Inline(Vec<Register>),
}

/// Represents an MCU chip
#[derive(Debug, Clone, Deserialize)]
pub struct Chip {
    /// Chip's name, without variants surfix
    pub name: String,
    #[serde(deserialize_with = "de_u8")]
    pub chip_id: u8,
    pub flash_size: FlashSize,
    #[serde(default, deserialize_with = "de_size")]
    pub eeprom_size: u32,
    #[serde(default, deserialize_with = "de_size")]
    pub eeprom_start_addr: u32,
    #[serde(default)]
    config_registers: Option<RegisterSet>,
}

/// MCU Family
#[derive(Debug, Clone, Deserialize)]
pub struct Family {
    pub name: String,
    #[serde(deserialize_with = "de_u8")]
    pub device_type: u8,
    #[serde(default = "default_sector_size", deserialize_with = "de_size")]
    pub sector_size: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_decoder: ConfigDecoder,
    #[serde(default)]
    pub flash_config: Option<FlashConfig>,
    #[serde(default)]
    config_registers: Option<Vec<Register>>,
    #[serde(default)]
    register_sets: BTreeMap<String, Vec<Register>>,
    pub variants: Vec<Chip>,
}

impl Family {
    pub fn from_yaml(doc: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(doc)?)
    }

    /// First variant with `chip_id`, duplicates later in the list are aliases.
    pub fn find_chip(&self, chip_id: u8) -> Option<&Chip> {
        self.variants.iter().find(|c| c.chip_id == chip_id)
    }

    fn registers_for<'a>(&'a self, chip: Option<&'a Chip>) -> Result<Option<&'a [Register]>> {
        match chip.and_then(|c| c.config_registers.as_ref()) {
            Some(RegisterSet::Inline(regs)) => Ok(Some(regs.as_slice())),
            Some(RegisterSet::Named(name)) => self
                .register_sets
                .get(name)
                .map(|regs| Some(regs.as_slice()))
                .ok_or_else(|| {
                    Error::database(format!(
                        "{}: unknown register set `{}`",
                        self.name, name
                    ))
                }),
            None => Ok(self.config_registers.as_deref()),
        }
    }

    /// A fresh option byte model for `chip`, `None` without a schema.
    pub fn option_bytes(&self, chip: Option<&Chip>) -> Result<Option<OptionBytes>> {
        self.registers_for(chip)?
            .map(|regs| OptionBytes::new(regs.to_vec()))
            .transpose()
    }

    fn check_schema(&self, chip: Option<&Chip>) -> Result<()> {
        let Some(ob) = self.option_bytes(chip)? else {
            return Ok(());
        };
        if ob.word_count() > OPTION_WORDS {
            return Err(Error::database(format!(
                "{}: option registers span {} words, the device exchanges {}",
                self.name,
                ob.word_count(),
                OPTION_WORDS
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sector_size == 0 {
            return Err(Error::database(format!("{}: sector_size must not be 0", self.name)));
        }
        self.check_schema(None)?;
        for chip in self.variants.iter() {
            self.check_schema(Some(chip))?;
            if chip.flash_size == FlashSize::FromConfig && self.flash_config.is_none() {
                return Err(Error::database(format!(
                    "{}: flash size of {} derives from config but the family has no flash_config",
                    self.name, chip.name
                )));
            }
        }
        Ok(())
    }
}

/// Memory layout of a resolved chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    /// `None` when the chip is unknown or its size could not be derived.
    pub flash_size: Option<u32>,
    pub eeprom_size: u32,
    pub eeprom_start_addr: u32,
    /// Informational only.
    pub sram_size: Option<u32>,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            sector_size: DEFAULT_SECTOR_SIZE,
            flash_size: None,
            eeprom_size: 0,
            eeprom_start_addr: 0,
            sram_size: None,
        }
    }
}

impl Geometry {
    /// Sectors covering the whole flash.
    pub fn flash_sectors(&self) -> Option<u32> {
        self.flash_size.map(|size| size / self.sector_size)
    }
}

/// Result of a database lookup. Either part may be missing.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub device_type: u8,
    pub chip_id: u8,
    pub family: Option<&'a Family>,
    pub chip: Option<&'a Chip>,
}

impl Resolved<'_> {
    pub fn is_known(&self) -> bool {
        self.chip.is_some()
    }

    pub fn name(&self) -> String {
        match (self.family, self.chip) {
            (_, Some(chip)) => chip.name.clone(),
            (Some(family), None) => format!("unknown {}", family.name),
            (None, None) => "unknown".to_string(),
        }
    }

    pub fn config_decoder(&self) -> ConfigDecoder {
        self.family.map(|f| f.config_decoder).unwrap_or_default()
    }

    /// True when the flash size depends on config words.
    pub fn needs_option_words(&self) -> bool {
        self.chip.map(|c| c.flash_size) == Some(FlashSize::FromConfig)
    }

    pub fn option_bytes(&self) -> Result<Option<OptionBytes>> {
        match self.family {
            Some(family) => family.option_bytes(self.chip),
            None => Ok(None),
        }
    }

    /// Geometry, using `option_words` to size parts that need it.
    pub fn geometry(&self, option_words: Option<&[u32]>) -> Geometry {
        let mut geometry = Geometry::default();
        if let Some(family) = self.family {
            geometry.sector_size = family.sector_size;
        }
        let Some(chip) = self.chip else {
            return geometry;
        };
        geometry.eeprom_size = chip.eeprom_size;
        geometry.eeprom_start_addr = chip.eeprom_start_addr;
        match chip.flash_size {
            FlashSize::Fixed(size) => geometry.flash_size = Some(size),
            FlashSize::FromConfig => {
                let split = self
                    .family
                    .and_then(|f| f.flash_config.as_ref())
                    .zip(option_words)
                    .and_then(|(config, words)| config.lookup(words));
                if let Some(split) = split {
                    log::debug!(
                        "flash/sram split from config: {}K/{}K",
                        split.flash / 1024,
                        split.sram / 1024
                    );
                    geometry.flash_size = Some(split.flash);
                    geometry.sram_size = Some(split.sram);
                }
            }
        }
        geometry
    }
}

impl fmt::Display for Resolved<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:02x}{:02x})",
            self.name(),
            self.chip_id,
            self.device_type
        )
    }
}

/// All known families, searched in order.
#[derive(Debug, Clone, Default)]
pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        let families = BUILTIN_DEVICES
            .iter()
            .map(|(name, doc)| {
                Family::from_yaml(doc).map_err(|e| Error::database(format!("{}: {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_families(families)
    }

    /// Built-ins plus every `*.yaml`/`*.yml` below `dir`. User documents
    /// are searched first so they can shadow built-in records.
    pub fn load_with_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut paths = Vec::new();
        collect_documents(dir.as_ref(), &mut paths)?;
        paths.sort();

        let mut families = Vec::with_capacity(paths.len() + BUILTIN_DEVICES.len());
        for path in paths.iter() {
            log::debug!("loading device document {}", path.display());
            let doc = std::fs::read_to_string(path)
                .map_err(|e| Error::database(format!("{}: {}", path.display(), e)))?;
            let family = Family::from_yaml(&doc)
                .map_err(|e| Error::database(format!("{}: {}", path.display(), e)))?;
            families.push(family);
        }
        families.extend(Self::load()?.families);
        Self::from_families(families)
    }

    pub fn from_families(families: Vec<Family>) -> Result<Self> {
        for family in families.iter() {
            family.validate()?;
        }
        Ok(ChipDB { families })
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    pub fn resolve(&self, device_type: u8, chip_id: u8) -> Resolved<'_> {
        let family = self.families.iter().find(|f| f.device_type == device_type);
        let chip = family.and_then(|f| f.find_chip(chip_id));
        match (family, chip) {
            (Some(family), Some(_)) => log::debug!("chip family: {}", family.name),
            (Some(family), None) => log::warn!(
                "chip id 0x{:02x} not found in family {}",
                chip_id,
                family.name
            ),
            (None, _) => log::warn!("unknown device type 0x{:02x}", device_type),
        }
        Resolved {
            device_type,
            chip_id,
            family,
            chip,
        }
    }
}

fn collect_documents(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::database(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| Error::database(format!("{}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            collect_documents(&path, out)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            out.push(path);
        }
    }
    Ok(())
}
