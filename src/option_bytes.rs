//! Option bytes: named config registers and their bitfields.
//!
//! The register image is a flat array of little-endian words as read with
//! READ_CONFIG; a register at byte `offset` lives in word `offset / 4`.
//! Registers start out at their reset value and only reflect the device
//! after [`OptionBytes::import`].

use std::fmt;

use serde::Deserialize;

use crate::constants::RDPR_UNPROTECTED;
use crate::device::{parse_number, Scalar};
use crate::error::{Error, Result};

/// Name looked up by [`OptionBytes::unlock`].
pub const READ_PROTECTION: &str = "RDPR";

/// Key of one entry in a field's `explaination` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKey {
    Value(u32),
    /// `_`, any value not listed.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVariant {
    pub key: VariantKey,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBitfield {
    name: String,
    #[serde(default)]
    description: String,
    bit_range: [u8; 2],
    #[serde(default, deserialize_with = "parse_variants")]
    explaination: Vec<FieldVariant>,
}

/// A named bit range `[high:low]` of a register, both ends inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBitfield")]
pub struct Bitfield {
    pub name: String,
    pub description: String,
    high: u8,
    low: u8,
    pub variants: Vec<FieldVariant>,
}

impl TryFrom<RawBitfield> for Bitfield {
    type Error = Error;

    fn try_from(raw: RawBitfield) -> Result<Self> {
        let [a, b] = raw.bit_range;
        let mut field = Bitfield::new(raw.name, a, b)?;
        field.description = raw.description;
        field.variants = raw.explaination;
        Ok(field)
    }
}

impl Bitfield {
    /// Bit indices may be given in either order.
    pub fn new(name: impl Into<String>, high: u8, low: u8) -> Result<Self> {
        let name = name.into();
        let (high, low) = if low > high { (low, high) } else { (high, low) };
        if high > 31 {
            return Err(Error::database(format!(
                "field `{}` bit {} is outside a 32-bit register",
                name, high
            )));
        }
        Ok(Bitfield {
            name,
            description: String::new(),
            high,
            low,
            variants: Vec::new(),
        })
    }

    pub fn high(&self) -> u8 {
        self.high
    }

    pub fn low(&self) -> u8 {
        self.low
    }

    pub fn width(&self) -> u32 {
        (self.high - self.low) as u32 + 1
    }

    /// Mask of `width()` low bits.
    pub fn mask(&self) -> u32 {
        u32::MAX >> (32 - self.width())
    }

    fn register_mask(&self) -> u32 {
        self.mask() << self.low
    }

    fn overlaps(&self, other: &Bitfield) -> bool {
        self.register_mask() & other.register_mask() != 0
    }

    /// `(regval >> low) & mask`
    pub fn value(&self, regval: u32) -> u32 {
        (regval >> self.low) & self.mask()
    }

    /// Replace this field's bits in `regval` with `newval`.
    ///
    /// Returns the new register value and whether `newval` had to be truncated.
    pub fn apply(&self, regval: u32, newval: u32) -> (u32, bool) {
        let masked = newval & self.mask();
        let cleared = regval & !self.register_mask();
        (cleared | (masked << self.low), masked != newval)
    }

    pub fn label(&self, value: u32) -> Option<&str> {
        self.variants
            .iter()
            .find(|v| v.key == VariantKey::Value(value))
            .or_else(|| self.variants.iter().find(|v| v.key == VariantKey::Other))
            .map(|v| v.label.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawRegister {
    offset: Scalar,
    name: String,
    #[serde(default)]
    description: String,
    reset: Option<Scalar>,
    #[serde(default)]
    fields: Vec<Bitfield>,
}

/// One 32-bit config register.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRegister")]
pub struct Register {
    pub offset: u8,
    pub name: String,
    pub description: String,
    pub default_value: u32,
    pub current_value: u32,
    pub fields: Vec<Bitfield>,
}

impl TryFrom<RawRegister> for Register {
    type Error = Error;

    fn try_from(raw: RawRegister) -> Result<Self> {
        let offset = raw.offset.to_u64()?;
        let offset = u8::try_from(offset)
            .map_err(|_| Error::database(format!("register offset {} too large", offset)))?;
        let default_value = match raw.reset {
            Some(reset) => u32::try_from(reset.to_u64()?)
                .map_err(|_| Error::database(format!("reset value of `{}` too large", raw.name)))?,
            None => 0xffff_ffff,
        };
        let mut register = Register::new(offset, raw.name, default_value);
        register.description = raw.description;
        register.fields = raw.fields;
        Ok(register)
    }
}

impl Register {
    pub fn new(offset: u8, name: impl Into<String>, default_value: u32) -> Self {
        Register {
            offset,
            name: name.into(),
            description: String::new(),
            default_value,
            current_value: default_value,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Bitfield) -> Self {
        self.fields.push(field);
        self
    }

    /// Index of this register in the word image.
    pub fn word_index(&self) -> usize {
        self.offset as usize / 4
    }

    pub fn field(&self, name: &str) -> Option<&Bitfield> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// A truncated assignment, kept so the caller can report a warning status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub field: String,
    pub requested: u32,
    pub applied: u32,
}

impl From<&Truncation> for Error {
    fn from(t: &Truncation) -> Self {
        Error::FieldTruncated {
            field: t.field.clone(),
            requested: t.requested,
            applied: t.applied,
        }
    }
}

/// Where a name resolved to: a whole register or one of its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Register(usize),
    Field(usize, usize),
}

/// Register schema of one device plus its runtime values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionBytes {
    registers: Vec<Register>,
    /// `current_value`s come from the device.
    imported: bool,
    /// `current_value`s were edited.
    modified: bool,
    truncations: Vec<Truncation>,
}

impl OptionBytes {
    /// Build a schema, rejecting overlapping fields within a register.
    pub fn new(mut registers: Vec<Register>) -> Result<Self> {
        for reg in registers.iter_mut() {
            reg.current_value = reg.default_value;
            for (i, a) in reg.fields.iter().enumerate() {
                if let Some(b) = reg.fields[i + 1..].iter().find(|b| a.overlaps(b)) {
                    return Err(Error::database(format!(
                        "fields `{}` and `{}` of `{}` overlap",
                        a.name, b.name, reg.name
                    )));
                }
            }
        }
        Ok(OptionBytes {
            registers,
            ..Default::default()
        })
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// Number of words an image must hold to cover every register.
    pub fn word_count(&self) -> usize {
        self.registers
            .iter()
            .map(|r| r.word_index() + 1)
            .max()
            .unwrap_or(0)
    }

    fn check_image_len(&self, len: usize) -> Result<()> {
        if let Some(reg) = self.registers.iter().find(|r| r.word_index() >= len) {
            return Err(Error::database(format!(
                "register `{}` at offset 0x{:02x} is outside a {}-word image",
                reg.name, reg.offset, len
            )));
        }
        Ok(())
    }

    /// Take every register's current value from `raw_words`.
    pub fn import(&mut self, raw_words: &[u32]) -> Result<()> {
        self.check_image_len(raw_words.len())?;
        for reg in self.registers.iter_mut() {
            reg.current_value = raw_words[reg.word_index()];
        }
        self.imported = true;
        self.modified = false;
        Ok(())
    }

    /// Write registers into `raw_words`. Untouched words keep their content.
    ///
    /// Before any import or modification the reset values are written.
    pub fn export(&self, raw_words: &mut [u32]) -> Result<()> {
        self.check_image_len(raw_words.len())?;
        let live = self.imported || self.modified;
        for reg in self.registers.iter() {
            raw_words[reg.word_index()] = if live {
                reg.current_value
            } else {
                reg.default_value
            };
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<Target> {
        if let Some(r) = self
            .registers
            .iter()
            .position(|r| r.name.eq_ignore_ascii_case(name))
        {
            return Some(Target::Register(r));
        }
        self.registers.iter().enumerate().find_map(|(r, reg)| {
            reg.fields
                .iter()
                .position(|f| f.name.eq_ignore_ascii_case(name))
                .map(|f| Target::Field(r, f))
        })
    }

    /// Current value of a register or field.
    pub fn value_of(&self, name: &str) -> Option<u32> {
        match self.resolve(name)? {
            Target::Register(r) => Some(self.registers[r].current_value),
            Target::Field(r, f) => {
                let reg = &self.registers[r];
                Some(reg.fields[f].value(reg.current_value))
            }
        }
    }

    /// Set one register or field by name.
    pub fn assign(&mut self, name: &str, value: u32) -> Result<()> {
        let target = self
            .resolve(name)
            .ok_or_else(|| Error::UnknownFieldName(name.to_string()))?;
        match target {
            Target::Register(r) => self.registers[r].current_value = value,
            Target::Field(r, f) => {
                let reg = &mut self.registers[r];
                let field = &reg.fields[f];
                let (regval, truncated) = field.apply(reg.current_value, value);
                if truncated {
                    let t = Truncation {
                        field: field.name.clone(),
                        requested: value,
                        applied: value & field.mask(),
                    };
                    log::warn!("{}", Error::from(&t));
                    self.truncations.push(t);
                }
                reg.current_value = regval;
            }
        }
        self.modified = true;
        Ok(())
    }

    /// Apply `name=value` assignments separated by `,`, `;` or whitespace.
    ///
    /// Values are decimal, `0x` hex or `0b` binary. Names match registers
    /// first, then fields, ignoring case. Assignments are applied in order
    /// and an error leaves the earlier ones in place.
    pub fn modify(&mut self, assignments: &str) -> Result<()> {
        if !self.imported {
            log::warn!("modifying option bytes that were not read from the device");
        }
        let mut tokens = assignments
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty());
        let mut count = 0;

        while let Some(token) = tokens.next() {
            let (name, value) = match token.split_once('=') {
                Some((name, "")) => (name, tokens.next()),
                Some((name, value)) => (name, Some(value)),
                None => match tokens.next() {
                    Some("=") => (token, tokens.next()),
                    Some(next) => (token, Some(next.strip_prefix('=').unwrap_or(next))),
                    None => (token, None),
                },
            };
            if name.is_empty() {
                return Err(Error::invalid_assignment(format!("missing name in `{}`", token)));
            }
            let value = value
                .ok_or_else(|| Error::invalid_assignment(format!("missing value for `{}`", name)))?;
            let parsed = parse_number(value)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    Error::invalid_assignment(format!("bad value `{}` for `{}`", value, name))
                })?;
            self.assign(name, parsed)?;
            count += 1;
        }

        if count == 0 {
            return Err(Error::invalid_assignment("no assignments given"));
        }
        Ok(())
    }

    /// Clear read protection. Returns `false` when already unprotected.
    pub fn unlock(&mut self) -> Result<bool> {
        let current = self
            .value_of(READ_PROTECTION)
            .ok_or_else(|| Error::UnknownFieldName(READ_PROTECTION.to_string()))?;
        if current == RDPR_UNPROTECTED {
            return Ok(false);
        }
        self.modify(&format!("{}=0x{:x}", READ_PROTECTION, RDPR_UNPROTECTED))?;
        Ok(true)
    }

    pub fn truncations(&self) -> &[Truncation] {
        &self.truncations
    }

    /// Non-fatal problems recorded so far.
    pub fn warnings(&self) -> Vec<Error> {
        self.truncations.iter().map(Error::from).collect()
    }
}

impl fmt::Display for OptionBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reg in self.registers.iter() {
            write!(f, "0x{:02x} {} ; default = 0x{:08x}", reg.offset, reg.name, reg.default_value)?;
            if self.imported || self.modified {
                write!(f, ", current = 0x{:08x}", reg.current_value)?;
            }
            writeln!(f)?;
            for field in reg.fields.iter() {
                if field.high == field.low {
                    write!(f, "  [{}] {}", field.low, field.name)?;
                } else {
                    write!(f, "  [{}:{}] {}", field.high, field.low, field.name)?;
                }
                let default = field.value(reg.default_value);
                let value = if self.imported || self.modified {
                    field.value(reg.current_value)
                } else {
                    default
                };
                write!(f, " = 0x{:x}", value)?;
                if value != default {
                    write!(f, " (default 0x{:x})", default)?;
                }
                match field.label(value) {
                    Some(label) => writeln!(f, " => {}", label)?,
                    None => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

fn parse_variants<'de, D>(deserializer: D) -> std::result::Result<Vec<FieldVariant>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;

    let map = serde_yaml::Mapping::deserialize(deserializer)?;
    map.into_iter()
        .map(|(k, v)| {
            let key = match &k {
                serde_yaml::Value::Number(n) => n
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(VariantKey::Value),
                serde_yaml::Value::String(s) if s == "_" => Some(VariantKey::Other),
                serde_yaml::Value::String(s) => parse_number(s)
                    .and_then(|n| u32::try_from(n).ok())
                    .map(VariantKey::Value),
                serde_yaml::Value::Bool(b) => Some(VariantKey::Value(*b as u32)),
                _ => None,
            }
            .ok_or_else(|| D::Error::custom(format!("bad variant key {:?}", k)))?;
            let label = match v {
                serde_yaml::Value::String(s) => s,
                other => serde_yaml::to_string(&other)
                    .map_err(D::Error::custom)?
                    .trim()
                    .to_string(),
            };
            Ok(FieldVariant { key, label })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch32_schema() -> OptionBytes {
        OptionBytes::new(vec![
            Register::new(0x00, "RDPR_USER", 0x00ff_5aa5)
                .with_field(Bitfield::new("RDPR", 7, 0).unwrap())
                .with_field(Bitfield::new("nRDPR", 15, 8).unwrap())
                .with_field(Bitfield::new("IWDG_SW", 16, 16).unwrap())
                .with_field(Bitfield::new("SRAM_CODE_MODE", 23, 22).unwrap()),
            Register::new(0x04, "DATA", 0xff00_ff00),
            Register::new(0x08, "WRP", 0xffff_ffff)
                .with_field(Bitfield::new("WRP", 31, 0).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn modify_whole_register_then_export() {
        let mut ob = OptionBytes::new(vec![Register::new(0, "RDPR", 0)]).unwrap();
        ob.modify("RDPR=0xA5").unwrap();
        assert_eq!(ob.registers()[0].current_value, 0xa5);

        let mut words = [0u32; 1];
        ob.export(&mut words).unwrap();
        assert_eq!(words[0], 0xa5);
    }

    #[test]
    fn export_import_round_trip() {
        let mut ob = ch32_schema();
        let raw = [0x3fc0_5aa5, 0x1234_5678, 0x0000_00ff];
        ob.import(&raw).unwrap();
        let mut out = [0u32; 3];
        ob.export(&mut out).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn export_before_import_writes_defaults() {
        let ob = ch32_schema();
        let mut out = [1u32, 2, 3];
        ob.export(&mut out).unwrap();
        assert_eq!(out, [0x00ff_5aa5, 0xff00_ff00, 0xffff_ffff]);
    }

    #[test]
    fn import_rejects_short_images() {
        let mut ob = ch32_schema();
        assert!(ob.import(&[0, 0]).is_err());
        assert!(!ob.is_imported());
    }

    #[test]
    fn apply_then_value_for_every_width() {
        let inputs = [0u32, 1, 0x5a, 0xa5a5_a5a5, 0x8000_0000, 0x7fff_ffff, u32::MAX];
        for low in 0u8..32 {
            for high in low..32 {
                let field = Bitfield::new("F", high, low).unwrap();
                for &reg in &[0u32, u32::MAX, 0x1357_9bdf] {
                    for &input in &inputs {
                        let (regval, truncated) = field.apply(reg, input);
                        assert_eq!(field.value(regval), input & field.mask());
                        assert_eq!(truncated, input & field.mask() != input);
                        // bits outside the field are untouched
                        assert_eq!(regval & !(field.mask() << low), reg & !(field.mask() << low));
                    }
                }
            }
        }
    }

    #[test]
    fn bit_range_order_is_normalised() {
        let field = Bitfield::new("F", 3, 7).unwrap();
        assert_eq!((field.high(), field.low()), (7, 3));
        assert!(Bitfield::new("F", 32, 0).is_err());
    }

    #[test]
    fn overlapping_fields_are_rejected() {
        let reg = Register::new(0, "R", 0)
            .with_field(Bitfield::new("A", 7, 0).unwrap())
            .with_field(Bitfield::new("B", 8, 7).unwrap());
        assert!(matches!(OptionBytes::new(vec![reg]), Err(Error::Database(_))));
    }

    #[test]
    fn modify_accepts_separator_styles() {
        let mut ob = ch32_schema();
        ob.import(&[0x00ff_5aa5, 0, 0]).unwrap();
        ob.modify("iwdg_sw = 0, SRAM_CODE_MODE= 0b10;DATA =0x10\tWRP 0xf").unwrap();
        assert_eq!(ob.value_of("IWDG_SW"), Some(0));
        assert_eq!(ob.value_of("SRAM_CODE_MODE"), Some(2));
        assert_eq!(ob.value_of("DATA"), Some(0x10));
        assert_eq!(ob.value_of("WRP"), Some(0xf));
    }

    #[test]
    fn register_names_win_over_field_names() {
        let mut ob = ch32_schema();
        ob.modify("WRP=0x3").unwrap();
        // WRP is both a register and a field of it, the register is assigned.
        assert_eq!(ob.registers()[2].current_value, 0x3);
    }

    #[test]
    fn unknown_name_keeps_earlier_assignments() {
        let mut ob = ch32_schema();
        ob.import(&[0x00ff_5aa5, 0, 0]).unwrap();
        let err = ob.modify("RDPR=0x00, NOPE=1, DATA=5").unwrap_err();
        assert!(matches!(err, Error::UnknownFieldName(ref n) if n == "NOPE"));
        assert_eq!(ob.value_of("RDPR"), Some(0));
        assert_eq!(ob.value_of("DATA"), Some(0));
    }

    #[test]
    fn malformed_assignments() {
        let mut ob = ch32_schema();
        assert!(matches!(ob.modify("RDPR"), Err(Error::InvalidAssignment(_))));
        assert!(matches!(ob.modify("RDPR=zz"), Err(Error::InvalidAssignment(_))));
        assert!(matches!(ob.modify(" ,; "), Err(Error::InvalidAssignment(_))));
        assert!(matches!(ob.modify("=5"), Err(Error::InvalidAssignment(_))));
    }

    #[test]
    fn truncation_is_recorded_not_fatal() {
        let mut ob = ch32_schema();
        ob.modify("SRAM_CODE_MODE=7").unwrap();
        assert_eq!(ob.value_of("SRAM_CODE_MODE"), Some(3));
        assert_eq!(
            ob.truncations(),
            &[Truncation {
                field: "SRAM_CODE_MODE".into(),
                requested: 7,
                applied: 3
            }]
        );
        assert!(ob.warnings().iter().all(Error::is_warning));
    }

    #[test]
    fn unlock_sets_rdpr_once() {
        let mut ob = ch32_schema();
        ob.import(&[0x00ff_5a00, 0, 0]).unwrap();
        assert!(ob.unlock().unwrap());
        assert_eq!(ob.value_of("RDPR"), Some(0xa5));
        assert_eq!(ob.value_of("nRDPR"), Some(0x5a));
        assert!(!ob.unlock().unwrap());
    }

    #[test]
    fn unlock_needs_a_read_protection_field() {
        let mut ob = OptionBytes::new(vec![Register::new(0, "USER", 0)]).unwrap();
        assert!(matches!(ob.unlock(), Err(Error::UnknownFieldName(_))));
    }

    #[test]
    fn schema_from_yaml() {
        let yaml = r#"
- offset: 0x00
  name: RDPR_USER
  reset: 0x00FF5AA5
  fields:
    - bit_range: [0, 7]
      name: RDPR
      explaination:
        0xa5: Unprotected
        _: Protected
    - bit_range: [17, 17]
      name: STOP_RST
      explaination:
        1: Disable
        0: Enable
- offset: 0x08
  name: WRP
"#;
        let registers: Vec<Register> = serde_yaml::from_str(yaml).unwrap();
        let ob = OptionBytes::new(registers).unwrap();
        let rdpr = ob.registers()[0].field("rdpr").unwrap();
        assert_eq!((rdpr.high(), rdpr.low()), (7, 0));
        assert_eq!(rdpr.label(0xa5), Some("Unprotected"));
        assert_eq!(rdpr.label(0x12), Some("Protected"));
        assert_eq!(ob.registers()[1].default_value, 0xffff_ffff);
        assert_eq!(ob.word_count(), 3);
        assert!(ob.to_string().contains("[7:0] RDPR = 0xa5 => Unprotected"));
    }
}
