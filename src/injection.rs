use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Moment at which an injection is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timing {
    /// Absolute cycle count of the DUT or simulator.
    Cycle(u64),
    /// Logical step, e.g. the checkpoint number of a simulator run.
    Step(u64),
}

/// Immutable description of one chosen bit.
///
/// `register` is the name the backend addresses. When the catalog entry is an
/// architectural alias, `register_alias` keeps the catalog name and
/// `register` holds the aliased register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionDescriptor {
    pub target: String,
    pub target_index: Option<usize>,
    pub register: String,
    pub register_alias: Option<String>,
    pub register_index: Option<Vec<usize>>,
    pub bit: u32,
    pub field: Option<String>,
    pub num_bits: u32,
    pub time: Option<Timing>,
}

impl InjectionDescriptor {
    /// Name of the register entry in the catalog.
    pub fn catalog_register(&self) -> &str {
        self.register_alias.as_deref().unwrap_or(&self.register)
    }
}

impl fmt::Display for InjectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)?;
        if let Some(index) = self.target_index {
            write!(f, "[{}]", index)?;
        }
        write!(f, ":{}", self.register)?;
        if let Some(index) = &self.register_index {
            write!(f, "[{}]", format_register_index(index))?;
        }
        if let Some(field) = &self.field {
            write!(f, ".{}", field)?;
        }
        write!(f, " bit {}", self.bit)?;
        if let Some(time) = self.time {
            match time {
                Timing::Cycle(cycle) => write!(f, " @ cycle {}", cycle)?,
                Timing::Step(step) => write!(f, " @ step {}", step)?,
            }
        }
        Ok(())
    }
}

/// A performed injection as written to the result log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionRecord {
    #[serde(flatten)]
    pub descriptor: InjectionDescriptor,
    pub gold_value: String,
    pub injected_value: String,
    pub processor_mode: Option<String>,
    pub register_access: Option<String>,
    pub success: bool,
}

/// Flips `bit` of `value` (hex with `0x` prefix or decimal) and returns the
/// result as lowercase hex.
pub fn flip_bit(value: &str, num_bits: u32, bit: u32) -> Result<String> {
    if bit >= num_bits || bit >= 64 {
        return Err(Error::InvalidBit {
            bit,
            bits: num_bits,
        });
    }
    let value = parse_value(value).ok_or_else(|| Error::MalformedValue {
        register: String::new(),
        message: format!("not a number: {:?}", value),
    })?;
    Ok(format!("{:#x}", value ^ (1u64 << bit)))
}

/// Parses a register value as printed by debuggers and checkpoints.
pub fn parse_value(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Zero-filled, colon separated representation of an array index, e.g. `003:001`.
pub fn format_register_index(index: &[usize]) -> String {
    index
        .iter()
        .map(|i| format!("{:03}", i))
        .collect::<Vec<_>>()
        .join(":")
}
