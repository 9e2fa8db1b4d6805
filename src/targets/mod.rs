//! Per-architecture catalog of injectable locations.
//!
//! A catalog maps target names (e.g. `GPR`, `TLB`, `CACHE_L2`) to [`Target`]
//! descriptions. Catalogs are written in JSON5 and every derived value
//! (`total_bits`, `adjust_bit`) is computed once when the catalog is loaded.

pub mod selector;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const A9_CATALOG: &str = include_str!("../../catalogs/a9.json5");

/// Architectures with a catalog shipped in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    A9,
}

/// Geometry of a set associative cache array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    pub ways: usize,
    pub sets: usize,
    pub line_bytes: u64,
}

impl CacheGeometry {
    /// Cache set an address maps to.
    pub fn set_of(&self, address: u64) -> usize {
        ((address / self.line_bytes) % self.sets as u64) as usize
    }

    /// Address of the first byte of the line holding `address`.
    pub fn line_address(&self, address: u64) -> u64 {
        address & !(self.line_bytes - 1)
    }

    pub fn line_bits(&self) -> u32 {
        (self.line_bytes * 8) as u32
    }
}

/// Coordinates of a coprocessor register (`arm mrc`/`arm mcr` operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coprocessor {
    pub cp: u32,
    pub op1: u32,
    pub crn: u32,
    pub crm: u32,
    pub op2: u32,
}

/// Named injectable unit, e.g. the general purpose registers of one core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Number of replicated instances (e.g. one per core).
    #[serde(default)]
    pub count: Option<usize>,
    /// Selecting an instance requires selecting the matching core on the probe.
    #[serde(default)]
    pub core: bool,
    /// Registers are accessed through coprocessor instructions.
    #[serde(default, rename = "CP")]
    pub cp: bool,
    /// Name of the object block in a simulator checkpoint.
    #[serde(default)]
    pub object: Option<String>,
    /// Type of the object block in a simulator checkpoint.
    #[serde(default, rename = "type")]
    pub object_type: Option<String>,
    /// Present for cache arrays, which are injected through the residency resolver.
    #[serde(default)]
    pub cache: Option<CacheGeometry>,
    pub registers: BTreeMap<String, RegisterSpec>,
    #[serde(skip)]
    pub total_bits: u64,
}

/// Architectural alias of a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub register: String,
    #[serde(default)]
    pub register_index: Option<Vec<usize>>,
}

/// Field of a TLB entry.
///
/// Split fields are stored in two words of the entry (`index_l` holds the
/// low part, `index_h` the high part).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlbField {
    Split {
        split: bool,
        bits: u32,
        bits_l: u32,
        bits_h: u32,
        index_l: usize,
        index_h: usize,
        bit_indices_l: [u32; 2],
        bit_indices_h: [u32; 2],
    },
    Single {
        bits: u32,
        index: usize,
        bit_indices: [u32; 2],
    },
}

impl TlbField {
    pub fn bits(&self) -> u32 {
        match self {
            TlbField::Split { bits, .. } | TlbField::Single { bits, .. } => *bits,
        }
    }
}

/// Field layout of a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fields {
    /// Ordered `[name, [lo, hi]]` bit ranges of a plain register.
    Ranges(Vec<(String, [u32; 2])>),
    /// Named fields of a TLB entry.
    Tlb(BTreeMap<String, TlbField>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    #[serde(default = "RegisterSpec::default_bits")]
    pub bits: u32,
    /// Dimensions of an array register, empty for scalars.
    #[serde(default)]
    pub count: Vec<usize>,
    #[serde(default)]
    pub is_tlb: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub fields: Option<Fields>,
    #[serde(default)]
    pub alias: Option<Alias>,
    #[serde(default)]
    pub access: Option<String>,
    /// Storage width used when flipping, when it differs from `bits`.
    #[serde(default)]
    pub actual_bits: Option<u32>,
    #[serde(default, rename = "CP")]
    pub cp: Option<u32>,
    #[serde(default, rename = "Op1")]
    pub op1: Option<u32>,
    #[serde(default, rename = "CRn")]
    pub crn: Option<u32>,
    #[serde(default, rename = "CRm")]
    pub crm: Option<u32>,
    #[serde(default, rename = "Op2")]
    pub op2: Option<u32>,
    #[serde(skip)]
    pub total_bits: u64,
    #[serde(skip)]
    pub adjust_bit: Vec<u32>,
}

impl RegisterSpec {
    fn default_bits() -> u32 {
        32
    }

    /// Width of the stored value the flipped bit lives in.
    pub fn num_bits(&self) -> u32 {
        match self.actual_bits {
            Some(bits) => bits,
            None if self.is_tlb => 32,
            None => self.bits,
        }
    }

    pub fn coprocessor(&self) -> Option<Coprocessor> {
        Some(Coprocessor {
            cp: self.cp?,
            op1: self.op1?,
            crn: self.crn?,
            crm: self.crm?,
            op2: self.op2?,
        })
    }

    /// Returns the name of the plain-register field containing `bit`.
    pub fn field_of(&self, bit: u32) -> Option<&str> {
        match &self.fields {
            Some(Fields::Ranges(ranges)) => ranges
                .iter()
                .find(|(_, range)| normalize(*range).contains(&bit))
                .map(|(name, _)| name.as_str()),
            _ => None,
        }
    }

    fn field_ranges(&self) -> Vec<std::ops::RangeInclusive<u32>> {
        match &self.fields {
            Some(Fields::Ranges(ranges)) => ranges.iter().map(|(_, r)| normalize(*r)).collect(),
            Some(Fields::Tlb(fields)) => fields
                .values()
                .flat_map(|field| match field {
                    TlbField::Single { bit_indices, .. } => vec![normalize(*bit_indices)],
                    TlbField::Split {
                        bit_indices_l,
                        bit_indices_h,
                        ..
                    } => vec![normalize(*bit_indices_l), normalize(*bit_indices_h)],
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Computes `total_bits` and, for partially implemented registers, the
    /// `adjust_bit` table mapping a dense bit draw to an implemented bit.
    fn calculate_bits(&mut self, target: &str, register: &str) -> Result<()> {
        let dimensions = if self.is_tlb && !self.count.is_empty() {
            &self.count[..self.count.len() - 1]
        } else {
            &self.count[..]
        };
        let count: u64 = dimensions.iter().map(|d| *d as u64).product();
        self.total_bits = count * self.bits as u64;

        if self.partial {
            let mut adjust_bit: Vec<u32> = self.field_ranges().into_iter().flatten().collect();
            if adjust_bit.len() != self.bits as usize {
                return Err(Error::Catalog(format!(
                    "Bits mismatch for register: {} in target: {}",
                    register, target
                )));
            }
            adjust_bit.sort_unstable();
            self.adjust_bit = adjust_bit;
        }
        Ok(())
    }
}

fn normalize(range: [u32; 2]) -> std::ops::RangeInclusive<u32> {
    range[0].min(range[1])..=range[0].max(range[1])
}

/// How the probe addresses a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterAccess {
    Named(String),
    Coprocessor(Coprocessor),
}

impl std::fmt::Display for RegisterAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterAccess::Named(name) => write!(f, "{}", name),
            RegisterAccess::Coprocessor(c) => write!(
                f,
                "p{} {} c{} c{} {}",
                c.cp, c.op1, c.crn, c.crm, c.op2
            ),
        }
    }
}

/// Catalog of all targets of one architecture.
#[derive(Debug, Clone)]
pub struct Catalog {
    targets: BTreeMap<String, Target>,
}

impl Catalog {
    /// Parses a JSON5 catalog and computes all derived bit counts.
    pub fn from_str(content: &str) -> Result<Self> {
        let targets: BTreeMap<String, Target> = json5::from_str(content)
            .map_err(|e| Error::Catalog(format!("Failed to parse JSON5 catalog: {}", e)))?;
        Self::new(targets)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        Self::from_str(&content)
    }

    pub fn builtin(architecture: Architecture) -> Result<Self> {
        match architecture {
            Architecture::A9 => Self::from_str(A9_CATALOG),
        }
    }

    pub fn new(mut targets: BTreeMap<String, Target>) -> Result<Self> {
        for (name, target) in targets.iter_mut() {
            let mut total_bits = 0;
            for (register_name, register) in target.registers.iter_mut() {
                register.calculate_bits(name, register_name)?;
                total_bits += register.total_bits;
            }
            target.total_bits = total_bits;
        }
        Ok(Self { targets })
    }

    pub fn get(&self, target: &str) -> Option<&Target> {
        self.targets.get(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&String, &Target)> {
        self.targets.iter()
    }

    /// Looks up a register by its catalog name.
    pub fn register(&self, target: &str, register: &str) -> Result<&RegisterSpec> {
        self.get(target)
            .ok_or_else(|| Error::Catalog(format!("invalid injection target: {}", target)))?
            .registers
            .get(register)
            .ok_or_else(|| Error::RegisterNotFound {
                register: register.to_string(),
                object: target.to_string(),
            })
    }

    /// Rejects names that are not part of the catalog.
    pub fn validate_selection(&self, names: &[String]) -> Result<()> {
        match names.iter().find(|name| !self.targets.contains_key(*name)) {
            Some(name) => Err(Error::Catalog(format!("invalid injection target: {}", name))),
            None => Ok(()),
        }
    }

    /// Derives how the probe must address the register of an injection.
    pub fn register_access(&self, injection: &crate::injection::InjectionDescriptor) -> Result<RegisterAccess> {
        let target = self
            .get(&injection.target)
            .ok_or_else(|| Error::Catalog(format!("invalid injection target: {}", injection.target)))?;
        let register = self.register(&injection.target, injection.catalog_register())?;
        if target.cp {
            return register.coprocessor().map(RegisterAccess::Coprocessor).ok_or_else(|| {
                Error::Catalog(format!(
                    "missing coprocessor coordinates for {}:{}",
                    injection.target,
                    injection.catalog_register()
                ))
            });
        }
        Ok(RegisterAccess::Named(injection.register.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        GPR: {
            core: true,
            count: 2,
            registers: {
                r0: {},
                r1: {},
                sp: { alias: { register: "r13" } },
            },
        },
        CPU: {
            registers: {
                cpsr: {
                    bits: 8,
                    actual_bits: 32,
                    partial: true,
                    fields: [["M", [0, 4]], ["T", [5, 5]], ["IT", [26, 25]]],
                },
            },
        },
        TLB: {
            registers: {
                entry: {
                    count: [64, 3],
                    is_tlb: true,
                    fields: {
                        VA: { bits: 20, index: 0, bit_indices: [12, 31] },
                        PA: {
                            split: true, bits: 20, bits_l: 8, bits_h: 12,
                            index_l: 1, index_h: 2,
                            bit_indices_l: [24, 31], bit_indices_h: [0, 11],
                        },
                    },
                },
            },
        },
    }"#;

    #[test]
    fn total_bits() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        assert_eq!(catalog.get("GPR").unwrap().total_bits, 96);
        // Last dimension of a TLB register indexes the storage words.
        assert_eq!(catalog.get("TLB").unwrap().total_bits, 64 * 32);
        let cpsr = catalog.register("CPU", "cpsr").unwrap();
        assert_eq!(cpsr.total_bits, 8);
        assert_eq!(cpsr.adjust_bit, vec![0, 1, 2, 3, 4, 5, 25, 26]);
        assert_eq!(cpsr.num_bits(), 32);
        assert_eq!(cpsr.field_of(26), Some("IT"));
    }

    #[test]
    fn bits_mismatch() {
        let catalog = r#"{ CPU: { registers: { cpsr: { bits: 9, partial: true, fields: [["M", [0, 4]]] } } } }"#;
        match Catalog::from_str(catalog) {
            Err(Error::Catalog(message)) => assert!(message.contains("Bits mismatch")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn selection_validation() {
        let catalog = Catalog::from_str(CATALOG).unwrap();
        assert!(catalog.validate_selection(&["GPR".to_string()]).is_ok());
        assert!(catalog.validate_selection(&["L3".to_string()]).is_err());
    }

    #[test]
    fn builtin_a9() {
        let catalog = Catalog::builtin(Architecture::A9).unwrap();
        let cache = catalog.get("CACHE_L2").unwrap();
        let geometry = cache.cache.unwrap();
        assert_eq!(geometry.ways, 8);
        assert_eq!(geometry.set_of(0x1000), (0x1000 / 32) % 2048);
        assert!(catalog.get("CP").unwrap().cp);
        let ttbcr = catalog.register("CP", "TTBCR").unwrap();
        assert_eq!(ttbcr.adjust_bit, vec![0, 1, 2, 4, 5]);
        assert_eq!(ttbcr.num_bits(), 32);
        assert_eq!(catalog.register("CPU", "cpsr").unwrap().adjust_bit.len(), 28);
    }
}
