use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::injection::parse_value;
use crate::targets::CacheGeometry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Direction of a memory access
pub enum Direction {
    Load,
    Store,
}

impl Direction {
    pub fn code(&self) -> i64 {
        match self {
            Direction::Load => 0,
            Direction::Store => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Direction::Load),
            1 => Some(Direction::Store),
            _ => None,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "L" | "l" | "LD" | "ld" => Ok(Direction::Load),
            "S" | "s" | "ST" | "st" => Ok(Direction::Store),
            other => Err(format!("unknown access direction {:?}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// One executed load or store of the golden run
pub struct TraceRecord {
    pub cycles: u64,
    /// Cycles since the previous record, large for accesses that miss.
    pub cycles_diff: u64,
    pub pc: u64,
    pub direction: Direction,
    pub address: u64,
    pub mnemonic: String,
    pub cache_set: usize,
}

impl TraceRecord {
    /// Parses one line of a trace dump:
    /// `cycles cycles_diff pc L|S address mnemonic`.
    pub fn parse_line(line: &str, geometry: &CacheGeometry) -> std::result::Result<Self, String> {
        let mut fields = line.split_whitespace();
        let mut number = |name: &str| -> std::result::Result<u64, String> {
            let field = fields.next().ok_or_else(|| format!("missing {}", name))?;
            parse_value(field).ok_or_else(|| format!("invalid {} {:?}", name, field))
        };
        let cycles = number("cycles")?;
        let cycles_diff = number("cycles_diff")?;
        let pc = number("pc")?;
        let direction = fields.next().ok_or("missing direction")?.parse()?;
        let address = parse_value(fields.next().ok_or("missing address")?).ok_or("invalid address")?;
        let mnemonic = fields.collect::<Vec<_>>().join(" ");
        Ok(Self {
            cycles,
            cycles_diff,
            pc,
            direction,
            address,
            mnemonic,
            cache_set: geometry.set_of(address),
        })
    }

    pub fn is_store(&self) -> bool {
        self.direction == Direction::Store
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>10} 0x{:08x} {} 0x{:08x} {} (set {})",
            self.cycles,
            self.pc,
            match self.direction {
                Direction::Load => "L",
                Direction::Store => "S",
            },
            self.address,
            self.mnemonic,
            self.cache_set
        )
    }
}

/// Start/end tags of the injection window and their measured cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InjectionInfo {
    pub start_addr: Option<u64>,
    pub end_addr: Option<u64>,
    pub start_cycle: Option<u64>,
    pub end_cycle: Option<u64>,
}

impl InjectionInfo {
    /// Injection window in cycles.
    pub fn window(&self) -> Result<(u64, u64)> {
        match (self.start_cycle, self.end_cycle) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(Error::Config(
                "campaign start/end cycles are not recorded, time the application first".to_string(),
            )),
        }
    }

    pub fn tags(&self) -> Result<(u64, u64)> {
        match (self.start_addr, self.end_addr) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(Error::Config("campaign start/end tags are not recorded".to_string())),
        }
    }
}
