//! Cache residency derived from the golden-run trace.
//!
//! The cache is not modelled. Which lines a set holds at a cycle is
//! approximated by the most recent distinct lines accessed in that set, and
//! the consumers of a corrupted word are the later accesses to the same word
//! until the line is refilled from memory or overwritten.

use std::collections::VecDeque;
use std::fmt;

use log::debug;
use serde::Serialize;

use super::{TraceRecord, TraceStore};
use crate::error::{Error, Result};
use crate::targets::CacheGeometry;

/// Word size of the cache and of the registers loaded from it, in bytes.
pub const WORD_BYTES: u64 = 4;

/// Backward scan over the accesses of one set. Rows sharing a cycle are
/// handed out one at a time before the scan moves to an earlier cycle.
struct AccessCursor<'a> {
    store: &'a TraceStore,
    cache_set: usize,
    cycle: u64,
    batch: VecDeque<u64>,
}

impl<'a> AccessCursor<'a> {
    fn new(store: &'a TraceStore, cycle: u64, cache_set: usize) -> Self {
        Self {
            store,
            cache_set,
            cycle,
            batch: VecDeque::new(),
        }
    }

    fn next(&mut self) -> Result<Option<u64>> {
        if self.batch.is_empty() {
            match self.store.latest_batch_before(self.cycle, self.cache_set)? {
                Some((cycle, addresses)) => {
                    self.cycle = cycle;
                    self.batch.extend(addresses);
                }
                None => return Ok(None),
            }
        }
        Ok(self.batch.pop_front())
    }
}

/// Why a cache injection was not performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NoInjection {
    /// The chosen way held no line at the injection cycle.
    ColdLine { way: usize, resident: usize },
    /// The corrupted word is never read before it is refilled or overwritten.
    NeverRead { word_address: u64 },
}

impl fmt::Display for NoInjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoInjection::ColdLine { way, resident } => write!(
                f,
                "cache line was not valid (way {}, {} lines resident)",
                way, resident
            ),
            NoInjection::NeverRead { word_address } => {
                write!(f, "value in cache never read (word 0x{:x})", word_address)
            }
        }
    }
}

/// A consumer of the corrupted word and how often its breakpoint must be
/// passed before the relevant dynamic occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedConsumer {
    pub record: TraceRecord,
    pub skip_count: u64,
}

/// Everything the probe needs to emulate a flipped cache bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInjection {
    pub line_address: u64,
    pub word_address: u64,
    /// Bit of the loaded register that is flipped.
    pub register_bit: u32,
    pub consumers: Vec<PlannedConsumer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePlan {
    NotInjected(NoInjection),
    Inject(CacheInjection),
}

/// Answers residency queries against a trace store.
pub struct CacheResidency<'a> {
    store: &'a TraceStore,
    geometry: CacheGeometry,
    miss_latency: u64,
}

impl<'a> CacheResidency<'a> {
    /// `miss_latency` is the cycle delta from which a load is considered a
    /// refill from backing memory.
    pub fn new(store: &'a TraceStore, geometry: CacheGeometry, miss_latency: u64) -> Self {
        Self {
            store,
            geometry,
            miss_latency,
        }
    }

    /// Up to `ways` distinct line addresses accessed in `cache_set` strictly
    /// before `cycle`, most recent first.
    pub fn previous_access(&self, cycle: u64, cache_set: usize, ways: usize) -> Result<Vec<u64>> {
        let mut cursor = AccessCursor::new(self.store, cycle, cache_set);
        let mut candidates = Vec::with_capacity(ways);
        while candidates.len() < ways {
            let Some(address) = cursor.next()? else {
                break;
            };
            let line = self.geometry.line_address(address);
            if !candidates.contains(&line) {
                candidates.push(line);
            }
        }
        Ok(candidates)
    }

    /// Accesses after `cycle` that see the word at `word_address`. Stops
    /// before a load slow enough to be a refill and after the first store.
    pub fn next_access(&self, cycle: u64, cache_set: usize, word_address: u64) -> Result<Vec<TraceRecord>> {
        let word = word_address & !(WORD_BYTES - 1);
        let mut consumers = Vec::new();
        for record in self.store.accesses_after(cycle, cache_set)? {
            if record.address & !(WORD_BYTES - 1) != word {
                continue;
            }
            if record.is_store() {
                consumers.push(record);
                break;
            }
            if record.cycles_diff >= self.miss_latency {
                break;
            }
            consumers.push(record);
        }
        Ok(consumers)
    }

    /// Number of times `pc` executed strictly between two cycles.
    pub fn skip_count(&self, previous_cycle: u64, target_cycle: u64, pc: u64) -> Result<u64> {
        self.store.count_distinct_cycles(pc, previous_cycle, target_cycle)
    }

    /// Plans the injection of bit `line_bit` of the line held in `way` of
    /// `cache_set` at `cycle`.
    ///
    /// Bit `b` of a line lives in word `b / 32` (byte offset `4 * (b / 32)`)
    /// at register bit `b % 32`.
    ///
    /// `position` is the cycle the DUT is halted at. Accesses up to it have
    /// already executed, so an earlier `cycle` takes effect at `position`.
    pub fn plan_cache_injection(
        &self,
        cycle: u64,
        cache_set: usize,
        way: usize,
        line_bit: u32,
        position: u64,
    ) -> Result<CachePlan> {
        if line_bit >= self.geometry.line_bits() {
            return Err(Error::InvalidBit {
                bit: line_bit,
                bits: self.geometry.line_bits(),
            });
        }
        let cycle = cycle.max(position);
        let candidates = self.previous_access(cycle, cache_set, self.geometry.ways)?;
        debug!("Resident lines of set {} at cycle {}: {:x?}", cache_set, cycle, candidates);
        let Some(line_address) = candidates.get(way).copied() else {
            return Ok(CachePlan::NotInjected(NoInjection::ColdLine {
                way,
                resident: candidates.len(),
            }));
        };

        let word_bits = (WORD_BYTES * 8) as u32;
        let word_address = line_address + WORD_BYTES * (line_bit / word_bits) as u64;
        let records = self.next_access(cycle, cache_set, word_address)?;
        if records.is_empty() {
            return Ok(CachePlan::NotInjected(NoInjection::NeverRead { word_address }));
        }

        let mut consumers = Vec::with_capacity(records.len());
        let mut previous_cycle = position;
        for record in records {
            let skip_count = self.skip_count(previous_cycle, record.cycles, record.pc)?;
            previous_cycle = record.cycles;
            consumers.push(PlannedConsumer { record, skip_count });
        }
        Ok(CachePlan::Inject(CacheInjection {
            line_address,
            word_address,
            register_bit: line_bit % word_bits,
            consumers,
        }))
    }
}
