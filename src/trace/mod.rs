//! Load/store trace of the golden run.
//!
//! The trace is written once (imported from a dump of the golden run) and
//! afterwards only read by range scans. Besides the accesses the store holds
//! a single row with the start/end tags of the injection window and the cycle
//! counts observed when timing the application.

pub mod record;
pub mod residency;

use std::io::BufRead;
use std::path::Path;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::targets::CacheGeometry;
pub use record::{Direction, InjectionInfo, TraceRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ldstr (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycles INTEGER NOT NULL,
    cycles_diff INTEGER NOT NULL,
    pc INTEGER NOT NULL,
    ldstr INTEGER NOT NULL,
    ldstr_addr INTEGER NOT NULL,
    mnemonic TEXT NOT NULL,
    cache_set INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ldstr_set_cycles ON ldstr (cache_set, cycles);
CREATE INDEX IF NOT EXISTS ldstr_pc_cycles ON ldstr (pc, cycles);
CREATE TABLE IF NOT EXISTS injection_info (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    start_addr INTEGER,
    end_addr INTEGER,
    start_cycle INTEGER,
    end_cycle INTEGER
);
";

const RECORD_COLUMNS: &str = "cycles, cycles_diff, pc, ldstr, ldstr_addr, mnemonic, cache_set";

/// Embedded store holding the trace of one campaign.
pub struct TraceStore {
    connection: Connection,
}

impl TraceStore {
    /// Opens (and if necessary creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening trace store {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self { connection })
    }

    /// Appends records in one transaction. Returns the number of rows written.
    pub fn insert_records<'r, I>(&mut self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'r TraceRecord>,
    {
        let transaction = self.connection.transaction()?;
        let mut count = 0;
        {
            let mut statement = transaction.prepare(&format!(
                "INSERT INTO ldstr ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                RECORD_COLUMNS
            ))?;
            for record in records {
                statement.execute(params![
                    record.cycles as i64,
                    record.cycles_diff as i64,
                    record.pc as i64,
                    record.direction.code(),
                    record.address as i64,
                    record.mnemonic,
                    record.cache_set as i64,
                ])?;
                count += 1;
            }
        }
        transaction.commit()?;
        Ok(count)
    }

    /// Imports a text dump with one `cycles cycles_diff pc L|S address mnemonic`
    /// access per line. Empty lines and `#` comments are skipped.
    pub fn import_trace<R: BufRead>(&mut self, reader: R, geometry: &CacheGeometry) -> Result<usize> {
        let mut records = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::Io {
                channel: "trace dump".to_string(),
                source: e,
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = TraceRecord::parse_line(line, geometry).map_err(|message| Error::TraceImport {
                line: number + 1,
                message,
            })?;
            records.push(record);
        }
        let count = self.insert_records(&records)?;
        info!("Imported {} trace records", count);
        Ok(count)
    }

    /// Records the instruction addresses bounding the injection window.
    pub fn log_tags(&self, start_addr: u64, end_addr: u64) -> Result<()> {
        self.connection.execute(
            "INSERT INTO injection_info (id, start_addr, end_addr) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET start_addr = excluded.start_addr, end_addr = excluded.end_addr",
            params![start_addr as i64, end_addr as i64],
        )?;
        Ok(())
    }

    /// Records the cycles observed at the start and end tags.
    pub fn log_start_end(&self, start_cycle: u64, end_cycle: u64) -> Result<()> {
        debug!("Injection window: cycles {} - {}", start_cycle, end_cycle);
        self.connection.execute(
            "INSERT INTO injection_info (id, start_cycle, end_cycle) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET start_cycle = excluded.start_cycle, end_cycle = excluded.end_cycle",
            params![start_cycle as i64, end_cycle as i64],
        )?;
        Ok(())
    }

    pub fn injection_info(&self) -> Result<InjectionInfo> {
        let info = self
            .connection
            .query_row(
                "SELECT start_addr, end_addr, start_cycle, end_cycle FROM injection_info WHERE id = 0",
                [],
                |row| {
                    let get = |i: usize| -> rusqlite::Result<Option<u64>> {
                        Ok(row.get::<_, Option<i64>>(i)?.map(|v| v as u64))
                    };
                    Ok(InjectionInfo {
                        start_addr: get(0)?,
                        end_addr: get(1)?,
                        start_cycle: get(2)?,
                        end_cycle: get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(info.unwrap_or_default())
    }

    /// Cycle and addresses of the latest access to `cache_set` strictly before
    /// `cycle`. All rows sharing that cycle are returned, newest row first.
    pub fn latest_batch_before(&self, cycle: u64, cache_set: usize) -> Result<Option<(u64, Vec<u64>)>> {
        let latest: Option<i64> = self
            .connection
            .query_row(
                "SELECT MAX(cycles) FROM ldstr WHERE cache_set = ?1 AND cycles < ?2",
                params![cache_set as i64, cycle as i64],
                |row| row.get(0),
            )?;
        let Some(latest) = latest else {
            return Ok(None);
        };
        let mut statement = self
            .connection
            .prepare_cached("SELECT ldstr_addr FROM ldstr WHERE cache_set = ?1 AND cycles = ?2 ORDER BY id DESC")?;
        let addresses = statement
            .query_map(params![cache_set as i64, latest], |row| row.get::<_, i64>(0))?
            .map(|address| address.map(|a| a as u64))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some((latest as u64, addresses)))
    }

    /// Accesses to `cache_set` strictly after `cycle`, in execution order.
    pub fn accesses_after(&self, cycle: u64, cache_set: usize) -> Result<Vec<TraceRecord>> {
        let mut statement = self.connection.prepare_cached(&format!(
            "SELECT {} FROM ldstr WHERE cache_set = ?1 AND cycles > ?2 ORDER BY cycles, id",
            RECORD_COLUMNS
        ))?;
        let records = statement
            .query_map(params![cache_set as i64, cycle as i64], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Number of distinct cycles at which `pc` executed strictly between `after` and `before`.
    pub fn count_distinct_cycles(&self, pc: u64, after: u64, before: u64) -> Result<u64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(DISTINCT cycles) FROM ldstr WHERE pc = ?1 AND cycles > ?2 AND cycles < ?3",
            params![pc as i64, after as i64, before as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM ldstr", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn record_from_row(row: &Row) -> rusqlite::Result<TraceRecord> {
    let direction: i64 = row.get(3)?;
    Ok(TraceRecord {
        cycles: row.get::<_, i64>(0)? as u64,
        cycles_diff: row.get::<_, i64>(1)? as u64,
        pc: row.get::<_, i64>(2)? as u64,
        direction: Direction::from_code(direction).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Integer,
                format!("invalid access direction {}", direction).into(),
            )
        })?,
        address: row.get::<_, i64>(4)? as u64,
        mnemonic: row.get(5)?,
        cache_set: row.get::<_, i64>(6)? as usize,
    })
}
