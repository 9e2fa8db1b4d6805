use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::outcome::{Category, Outcome};
use crate::checkpoint::{MemoryDiff, RegisterDiff};
use crate::error::{Error, Result};
use crate::injection::InjectionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Everything recorded about one iteration of a campaign
pub struct IterationResult {
    pub iteration: usize,
    pub worker: usize,
    pub category: Category,
    pub outcome: String,
    pub injections: Vec<InjectionRecord>,
    /// Why no injection was performed, if so.
    pub no_injection: Option<String>,
    pub detected_errors: Option<u64>,
    pub data_diff: Option<f64>,
    pub num_register_diffs: usize,
    pub num_memory_diffs: usize,
    pub register_diffs: Vec<RegisterDiff>,
    #[serde(default)]
    pub memory_diffs: Vec<MemoryDiff>,
    pub latent_iterations: usize,
    pub debugger_output: String,
    pub dut_output: String,
    pub aux_output: Option<String>,
    /// Seconds since the epoch.
    pub started: u64,
    pub duration_ms: u64,
}

impl IterationResult {
    pub fn new(iteration: usize, worker: usize) -> Self {
        Self {
            iteration,
            worker,
            category: Category::Incomplete,
            outcome: String::new(),
            injections: Vec::new(),
            no_injection: None,
            detected_errors: None,
            data_diff: None,
            num_register_diffs: 0,
            num_memory_diffs: 0,
            register_diffs: Vec::new(),
            memory_diffs: Vec::new(),
            latent_iterations: 0,
            debugger_output: String::new(),
            dut_output: String::new(),
            aux_output: None,
            started: 0,
            duration_ms: 0,
        }
    }

    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.category = outcome.category;
        self.outcome = outcome.outcome;
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::new(self.category, self.outcome.clone())
    }
}

/// Append-only JSON lines log of iteration results.
pub struct ResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ResultLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::file(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Writes one result and flushes it to disk.
    pub fn append(&mut self, result: &IterationResult) -> Result<()> {
        let line = serde_json::to_string(result)
            .map_err(|e| Error::Config(format!("Failed to serialize result: {}", e)))?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::file(&self.path, e))
    }

    /// Reads all results of a log.
    pub fn read(path: &Path) -> Result<Vec<IterationResult>> {
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        let mut results = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::file(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let result = serde_json::from_str(&line).map_err(|e| {
                Error::Config(format!("{}:{}: invalid result: {}", path.display(), number + 1, e))
            })?;
            results.push(result);
        }
        Ok(results)
    }

    /// Finds the result of an iteration.
    pub fn find(path: &Path, iteration: usize) -> Result<IterationResult> {
        Self::read(path)?
            .into_iter()
            .find(|r| r.iteration == iteration)
            .ok_or_else(|| Error::Config(format!("iteration {} not found in {}", iteration, path.display())))
    }
}
