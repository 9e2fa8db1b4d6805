use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Category of an iteration outcome
pub enum Category {
    #[serde(rename = "No error")]
    NoError,
    #[serde(rename = "Data error")]
    DataError,
    #[serde(rename = "Execution error")]
    ExecutionError,
    #[serde(rename = "Post execution error")]
    PostExecutionError,
    #[serde(rename = "Debugger error")]
    DebuggerError,
    #[serde(rename = "Simics error")]
    SimicsError,
    #[serde(rename = "SCP error")]
    ScpError,
    #[serde(rename = "SSH error")]
    SshError,
    Incomplete,
    #[serde(rename = "No injection")]
    NoInjection,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::NoError => "No error",
            Category::DataError => "Data error",
            Category::ExecutionError => "Execution error",
            Category::PostExecutionError => "Post execution error",
            Category::DebuggerError => "Debugger error",
            Category::SimicsError => "Simics error",
            Category::ScpError => "SCP error",
            Category::SshError => "SSH error",
            Category::Incomplete => "Incomplete",
            Category::NoInjection => "No injection",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const MASKED_FAULTS: &str = "Masked faults";
pub const LATENT_FAULTS: &str = "Latent faults";
pub const PERSISTENT_FAULTS: &str = "Persistent faults";
pub const DETECTED_DATA_ERROR: &str = "Detected data error";
pub const CORRECTED_DATA_ERROR: &str = "Corrected data error";
pub const SILENT_DATA_ERROR: &str = "Silent data error";
pub const INTERRUPTED: &str = "Interrupted";
pub const UNCAUGHT_EXCEPTION: &str = "Uncaught exception";

/// Terminal classification of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub category: Category,
    pub outcome: String,
}

impl Outcome {
    pub fn new(category: Category, outcome: impl Into<String>) -> Self {
        Self {
            category,
            outcome: outcome.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self::new(Category::Incomplete, INTERRUPTED)
    }

    /// Maps an error that escaped an iteration. Transport and protocol errors
    /// are attributed to the backend, everything else is unexpected.
    pub fn from_error(error: &Error, backend: Category) -> Self {
        match error.kind() {
            ErrorKind::Cancelled => Self::interrupted(),
            ErrorKind::Transport | ErrorKind::Protocol => Self::new(backend, error.outcome()),
            ErrorKind::Format | ErrorKind::Configuration => Self::new(Category::Incomplete, UNCAUGHT_EXCEPTION),
        }
    }

    pub fn is_error(&self) -> bool {
        self.category != Category::NoError
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.category, self.outcome)
    }
}

/// Everything observed while monitoring an iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Error message seen on the console, or "Hanging".
    pub execution_error: Option<String>,
    /// The output artifact could not be fetched.
    pub transfer_error: Option<String>,
    /// Sum of the error counts reported by the workload.
    pub detected_errors: Option<u64>,
    /// Similarity of the output artifact to the gold artifact.
    pub data_diff: Option<f64>,
    pub persistent_faults: bool,
    pub register_diffs: usize,
    pub memory_diffs: usize,
}

impl Observation {
    /// Derives exactly one outcome from the observation.
    pub fn classify(&self) -> Outcome {
        if let Some(error) = &self.execution_error {
            return Outcome::new(Category::ExecutionError, error.clone());
        }
        if let Some(error) = &self.transfer_error {
            return Outcome::new(Category::ScpError, error.clone());
        }
        let corrupted = |diff: Option<f64>| matches!(diff, Some(d) if d < 1.0);
        if self.detected_errors.unwrap_or(0) > 0 {
            if self.data_diff.is_none() || corrupted(self.data_diff) {
                return Outcome::new(Category::DataError, DETECTED_DATA_ERROR);
            }
            return Outcome::new(Category::DataError, CORRECTED_DATA_ERROR);
        }
        if corrupted(self.data_diff) {
            return Outcome::new(Category::DataError, SILENT_DATA_ERROR);
        }
        if self.persistent_faults {
            Outcome::new(Category::NoError, PERSISTENT_FAULTS)
        } else if self.register_diffs > 0 || self.memory_diffs > 0 {
            Outcome::new(Category::NoError, LATENT_FAULTS)
        } else {
            Outcome::new(Category::NoError, MASKED_FAULTS)
        }
    }
}

/// Combines the first pass outcome with the outcome of a latent fault pass.
pub fn merge_latent_pass(first: &Outcome, pass: Outcome) -> Outcome {
    if pass.is_error() {
        Outcome::new(Category::PostExecutionError, pass.outcome)
    } else {
        first.clone()
    }
}

/// The latent fault pass only runs when nothing went wrong so far.
pub fn needs_latent_pass(outcome: &Outcome, live: bool) -> bool {
    outcome.outcome == LATENT_FAULTS || (live && outcome.outcome == MASKED_FAULTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn observation(detected: Option<u64>, diff: Option<f64>) -> Observation {
        Observation {
            detected_errors: detected,
            data_diff: diff,
            ..Default::default()
        }
    }

    #[test]
    fn data_errors() {
        assert_eq!(observation(Some(2), Some(0.5)).classify().outcome, DETECTED_DATA_ERROR);
        assert_eq!(observation(Some(2), None).classify().outcome, DETECTED_DATA_ERROR);
        assert_eq!(observation(Some(1), Some(1.0)).classify().outcome, CORRECTED_DATA_ERROR);
        let silent = observation(Some(0), Some(0.99)).classify();
        assert_eq!(silent, Outcome::new(Category::DataError, SILENT_DATA_ERROR));
        assert_eq!(observation(None, Some(1.0)).classify().outcome, MASKED_FAULTS);
    }

    #[test]
    fn execution_error_wins() {
        let observed = Observation {
            execution_error: Some("Signal SIGSEGV".to_string()),
            detected_errors: Some(3),
            data_diff: Some(0.1),
            ..Default::default()
        };
        assert_eq!(
            observed.classify(),
            Outcome::new(Category::ExecutionError, "Signal SIGSEGV")
        );
    }

    #[test]
    fn faults_without_errors() {
        let persistent = Observation {
            persistent_faults: true,
            register_diffs: 3,
            ..Default::default()
        };
        assert_eq!(persistent.classify().outcome, PERSISTENT_FAULTS);
        let latent = Observation {
            memory_diffs: 1,
            ..Default::default()
        };
        assert_eq!(latent.classify().outcome, LATENT_FAULTS);
        let lost = Observation {
            transfer_error: Some("result.dat not found".to_string()),
            memory_diffs: 1,
            ..Default::default()
        };
        assert_eq!(lost.classify().category, Category::ScpError);
    }

    #[test]
    fn latent_pass() {
        let latent = Outcome::new(Category::NoError, LATENT_FAULTS);
        let masked = Outcome::new(Category::NoError, MASKED_FAULTS);
        assert!(needs_latent_pass(&latent, false));
        assert!(!needs_latent_pass(&masked, false));
        assert!(needs_latent_pass(&masked, true));

        let crashed = Outcome::new(Category::ExecutionError, "Kernel error");
        assert_eq!(
            merge_latent_pass(&latent, crashed),
            Outcome::new(Category::PostExecutionError, "Kernel error")
        );
        assert_eq!(merge_latent_pass(&latent, masked.clone()), latent);
    }

    #[test]
    fn errors() {
        let timeout = Error::Timeout {
            context: "Error halting DUT".to_string(),
            expected: vec![],
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            Outcome::from_error(&timeout, Category::DebuggerError),
            Outcome::new(Category::DebuggerError, "Timeout")
        );
        assert_eq!(Outcome::from_error(&Error::Cancelled, Category::SimicsError), Outcome::interrupted());
        assert_eq!(
            Outcome::from_error(&Error::NoCandidates, Category::DebuggerError).outcome,
            UNCAUGHT_EXCEPTION
        );
    }
}
