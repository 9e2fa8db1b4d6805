//! Error type shared by all injection components.
//!
//! Errors are grouped into kinds which decide how the campaign controller
//! reacts: transport errors are retried, protocol and format errors abort the
//! current injection attempt, configuration errors abort the campaign.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel open failure, read timeout, unexpected disconnect.
    Transport,
    /// Missing or unexpected response from the debug probe or simulator.
    Protocol,
    /// Malformed checkpoint or catalog content.
    Format,
    /// Invalid user supplied configuration or selection.
    Configuration,
    /// Operator interrupt.
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("I/O error on {channel}: {source}")]
    Io {
        channel: String,
        source: std::io::Error,
    },
    #[error("{context}: timeout after {timeout:?} waiting for {expected:?}")]
    Timeout {
        context: String,
        expected: Vec<String>,
        timeout: Duration,
    },
    #[error("{channel} disconnected")]
    Disconnected { channel: String },
    #[error("{message}: unexpected response {response:?}")]
    Protocol { message: String, response: String },
    #[error("{message}: device reported \"{category}\"")]
    Device { message: String, category: String },
    #[error("Command {command:?} requires probe state {expected:?}, probe is {actual:?}")]
    State {
        command: String,
        expected: crate::debugger::ProbeState,
        actual: crate::debugger::ProbeState,
    },
    #[error("Could not find {object} in {path}")]
    ObjectNotFound { object: String, path: PathBuf },
    #[error("Could not find {register} in {object}")]
    RegisterNotFound { register: String, object: String },
    #[error("Malformed value for register {register}: {message}")]
    MalformedValue { register: String, message: String },
    #[error("Too many dimensions ({dimensions}) for register {register}")]
    TooManyDimensions { register: String, dimensions: usize },
    #[error("Invalid bit {bit} for a {bits} bit value")]
    InvalidBit { bit: u32, bits: u32 },
    #[error("Catalog error: {0}")]
    Catalog(String),
    #[error("Error choosing injection target: no candidates")]
    NoCandidates,
    #[error("Trace store error: {0}")]
    Trace(#[from] rusqlite::Error),
    #[error("Trace import error in line {line}: {message}")]
    TraceImport { line: usize, message: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("File error on {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Interrupted")]
    Cancelled,
}

impl Error {
    /// Returns the kind of the error which drives retry and classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect { .. }
            | Error::Io { .. }
            | Error::Timeout { .. }
            | Error::Disconnected { .. } => ErrorKind::Transport,
            Error::Protocol { .. } | Error::Device { .. } | Error::State { .. } => {
                ErrorKind::Protocol
            }
            Error::ObjectNotFound { .. }
            | Error::RegisterNotFound { .. }
            | Error::MalformedValue { .. }
            | Error::TooManyDimensions { .. }
            | Error::InvalidBit { .. }
            | Error::Catalog(_)
            | Error::Trace(_)
            | Error::TraceImport { .. }
            | Error::File { .. } => ErrorKind::Format,
            Error::NoCandidates | Error::Config(_) => ErrorKind::Configuration,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Short outcome string stored with a result, e.g. "Timeout" or "Signal SIGSEGV".
    pub fn outcome(&self) -> String {
        match self {
            Error::Timeout { .. } => "Timeout".to_string(),
            Error::Device { category, .. } => category.clone(),
            Error::Disconnected { .. } => "Disconnected".to_string(),
            other => other.to_string(),
        }
    }

    /// Wrap an I/O error with the path it occurred on.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let timeout = Error::Timeout {
            context: "halt".to_string(),
            expected: vec!["target state: halted".to_string()],
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.kind(), ErrorKind::Transport);
        assert_eq!(timeout.outcome(), "Timeout");

        let protocol = Error::Protocol {
            message: "Error halting DUT".to_string(),
            response: "foo".to_string(),
        };
        assert_eq!(protocol.kind(), ErrorKind::Protocol);

        let format = Error::RegisterNotFound {
            register: "gprs".to_string(),
            object: "cpu0".to_string(),
        };
        assert_eq!(format.kind(), ErrorKind::Format);
        assert_eq!(Error::NoCandidates.kind(), ErrorKind::Configuration);
    }
}
