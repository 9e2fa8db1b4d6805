//! Serial console of the DUT and the artifacts a workload leaves behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;

use super::counter::CancelToken;
use crate::debugger::{CommandChannel, Connection};
use crate::error::{Error, Result};

/// Console output which marks a failed execution, with the outcome it maps to.
pub const ERROR_MESSAGES: [(&str, &str); 31] = [
    ("drseus_sighandler: SIGSEGV", "Signal SIGSEGV"),
    ("drseus_sighandler: SIGILL", "Signal SIGILL"),
    ("drseus_sighandler: SIGBUS", "Signal SIGBUS"),
    ("drseus_sighandler: SIGFPE", "Signal SIGFPE"),
    ("drseus_sighandler: SIGABRT", "Signal SIGABRT"),
    ("drseus_sighandler: SIGIOT", "Signal SIGIOT"),
    ("drseus_sighandler: SIGTRAP", "Signal SIGTRAP"),
    ("drseus_sighandler: SIGSYS", "Signal SIGSYS"),
    ("drseus_sighandler: SIGEMT", "Signal SIGEMT"),
    ("command not found", "Invalid command"),
    ("Unknown command", "Invalid command"),
    ("No such file or directory", "Missing file"),
    ("panic", "Kernel error"),
    ("Oops", "Kernel error"),
    ("Segmentation fault", "Segmentation fault"),
    ("Illegal instruction", "Illegal instruction"),
    ("Call Trace:", "Kernel error"),
    ("detected stalls on CPU", "Stall detected"),
    ("detected stall on CPU", "Stall detected"),
    ("malloc(), memory corruption", "Kernel error"),
    ("malloc(): memory corruption", "Kernel error"),
    ("Bad swap file entry", "Kernel error"),
    ("Unable to handle kernel paging request", "Kernel error"),
    ("Alignment trap", "Kernel error"),
    ("Unhandled fault", "Kernel error"),
    ("free(), invalid next size", "Kernel error"),
    ("double free or corruption", "Kernel error"),
    ("Rebooting in", "Kernel error"),
    ("????????", "????????"),
    ("Hit any key to stop autoboot:", "Reboot"),
    ("can't get kernel image", "Error booting"),
];

/// Outcome of a console read without a recognised error.
pub const HANGING: &str = "Hanging";

/// Login prompt printed once the DUT booted.
pub const LOGIN_PATTERN: &str = "login: ";

/// Silence after which late console output is considered complete.
const DRAIN_QUIET: Duration = Duration::from_millis(100);

/// Default pattern of the error count lines printed by self-checking workloads.
pub const DETECTED_ERRORS_PATTERN: &str = r"drseus_detected_errors:\s*(\d+)";

/// Text read from the console and what was recognised in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub text: String,
    /// Whether the prompt was seen before the timeout.
    pub returned: bool,
    pub detected_errors: Option<u64>,
    /// Outcome of the first error message found, or [`HANGING`].
    pub error: Option<String>,
}

/// Command line of the DUT (or of a companion device).
pub trait Console: Send {
    /// Writes a command without waiting for it to finish.
    fn start(&mut self, command: &str) -> Result<()>;
    /// Reads until the prompt or the timeout. Fails with
    /// [`Error::Cancelled`] as soon as `cancel` is set.
    fn read_until(&mut self, cancel: &CancelToken) -> Result<ConsoleOutput>;
    /// Runs a command to completion.
    fn command(&mut self, command: &str, cancel: &CancelToken) -> Result<ConsoleOutput> {
        self.start(command)?;
        self.read_until(cancel)
    }
    /// Waits until a freshly reset DUT booted and logs in.
    fn boot(&mut self, _cancel: &CancelToken) -> Result<()> {
        Ok(())
    }
    /// Collects output printed after the workload returned.
    fn drain(&mut self) -> Result<ConsoleOutput>;
    /// Asks the running workload to stop.
    fn interrupt(&mut self) -> Result<()>;
    fn take_output(&mut self) -> String;
}

/// Console on top of a byte connection, e.g. a serial server reached over TCP.
pub struct ChannelConsole<C: Connection> {
    channel: CommandChannel<C>,
    prompt: Regex,
    error_messages: Vec<(String, String)>,
    detected_errors: Regex,
    login: Regex,
    username: String,
    login_command: Option<String>,
    boot_timeout: Duration,
}

impl<C: Connection> ChannelConsole<C> {
    /// # Arguments
    ///
    /// * `connection` - Connection to the console.
    /// * `prompt` - Shell prompt, a trailing space is expected after it.
    /// * `timeout` - Maximal time a workload may run.
    /// * `user_messages` - Additional error messages, checked first and reported verbatim.
    /// * `detected_errors` - Pattern with one capture group holding a detected error count.
    pub fn new(
        connection: C,
        prompt: &str,
        timeout: Duration,
        user_messages: &[String],
        detected_errors: &str,
    ) -> Result<Self> {
        let prompt = format!("{} ", regex::escape(prompt));
        let channel = CommandChannel::new(connection, &[prompt.as_str()], timeout)?;
        let invalid = |e: regex::Error| Error::Config(format!("invalid console pattern: {}", e));
        let error_messages = user_messages
            .iter()
            .map(|m| (m.clone(), m.clone()))
            .chain(
                ERROR_MESSAGES
                    .iter()
                    .map(|(m, c)| (m.to_string(), c.to_string())),
            )
            .collect();
        Ok(Self {
            channel,
            prompt: Regex::new(&prompt).map_err(invalid)?,
            error_messages,
            detected_errors: Regex::new(detected_errors).map_err(invalid)?,
            login: Regex::new(LOGIN_PATTERN).map_err(invalid)?,
            username: "root".to_string(),
            login_command: None,
            boot_timeout: timeout,
        })
    }

    /// Account used after a reset, a command run once logged in and the
    /// time the DUT may take to boot.
    pub fn with_login(mut self, username: &str, login_command: Option<String>, boot_timeout: Duration) -> Self {
        self.username = username.to_string();
        self.login_command = login_command;
        self.boot_timeout = boot_timeout;
        self
    }

    fn log_in(&mut self, cancel: &CancelToken) -> Result<()> {
        let stop = || cancel.is_cancelled();
        let patterns = [self.prompt.clone(), self.login.clone()];
        let (index, text) = self.channel.expect_until(&patterns, "Error booting DUT", &stop)?;
        if let Some(error) = self.inspect(text, true).error {
            warn!("DUT boot reported: {}", error);
        }
        if index == 1 {
            debug!("Logging in as {}", self.username);
            self.channel.write(&format!("{}\n", self.username))?;
            self.channel
                .expect_until(&patterns[..1], "Error logging in to DUT", &stop)?;
        }
        Ok(())
    }

    pub fn channel(&self) -> &CommandChannel<C> {
        &self.channel
    }

    fn inspect(&self, text: String, returned: bool) -> ConsoleOutput {
        let counts: Vec<u64> = self
            .detected_errors
            .captures_iter(&text)
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .collect();
        let detected_errors = (!counts.is_empty()).then(|| counts.iter().sum());
        let error = self
            .error_messages
            .iter()
            .find(|(message, _)| text.contains(message.as_str()))
            .map(|(_, category)| category.clone())
            .or_else(|| (!returned).then(|| HANGING.to_string()));
        if let Some(error) = &error {
            debug!("Console error: {}", error);
        }
        ConsoleOutput {
            text,
            returned,
            detected_errors,
            error,
        }
    }
}

impl<C: Connection> Console for ChannelConsole<C> {
    fn start(&mut self, command: &str) -> Result<()> {
        self.channel.flush();
        self.channel.write(&format!("{}\n", command))
    }

    fn read_until(&mut self, cancel: &CancelToken) -> Result<ConsoleOutput> {
        let start = self.channel.transcript().len();
        let prompt = [self.prompt.clone()];
        let stop = || cancel.is_cancelled();
        match self.channel.expect_until(&prompt, "Error reading DUT console", &stop) {
            Ok((_, text)) => Ok(self.inspect(text, true)),
            Err(Error::Timeout { .. }) => {
                warn!("DUT console timed out");
                let text = self.channel.transcript()[start..].to_string();
                Ok(self.inspect(text, false))
            }
            Err(e) => Err(e),
        }
    }

    fn boot(&mut self, cancel: &CancelToken) -> Result<()> {
        let timeout = self.channel.timeout();
        self.channel.set_timeout(self.boot_timeout);
        let booted = self.log_in(cancel);
        self.channel.set_timeout(timeout);
        booted?;
        if let Some(command) = self.login_command.clone() {
            let output = self.command(&command, cancel)?;
            if let Some(error) = output.error {
                return Err(Error::Protocol {
                    message: format!("Error running login command {:?}", command),
                    response: error,
                });
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<ConsoleOutput> {
        let text = self.channel.drain(DRAIN_QUIET)?;
        Ok(self.inspect(text, true))
    }

    fn interrupt(&mut self) -> Result<()> {
        self.channel.write("\x03")
    }

    fn take_output(&mut self) -> String {
        self.channel.take_transcript()
    }
}

/// Source of the files a workload produces.
pub trait ArtifactSource: Send {
    /// Copies artifact `name` to `destination`.
    fn fetch(&mut self, name: &str, destination: &Path) -> Result<()>;
}

/// Artifacts in a directory visible to the injector, e.g. a network mount.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    directory: PathBuf,
}

impl LocalArtifacts {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl ArtifactSource for LocalArtifacts {
    fn fetch(&mut self, name: &str, destination: &Path) -> Result<()> {
        let source = self.directory.join(name);
        fs::copy(&source, destination).map_err(|e| Error::file(&source, e))?;
        Ok(())
    }
}

/// Fraction of positions holding the same byte in both buffers, relative to
/// the longer one. Exactly `1.0` only for identical buffers.
pub fn similarity(gold: &[u8], output: &[u8]) -> f64 {
    if gold == output {
        return 1.0;
    }
    let longest = gold.len().max(output.len());
    let matching = gold.iter().zip(output).filter(|(a, b)| a == b).count();
    matching as f64 / longest as f64
}
