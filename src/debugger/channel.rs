use std::collections::VecDeque;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{trace, warn};
use regex::Regex;

use crate::error::{Error, Result};

/// Byte transport underneath a [`CommandChannel`].
pub trait Connection: Send {
    fn send(&mut self, data: &[u8]) -> Result<()>;
    /// Waits up to `timeout` for data. `Ok(None)` means nothing arrived.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
    /// Closes and reopens the underlying connection.
    fn reconnect(&mut self) -> Result<()>;
    fn describe(&self) -> String;
}

const TELNET_IAC: u8 = 255;

/// Telnet connection to a debug-probe server.
pub struct TcpConnection {
    address: String,
    timeout: Duration,
    stream: TcpStream,
}

impl TcpConnection {
    const CONNECT_ATTEMPTS: usize = 3;

    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = Self::open(address, timeout)?;
        Ok(Self {
            address: address.to_string(),
            timeout,
            stream,
        })
    }

    fn open(address: &str, timeout: Duration) -> Result<TcpStream> {
        let connect_error = |source| Error::Connect {
            address: address.to_string(),
            source,
        };
        let socket = address
            .to_socket_addrs()
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| connect_error(std::io::Error::new(IoErrorKind::NotFound, "no address")))?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect_timeout(&socket, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < Self::CONNECT_ATTEMPTS && e.kind() == IoErrorKind::ConnectionRefused => {
                    warn!("Connection to {} refused, retrying...", address);
                    sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(connect_error(e)),
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Io {
            channel: self.describe(),
            source,
        }
    }
}

/// Drops telnet option negotiation (`IAC <cmd> <option>`) from received data.
fn strip_telnet_negotiation(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == TELNET_IAC {
            i += 3;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

impl Connection for TcpConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).map_err(|e| self.io_error(e))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| self.io_error(e))?;
        let mut buffer = [0u8; 4096];
        match self.stream.read(&mut buffer) {
            Ok(0) => Err(Error::Disconnected {
                channel: self.describe(),
            }),
            Ok(n) => Ok(Some(strip_telnet_negotiation(&buffer[..n]))),
            Err(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.stream = Self::open(&self.address, self.timeout)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("telnet {}", self.address)
    }
}

/// Connection replaying a fixed dialogue, used for dry runs and tests.
///
/// Every line sent is echoed back followed by the next queued response.
#[derive(Default)]
pub struct ScriptedConnection {
    responses: VecDeque<String>,
    pending: Vec<u8>,
    sent: Vec<String>,
    reconnects: usize,
    /// Largest number of bytes handed out per receive, unlimited if 0.
    chunk_size: usize,
    disconnected: bool,
}

impl ScriptedConnection {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Queues output that arrives without a command, e.g. a banner.
    pub fn push_output(&mut self, output: &str) {
        self.pending.extend_from_slice(output.as_bytes());
    }

    /// Hands out received data in pieces of at most `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// The next receive fails as if the peer closed the connection.
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    /// Lines sent so far, without line endings.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects
    }
}

impl Connection for ScriptedConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data);
        for line in text.split_inclusive('\n') {
            self.pending.extend_from_slice(line.as_bytes());
            self.sent.push(line.trim_end().to_string());
            if let Some(response) = self.responses.pop_front() {
                self.pending.extend_from_slice(response.as_bytes());
            }
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.disconnected {
            return Err(Error::Disconnected {
                channel: self.describe(),
            });
        }
        if self.pending.is_empty() {
            sleep(timeout.min(Duration::from_millis(5)));
            return Ok(None);
        }
        if self.chunk_size > 0 && self.pending.len() > self.chunk_size {
            let rest = self.pending.split_off(self.chunk_size);
            return Ok(Some(std::mem::replace(&mut self.pending, rest)));
        }
        Ok(Some(std::mem::take(&mut self.pending)))
    }

    fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        self.disconnected = false;
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted connection".to_string()
    }
}

/// Line oriented command/response channel.
///
/// Every byte received is appended to the transcript, which becomes the
/// debugger output of the current iteration.
pub struct CommandChannel<C: Connection> {
    connection: C,
    prompts: Vec<Regex>,
    error_messages: Vec<String>,
    timeout: Duration,
    buffer: String,
    /// Received bytes ending in an incomplete UTF-8 sequence.
    undecoded: Vec<u8>,
    transcript: String,
    attempts: usize,
}

impl<C: Connection> CommandChannel<C> {
    pub fn new(connection: C, prompts: &[&str], timeout: Duration) -> Result<Self> {
        Ok(Self {
            connection,
            prompts: compile(prompts)?,
            error_messages: Vec::new(),
            timeout,
            buffer: String::new(),
            undecoded: Vec::new(),
            transcript: String::new(),
            attempts: 3,
        })
    }

    /// Responses containing one of `messages` fail with [`Error::Device`].
    pub fn with_error_messages(mut self, messages: &[&str]) -> Self {
        self.error_messages = messages.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Returns and clears the transcript.
    pub fn take_transcript(&mut self) -> String {
        self.flush();
        std::mem::take(&mut self.transcript)
    }

    /// Moves unconsumed input to the transcript.
    pub fn flush(&mut self) {
        let pending = std::mem::take(&mut self.buffer);
        self.transcript.push_str(&pending);
    }

    /// Writes raw text, reconnecting on I/O errors.
    pub fn write(&mut self, text: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connection.send(text.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts && e.kind() == crate::error::ErrorKind::Transport => {
                    warn!("{}: {}, reconnecting", self.connection.describe(), e);
                    self.connection.reconnect()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads until one of `patterns` matches. Returns the index of the
    /// matching pattern and all text up to and including the match.
    pub fn expect(&mut self, patterns: &[Regex], context: &str) -> Result<(usize, String)> {
        self.expect_until(patterns, context, &|| false)
    }

    /// Like [`CommandChannel::expect`], but gives up with [`Error::Cancelled`]
    /// as soon as `stop` returns true.
    pub fn expect_until(&mut self, patterns: &[Regex], context: &str, stop: &dyn Fn() -> bool) -> Result<(usize, String)> {
        let deadline = Instant::now() + self.timeout;
        let mut reconnects = 0;
        loop {
            let found = patterns
                .iter()
                .enumerate()
                .filter_map(|(i, pattern)| pattern.find(&self.buffer).map(|m| (i, m.start(), m.end())))
                .min_by_key(|(_, start, _)| *start);
            if let Some((index, _, end)) = found {
                let consumed: String = self.buffer.drain(..end).collect();
                self.transcript.push_str(&consumed);
                return Ok((index, consumed));
            }

            if stop() {
                self.flush();
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                self.flush();
                return Err(Error::Timeout {
                    context: context.to_string(),
                    expected: patterns.iter().map(|p| p.as_str().to_string()).collect(),
                    timeout: self.timeout,
                });
            }
            match self.connection.receive((deadline - now).min(POLL_INTERVAL)) {
                Ok(Some(data)) => self.push_received(&data),
                Ok(None) => {}
                Err(e) if reconnects + 1 < self.attempts && e.kind() == crate::error::ErrorKind::Transport => {
                    reconnects += 1;
                    warn!("{}: {}, reconnecting", self.connection.describe(), e);
                    self.connection.reconnect()?;
                }
                Err(e) => {
                    self.flush();
                    return Err(e);
                }
            }
        }
    }

    /// Collects whatever arrives until the line stays quiet for `quiet`,
    /// without waiting for a prompt. Gives up after the channel timeout.
    pub fn drain(&mut self, quiet: Duration) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            match self.connection.receive(quiet)? {
                Some(data) => self.push_received(&data),
                None => break,
            }
        }
        let text = std::mem::take(&mut self.buffer);
        self.transcript.push_str(&text);
        Ok(text)
    }

    fn push_received(&mut self, data: &[u8]) {
        self.undecoded.extend_from_slice(data);
        let text = decode_utf8(&mut self.undecoded);
        trace!("{} <- {:?}", self.connection.describe(), text);
        self.buffer.push_str(&text);
    }

    /// Sends `command`, waits for its echo (if `echo`), for each of the
    /// `expected` patterns and finally for the prompt.
    ///
    /// # Arguments
    ///
    /// * `command` - Command line without line ending.
    /// * `expected` - Regular expressions that must appear in the response.
    /// * `error_message` - Context of the error raised on a mismatch.
    /// * `echo` - The server echoes commands.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - Response text following the echo, including the prompt.
    /// * `Err(Error)` - Timeout, transport error or a known device error in the response.
    pub fn command(&mut self, command: &str, expected: &[&str], error_message: &str, echo: bool) -> Result<String> {
        self.flush();
        trace!("{} -> {}", self.connection.describe(), command);
        self.write(&format!("{}\n", command))?;
        if echo {
            let echo_pattern = [Regex::new(&regex::escape(command)).map_err(invalid_pattern)?];
            self.expect(&echo_pattern, error_message)?;
        } else {
            self.transcript.push_str(command);
            self.transcript.push('\n');
        }

        let mut response = String::new();
        if !expected.is_empty() {
            let patterns = compile(expected)?;
            for _ in 0..patterns.len() {
                let (_, text) = self.expect(&patterns, error_message)?;
                response.push_str(&text);
            }
        }
        let prompts = self.prompts.clone();
        let (_, text) = self.expect(&prompts, error_message)?;
        response.push_str(&text);

        if let Some(category) = self.error_messages.iter().find(|m| response.contains(m.as_str())) {
            return Err(Error::Device {
                message: error_message.to_string(),
                category: category.clone(),
            });
        }
        Ok(response)
    }
}

/// Longest wait of a single receive, bounds how late a stop request is seen.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Decodes the complete UTF-8 sequences of `bytes` and leaves an incomplete
/// trailing sequence in place. Invalid sequences become U+FFFD.
fn decode_utf8(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(&bytes[..]) {
            Ok(valid) => {
                text.push_str(valid);
                bytes.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match e.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        bytes.drain(..valid + invalid);
                    }
                    None => {
                        bytes.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}

fn invalid_pattern(e: regex::Error) -> Error {
    Error::Config(format!("invalid response pattern: {}", e))
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(invalid_pattern))
        .collect()
}
