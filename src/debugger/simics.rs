use std::path::Path;
use std::time::Duration;

use log::info;

use super::channel::{CommandChannel, Connection, TcpConnection};
use super::{Debugger, ProbeState};
use crate::error::{Error, Result};
use crate::injection::parse_value;
use crate::targets::RegisterAccess;

const PROMPT: &str = "simics> ";

pub const ERROR_MESSAGES: [&str; 3] = [
    "Simics process exited",
    "No such file or directory",
    "Unknown command",
];

/// Driver for the command line of a checkpointing simulator.
pub struct Simics<C: Connection = TcpConnection> {
    channel: CommandChannel<C>,
    state: ProbeState,
    object_prefix: String,
}

impl Simics<TcpConnection> {
    pub fn connect(address: &str, timeout: Duration, object_prefix: &str) -> Result<Self> {
        info!("Connecting to simics at {}", address);
        Self::new(TcpConnection::connect(address, timeout)?, timeout, object_prefix)
    }
}

impl<C: Connection> Simics<C> {
    /// Wraps an open connection to the simulator CLI and waits for its prompt.
    pub fn new(connection: C, timeout: Duration, object_prefix: &str) -> Result<Self> {
        let mut channel = CommandChannel::new(connection, &[PROMPT], timeout)?.with_error_messages(&ERROR_MESSAGES);
        let prompt = [regex::Regex::new(PROMPT).map_err(|e| Error::Config(e.to_string()))?];
        channel.expect(&prompt, "Error launching simics")?;
        Ok(Self {
            channel,
            state: ProbeState::Connected,
            object_prefix: object_prefix.to_string(),
        })
    }

    pub fn channel(&self) -> &CommandChannel<C> {
        &self.channel
    }

    /// Loads a checkpoint. The simulation is stopped afterwards.
    pub fn read_configuration(&mut self, checkpoint: &Path) -> Result<()> {
        self.channel.command(
            &format!("read-configuration {}", checkpoint.display()),
            &[],
            "Error loading checkpoint",
            true,
        )?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    /// Saves the current state as a checkpoint.
    pub fn write_configuration(&mut self, checkpoint: &Path) -> Result<()> {
        if self.state == ProbeState::Running {
            self.halt_dut()?;
        }
        self.channel.command(
            &format!("write-configuration {}", checkpoint.display()),
            &[],
            "Error writing checkpoint",
            true,
        )?;
        Ok(())
    }

    /// Runs the simulation for exactly `cycles` cycles.
    pub fn run_cycles(&mut self, cycles: u64) -> Result<()> {
        self.channel
            .command(&format!("run-cycles {}", cycles), &[], "Error running simulation", true)?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    fn register_name(register: &RegisterAccess) -> Result<&str> {
        match register {
            RegisterAccess::Named(name) => Ok(name),
            RegisterAccess::Coprocessor(_) => Err(Error::Protocol {
                message: format!("simics addresses registers by name, got {}", register),
                response: String::new(),
            }),
        }
    }
}

impl<C: Connection> Debugger for Simics<C> {
    fn state(&self) -> ProbeState {
        self.state
    }

    fn halt_dut(&mut self) -> Result<()> {
        self.channel.command("stop", &[], "Error halting simics", true)?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    fn continue_dut(&mut self) -> Result<()> {
        // The prompt only returns once the simulation stops.
        self.channel.flush();
        self.channel.write("run\n")?;
        self.state = ProbeState::Running;
        Ok(())
    }

    fn select_core(&mut self, core: usize) -> Result<()> {
        let command = format!("pselect {}cpu[{}]", self.object_prefix, core);
        self.channel.command(&command, &[], "Error selecting processor", true)?;
        Ok(())
    }

    fn get_register(&mut self, register: &RegisterAccess) -> Result<u64> {
        let name = Self::register_name(register)?;
        let response = self
            .channel
            .command(&format!("read-reg {}", name), &[], "Error getting register value", true)?;
        response
            .lines()
            .map(str::trim)
            .find_map(parse_value)
            .ok_or_else(|| Error::Protocol {
                message: format!("Error getting value of register {}", name),
                response,
            })
    }

    fn set_register(&mut self, register: &RegisterAccess, value: u64) -> Result<()> {
        let name = Self::register_name(register)?;
        self.channel.command(
            &format!("write-reg {} 0x{:x}", name, value),
            &[],
            "Error setting register value",
            true,
        )?;
        Ok(())
    }

    fn reset_dut(&mut self) -> Result<()> {
        if self.state == ProbeState::Running {
            self.halt_dut()?;
        }
        self.channel.command("reset", &[], "Error resetting simics", true)?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    fn take_output(&mut self) -> String {
        self.channel.take_transcript()
    }
}
