use std::time::Duration;

use log::{debug, info};
use regex::Regex;

use super::channel::{CommandChannel, Connection, TcpConnection};
use super::{Breakpoints, Debugger, ModeSwitch, ProbeState, ProcessorMode};
use crate::error::{Error, Result};
use crate::injection::parse_value;
use crate::targets::{Coprocessor, RegisterAccess};

const PROMPT: &str = "> ";
const HALTED: &str = "target state: halted";
const JTAG_TAP_FOUND: &str = "JTAG tap: zynq.dap tap/device found: 0x4ba00477";

/// Responses which mean the probe lost the target.
pub const ERROR_MESSAGES: [&str; 3] = [
    "Timeout",
    "Target not examined yet",
    "timed out while waiting for target halted",
];

/// Performance monitor cycle counter.
pub const PMCCNTR: Coprocessor = Coprocessor {
    cp: 15,
    op1: 0,
    crn: 9,
    crm: 13,
    op2: 0,
};

/// Driver for an OpenOCD server attached to a dual Cortex-A9 (Zynq) board.
pub struct OpenOcd<C: Connection = TcpConnection> {
    channel: CommandChannel<C>,
    state: ProbeState,
    core: usize,
    halt_confirmations: usize,
    register_value: Regex,
    load_destination: Regex,
}

impl OpenOcd<TcpConnection> {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        info!("Connecting to OpenOCD at {}", address);
        Self::new(TcpConnection::connect(address, timeout)?, timeout)
    }
}

impl<C: Connection> OpenOcd<C> {
    /// Wraps an open connection and waits for the first prompt.
    pub fn new(connection: C, timeout: Duration) -> Result<Self> {
        let mut channel = CommandChannel::new(connection, &[PROMPT], timeout)?.with_error_messages(&ERROR_MESSAGES);
        let prompt = [Regex::new(PROMPT).map_err(|e| Error::Config(e.to_string()))?];
        channel.expect(&prompt, "Error connecting to OpenOCD")?;
        Ok(Self {
            channel,
            state: ProbeState::Connected,
            core: 0,
            // Both cores report the halt.
            halt_confirmations: 2,
            register_value: Regex::new(r":\s*(0x[0-9a-fA-F]+)").map_err(|e| Error::Config(e.to_string()))?,
            load_destination: Regex::new(r"(?i)\b(LD\w*)\s+(r\d+|sp|lr|pc)\b")
                .map_err(|e| Error::Config(e.to_string()))?,
        })
    }

    /// Number of `target state: halted` lines a halt produces.
    pub fn with_halt_confirmations(mut self, confirmations: usize) -> Self {
        self.halt_confirmations = confirmations;
        self
    }

    pub fn channel(&self) -> &CommandChannel<C> {
        &self.channel
    }

    pub fn core(&self) -> usize {
        self.core
    }

    fn require(&self, command: &str, expected: ProbeState) -> Result<()> {
        if self.state != expected {
            return Err(Error::State {
                command: command.to_string(),
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn read_coprocessor(&mut self, c: &Coprocessor) -> Result<u64> {
        let command = format!("arm mrc {} {} {} {} {}", c.cp, c.op1, c.crn, c.crm, c.op2);
        let response = self.channel.command(&command, &[], "Error reading coprocessor register", true)?;
        response
            .lines()
            .map(str::trim)
            .find_map(parse_value)
            .ok_or_else(|| Error::Protocol {
                message: "Error reading coprocessor register".to_string(),
                response,
            })
    }
}

/// Maps the numbered aliases of sp, lr and pc to their probe names.
fn register_name(register: &str) -> String {
    match register.to_lowercase().as_str() {
        "r13" => "sp".to_string(),
        "r14" => "lr".to_string(),
        "r15" => "pc".to_string(),
        other => other.to_string(),
    }
}

impl<C: Connection> Debugger for OpenOcd<C> {
    fn state(&self) -> ProbeState {
        self.state
    }

    fn halt_dut(&mut self) -> Result<()> {
        let expected = vec![HALTED; self.halt_confirmations];
        self.channel.command("halt", &expected, "Error halting DUT", true)?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    fn continue_dut(&mut self) -> Result<()> {
        self.require("resume", ProbeState::Halted)?;
        self.channel.command("resume", &[], "Error continuing DUT", true)?;
        self.state = ProbeState::Running;
        Ok(())
    }

    fn select_core(&mut self, core: usize) -> Result<()> {
        self.channel
            .command(&format!("targets zynq.cpu{}", core), &[], "Error selecting core", true)?;
        self.core = core;
        Ok(())
    }

    fn get_register(&mut self, register: &RegisterAccess) -> Result<u64> {
        self.require("reg", ProbeState::Halted)?;
        match register {
            RegisterAccess::Named(name) => {
                let response = self
                    .channel
                    .command(&format!("reg {}", name), &[], "Error getting register value", true)?;
                self.register_value
                    .captures(&response)
                    .and_then(|c| parse_value(&c[1]))
                    .ok_or_else(|| Error::Protocol {
                        message: format!("Error getting value of register {}", name),
                        response,
                    })
            }
            RegisterAccess::Coprocessor(c) => self.read_coprocessor(c),
        }
    }

    fn set_register(&mut self, register: &RegisterAccess, value: u64) -> Result<()> {
        self.require("reg", ProbeState::Halted)?;
        let command = match register {
            RegisterAccess::Named(name) => format!("reg {} 0x{:x}", name, value),
            RegisterAccess::Coprocessor(c) => {
                format!("arm mcr {} {} {} {} {} {}", c.cp, c.op1, c.crn, c.crm, c.op2, value)
            }
        };
        self.channel
            .command(&command, &[], "Error setting register value", true)?;
        Ok(())
    }

    fn reset_dut(&mut self) -> Result<()> {
        self.channel
            .command("reset", &[JTAG_TAP_FOUND], "Error resetting DUT", true)?;
        self.state = ProbeState::Running;
        Ok(())
    }

    fn take_output(&mut self) -> String {
        self.channel.take_transcript()
    }
}

impl<C: Connection> Breakpoints for OpenOcd<C> {
    fn set_breakpoint(&mut self, address: u64) -> Result<()> {
        self.channel.command(
            &format!("bp 0x{:x} 4 hw", address),
            &["breakpoint set at"],
            "Error setting breakpoint",
            true,
        )?;
        Ok(())
    }

    fn clear_breakpoint(&mut self, address: u64) -> Result<()> {
        self.channel
            .command(&format!("rbp 0x{:x}", address), &[], "Error removing breakpoint", true)?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.require("step", ProbeState::Halted)?;
        self.channel.command("step", &[], "Error stepping DUT", true)?;
        Ok(())
    }

    fn wait_halted(&mut self) -> Result<()> {
        let command = format!("wait_halt {}", self.channel.timeout().as_millis());
        self.channel
            .command(&command, &[], "Error waiting for breakpoint", true)?;
        self.state = ProbeState::Halted;
        Ok(())
    }

    fn read_cycle_counter(&mut self) -> Result<u64> {
        self.require("arm mrc", ProbeState::Halted)?;
        self.read_coprocessor(&PMCCNTR)
    }

    fn destination_register(&mut self, pc: u64) -> Result<String> {
        let response = self.channel.command(
            &format!("arm disassemble 0x{:x}", pc),
            &[],
            "Error disassembling instruction",
            true,
        )?;
        let register = self
            .load_destination
            .captures(&response)
            .map(|c| register_name(&c[2]))
            .ok_or_else(|| Error::Protocol {
                message: format!("No load instruction at 0x{:x}", pc),
                response,
            })?;
        debug!("Destination register at 0x{:x}: {}", pc, register);
        Ok(register)
    }
}

impl<C: Connection> ModeSwitch for OpenOcd<C> {
    fn get_mode(&mut self) -> Result<ProcessorMode> {
        let cpsr = self.get_register(&RegisterAccess::Named("cpsr".to_string()))?;
        ProcessorMode::from_cpsr(cpsr).ok_or_else(|| Error::Protocol {
            message: "Error decoding processor mode".to_string(),
            response: format!("cpsr 0x{:x}", cpsr),
        })
    }

    fn set_mode(&mut self, mode: ProcessorMode) -> Result<()> {
        let cpsr = RegisterAccess::Named("cpsr".to_string());
        let value = self.get_register(&cpsr)?;
        self.set_register(&cpsr, mode.apply(value))?;
        debug!("Switched core {} to {} mode", self.core, mode);
        Ok(())
    }
}
