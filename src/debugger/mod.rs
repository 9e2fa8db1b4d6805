//! Drivers for the debug probe of a live DUT and for the simulator CLI.
//!
//! Both sit on top of a [`CommandChannel`] and expose their capabilities
//! through the traits below. The campaign controller only talks to these
//! traits, the concrete driver is chosen when the campaign is built.

pub mod channel;
pub mod openocd;
pub mod simics;

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::error::Result;
use crate::targets::RegisterAccess;
pub use channel::{CommandChannel, Connection, ScriptedConnection, TcpConnection};
pub use openocd::OpenOcd;
pub use simics::Simics;

/// Connection state of a probe or simulator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Disconnected,
    Connected,
    Halted,
    Running,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// ARM processor modes with their CPSR mode field encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    User,
    Fiq,
    Irq,
    Supervisor,
    Monitor,
    Abort,
    Hypervisor,
    Undefined,
    System,
}

impl ProcessorMode {
    const ALL: [ProcessorMode; 9] = [
        ProcessorMode::User,
        ProcessorMode::Fiq,
        ProcessorMode::Irq,
        ProcessorMode::Supervisor,
        ProcessorMode::Monitor,
        ProcessorMode::Abort,
        ProcessorMode::Hypervisor,
        ProcessorMode::Undefined,
        ProcessorMode::System,
    ];

    pub fn bits(&self) -> u64 {
        match self {
            ProcessorMode::User => 0b10000,
            ProcessorMode::Fiq => 0b10001,
            ProcessorMode::Irq => 0b10010,
            ProcessorMode::Supervisor => 0b10011,
            ProcessorMode::Monitor => 0b10110,
            ProcessorMode::Abort => 0b10111,
            ProcessorMode::Hypervisor => 0b11010,
            ProcessorMode::Undefined => 0b11011,
            ProcessorMode::System => 0b11111,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessorMode::User => "usr",
            ProcessorMode::Fiq => "fiq",
            ProcessorMode::Irq => "irq",
            ProcessorMode::Supervisor => "svc",
            ProcessorMode::Monitor => "mon",
            ProcessorMode::Abort => "abt",
            ProcessorMode::Hypervisor => "hyp",
            ProcessorMode::Undefined => "und",
            ProcessorMode::System => "sys",
        }
    }

    /// Decodes the mode field (bits 4:0) of a CPSR value.
    pub fn from_cpsr(cpsr: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.bits() == cpsr & 0x1f)
    }

    /// Returns `cpsr` with its mode field replaced.
    pub fn apply(&self, cpsr: u64) -> u64 {
        (cpsr & !0x1f) | self.bits()
    }
}

impl fmt::Display for ProcessorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ProcessorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| format!("unknown processor mode {:?}", s))
    }
}

/// Common capability set of every debugger backend.
pub trait Debugger: Send {
    fn state(&self) -> ProbeState;
    fn halt_dut(&mut self) -> Result<()>;
    fn continue_dut(&mut self) -> Result<()>;
    /// Makes `core` the target of subsequent register accesses.
    fn select_core(&mut self, core: usize) -> Result<()>;
    fn get_register(&mut self, register: &RegisterAccess) -> Result<u64>;
    fn set_register(&mut self, register: &RegisterAccess, value: u64) -> Result<()>;
    fn reset_dut(&mut self) -> Result<()>;
    /// Returns and clears everything exchanged with the backend so far.
    fn take_output(&mut self) -> String;
}

/// Breakpoint and single-step control of a live DUT.
pub trait Breakpoints: Debugger {
    fn set_breakpoint(&mut self, address: u64) -> Result<()>;
    fn clear_breakpoint(&mut self, address: u64) -> Result<()>;
    fn step(&mut self) -> Result<()>;
    /// Blocks until the DUT halts, e.g. on a breakpoint.
    fn wait_halted(&mut self) -> Result<()>;
    fn read_cycle_counter(&mut self) -> Result<u64>;
    /// Name of the register written by the load instruction at `pc`.
    fn destination_register(&mut self, pc: u64) -> Result<String>;

    /// Halts the DUT on the `skip_count + 1`'th execution of `address`.
    ///
    /// # Arguments
    ///
    /// * `address` - Instruction address to stop at.
    /// * `skip_count` - Number of executions of `address` to let pass.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - DUT is halted at `address`, the breakpoint is removed.
    /// * `Err(Error)` - A probe command failed.
    fn break_until(&mut self, address: u64, skip_count: u64) -> Result<()> {
        debug!("Breaking at 0x{:x} after {} hits", address, skip_count);
        self.set_breakpoint(address)?;
        for _ in 0..skip_count {
            self.continue_dut()?;
            self.wait_halted()?;
            // Leave the breakpoint address before resuming again.
            self.step()?;
        }
        self.continue_dut()?;
        self.wait_halted()?;
        self.clear_breakpoint(address)
    }

    /// Halts the DUT on the next execution of `address`.
    fn break_dut(&mut self, address: u64) -> Result<()> {
        self.break_until(address, 0)
    }
}

/// Processor mode switching, needed for banked registers.
pub trait ModeSwitch: Debugger {
    fn get_mode(&mut self) -> Result<ProcessorMode>;
    fn set_mode(&mut self, mode: ProcessorMode) -> Result<()>;
}
