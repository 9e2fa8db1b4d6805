//! Injector backends: the part of an iteration that actually flips bits.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};

use super::outcome::Category;
use crate::checkpoint::memory::DEFAULT_BLOCK_SIZE;
use crate::checkpoint::{compare_memory, object_name, CheckpointInjector, MemoryDiff, RegisterDiff};
use crate::debugger::{Breakpoints, Connection, Debugger, ModeSwitch, ProcessorMode, Simics};
use crate::error::{Error, Result};
use crate::injection::{flip_bit, parse_value, InjectionDescriptor, InjectionRecord, Timing};
use crate::targets::{Catalog, RegisterAccess};
use crate::trace::residency::{CachePlan, CacheResidency};
use crate::trace::{InjectionInfo, TraceStore};

/// What an injector did in one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionReport {
    Injected(Vec<InjectionRecord>),
    /// Nothing was corrupted, e.g. the chosen cache line was never read.
    NotInjected(String),
}

/// Machine state differences found after the workload finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub register_diffs: Vec<RegisterDiff>,
    pub memory_diffs: Vec<MemoryDiff>,
    /// An injected location still holds its injected value.
    pub persistent: bool,
}

/// A way of performing injections, selected when the campaign is built.
pub trait InjectorBackend: Send {
    /// Category of the outcome when the backend itself fails.
    fn error_category(&self) -> Category;
    /// Injections hit a real device.
    fn is_live(&self) -> bool;
    /// Range from which injection times are drawn.
    fn window(&self) -> (u64, u64);
    fn timing(&self, value: u64) -> Timing;

    /// Brings the DUT into a state where the workload can be started. Live
    /// backends reset the DUT, which must then boot before the workload starts.
    fn prepare(&mut self) -> Result<()>;

    /// Starts the workload through `start_workload` where needed, performs
    /// all `injections` and leaves the workload running.
    fn inject(
        &mut self,
        injections: &[InjectionDescriptor],
        start_workload: &mut dyn FnMut() -> Result<()>,
    ) -> Result<InjectionReport>;

    /// Compares the machine state against the golden run.
    fn inspect(&mut self, iteration_dir: &Path) -> Result<StateDiff>;

    /// Measures the injection window during a golden run. Returns the start
    /// and end cycle if the backend derives its window this way.
    fn time_application(&mut self, _start_workload: &mut dyn FnMut() -> Result<()>) -> Result<Option<(u64, u64)>> {
        Ok(None)
    }

    /// Stops the DUT, e.g. after an interrupt.
    fn stop(&mut self) -> Result<()>;
    /// Brings the DUT back after a failed iteration.
    fn recover(&mut self) -> Result<()>;
    fn take_output(&mut self) -> String;
}

/// Injects through the debug probe of a live DUT.
///
/// Register targets are flipped in place. Cache targets are emulated: the
/// trace tells which loads read the corrupted word, the probe stops after
/// each of them and flips the bit in the loaded register.
pub struct ProbeBackend<D: Breakpoints + ModeSwitch> {
    debugger: D,
    catalog: Arc<Catalog>,
    store: TraceStore,
    info: InjectionInfo,
    miss_latency: u64,
    /// Cycles per second of the counter read by `read_cycle_counter`.
    cycle_rate: u64,
}

impl<D: Breakpoints + ModeSwitch> ProbeBackend<D> {
    pub fn new(debugger: D, catalog: Arc<Catalog>, store: TraceStore, miss_latency: u64, cycle_rate: u64) -> Result<Self> {
        let info = store.injection_info()?;
        Ok(Self {
            debugger,
            catalog,
            store,
            info,
            miss_latency,
            cycle_rate: cycle_rate.max(1),
        })
    }

    pub fn debugger(&self) -> &D {
        &self.debugger
    }

    /// Runs the workload until the start tag.
    fn break_at_start(&mut self, start_workload: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let (start_tag, _) = self.info.tags()?;
        self.debugger.halt_dut()?;
        self.debugger.set_breakpoint(start_tag)?;
        self.debugger.continue_dut()?;
        start_workload()?;
        self.debugger.wait_halted()?;
        self.debugger.clear_breakpoint(start_tag)
    }

    /// Lets the DUT run until about `cycle`. The probe cannot stop on a cycle
    /// count, so the remaining cycles are converted into a delay.
    fn advance_to(&mut self, cycle: u64) -> Result<()> {
        let now = self.debugger.read_cycle_counter()?;
        if cycle <= now {
            return Ok(());
        }
        let delay = Duration::from_secs_f64((cycle - now) as f64 / self.cycle_rate as f64);
        self.debugger.continue_dut()?;
        sleep(delay);
        self.debugger.halt_dut()?;
        debug!(
            "Halted at cycle {} for injection at cycle {}",
            self.debugger.read_cycle_counter()?,
            cycle
        );
        Ok(())
    }

    fn inject_register(&mut self, injection: &InjectionDescriptor) -> Result<InjectionRecord> {
        let target = self
            .catalog
            .get(&injection.target)
            .ok_or_else(|| Error::Catalog(format!("invalid injection target: {}", injection.target)))?;
        if target.core || target.cp {
            self.debugger.select_core(injection.target_index.unwrap_or(0))?;
        }
        let register = self.catalog.register_access(injection)?;
        let access = self
            .catalog
            .register(&injection.target, injection.catalog_register())?
            .access
            .clone();
        let mode = self.debugger.get_mode()?;

        let gold_value = self.debugger.get_register(&register)?;
        let injected = flip_bit(&format!("{:#x}", gold_value), injection.num_bits, injection.bit)?;
        let injected_value = parse_value(&injected).ok_or_else(|| Error::MalformedValue {
            register: register.to_string(),
            message: injected.clone(),
        })?;
        self.debugger.set_register(&register, injected_value)?;
        let mut success = self.debugger.get_register(&register)? == injected_value;
        let mut processor_mode = mode;
        if !success {
            // Some registers are only writable from a privileged mode.
            debug!("Retrying injection of {} in supervisor mode", register);
            self.debugger.set_mode(ProcessorMode::Supervisor)?;
            self.debugger.set_register(&register, injected_value)?;
            success = self.debugger.get_register(&register)? == injected_value;
            self.debugger.set_mode(mode)?;
            processor_mode = ProcessorMode::Supervisor;
            if !success {
                warn!("Injection of {} failed: register keeps its value", injection);
            }
        }
        info!("Injected {}: {:#x} -> {}", injection, gold_value, injected);
        Ok(InjectionRecord {
            descriptor: injection.clone(),
            gold_value: format!("{:#x}", gold_value),
            injected_value: injected,
            processor_mode: Some(processor_mode.to_string()),
            register_access: access,
            success,
        })
    }

    /// Emulates a flipped cache bit. `position` is the cycle at which the DUT
    /// is currently halted and is moved past the last consumer.
    fn inject_cache(&mut self, injection: &InjectionDescriptor, position: &mut u64) -> Result<InjectionReport> {
        let geometry = self
            .catalog
            .get(&injection.target)
            .and_then(|t| t.cache)
            .ok_or_else(|| Error::Catalog(format!("{} is not a cache target", injection.target)))?;
        let (cache_set, way) = match injection.register_index.as_deref() {
            Some([set, way]) => (*set, *way),
            _ => {
                return Err(Error::Catalog(format!(
                    "cache injection {} needs a [set, way] index",
                    injection
                )))
            }
        };
        let cycle = match injection.time {
            Some(Timing::Cycle(cycle)) => cycle,
            _ => return Err(Error::Config(format!("cache injection {} needs a cycle", injection))),
        };

        let residency = CacheResidency::new(&self.store, geometry, self.miss_latency);
        let plan = match residency.plan_cache_injection(cycle, cache_set, way, injection.bit, *position)? {
            CachePlan::NotInjected(reason) => {
                info!("No injection for {}: {}", injection, reason);
                return Ok(InjectionReport::NotInjected(reason.to_string()));
            }
            CachePlan::Inject(plan) => plan,
        };
        if plan.consumers.first().map_or(true, |c| c.record.is_store()) {
            return Ok(InjectionReport::NotInjected(format!(
                "word 0x{:x} overwritten before it was read",
                plan.word_address
            )));
        }

        let mut records = Vec::new();
        for consumer in &plan.consumers {
            // A store replaces the corrupted word.
            if consumer.record.is_store() {
                break;
            }
            let pc = consumer.record.pc;
            self.debugger.break_until(pc, consumer.skip_count)?;
            *position = consumer.record.cycles;
            let register = self.debugger.destination_register(pc)?;
            self.debugger.step()?;

            let access = RegisterAccess::Named(register.clone());
            let gold_value = self.debugger.get_register(&access)?;
            let injected_value = gold_value ^ (1u64 << plan.register_bit);
            self.debugger.set_register(&access, injected_value)?;
            let success = self.debugger.get_register(&access)? == injected_value;
            debug!(
                "Corrupted {} after load at 0x{:x} (cycle {}): {:#x} -> {:#x}",
                register, pc, consumer.record.cycles, gold_value, injected_value
            );
            records.push(InjectionRecord {
                descriptor: injection.clone(),
                gold_value: format!("{:#x}", gold_value),
                injected_value: format!("{:#x}", injected_value),
                processor_mode: None,
                register_access: Some(format!("{} @ 0x{:x}", register, pc)),
                success,
            });
        }
        info!(
            "Injected {} through {} consumers of word 0x{:x}",
            injection,
            records.len(),
            plan.word_address
        );
        Ok(InjectionReport::Injected(records))
    }
}

impl<D: Breakpoints + ModeSwitch> InjectorBackend for ProbeBackend<D> {
    fn error_category(&self) -> Category {
        Category::DebuggerError
    }

    fn is_live(&self) -> bool {
        true
    }

    fn window(&self) -> (u64, u64) {
        self.info.window().unwrap_or((0, 0))
    }

    fn timing(&self, value: u64) -> Timing {
        Timing::Cycle(value)
    }

    fn prepare(&mut self) -> Result<()> {
        self.info.window()?;
        self.debugger.reset_dut()
    }

    fn inject(
        &mut self,
        injections: &[InjectionDescriptor],
        start_workload: &mut dyn FnMut() -> Result<()>,
    ) -> Result<InjectionReport> {
        let (window_start, _) = self.info.window()?;
        self.break_at_start(start_workload)?;
        let mut position = window_start;
        let mut records = Vec::new();
        let mut not_injected = None;
        for injection in injections {
            let cache = self.catalog.get(&injection.target).map_or(false, |t| t.cache.is_some());
            if cache {
                match self.inject_cache(injection, &mut position)? {
                    InjectionReport::Injected(mut performed) => records.append(&mut performed),
                    InjectionReport::NotInjected(reason) => not_injected = Some(reason),
                }
            } else {
                if let Some(Timing::Cycle(cycle)) = injection.time {
                    self.advance_to(cycle)?;
                    position = position.max(cycle);
                }
                records.push(self.inject_register(injection)?);
            }
        }
        self.debugger.continue_dut()?;
        match not_injected {
            Some(reason) if records.is_empty() => Ok(InjectionReport::NotInjected(reason)),
            _ => Ok(InjectionReport::Injected(records)),
        }
    }

    fn inspect(&mut self, _iteration_dir: &Path) -> Result<StateDiff> {
        Ok(StateDiff::default())
    }

    fn time_application(&mut self, start_workload: &mut dyn FnMut() -> Result<()>) -> Result<Option<(u64, u64)>> {
        let (_, end_tag) = self.info.tags()?;
        self.break_at_start(start_workload)?;
        let start_cycle = self.debugger.read_cycle_counter()?;
        self.debugger.break_dut(end_tag)?;
        let end_cycle = self.debugger.read_cycle_counter()?;
        self.debugger.continue_dut()?;
        self.store.log_start_end(start_cycle, end_cycle)?;
        self.info = self.store.injection_info()?;
        info!("Application runs from cycle {} to {}", start_cycle, end_cycle);
        Ok(Some((start_cycle, end_cycle)))
    }

    fn stop(&mut self) -> Result<()> {
        self.debugger.halt_dut()
    }

    fn recover(&mut self) -> Result<()> {
        self.debugger.reset_dut()
    }

    fn take_output(&mut self) -> String {
        self.debugger.take_output()
    }
}

/// Layout of the checkpoints of a simulator campaign.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    /// Directory with `checkpoint-<n>` of the golden run and its `final` state.
    pub gold_dir: PathBuf,
    pub checkpoints: u64,
    /// Simulated cycles between two gold checkpoints.
    pub interval: u64,
    /// Directory for injected and monitored checkpoints of this worker.
    pub work_dir: PathBuf,
}

impl CheckpointLayout {
    pub fn gold(&self, step: u64) -> PathBuf {
        self.gold_dir.join(format!("checkpoint-{}", step))
    }

    pub fn gold_final(&self) -> PathBuf {
        self.gold_dir.join("final")
    }
}

/// Injects into checkpoints of the simulator.
pub struct CheckpointBackend<C: Connection> {
    simics: Simics<C>,
    catalog: Arc<Catalog>,
    object_prefix: String,
    layout: CheckpointLayout,
    memory_block_size: u64,
    injected: Vec<InjectionRecord>,
}

impl<C: Connection> CheckpointBackend<C> {
    pub fn new(simics: Simics<C>, catalog: Arc<Catalog>, object_prefix: &str, layout: CheckpointLayout) -> Self {
        Self {
            simics,
            catalog,
            object_prefix: object_prefix.to_string(),
            layout,
            memory_block_size: DEFAULT_BLOCK_SIZE,
            injected: Vec::new(),
        }
    }

    pub fn with_memory_block_size(mut self, block_size: u64) -> Self {
        self.memory_block_size = block_size.max(1);
        self
    }

    fn fresh_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.layout.work_dir.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::file(&dir, e))?;
        }
        Ok(dir)
    }

    /// Whether an injected register element still differs from the gold run.
    fn is_persistent(&self, diffs: &[RegisterDiff]) -> Result<bool> {
        for record in &self.injected {
            let injection = &record.descriptor;
            let Some(target) = self.catalog.get(&injection.target) else {
                continue;
            };
            let (object, _) = object_name(&self.object_prefix, &injection.target, target, injection.target_index)?;
            let register = match &injection.register_index {
                Some(index) => format!(
                    "{}{}",
                    injection.register,
                    index.iter().map(|i| format!(":{}", i)).collect::<String>()
                ),
                None => injection.register.clone(),
            };
            if diffs.iter().any(|d| d.object == object && d.register == register) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Registers and memory images of `monitored` against the final gold checkpoint.
    pub fn compare_with_gold(&self, monitored: &Path) -> Result<StateDiff> {
        let gold = self.layout.gold_final();
        let injector = CheckpointInjector::new(&self.catalog, self.object_prefix.clone());
        let register_diffs = injector.compare_registers(&gold, monitored)?;
        let memory_diffs = compare_memory(&gold, monitored, self.memory_block_size)?;
        let persistent = self.is_persistent(&register_diffs)?;
        debug!(
            "{} register and {} memory differences, persistent: {}",
            register_diffs.len(),
            memory_diffs.len(),
            persistent
        );
        Ok(StateDiff {
            register_diffs,
            memory_diffs,
            persistent,
        })
    }
}

impl<C: Connection> InjectorBackend for CheckpointBackend<C> {
    fn error_category(&self) -> Category {
        Category::SimicsError
    }

    fn is_live(&self) -> bool {
        false
    }

    fn window(&self) -> (u64, u64) {
        (0, self.layout.checkpoints.saturating_sub(1))
    }

    fn timing(&self, value: u64) -> Timing {
        Timing::Step(value)
    }

    fn prepare(&mut self) -> Result<()> {
        if self.layout.checkpoints == 0 {
            return Err(Error::Config("no gold checkpoints".to_string()));
        }
        self.injected.clear();
        Ok(())
    }

    /// The gold checkpoints are taken with the workload running, so
    /// `start_workload` is not needed.
    fn inject(
        &mut self,
        injections: &[InjectionDescriptor],
        _start_workload: &mut dyn FnMut() -> Result<()>,
    ) -> Result<InjectionReport> {
        let injector = CheckpointInjector::new(&self.catalog, self.object_prefix.clone());
        let mut previous_step = None;
        let mut records = Vec::new();
        for (i, injection) in injections.iter().enumerate() {
            let step = match injection.time {
                Some(Timing::Step(step)) => step,
                _ => 0,
            };
            let source = match previous_step {
                None => self.layout.gold(step),
                Some(previous) => {
                    // Continue the already injected run up to the next step.
                    let cycles = step.saturating_sub(previous) * self.layout.interval;
                    if cycles > 0 {
                        self.simics.run_cycles(cycles)?;
                    }
                    let source = self.fresh_dir(&format!("step-{}", i))?;
                    self.simics.write_configuration(&source)?;
                    source
                }
            };
            let injected = self.fresh_dir(&format!("injected-{}", i))?;
            records.push(injector.inject(&source, &injected, injection)?);
            self.simics.read_configuration(&injected)?;
            previous_step = Some(step);
        }
        self.simics.continue_dut()?;
        self.injected = records.clone();
        Ok(InjectionReport::Injected(records))
    }

    fn inspect(&mut self, iteration_dir: &Path) -> Result<StateDiff> {
        let monitored = iteration_dir.join("monitored");
        if monitored.exists() {
            fs::remove_dir_all(&monitored).map_err(|e| Error::file(&monitored, e))?;
        }
        self.simics.write_configuration(&monitored)?;
        self.compare_with_gold(&monitored)
    }

    fn stop(&mut self) -> Result<()> {
        self.simics.halt_dut()
    }

    fn recover(&mut self) -> Result<()> {
        self.simics.reset_dut()
    }

    fn take_output(&mut self) -> String {
        self.simics.take_output()
    }
}
