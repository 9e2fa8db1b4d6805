//! Campaign control loop.
//!
//! A [`Campaign`] drives one DUT (or simulator instance) through the
//! iterations it claims: prepare, inject, monitor, classify and log. Several
//! campaigns run in parallel on a [`worker::WorkerPool`].

pub mod backend;
pub mod console;
pub mod counter;
pub mod outcome;
pub mod results;
pub mod retry;
pub mod worker;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, sleep};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rand::Rng;

use crate::error::{Error, Result};
use crate::targets::selector::Selector;
use backend::{InjectionReport, InjectorBackend};
use console::{ArtifactSource, Console, ConsoleOutput};
use counter::CancelToken;
use outcome::{merge_latent_pass, needs_latent_pass, Category, Observation, Outcome};
use results::IterationResult;
use retry::{retry_with_backoff, RetryOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Phase of the iteration a campaign is in
pub enum CampaignState {
    Idle,
    Preparing,
    Running,
    Monitoring,
    Classifying,
    Logging,
    Closed,
}

/// Settings shared by all workers of a campaign.
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    /// Command starting the workload on the DUT console.
    pub command: String,
    /// Command run on the companion device while the workload runs.
    pub aux_command: Option<String>,
    /// Injections per iteration.
    pub injections: usize,
    pub latent_iterations: usize,
    /// Artifact compared against `gold_output`.
    pub output_file: Option<String>,
    pub gold_output: Option<PathBuf>,
    /// Partial log polled while the workload runs.
    pub log_file: Option<String>,
    pub log_delay: Duration,
    pub work_dir: PathBuf,
    pub prepare_attempts: usize,
    pub retry_delay: Duration,
}

/// Controller of one DUT.
pub struct Campaign<B: InjectorBackend> {
    id: usize,
    backend: B,
    console: Box<dyn Console>,
    aux: Option<Box<dyn Console>>,
    artifacts: Option<Box<dyn ArtifactSource>>,
    options: CampaignOptions,
    state: CampaignState,
}

impl<B: InjectorBackend> Campaign<B> {
    pub fn new(id: usize, backend: B, console: Box<dyn Console>, options: CampaignOptions) -> Self {
        Self {
            id,
            backend,
            console,
            aux: None,
            artifacts: None,
            options,
            state: CampaignState::Idle,
        }
    }

    pub fn with_aux(mut self, aux: Box<dyn Console>) -> Self {
        self.aux = Some(aux);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Box<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn transition(&mut self, state: CampaignState) {
        debug!("Worker {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    /// Golden run: measures the injection window (on backends that derive it
    /// from the run) and stores the gold output artifact.
    pub fn setup(&mut self, cancel: &CancelToken) -> Result<Option<(u64, u64)>> {
        self.transition(CampaignState::Running);
        let command = self.options.command.clone();
        let console = &mut self.console;
        let window = self
            .backend
            .time_application(&mut || console.start(&command))?;
        let output = match window {
            Some(_) => self.console.read_until(cancel)?,
            None => self.console.command(&command, cancel)?,
        };
        if let Some(error) = output.error {
            self.transition(CampaignState::Idle);
            return Err(Error::Config(format!("golden run failed: {}", error)));
        }
        if let (Some(name), Some(gold), Some(artifacts)) =
            (&self.options.output_file, &self.options.gold_output, self.artifacts.as_mut())
        {
            artifacts.fetch(name, gold)?;
            info!("Stored gold output in {}", gold.display());
        }
        self.transition(CampaignState::Idle);
        Ok(window)
    }

    /// Runs one complete iteration. Never fails: errors become the outcome.
    pub fn run_iteration<R: Rng>(
        &mut self,
        iteration: usize,
        selector: &mut Selector<'_, R>,
        cancel: &CancelToken,
    ) -> IterationResult {
        let started = Instant::now();
        let mut result = IterationResult::new(iteration, self.id);
        result.started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let outcome = match self.execute(iteration, selector, cancel, &mut result) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Worker {}: iteration {} failed: {}", self.id, iteration, e);
                let outcome = if cancel.is_cancelled() {
                    Outcome::interrupted()
                } else {
                    Outcome::from_error(&e, self.backend.error_category())
                };
                self.clean_up(&outcome);
                outcome
            }
        };

        self.transition(CampaignState::Logging);
        result.set_outcome(outcome);
        result.debugger_output = self.backend.take_output();
        result.dut_output = self.console.take_output();
        result.aux_output = self.aux.as_mut().map(|aux| aux.take_output());
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.transition(CampaignState::Idle);
        result
    }

    /// Leaves the DUT stopped after an interrupt or reset after a failure.
    fn clean_up(&mut self, outcome: &Outcome) {
        let cleaned = if *outcome == Outcome::interrupted() {
            self.console.interrupt().and_then(|_| self.backend.stop())
        } else {
            self.backend.recover()
        };
        if let Err(e) = cleaned {
            warn!("Worker {}: could not clean up DUT: {}", self.id, e);
        }
    }

    fn execute<R: Rng>(
        &mut self,
        iteration: usize,
        selector: &mut Selector<'_, R>,
        cancel: &CancelToken,
        result: &mut IterationResult,
    ) -> Result<Outcome> {
        cancel.check()?;
        self.transition(CampaignState::Preparing);
        let attempts = self.options.prepare_attempts;
        let delay = self.options.retry_delay;
        let live = self.backend.is_live();
        let backend = &mut self.backend;
        let console = &mut self.console;
        retry_with_backoff(attempts, delay, |_| {
            RetryOutcome::from(backend.prepare().and_then(|_| if live { console.boot(cancel) } else { Ok(()) }))
        })?;
        let iteration_dir = self.options.work_dir.join(format!("iteration-{}", iteration));
        fs::create_dir_all(&iteration_dir).map_err(|e| Error::file(&iteration_dir, e))?;

        cancel.check()?;
        self.transition(CampaignState::Running);
        let (start, end) = self.backend.window();
        let injections = selector
            .choose_injection_times(start, end, self.options.injections)
            .into_iter()
            .map(|time| selector.choose_injection(Some(self.backend.timing(time))))
            .collect::<Result<Vec<_>>>()?;
        let command = self.options.command.clone();
        let console = &mut self.console;
        match self.backend.inject(&injections, &mut || console.start(&command))? {
            InjectionReport::Injected(records) => result.injections = records,
            InjectionReport::NotInjected(reason) => result.no_injection = Some(reason),
        }

        self.transition(CampaignState::Monitoring);
        let output = self.monitor(cancel, &iteration_dir)?;
        let mut observation = self.observe(output, &iteration_dir)?;
        result.detected_errors = observation.detected_errors;
        result.data_diff = observation.data_diff;
        if observation.execution_error.is_none() {
            let diff = self.backend.inspect(&iteration_dir)?;
            observation.register_diffs = diff.register_diffs.len();
            observation.memory_diffs = diff.memory_diffs.len();
            observation.persistent_faults = diff.persistent;
            result.num_register_diffs = diff.register_diffs.len();
            result.register_diffs = diff.register_diffs;
            result.num_memory_diffs = diff.memory_diffs.len();
            result.memory_diffs = diff.memory_diffs;
        }

        self.transition(CampaignState::Classifying);
        let mut outcome = observation.classify();
        if let Some(reason) = &result.no_injection {
            if !outcome.is_error() {
                outcome = Outcome::new(Category::NoInjection, reason.clone());
            }
        } else if needs_latent_pass(&outcome, self.backend.is_live()) {
            for _ in 0..self.options.latent_iterations {
                cancel.check()?;
                result.latent_iterations += 1;
                let output = self.console.command(&command, cancel)?;
                let pass = self.observe(output, &iteration_dir)?.classify();
                outcome = merge_latent_pass(&outcome, pass);
                if outcome.category == Category::PostExecutionError {
                    break;
                }
            }
        }
        self.check_late_errors(outcome)
    }

    /// Reads what the console printed after the last run. An error there
    /// turns a clean outcome into a post execution error.
    fn check_late_errors(&mut self, outcome: Outcome) -> Result<Outcome> {
        if !matches!(outcome.category, Category::NoError | Category::NoInjection) {
            return Ok(outcome);
        }
        match self.console.drain()?.error {
            Some(error) => {
                warn!("Worker {}: late console error: {}", self.id, error);
                Ok(Outcome::new(Category::PostExecutionError, error))
            }
            None => Ok(outcome),
        }
    }

    /// Waits for the workload while the companion device and the log poller
    /// run on their own threads.
    fn monitor(&mut self, cancel: &CancelToken, iteration_dir: &Path) -> Result<ConsoleOutput> {
        let stop = AtomicBool::new(false);
        let aux_command = self.options.aux_command.clone();
        let log_file = self.options.log_file.clone();
        let log_delay = self.options.log_delay;
        let console = &mut self.console;
        let aux = self.aux.as_mut();
        let artifacts = self.artifacts.as_mut();

        let (output, aux_output) = thread::scope(|scope| {
            let aux_handle = match (aux, aux_command) {
                (Some(aux), Some(command)) => Some(scope.spawn(move || aux.command(&command, cancel))),
                _ => None,
            };
            let log_handle = match (artifacts, log_file) {
                (Some(artifacts), Some(log_file)) => {
                    let stop = &stop;
                    let destination = iteration_dir.join(&log_file);
                    Some(scope.spawn(move || {
                        while !stop.load(Ordering::SeqCst) && !cancel.is_cancelled() {
                            if let Err(e) = artifacts.fetch(&log_file, &destination) {
                                debug!("Log not available yet: {}", e);
                            }
                            wait_or_stop(log_delay, stop);
                        }
                    }))
                }
                _ => None,
            };

            let output = console.read_until(cancel);
            stop.store(true, Ordering::SeqCst);
            let aux_output = aux_handle.map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Config("companion console thread panicked".to_string())))
            });
            if let Some(handle) = log_handle {
                if handle.join().is_err() {
                    warn!("Log polling thread panicked");
                }
            }
            (output, aux_output)
        });

        cancel.check()?;
        let mut output = output?;
        if let Some(aux_output) = aux_output {
            let aux_output = aux_output?;
            if output.error.is_none() {
                output.error = aux_output.error.map(|e| format!("Companion: {}", e));
            }
        }
        Ok(output)
    }

    /// Turns console output into an observation, fetching and comparing the
    /// output artifact when the workload completed.
    fn observe(&mut self, output: ConsoleOutput, iteration_dir: &Path) -> Result<Observation> {
        let mut observation = Observation {
            execution_error: output.error,
            detected_errors: output.detected_errors,
            ..Default::default()
        };
        if observation.execution_error.is_some() {
            return Ok(observation);
        }
        if let (Some(name), Some(gold), Some(artifacts)) =
            (&self.options.output_file, &self.options.gold_output, self.artifacts.as_mut())
        {
            let destination = iteration_dir.join(name);
            match artifacts.fetch(name, &destination) {
                Ok(()) => {
                    let gold = fs::read(gold).map_err(|e| Error::file(gold, e))?;
                    let data = fs::read(&destination).map_err(|e| Error::file(&destination, e))?;
                    observation.data_diff = Some(console::similarity(&gold, &data));
                }
                Err(e) => observation.transfer_error = Some(e.to_string()),
            }
        }
        Ok(observation)
    }

    pub fn close(&mut self) {
        self.transition(CampaignState::Closed);
    }
}

/// Sleeps for `delay` in short slices so that `stop` is seen quickly.
fn wait_or_stop(delay: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(10);
    let deadline = Instant::now() + delay;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::backend::StateDiff;
    use super::*;
    use crate::checkpoint::MemoryDiff;
    use crate::injection::{InjectionDescriptor, InjectionRecord, Timing};
    use crate::targets::Catalog;
    use itertools::Itertools;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    /// Backend that records its calls and pretends to inject.
    struct FakeBackend {
        calls: Arc<Mutex<Vec<String>>>,
        prepare_failures: usize,
        report: Option<String>,
        memory_diffs: Vec<MemoryDiff>,
    }

    impl InjectorBackend for FakeBackend {
        fn error_category(&self) -> Category {
            Category::DebuggerError
        }
        fn is_live(&self) -> bool {
            true
        }
        fn window(&self) -> (u64, u64) {
            (100, 200)
        }
        fn timing(&self, value: u64) -> Timing {
            Timing::Cycle(value)
        }
        fn prepare(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("prepare".to_string());
            if self.prepare_failures > 0 {
                self.prepare_failures -= 1;
                return Err(Error::Disconnected {
                    channel: "fake".to_string(),
                });
            }
            Ok(())
        }
        fn inject(
            &mut self,
            injections: &[InjectionDescriptor],
            start_workload: &mut dyn FnMut() -> Result<()>,
        ) -> Result<InjectionReport> {
            start_workload()?;
            self.calls.lock().unwrap().push(format!("inject {}", injections.len()));
            if let Some(reason) = &self.report {
                return Ok(InjectionReport::NotInjected(reason.clone()));
            }
            Ok(InjectionReport::Injected(
                injections
                    .iter()
                    .map(|i| InjectionRecord {
                        descriptor: i.clone(),
                        gold_value: "0x0".to_string(),
                        injected_value: "0x1".to_string(),
                        processor_mode: None,
                        register_access: None,
                        success: true,
                    })
                    .collect(),
            ))
        }
        fn inspect(&mut self, _iteration_dir: &Path) -> Result<StateDiff> {
            Ok(StateDiff {
                memory_diffs: self.memory_diffs.clone(),
                ..Default::default()
            })
        }
        fn stop(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }
        fn recover(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("recover".to_string());
            Ok(())
        }
        fn take_output(&mut self) -> String {
            "debugger".to_string()
        }
    }

    /// Console replaying a list of outputs.
    struct FakeConsole {
        outputs: Vec<ConsoleOutput>,
        commands: Arc<Mutex<Vec<String>>>,
        /// Printed after the workload returned.
        late: Option<String>,
        /// Never sees the prompt.
        hangs: bool,
    }

    impl Console for FakeConsole {
        fn start(&mut self, command: &str) -> Result<()> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(())
        }
        fn boot(&mut self, _cancel: &CancelToken) -> Result<()> {
            self.commands.lock().unwrap().push("boot".to_string());
            Ok(())
        }
        fn drain(&mut self) -> Result<ConsoleOutput> {
            Ok(ConsoleOutput {
                returned: true,
                error: self.late.take(),
                ..Default::default()
            })
        }
        fn read_until(&mut self, cancel: &CancelToken) -> Result<ConsoleOutput> {
            while self.hangs {
                cancel.check()?;
                sleep(Duration::from_millis(5));
            }
            if self.outputs.is_empty() {
                return Ok(ConsoleOutput {
                    returned: true,
                    ..Default::default()
                });
            }
            Ok(self.outputs.remove(0))
        }
        fn interrupt(&mut self) -> Result<()> {
            Ok(())
        }
        fn take_output(&mut self) -> String {
            "dut".to_string()
        }
    }

    fn options(dir: &Path) -> CampaignOptions {
        CampaignOptions {
            command: "./fib".to_string(),
            aux_command: None,
            injections: 1,
            latent_iterations: 2,
            output_file: None,
            gold_output: None,
            log_file: None,
            log_delay: Duration::from_millis(10),
            work_dir: dir.to_path_buf(),
            prepare_attempts: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn campaign(
        dir: &Path,
        backend: FakeBackend,
        outputs: Vec<ConsoleOutput>,
    ) -> (Campaign<FakeBackend>, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let console = FakeConsole {
            outputs,
            commands: commands.clone(),
            late: None,
            hangs: false,
        };
        (Campaign::new(0, backend, Box::new(console), options(dir)), commands)
    }

    fn fake_backend(prepare_failures: usize, report: Option<&str>) -> (FakeBackend, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            FakeBackend {
                calls: calls.clone(),
                prepare_failures,
                report: report.map(str::to_string),
                memory_diffs: Vec::new(),
            },
            calls,
        )
    }

    #[test]
    fn masked_iteration_runs_latent_passes() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(1));
        let (backend, calls) = fake_backend(1, None);
        let (mut campaign, commands) = campaign(dir.path(), backend, vec![]);

        let result = campaign.run_iteration(7, &mut selector, &CancelToken::new());
        assert_eq!(result.outcome(), Outcome::new(Category::NoError, outcome::MASKED_FAULTS));
        assert_eq!(result.injections.len(), 1);
        assert_eq!(result.latent_iterations, 2);
        assert_eq!(result.debugger_output, "debugger");
        assert_eq!(calls.lock().unwrap().as_slice(), &["prepare", "prepare", "inject 1"]);
        assert_eq!(commands.lock().unwrap().as_slice(), &["boot", "./fib", "./fib", "./fib"]);
        assert!(dir.path().join("iteration-7").is_dir());
        assert_eq!(campaign.state(), CampaignState::Idle);
    }

    #[test]
    fn post_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(2));
        let (backend, _) = fake_backend(0, None);
        let crashed = ConsoleOutput {
            error: Some("Kernel error".to_string()),
            ..Default::default()
        };
        let (mut campaign, _) = campaign(dir.path(), backend, vec![ConsoleOutput::default(), crashed]);
        let result = campaign.run_iteration(0, &mut selector, &CancelToken::new());
        assert_eq!(
            result.outcome(),
            Outcome::new(Category::PostExecutionError, "Kernel error")
        );
        assert_eq!(result.latent_iterations, 1);
    }

    #[test]
    fn not_injected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(3));
        let (backend, _) = fake_backend(0, Some("value in cache never read"));
        let (mut campaign, _) = campaign(dir.path(), backend, vec![]);
        let result = campaign.run_iteration(0, &mut selector, &CancelToken::new());
        assert_eq!(result.category, Category::NoInjection);
        assert_eq!(result.no_injection.as_deref(), Some("value in cache never read"));
        assert_eq!(result.latent_iterations, 0);
    }

    #[test]
    fn prepare_failures_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(4));
        let (backend, calls) = fake_backend(10, None);
        let (mut campaign, _) = campaign(dir.path(), backend, vec![]);
        let result = campaign.run_iteration(0, &mut selector, &CancelToken::new());
        assert_eq!(result.outcome(), Outcome::new(Category::DebuggerError, "Disconnected"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| *c == "prepare").count(), 3);
        assert_eq!(calls.last().map(String::as_str), Some("recover"));
    }

    #[test]
    fn cancelled_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(5));
        let (backend, calls) = fake_backend(0, None);
        let (mut campaign, _) = campaign(dir.path(), backend, vec![]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = campaign.run_iteration(0, &mut selector, &cancel);
        assert_eq!(result.outcome(), Outcome::interrupted());
        assert_eq!(calls.lock().unwrap().as_slice(), &["stop"]);
    }

    #[test]
    fn dut_boots_after_each_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(6));
        let (backend, _) = fake_backend(0, None);
        let (mut campaign, commands) = campaign(dir.path(), backend, vec![]);
        for iteration in 0..2 {
            campaign.run_iteration(iteration, &mut selector, &CancelToken::new());
        }
        let commands = commands.lock().unwrap();
        let boots: Vec<usize> = commands.iter().positions(|c| c == "boot").collect();
        assert_eq!(boots.len(), 2);
        assert_eq!(commands[boots[0] + 1], "./fib");
        assert_eq!(commands[boots[1] + 1], "./fib");
    }

    #[test]
    fn memory_differences_are_latent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(7));
        let (mut backend, _) = fake_backend(0, None);
        backend.memory_diffs = vec![MemoryDiff {
            image: "ddr.raw".to_string(),
            block: 0x2000,
        }];
        let (mut campaign, _) = campaign(dir.path(), backend, vec![]);
        let result = campaign.run_iteration(0, &mut selector, &CancelToken::new());
        assert_eq!(result.num_memory_diffs, 1);
        assert_eq!(result.memory_diffs[0].block, 0x2000);
        assert_eq!(result.num_register_diffs, 0);
        assert_eq!(result.outcome(), Outcome::new(Category::NoError, outcome::LATENT_FAULTS));
    }

    #[test]
    fn late_console_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(8));
        let (backend, _) = fake_backend(0, None);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let console = FakeConsole {
            outputs: vec![],
            commands,
            late: Some("Kernel error".to_string()),
            hangs: false,
        };
        let mut campaign = Campaign::new(0, backend, Box::new(console), options(dir.path()));
        let result = campaign.run_iteration(0, &mut selector, &CancelToken::new());
        assert_eq!(
            result.outcome(),
            Outcome::new(Category::PostExecutionError, "Kernel error")
        );
        assert_eq!(result.latent_iterations, 2);
    }

    #[test]
    fn cancel_while_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin(crate::targets::Architecture::A9).unwrap();
        let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(9));
        let (backend, calls) = fake_backend(0, None);
        let console = FakeConsole {
            outputs: vec![],
            commands: Arc::new(Mutex::new(Vec::new())),
            late: None,
            hangs: true,
        };
        let mut campaign = Campaign::new(0, backend, Box::new(console), options(dir.path()));
        let cancel = CancelToken::new();
        let started = Instant::now();
        let result = thread::scope(|scope| {
            scope.spawn(|| {
                sleep(Duration::from_millis(50));
                cancel.cancel();
            });
            campaign.run_iteration(0, &mut selector, &cancel)
        });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.outcome(), Outcome::interrupted());
        assert_eq!(calls.lock().unwrap().last().map(String::as_str), Some("stop"));
    }
}
