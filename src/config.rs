use clap::{Parser, ValueEnum};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

use crate::campaign::console::DETECTED_ERRORS_PATTERN;
use crate::checkpoint::memory::DEFAULT_BLOCK_SIZE;
use crate::targets::Architecture;

/// Parse hex address strings to u64 values
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(cleaned, 16).map_err(|e| format!("Invalid hex address '{}': {}", s, e))
}

/// Custom deserializer for an optional address given as hex string or number
fn deserialize_hex<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => parse_hex(&s).map(Some).map_err(de::Error::custom),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom("Invalid number for address")),
        Some(_) => Err(de::Error::custom("Address must be a string or number")),
    }
}

/// What the program does
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Run the injection campaign
    Inject,
    /// Golden run: time the application and store the gold output
    Setup,
    /// Import a text trace dump into the trace store
    ImportTrace,
    /// Rebuild the injected checkpoint of a logged iteration
    Regenerate,
}

/// How injections are performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Live DUT behind a debug probe
    Probe,
    /// Checkpoints of a simulator
    Checkpoint,
}

/// Connections of one DUT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// Probe or simulator command line, `host:port`.
    pub debugger: String,
    /// Serial console of the DUT, `host:port`.
    pub console: String,
    /// Console of the companion device.
    #[serde(default)]
    pub aux_console: Option<String>,
    /// Artifact directory of this DUT, overrides the shared one.
    #[serde(default)]
    pub artifacts: Option<PathBuf>,
}

/// Configuration structure that can be loaded from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_mode")]
    pub mode: Mode,
    #[serde(default = "Config::default_backend")]
    pub backend: Backend,
    #[serde(default = "Config::default_architecture")]
    pub architecture: Architecture,
    /// Catalog file replacing the builtin one.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub indices: Vec<usize>,
    #[serde(default = "Config::default_injections")]
    pub injections: usize,
    #[serde(default = "Config::default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    /// Seconds to wait for a debugger response.
    #[serde(default = "Config::default_timeout")]
    pub timeout: f64,
    /// Seconds a workload or a checkpoint transfer may take.
    #[serde(default = "Config::default_run_timeout")]
    pub run_timeout: f64,
    #[serde(default = "Config::default_command")]
    pub command: String,
    #[serde(default)]
    pub aux_command: Option<String>,
    #[serde(default = "Config::default_prompt")]
    pub prompt: String,
    /// User name sent when the DUT asks for a login after a reset.
    #[serde(default = "Config::default_username")]
    pub username: String,
    /// Command run once the DUT is logged in.
    #[serde(default)]
    pub login_command: Option<String>,
    /// Seconds a reset DUT may take to boot.
    #[serde(default = "Config::default_boot_timeout")]
    pub boot_timeout: f64,
    /// Additional console messages marking a failed execution.
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default = "Config::default_detected_errors")]
    pub detected_errors: String,
    #[serde(default)]
    pub latent_iterations: usize,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default = "Config::default_gold_output")]
    pub gold_output: PathBuf,
    #[serde(default)]
    pub log_file: Option<String>,
    /// Seconds between two fetches of `log_file`.
    #[serde(default = "Config::default_log_delay")]
    pub log_delay: f64,
    /// Directory the DUT writes its artifacts to.
    #[serde(default)]
    pub artifacts: Option<PathBuf>,
    #[serde(default = "Config::default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "Config::default_result_log")]
    pub result_log: PathBuf,
    #[serde(default = "Config::default_trace_db")]
    pub trace_db: PathBuf,
    /// Trace dump read by `import-trace`.
    #[serde(default)]
    pub trace_file: Option<PathBuf>,
    /// Cache target whose geometry maps trace addresses to sets.
    #[serde(default)]
    pub cache_target: Option<String>,
    #[serde(default, deserialize_with = "deserialize_hex")]
    pub start_tag: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_hex")]
    pub end_tag: Option<u64>,
    #[serde(default = "Config::default_miss_latency")]
    pub miss_latency: u64,
    #[serde(default = "Config::default_cycle_rate")]
    pub cycle_rate: u64,
    #[serde(default)]
    pub object_prefix: String,
    #[serde(default = "Config::default_gold_dir")]
    pub gold_dir: PathBuf,
    #[serde(default)]
    pub checkpoints: u64,
    #[serde(default)]
    pub checkpoint_interval: u64,
    /// Granularity of the reported memory image differences.
    #[serde(default = "Config::default_memory_block_size")]
    pub memory_block_size: u64,
    #[serde(default = "Config::default_attempts")]
    pub attempts: usize,
    #[serde(default = "Config::default_retry_delay")]
    pub retry_delay: f64,
    /// Iteration rebuilt by `regenerate`.
    #[serde(default)]
    pub iteration: Option<usize>,
    /// Log level: "off", "error", "warn", "info", "debug", "trace".
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
}

impl Config {
    // Keep defaults in sync with CLI defaults
    fn default_mode() -> Mode {
        Mode::Inject
    }

    fn default_backend() -> Backend {
        Backend::Probe
    }

    fn default_architecture() -> Architecture {
        Architecture::A9
    }

    fn default_injections() -> usize {
        1
    }

    fn default_iterations() -> usize {
        1
    }

    fn default_timeout() -> f64 {
        30.0
    }

    fn default_run_timeout() -> f64 {
        300.0
    }

    fn default_command() -> String {
        String::new()
    }

    fn default_prompt() -> String {
        "root@zynq:~#".to_string()
    }

    fn default_username() -> String {
        "root".to_string()
    }

    fn default_boot_timeout() -> f64 {
        60.0
    }

    fn default_detected_errors() -> String {
        DETECTED_ERRORS_PATTERN.to_string()
    }

    fn default_gold_output() -> PathBuf {
        PathBuf::from("gold_output")
    }

    fn default_log_delay() -> f64 {
        5.0
    }

    fn default_work_dir() -> PathBuf {
        PathBuf::from("campaign")
    }

    fn default_result_log() -> PathBuf {
        PathBuf::from("results.jsonl")
    }

    fn default_trace_db() -> PathBuf {
        PathBuf::from("trace.sqlite")
    }

    fn default_miss_latency() -> u64 {
        100
    }

    fn default_cycle_rate() -> u64 {
        666_666_667
    }

    fn default_gold_dir() -> PathBuf {
        PathBuf::from("gold")
    }

    fn default_memory_block_size() -> u64 {
        DEFAULT_BLOCK_SIZE
    }

    fn default_attempts() -> usize {
        3
    }

    fn default_retry_delay() -> f64 {
        1.0
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_str(&content)
    }

    /// Parse configuration from JSON5 text
    pub fn from_str(content: &str) -> Result<Self, String> {
        json5::from_str(content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Create Config from command line arguments
    pub fn from_args(args: &Args) -> Result<Self, String> {
        let mut config = Self::from_str("{}")?;
        config.override_with_args(args);
        Ok(config)
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Only override options explicitly given by the user
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        if let Some(backend) = args.backend {
            self.backend = backend;
        }
        if let Some(iterations) = args.iterations {
            self.iterations = iterations;
        }
        if let Some(injections) = args.injections {
            self.injections = injections;
        }
        if !args.targets.is_empty() {
            self.targets = args.targets.clone();
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if args.catalog.is_some() {
            self.catalog = args.catalog.clone();
        }
        if args.trace_file.is_some() {
            self.trace_file = args.trace_file.clone();
        }
        if args.iteration.is_some() {
            self.iteration = args.iteration;
        }
        if args.start_tag.is_some() {
            self.start_tag = args.start_tag;
        }
        if args.end_tag.is_some() {
            self.end_tag = args.end_tag;
        }
        if let Some(log_level) = &args.log_level {
            self.log_level = log_level.clone();
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_timeout)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.boot_timeout)
    }

    pub fn log_delay(&self) -> Duration {
        Duration::from_secs_f64(self.log_delay)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }

    /// Target restriction, `None` selects every target.
    pub fn selected_targets(&self) -> Option<Vec<String>> {
        (!self.targets.is_empty()).then(|| self.targets.clone())
    }

    pub fn selected_indices(&self) -> Option<Vec<usize>> {
        (!self.indices.is_empty()).then(|| self.indices.clone())
    }
}

/// Public function to parse hex addresses, used by CLI argument parser
pub fn parse_hex_address(s: &str) -> Result<u64, String> {
    parse_hex(s)
}

/// Command-line arguments structure for the injector.
///
/// Options given here override the values of the configuration file.
///
/// # Fields
///
/// * `config` - Load configuration from JSON5 file.
/// * `mode` - `inject`, `setup`, `import-trace` or `regenerate`.
/// * `backend` - `probe` for a live DUT, `checkpoint` for the simulator.
/// * `iterations` - Number of iterations of the campaign.
/// * `injections` - Number of injections per iteration.
/// * `targets` - Restrict injections to these catalog targets.
/// * `seed` - Seed of the random target selection.
/// * `catalog` - Catalog file replacing the builtin one.
/// * `trace_file` - Trace dump read by `import-trace`.
/// * `iteration` - Iteration rebuilt by `regenerate`.
/// * `start_tag` / `end_tag` - Instruction addresses bounding the injection window.
/// * `log_level` - Log level, `RUST_LOG` takes precedence.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// What to do
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// How injections are performed
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Number of iterations
    #[arg(short, long)]
    pub iterations: Option<usize>,

    /// Number of injections per iteration
    #[arg(short = 'n', long)]
    pub injections: Option<usize>,

    /// Injection targets, all catalog targets if omitted
    ///   E.g.: --targets CPU CACHE_L2
    #[arg(short, long, value_delimiter = ' ', num_args = 1.., verbatim_doc_comment)]
    pub targets: Vec<String>,

    /// Seed of the target selection
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Catalog file replacing the builtin one
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Trace dump to import
    #[arg(long)]
    pub trace_file: Option<PathBuf>,

    /// Iteration to regenerate
    #[arg(long)]
    pub iteration: Option<usize>,

    /// Address of the first instruction of the injection window
    #[arg(long, value_parser = parse_hex_address)]
    pub start_tag: Option<u64>,

    /// Address of the last instruction of the injection window
    #[arg(long, value_parser = parse_hex_address)]
    pub end_tag: Option<u64>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config.mode, Mode::Inject);
        assert_eq!(config.backend, Backend::Probe);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.run_timeout(), Duration::from_secs(300));
        assert_eq!(config.cycle_rate, 666_666_667);
        assert_eq!(config.detected_errors, DETECTED_ERRORS_PATTERN);
        assert_eq!(config.selected_targets(), None);
        assert_eq!(config.start_tag, None);
        assert_eq!(config.username, "root");
        assert_eq!(config.boot_timeout(), Duration::from_secs(60));
        assert_eq!(config.memory_block_size, 8192);
    }

    #[test]
    fn json5_config() {
        let config = Config::from_str(
            r#"{
                // Simulator campaign
                mode: "inject",
                backend: "checkpoint",
                targets: ["CPU", "CACHE_L2"],
                iterations: 500,
                start_tag: "0x100a4",
                end_tag: 65792,
                workers: [
                    { debugger: "localhost:4444", console: "localhost:4000" },
                    { debugger: "localhost:4445", console: "localhost:4001", aux_console: "localhost:4002" },
                ],
                checkpoints: 50,
                checkpoint_interval: 1000000,
            }"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Checkpoint);
        assert_eq!(config.iterations, 500);
        assert_eq!(config.start_tag, Some(0x100a4));
        assert_eq!(config.end_tag, Some(65792));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].aux_console.as_deref(), Some("localhost:4002"));
        assert_eq!(
            config.selected_targets(),
            Some(vec!["CPU".to_string(), "CACHE_L2".to_string()])
        );
        assert!(Config::from_str("{ start_tag: \"xyz\" }").is_err());
        assert!(Config::from_str("{ mode: \"explode\" }").is_err());
    }

    #[test]
    fn args_override_config() {
        let mut config = Config::from_str("{ iterations: 10, seed: 1 }").unwrap();
        let args = Args::parse_from([
            "seu_injector",
            "--mode",
            "setup",
            "--iterations",
            "20",
            "--start-tag",
            "0x8000",
        ]);
        config.override_with_args(&args);
        assert_eq!(config.mode, Mode::Setup);
        assert_eq!(config.iterations, 20);
        assert_eq!(config.seed, Some(1));
        assert_eq!(config.start_tag, Some(0x8000));
    }

    #[test]
    fn hex() {
        assert_eq!(parse_hex("0x1F"), Ok(0x1f));
        assert_eq!(parse_hex("ff"), Ok(0xff));
        assert!(parse_hex("0xZZ").is_err());
    }
}
