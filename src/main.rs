use clap::Parser;
use colored::Colorize;
use indicatif::ProgressBar;
use itertools::Itertools;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use seu_injector::campaign::console::ArtifactSource;
use seu_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Program to inject single event upsets into a Zynq DUT or its simulator
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_args(&args)?,
    };
    config.override_with_args(&args);

    // RUST_LOG takes precedence over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();

    println!("--- SEU fault injector: {GIT_VERSION} ---\n");

    let catalog = Arc::new(match &config.catalog {
        Some(path) => Catalog::from_file(path),
        None => Catalog::builtin(config.architecture),
    }
    .map_err(|e| e.to_string())?);

    match config.mode {
        Mode::ImportTrace => import_trace(&config, &catalog),
        Mode::Setup => setup(&config, catalog),
        Mode::Inject => inject(&config, catalog),
        Mode::Regenerate => regenerate(&config, &catalog),
    }
}

/// Fills the trace store from a text dump and records the window tags
fn import_trace(config: &Config, catalog: &Catalog) -> Result<(), String> {
    let path = config
        .trace_file
        .as_ref()
        .ok_or("No trace file given (--trace-file)")?;
    let geometry = match &config.cache_target {
        Some(name) => catalog.get(name).and_then(|t| t.cache),
        None => catalog.targets().find_map(|(_, t)| t.cache),
    }
    .ok_or("Catalog has no cache target to map the trace with")?;

    let mut store = TraceStore::open(&config.trace_db).map_err(|e| e.to_string())?;
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let count = store
        .import_trace(BufReader::new(file), &geometry)
        .map_err(|e| e.to_string())?;
    println!("Imported {} accesses into {}", count, config.trace_db.display());
    log_tags(config, &store)
}

fn log_tags(config: &Config, store: &TraceStore) -> Result<(), String> {
    if let (Some(start), Some(end)) = (config.start_tag, config.end_tag) {
        store.log_tags(start, end).map_err(|e| e.to_string())?;
        println!("Injection window tags: 0x{:x} - 0x{:x}", start, end);
    }
    Ok(())
}

/// Golden run on the first worker
fn setup(config: &Config, catalog: Arc<Catalog>) -> Result<(), String> {
    let cancel = CancelToken::new();
    let window = match config.backend {
        Backend::Probe => {
            log_tags(config, &TraceStore::open(&config.trace_db).map_err(|e| e.to_string())?)?;
            let mut campaign = probe_campaigns(config, &catalog)?
                .into_iter()
                .next()
                .ok_or("No worker configured")?;
            campaign.setup(&cancel)
        }
        Backend::Checkpoint => {
            let mut campaign = checkpoint_campaigns(config, &catalog)?
                .into_iter()
                .next()
                .ok_or("No worker configured")?;
            campaign.setup(&cancel)
        }
    }
    .map_err(|e| e.to_string())?;

    if let Some((start, end)) = window {
        println!("Application runs from cycle {} to {}", start, end);
    }
    println!("Golden run {}", "finished".green());
    Ok(())
}

fn inject(config: &Config, catalog: Arc<Catalog>) -> Result<(), String> {
    match config.backend {
        Backend::Probe => {
            let campaigns = probe_campaigns(config, &catalog)?;
            run_campaigns(config, catalog, campaigns)
        }
        Backend::Checkpoint => {
            let campaigns = checkpoint_campaigns(config, &catalog)?;
            run_campaigns(config, catalog, campaigns)
        }
    }
}

/// Runs all workers and writes every finished iteration to the result log
fn run_campaigns<B: InjectorBackend + 'static>(
    config: &Config,
    catalog: Arc<Catalog>,
    campaigns: Vec<Campaign<B>>,
) -> Result<(), String> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| format!("Failed to install interrupt handler: {}", e))?;

    let mut log = ResultLog::open(&config.result_log).map_err(|e| e.to_string())?;
    let selection = Selection {
        targets: config.selected_targets(),
        indices: config.selected_indices(),
    };
    let seed = config.seed.unwrap_or_else(rand::random);
    println!(
        "Running {} iterations on {} workers (seed {})",
        config.iterations,
        campaigns.len(),
        seed
    );

    let bar = ProgressBar::new(config.iterations as u64);
    let pool = WorkerPool::start(
        campaigns,
        catalog,
        selection,
        IterationCounter::new(config.iterations),
        cancel.clone(),
        seed,
    )
    .map_err(|e| e.to_string())?;

    let mut results = Vec::new();
    for result in pool.results().iter() {
        log.append(&result).map_err(|e| e.to_string())?;
        bar.inc(1);
        results.push(result);
    }
    drop(pool);
    bar.finish_and_clear();

    print_summary(&results);
    if cancel.is_cancelled() {
        println!("{}", "Campaign interrupted".yellow());
    }
    Ok(())
}

/// Pretty print the number of iterations per outcome
fn print_summary(results: &[IterationResult]) {
    println!("-> {} iterations executed", results.len());
    let counts = results.iter().counts_by(|r| r.outcome());
    for (outcome, count) in counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.outcome.cmp(&b.0.outcome)))
    {
        let line = format!("{:>6}  {}", count, outcome);
        match outcome.category {
            Category::NoError => println!("{}", line.green()),
            Category::DataError | Category::ExecutionError | Category::PostExecutionError => {
                println!("{}", line.red())
            }
            _ => println!("{}", line.yellow()),
        }
    }
}

/// Rebuilds the first injected checkpoint of a logged iteration
fn regenerate(config: &Config, catalog: &Catalog) -> Result<(), String> {
    let iteration = config.iteration.ok_or("No iteration given (--iteration)")?;
    let result = ResultLog::find(&config.result_log, iteration).map_err(|e| e.to_string())?;
    let record = result
        .injections
        .first()
        .ok_or_else(|| format!("Iteration {} has no injections", iteration))?;
    if result.injections.len() > 1 {
        println!(
            "{}",
            "Only the first injection starts from a gold checkpoint, the others are skipped".yellow()
        );
    }
    let step = match record.descriptor.time {
        Some(Timing::Step(step)) => step,
        _ => return Err(format!("Iteration {} was not a checkpoint injection", iteration)),
    };
    let layout = checkpoint_layout(config, config.work_dir.clone());
    let destination = config.work_dir.join(format!("regenerated-{}", iteration));
    let injector = CheckpointInjector::new(catalog, config.object_prefix.clone());
    injector
        .regenerate(&layout.gold(step), &destination, record)
        .map_err(|e| e.to_string())?;
    println!("Regenerated {} in {}", record.descriptor, destination.display());
    Ok(())
}

fn checkpoint_layout(config: &Config, work_dir: std::path::PathBuf) -> CheckpointLayout {
    CheckpointLayout {
        gold_dir: config.gold_dir.clone(),
        checkpoints: config.checkpoints,
        interval: config.checkpoint_interval,
        work_dir,
    }
}

fn campaign_options(config: &Config, id: usize) -> CampaignOptions {
    CampaignOptions {
        command: config.command.clone(),
        aux_command: config.aux_command.clone(),
        injections: config.injections,
        latent_iterations: config.latent_iterations,
        output_file: config.output_file.clone(),
        gold_output: config.output_file.as_ref().map(|_| config.gold_output.clone()),
        log_file: config.log_file.clone(),
        log_delay: config.log_delay(),
        work_dir: config.work_dir.join(format!("worker-{}", id)),
        prepare_attempts: config.attempts,
        retry_delay: config.retry_delay(),
    }
}

/// Attaches the consoles and the artifact source of a worker
fn attach<B: InjectorBackend>(
    config: &Config,
    id: usize,
    backend: B,
) -> Result<Campaign<B>, String> {
    let worker = &config.workers[id];
    let console = |address: &str| {
        ChannelConsole::new(
            TcpConnection::connect(address, config.timeout())?,
            &config.prompt,
            config.run_timeout(),
            &config.error_messages,
            &config.detected_errors,
        )
        .map(|console| console.with_login(&config.username, config.login_command.clone(), config.boot_timeout()))
    };
    let mut campaign = Campaign::new(
        id,
        backend,
        Box::new(console(&worker.console).map_err(|e| e.to_string())?),
        campaign_options(config, id),
    );
    if let Some(address) = &worker.aux_console {
        campaign = campaign.with_aux(Box::new(console(address).map_err(|e| e.to_string())?));
    }
    if let Some(directory) = worker.artifacts.as_ref().or(config.artifacts.as_ref()) {
        let artifacts: Box<dyn ArtifactSource> = Box::new(LocalArtifacts::new(directory));
        campaign = campaign.with_artifacts(artifacts);
    }
    Ok(campaign)
}

fn probe_campaigns(config: &Config, catalog: &Arc<Catalog>) -> Result<Vec<Campaign<ProbeBackend<OpenOcd>>>, String> {
    (0..config.workers.len())
        .map(|id| {
            let debugger = OpenOcd::connect(&config.workers[id].debugger, config.timeout()).map_err(|e| e.to_string())?;
            let store = TraceStore::open(&config.trace_db).map_err(|e| e.to_string())?;
            let backend = ProbeBackend::new(
                debugger,
                Arc::clone(catalog),
                store,
                config.miss_latency,
                config.cycle_rate,
            )
            .map_err(|e| e.to_string())?;
            attach(config, id, backend)
        })
        .collect()
}

fn checkpoint_campaigns(
    config: &Config,
    catalog: &Arc<Catalog>,
) -> Result<Vec<Campaign<CheckpointBackend<TcpConnection>>>, String> {
    (0..config.workers.len())
        .map(|id| {
            let simics = Simics::connect(&config.workers[id].debugger, config.run_timeout(), &config.object_prefix)
                .map_err(|e| e.to_string())?;
            let layout = checkpoint_layout(config, config.work_dir.join(format!("worker-{}", id)));
            let backend = CheckpointBackend::new(simics, Arc::clone(catalog), &config.object_prefix, layout)
                .with_memory_block_size(config.memory_block_size);
            attach(config, id, backend)
        })
        .collect()
}
