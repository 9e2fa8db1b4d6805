use seu_injector::campaign::backend::InjectionReport;
use seu_injector::campaign::outcome::{
    merge_latent_pass, Observation, CORRECTED_DATA_ERROR, LATENT_FAULTS, MASKED_FAULTS,
};
use seu_injector::debugger::{Breakpoints, Debugger, ProbeState, ScriptedConnection};
use seu_injector::prelude::*;
use seu_injector::targets::CacheGeometry;
use seu_injector::trace::residency::CacheResidency;
use seu_injector::trace::{Direction, TraceRecord};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const GEOMETRY: CacheGeometry = CacheGeometry {
    ways: 2,
    sets: 16,
    line_bytes: 32,
};

const CPU_CATALOG: &str = r#"{
    CPU: {
        count: 2,
        core: true,
        object: "cpu",
        type: "cortex-a9",
        registers: {
            pc: {},
            gprs: { count: [2, 2] },
        },
    },
}"#;

const CACHE_CATALOG: &str = r#"{
    L2: {
        cache: { ways: 2, sets: 16, line_bytes: 32 },
        registers: { data: { count: [16, 2], bits: 256 } },
    },
}"#;

const GOLD_CONFIG: &str = "#SIMICS-CONF-1\n\
OBJECT DUT_cpu[0] TYPE cortex-a9 {\n\
\tpc: 0x100\n\
\tgprs: ((0x0, 0x1),\n\
\t       (0x2, 0x3))\n\
}\n\
OBJECT DUT_cpu[1] TYPE cortex-a9 {\n\
\tpc: 0x200\n\
\tgprs: ((0x10, 0x11),\n\
\t       (0x12, 0x13))\n\
}\n";

fn record(cycles: u64, cycles_diff: u64, pc: u64, direction: Direction, address: u64) -> TraceRecord {
    TraceRecord {
        cycles,
        cycles_diff,
        pc,
        direction,
        address,
        mnemonic: match direction {
            Direction::Load => "ldr".to_string(),
            Direction::Store => "str".to_string(),
        },
        cache_set: GEOMETRY.set_of(address),
    }
}

/// Golden run of a loop reading the word at 0x1004 twice before overwriting it
fn trace_store() -> TraceStore {
    let mut store = TraceStore::open_in_memory().unwrap();
    store
        .insert_records(&[
            record(100, 200, 0x200, Direction::Load, 0x1000),
            record(150, 5, 0x204, Direction::Load, 0x1004),
            record(180, 5, 0x204, Direction::Load, 0x1004),
            record(220, 5, 0x208, Direction::Store, 0x1004),
        ])
        .unwrap();
    store.log_tags(0x100, 0x300).unwrap();
    store.log_start_end(50, 1000).unwrap();
    store
}

fn gold_checkpoint(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("config"), GOLD_CONFIG).unwrap();
    fs::write(dir.join("memory.craff"), [0xde, 0xad, 0xbe, 0xef]).unwrap();
}

#[test]
/// Test for checkpoint regeneration
///
/// Injects a randomly chosen bit into a gold checkpoint and rebuilds the
/// injected checkpoint from the logged record. Both must be byte identical.
fn regenerated_checkpoint_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let gold = dir.path().join("checkpoint-0");
    gold_checkpoint(&gold);
    let catalog = Catalog::from_str(CPU_CATALOG).unwrap();
    let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(42));
    let injector = CheckpointInjector::new(&catalog, "DUT_");

    for i in 0..10 {
        let injection = selector.choose_injection(Some(Timing::Step(0))).unwrap();
        let injected = dir.path().join(format!("injected-{}", i));
        let record = injector.inject(&gold, &injected, &injection).unwrap();
        assert_ne!(record.gold_value, record.injected_value);
        assert!(record.success);

        let regenerated = dir.path().join(format!("regenerated-{}", i));
        let again = injector.regenerate(&gold, &regenerated, &record).unwrap();
        assert_eq!(again.injected_value, record.injected_value);
        assert_eq!(
            fs::read(injected.join("config")).unwrap(),
            fs::read(regenerated.join("config")).unwrap()
        );
        assert_eq!(fs::read(regenerated.join("memory.craff")).unwrap(), [0xde, 0xad, 0xbe, 0xef]);
        assert_ne!(fs::read_to_string(injected.join("config")).unwrap(), GOLD_CONFIG);
    }
}

#[test]
/// Test for a failed injection
///
/// A register missing from the checkpoint must not leave a partial checkpoint behind.
fn failed_injection_leaves_no_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let gold = dir.path().join("checkpoint-0");
    gold_checkpoint(&gold);
    fs::write(gold.join("config"), GOLD_CONFIG.replace("\tpc: 0x200\n", "")).unwrap();
    let catalog = Catalog::from_str(CPU_CATALOG).unwrap();
    let injector = CheckpointInjector::new(&catalog, "DUT_");
    let injection = InjectionDescriptor {
        target: "CPU".to_string(),
        target_index: Some(1),
        register: "pc".to_string(),
        register_alias: None,
        register_index: None,
        bit: 3,
        field: None,
        num_bits: 32,
        time: Some(Timing::Step(0)),
    };
    let injected = dir.path().join("injected");
    assert!(injector.inject(&gold, &injected, &injection).is_err());
    assert!(!injected.exists());
}

#[test]
/// Test for the cache residency queries
///
/// A load at cycle 100 brings line 0x1000 into set 0, a store at 220 overwrites word 0x1004.
fn cache_residency() {
    let store = trace_store();
    let residency = CacheResidency::new(&store, GEOMETRY, 100);
    assert_eq!(residency.previous_access(200, 0, 2).unwrap(), vec![0x1000]);
    assert!(residency.previous_access(100, 0, 2).unwrap().is_empty());

    let consumers = residency.next_access(100, 0, 0x1004).unwrap();
    let cycles: Vec<u64> = consumers.iter().map(|r| r.cycles).collect();
    assert_eq!(cycles, vec![150, 180, 220]);
    assert!(consumers.last().unwrap().is_store());
    assert_eq!(residency.skip_count(50, 180, 0x204).unwrap(), 1);
}

fn probe(responses: &[&str]) -> OpenOcd<ScriptedConnection> {
    let mut connection = ScriptedConnection::new(responses.iter().copied());
    connection.push_output("Open On-Chip Debugger\r\n> ");
    OpenOcd::new(connection, Duration::from_millis(200)).unwrap()
}

const HALTED: &str = "\r\ntarget state: halted\r\ntarget state: halted\r\n> ";
const PROMPT: &str = "\r\n> ";

#[test]
/// Test for break_until
///
/// Skipping two hits needs two resume/wait/step rounds before the final resume.
fn break_until_skips_hits() {
    let mut responses = vec![HALTED, "\r\nbreakpoint set at 0x00000204\r\n> "];
    responses.extend([PROMPT; 9]);
    let mut openocd = probe(&responses);
    openocd.halt_dut().unwrap();
    openocd.break_until(0x204, 2).unwrap();

    let sent = openocd.channel().connection().sent();
    assert_eq!(sent[1], "bp 0x204 4 hw");
    assert_eq!(sent.iter().filter(|s| *s == "resume").count(), 3);
    assert_eq!(sent.iter().filter(|s| *s == "step").count(), 2);
    assert_eq!(sent.iter().filter(|s| s.starts_with("wait_halt")).count(), 3);
    assert_eq!(sent.last().unwrap(), "rbp 0x204");
    assert_eq!(openocd.state(), ProbeState::Halted);
}

/// Responses for stopping at one consumer load of r2 and flipping register bit 1
fn consumer_dialogue(gold: &'static str, injected: &'static str) -> Vec<&'static str> {
    vec![
        "\r\nbreakpoint set at 0x00000204\r\n> ",
        PROMPT,
        PROMPT,
        PROMPT,
        "\r\n0x00000204  0xe5932004\tLDR r2, [r3, #4]\r\n> ",
        PROMPT,
        gold,
        PROMPT,
        injected,
    ]
}

#[test]
/// Test for the emulated cache injection on a live DUT
///
/// Bit 33 of the line at 0x1000 lives in word 0x1004, which is read twice by
/// the load at 0x204 before being overwritten. Both loads get register bit 1 flipped.
fn probe_cache_injection() {
    let mut responses = vec![
        HALTED,
        "\r\nbreakpoint set at 0x00000100\r\n> ",
        PROMPT,
        PROMPT,
        PROMPT,
    ];
    responses.extend(consumer_dialogue(
        "\r\nr2 (/32): 0x00000010\r\n> ",
        "\r\nr2 (/32): 0x00000012\r\n> ",
    ));
    responses.extend(consumer_dialogue(
        "\r\nr2 (/32): 0x00000020\r\n> ",
        "\r\nr2 (/32): 0x00000022\r\n> ",
    ));
    responses.push(PROMPT);

    let catalog = Arc::new(Catalog::from_str(CACHE_CATALOG).unwrap());
    let mut backend = ProbeBackend::new(probe(&responses), catalog, trace_store(), 100, 1_000_000).unwrap();
    assert_eq!(backend.window(), (50, 1000));

    let injection = InjectionDescriptor {
        target: "L2".to_string(),
        target_index: None,
        register: "data".to_string(),
        register_alias: None,
        register_index: Some(vec![0, 0]),
        bit: 33,
        field: None,
        num_bits: 256,
        time: Some(Timing::Cycle(120)),
    };
    let mut started = 0;
    let report = backend
        .inject(&[injection], &mut || {
            started += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(started, 1);

    let InjectionReport::Injected(records) = report else {
        panic!("expected an injection, got {:?}", report);
    };
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].gold_value, "0x10");
    assert_eq!(records[0].injected_value, "0x12");
    assert_eq!(records[1].injected_value, "0x22");
    assert!(records.iter().all(|r| r.success));
    assert_eq!(records[0].register_access.as_deref(), Some("r2 @ 0x204"));

    let sent = backend.debugger().channel().connection().sent();
    assert!(sent.contains(&"reg r2 0x12".to_string()));
    assert!(sent.contains(&"reg r2 0x22".to_string()));
    assert_eq!(sent.last().unwrap(), "resume");
    assert_eq!(backend.debugger().state(), ProbeState::Running);
}

#[test]
/// Test for a cache injection into a line that is never read again
fn probe_cache_injection_not_read() {
    let responses = [
        HALTED,
        "\r\nbreakpoint set at 0x00000100\r\n> ",
        PROMPT,
        PROMPT,
        PROMPT,
        PROMPT,
    ];
    let catalog = Arc::new(Catalog::from_str(CACHE_CATALOG).unwrap());
    let mut backend = ProbeBackend::new(probe(&responses), catalog, trace_store(), 100, 1_000_000).unwrap();
    let injection = InjectionDescriptor {
        target: "L2".to_string(),
        target_index: None,
        register: "data".to_string(),
        register_alias: None,
        register_index: Some(vec![0, 0]),
        // Word 0x1010 of the line
        bit: 128,
        field: None,
        num_bits: 256,
        time: Some(Timing::Cycle(120)),
    };
    match backend.inject(&[injection], &mut || Ok(())).unwrap() {
        InjectionReport::NotInjected(reason) => assert!(reason.contains("never read")),
        other => panic!("unexpected report {:?}", other),
    }
}

#[test]
/// Test for the simulator backend
///
/// The injected checkpoint is built from the gold checkpoint of the chosen step and loaded.
fn checkpoint_backend_injection() {
    let dir = tempfile::tempdir().unwrap();
    let gold_dir = dir.path().join("gold");
    gold_checkpoint(&gold_dir.join("checkpoint-3"));
    let work_dir = dir.path().join("worker-0");
    fs::create_dir_all(&work_dir).unwrap();

    let mut connection = ScriptedConnection::new(["\r\nsimics> ", ""]);
    connection.push_output("Simics 4.8\r\nsimics> ");
    let simics = Simics::new(connection, Duration::from_millis(200), "DUT_").unwrap();
    let catalog = Arc::new(Catalog::from_str(CPU_CATALOG).unwrap());
    let layout = CheckpointLayout {
        gold_dir,
        checkpoints: 5,
        interval: 1000,
        work_dir: work_dir.clone(),
    };
    let mut backend = CheckpointBackend::new(simics, Arc::clone(&catalog), "DUT_", layout.clone());
    assert_eq!(backend.window(), (0, 4));
    backend.prepare().unwrap();

    let injection = InjectionDescriptor {
        target: "CPU".to_string(),
        target_index: Some(1),
        register: "gprs".to_string(),
        register_alias: None,
        register_index: Some(vec![1, 0]),
        bit: 0,
        field: None,
        num_bits: 32,
        time: Some(Timing::Step(3)),
    };
    let report = backend.inject(&[injection], &mut || Ok(())).unwrap();
    let InjectionReport::Injected(records) = report else {
        panic!("expected an injection");
    };
    assert_eq!(records[0].gold_value, "0x12");
    assert_eq!(records[0].injected_value, "0x13");
    let injected = fs::read_to_string(work_dir.join("injected-0").join("config")).unwrap();
    assert!(injected.contains("(0x13, 0x13)"));

    let regenerated = dir.path().join("regenerated");
    CheckpointInjector::new(&catalog, "DUT_")
        .regenerate(&layout.gold(3), &regenerated, &records[0])
        .unwrap();
    assert_eq!(fs::read_to_string(regenerated.join("config")).unwrap(), injected);
}

#[test]
/// Test for the outcome classification of a campaign iteration
fn classification() {
    let corrected = Observation {
        detected_errors: Some(1),
        data_diff: Some(1.0),
        ..Default::default()
    };
    assert_eq!(
        corrected.classify(),
        Outcome::new(Category::DataError, CORRECTED_DATA_ERROR)
    );

    let hung = Observation {
        execution_error: Some("Hanging".to_string()),
        ..Default::default()
    };
    assert_eq!(hung.classify(), Outcome::new(Category::ExecutionError, "Hanging"));

    let latent = Observation {
        register_diffs: 2,
        ..Default::default()
    }
    .classify();
    assert_eq!(latent.outcome, LATENT_FAULTS);
    let masked = Outcome::new(Category::NoError, MASKED_FAULTS);
    assert_eq!(merge_latent_pass(&latent, masked), latent);
    assert_eq!(
        merge_latent_pass(&latent, hung.classify()),
        Outcome::new(Category::PostExecutionError, "Hanging")
    );
}

#[test]
/// Test for loading the builtin catalog the way the command line tool does
fn builtin_catalog_from_args() -> Result<(), String> {
    let config = Config::from_args(&Args::default())?;
    let catalog = Catalog::builtin(config.architecture).map_err(|e| e.to_string())?;
    let mut selector = Selector::new(&catalog, StdRng::seed_from_u64(3));
    for _ in 0..100 {
        selector
            .choose_injection(Some(Timing::Cycle(0)))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

const RESET: &str = "\r\nJTAG tap: zynq.dap tap/device found: 0x4ba00477 (mfg: 0x23b, part: 0xba00, ver: 0x4)\r\n> ";

#[test]
/// Test for preparing a live DUT
///
/// Every iteration starts from a reset, also when the previous one left the DUT hanging.
fn prepare_resets_dut() {
    let catalog = Arc::new(Catalog::from_str(CACHE_CATALOG).unwrap());
    let mut backend = ProbeBackend::new(probe(&[HALTED, RESET, RESET]), catalog, trace_store(), 100, 1_000_000).unwrap();
    backend.stop().unwrap();
    assert_eq!(backend.debugger().state(), ProbeState::Halted);

    backend.prepare().unwrap();
    assert_eq!(backend.debugger().state(), ProbeState::Running);
    backend.prepare().unwrap();
    let sent = backend.debugger().channel().connection().sent();
    assert_eq!(sent, &["halt", "reset", "reset"]);
    assert!(backend.take_output().contains("tap/device found"));
}

#[test]
/// Test for two cache injections into the same word in one iteration
///
/// The first injection at cycle 120 corrupts both loads at 150 and 180. The
/// second one at cycle 160 lies behind the DUT, which is halted at 180, so it
/// only sees the store at 220 and must not set another breakpoint.
fn two_cache_injections() {
    let mut responses = vec![
        HALTED,
        "\r\nbreakpoint set at 0x00000100\r\n> ",
        PROMPT,
        PROMPT,
        PROMPT,
    ];
    responses.extend(consumer_dialogue(
        "\r\nr2 (/32): 0x00000010\r\n> ",
        "\r\nr2 (/32): 0x00000012\r\n> ",
    ));
    responses.extend(consumer_dialogue(
        "\r\nr2 (/32): 0x00000020\r\n> ",
        "\r\nr2 (/32): 0x00000022\r\n> ",
    ));
    responses.push(PROMPT);

    let catalog = Arc::new(Catalog::from_str(CACHE_CATALOG).unwrap());
    let mut backend = ProbeBackend::new(probe(&responses), catalog, trace_store(), 100, 1_000_000).unwrap();
    let injection = |cycle| InjectionDescriptor {
        target: "L2".to_string(),
        target_index: None,
        register: "data".to_string(),
        register_alias: None,
        register_index: Some(vec![0, 0]),
        bit: 33,
        field: None,
        num_bits: 256,
        time: Some(Timing::Cycle(cycle)),
    };
    let report = backend
        .inject(&[injection(120), injection(160)], &mut || Ok(()))
        .unwrap();
    let InjectionReport::Injected(records) = report else {
        panic!("expected an injection, got {:?}", report);
    };
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.descriptor.time == Some(Timing::Cycle(120))));

    let sent = backend.debugger().channel().connection().sent();
    assert_eq!(sent.iter().filter(|s| *s == "bp 0x204 4 hw").count(), 2);
    assert_eq!(sent.last().unwrap(), "resume");
}

#[test]
/// Test for the memory comparison of a monitored checkpoint
///
/// A byte written by the workload shows up as one differing block of the image.
fn checkpoint_memory_differences() {
    let dir = tempfile::tempdir().unwrap();
    let gold_dir = dir.path().join("gold");
    gold_checkpoint(&gold_dir.join("final"));
    let monitored = dir.path().join("monitored");
    gold_checkpoint(&monitored);
    fs::write(monitored.join("memory.craff"), [0xde, 0xad, 0xbe, 0xee]).unwrap();

    let mut connection = ScriptedConnection::new(Vec::<String>::new());
    connection.push_output("Simics 4.8\r\nsimics> ");
    let simics = Simics::new(connection, Duration::from_millis(200), "DUT_").unwrap();
    let layout = CheckpointLayout {
        gold_dir,
        checkpoints: 1,
        interval: 1000,
        work_dir: dir.path().join("worker-0"),
    };
    let catalog = Arc::new(Catalog::from_str(CPU_CATALOG).unwrap());
    let backend = CheckpointBackend::new(simics, catalog, "DUT_", layout).with_memory_block_size(2);
    let diff = backend.compare_with_gold(&monitored).unwrap();
    assert!(diff.register_diffs.is_empty());
    assert_eq!(diff.memory_diffs.len(), 1);
    assert_eq!(diff.memory_diffs[0].image, "memory.craff");
    assert_eq!(diff.memory_diffs[0].block, 2);
    assert!(!diff.persistent);
}
