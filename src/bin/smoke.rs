use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use devpanel_rust_lib::app::classify::DevicePropertyClassifier;
use devpanel_rust_lib::app::config::{load_config, EngineConfig};
use devpanel_rust_lib::app::dispatcher::Engine;
use devpanel_rust_lib::app::error::ErrorKind;
use devpanel_rust_lib::app::logging::init_logging;
use devpanel_rust_lib::app::models::{Operation, OperationResult, Outcome, SequenceOutcome};
use devpanel_rust_lib::app::sinks::RecordingSink;
use serde::Serialize;
use uuid::Uuid;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Args {
    json: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    started_at: String,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut json = false;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--json" => {
                json = true;
            }
            "-h" | "--help" => {
                return Err("Usage: cargo run --bin smoke -- [--json]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(Args { json })
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F)
where
    F: FnOnce() -> Result<(), String>,
{
    let start = Instant::now();
    let result = f();
    checks.push(SmokeCheck {
        name,
        status: if result.is_ok() { "pass" } else { "fail" },
        duration_ms: start.elapsed().as_millis(),
        error: result.err(),
    });
}

fn new_engine(config: &EngineConfig) -> (Engine, RecordingSink) {
    let sink = RecordingSink::new();
    (Engine::new(config.clone(), sink.clone(), sink.clone()), sink)
}

/// Submits one operation and ticks until its callback ran.
fn run_one(config: &EngineConfig, operation: Operation) -> Result<OperationResult, String> {
    let (mut engine, _sink) = new_engine(config);
    let slot: Arc<Mutex<Option<OperationResult>>> = Arc::new(Mutex::new(None));
    let done = slot.clone();
    engine
        .submit(operation, move |result| {
            if let Ok(mut done) = done.lock() {
                *done = Some(result.clone());
            }
        })
        .map_err(|err| err.to_string())?;
    if !engine.run_until_idle(IDLE_TIMEOUT) {
        return Err("operation did not finish in time".to_string());
    }
    let result = slot
        .lock()
        .map_err(|_| "result lock poisoned".to_string())?
        .take();
    result.ok_or_else(|| "callback never ran".to_string())
}

fn check_collect(config: &EngineConfig) -> Result<(), String> {
    let operation = Operation::from_args("echo chipset", ["sh", "-c", "echo 'HW Chipset: MT6765'"])
        .with_classifier(Arc::new(DevicePropertyClassifier));
    let result = run_one(config, operation)?;
    if result.outcome() != Outcome::Success {
        return Err(format!("unexpected outcome {:?}", result.outcome()));
    }
    match result.device_info.get("chipset").map(String::as_str) {
        Some("MT6765") => Ok(()),
        other => Err(format!("chipset not classified: {other:?}")),
    }
}

fn check_non_zero_exit(config: &EngineConfig) -> Result<(), String> {
    let result = run_one(config, Operation::from_args("false", ["false"]))?;
    match result.outcome() {
        Outcome::NonZeroExit(1) => Ok(()),
        other => Err(format!("expected exit 1, got {other:?}")),
    }
}

fn check_launch_not_found(config: &EngineConfig) -> Result<(), String> {
    let result = run_one(config, Operation::from_args("missing", ["does-not-exist-xyz"]))?;
    match result.error_kind {
        Some(ErrorKind::LaunchNotFound) => Ok(()),
        other => Err(format!("expected launch_not_found, got {other:?}")),
    }
}

fn check_stream_order(config: &EngineConfig) -> Result<(), String> {
    let operation =
        Operation::from_args("stream", ["sh", "-c", "echo a; echo b 1>&2; echo c"]).streaming();
    let result = run_one(config, operation)?;
    if result.lines() != ["a", "b", "c"] {
        return Err(format!("unexpected lines {:?}", result.lines()));
    }
    Ok(())
}

fn check_sequence(config: &EngineConfig) -> Result<(), String> {
    let (mut engine, sink) = new_engine(config);
    let steps = (1..=3)
        .map(|index| Operation::from_args(format!("true #{index}"), ["true"]))
        .collect();
    let outcome: Arc<Mutex<Option<SequenceOutcome>>> = Arc::new(Mutex::new(None));
    let done = outcome.clone();
    engine
        .run_sequence("three trues", steps, None, |_| {}, move |result| {
            if let Ok(mut done) = done.lock() {
                *done = Some(result);
            }
        })
        .map_err(|err| err.to_string())?;
    if !engine.run_until_idle(IDLE_TIMEOUT) {
        return Err("sequence did not finish in time".to_string());
    }
    let outcome = outcome
        .lock()
        .map_err(|_| "outcome lock poisoned".to_string())?
        .take();
    if outcome != Some(SequenceOutcome::Success) {
        return Err(format!("unexpected sequence outcome {outcome:?}"));
    }
    let percents = sink.percents();
    if percents != [0, 33, 67, 100] {
        return Err(format!("unexpected progress {percents:?}"));
    }
    Ok(())
}

fn check_cancel(config: &EngineConfig) -> Result<(), String> {
    let (mut engine, _sink) = new_engine(config);
    let slot: Arc<Mutex<Option<OperationResult>>> = Arc::new(Mutex::new(None));
    let done = slot.clone();
    engine
        .submit(Operation::from_args("sleep", ["sleep", "30"]), move |result| {
            if let Ok(mut done) = done.lock() {
                *done = Some(result.clone());
            }
        })
        .map_err(|err| err.to_string())?;
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(50) {
        engine.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
    if !engine.on_cancel_requested() {
        return Err("cancel was not accepted".to_string());
    }
    if !engine.run_until_idle(config.cancel_grace()) {
        return Err("process did not stop within the grace period".to_string());
    }
    if engine.cancel_enabled() {
        return Err("cancel still enabled after the operation ended".to_string());
    }
    let result = slot
        .lock()
        .map_err(|_| "result lock poisoned".to_string())?
        .take()
        .ok_or_else(|| "callback never ran".to_string())?;
    if !result.is_cancelled() {
        return Err(format!("expected cancelled, got {:?}", result.outcome()));
    }
    Ok(())
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let started_at = chrono::Local::now().to_rfc3339();
    let mut checks: Vec<SmokeCheck> = Vec::new();

    let mut config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);
    config.dispatcher.tick_interval_ms = config.dispatcher.tick_interval_ms.min(20);

    run_check(&mut checks, "collect_success", || check_collect(&config));
    run_check(&mut checks, "collect_non_zero_exit", || check_non_zero_exit(&config));
    run_check(&mut checks, "launch_not_found", || check_launch_not_found(&config));
    run_check(&mut checks, "stream_order", || check_stream_order(&config));
    run_check(&mut checks, "sequence_progress", || check_sequence(&config));
    run_check(&mut checks, "cancel", || check_cancel(&config));

    let status = if checks.iter().all(|check| check.status == "pass") {
        "pass"
    } else {
        "fail"
    };
    let summary = SmokeSummary {
        tool: "devpanel_rust_smoke",
        status,
        trace_id,
        started_at,
        checks,
    };

    let output = if args.json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut lines = vec![
            format!("status: {}", summary.status),
            format!("trace_id: {}", summary.trace_id),
        ];
        for check in &summary.checks {
            match &check.error {
                Some(error) => lines.push(format!("{}: {} ({error})", check.name, check.status)),
                None => lines.push(format!("{}: {}", check.name, check.status)),
            }
        }
        lines.join("\n")
    };

    println!("{output}");
    if summary.status != "pass" {
        std::process::exit(1);
    }
}
