use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use devpanel_rust_lib::app::classify::{
    DevicePropertyClassifier, GetpropClassifier, LineClassifier, PartitionClassifier,
};
use devpanel_rust_lib::app::config::{config_path, load_config, save_config};
use devpanel_rust_lib::app::dispatcher::Engine;
use devpanel_rust_lib::app::error::ErrorKind;
use devpanel_rust_lib::app::logging::init_logging;
use devpanel_rust_lib::app::models::{
    LogTag, Operation, OperationResult, Outcome, ResultSummary,
};
use devpanel_rust_lib::app::process::locator::{ToolKind, ToolPaths};
use devpanel_rust_lib::app::sinks::NullProgressSink;

const USAGE: &str = concat!(
    "Usage: devpanel_rust [--name NAME] [--stream] [--timeout SECS] ",
    "[--tool adb|fastboot|mtk] [--classify device|getprop|partition] ",
    "[--cancel-after MS] [--json] [--init-config] -- COMMAND [ARGS...]"
);

#[derive(Debug, Clone, Default)]
struct Args {
    name: Option<String>,
    stream: bool,
    timeout: Option<Duration>,
    tool: Option<ToolKind>,
    classifiers: Vec<String>,
    cancel_after: Option<Duration>,
    json: bool,
    init_config: bool,
    command: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--name" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--name requires a value".to_string())?;
                args.name = Some(value);
            }
            "--stream" => {
                args.stream = true;
            }
            "--timeout" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--timeout requires a value".to_string())?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid --timeout value: {value}"))?;
                args.timeout = Some(Duration::from_secs(secs));
            }
            "--tool" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--tool requires a value".to_string())?;
                args.tool =
                    Some(ToolKind::parse(&value).ok_or_else(|| format!("Unknown tool: {value}"))?);
            }
            "--classify" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--classify requires a value".to_string())?;
                args.classifiers.push(value);
            }
            "--cancel-after" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--cancel-after requires a value".to_string())?;
                let millis: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid --cancel-after value: {value}"))?;
                args.cancel_after = Some(Duration::from_millis(millis));
            }
            "--json" => {
                args.json = true;
            }
            "--init-config" => {
                args.init_config = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            "--" => {
                args.command.extend(it.by_ref());
            }
            other if other.starts_with("--") => return Err(format!("Unknown arg: {other}")),
            _ => {
                args.command.push(arg.clone());
                args.command.extend(it.by_ref());
            }
        }
    }

    if args.command.is_empty() && !args.init_config {
        return Err(format!("A command is required\n{USAGE}"));
    }
    Ok(args)
}

fn classifier_for(name: &str) -> Result<Arc<dyn LineClassifier>, String> {
    match name {
        "device" => Ok(Arc::new(DevicePropertyClassifier)),
        "getprop" => Ok(Arc::new(GetpropClassifier)),
        "partition" => Ok(Arc::new(PartitionClassifier)),
        other => Err(format!("Unknown classifier: {other}")),
    }
}

/// Shell-style exit status for the finished operation.
fn exit_code_for(result: &OperationResult) -> i32 {
    match result.outcome() {
        Outcome::Success => 0,
        Outcome::NonZeroExit(code) => code,
        Outcome::Failed(ErrorKind::Timeout) => 124,
        Outcome::Failed(ErrorKind::LaunchNotFound) => 127,
        Outcome::Failed(ErrorKind::Cancelled) => 130,
        Outcome::Failed(ErrorKind::Other(_)) => 1,
    }
}

fn print_line(text: &str, tag: LogTag) {
    match tag {
        LogTag::Raw => println!("{text}"),
        _ => println!("[{tag}] {text}"),
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);

    if args.init_config {
        if let Err(err) = save_config(&config) {
            eprintln!("{err}");
            std::process::exit(1);
        }
        println!("{}", config_path().display());
        if args.command.is_empty() {
            return;
        }
    }

    let argv = match args.tool {
        Some(kind) => {
            let tools = ToolPaths::from_settings(&config.tools);
            if let Err(err) = tools.validate(kind, "") {
                eprintln!("{err}");
                std::process::exit(127);
            }
            tools.argv(kind, args.command.clone())
        }
        None => args.command.clone(),
    };
    let name = args.name.clone().unwrap_or_else(|| argv.join(" "));
    let mut operation = Operation::new(name, argv);
    if args.stream {
        operation = operation.streaming();
    }
    if let Some(timeout) = args.timeout {
        operation = operation.with_timeout(timeout);
    }
    for classifier in &args.classifiers {
        match classifier_for(classifier) {
            Ok(classifier) => operation = operation.with_classifier(classifier),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(2);
            }
        }
    }

    let tick = config.tick_interval();
    let grace = config.cancel_grace();
    let mut engine = Engine::new(config, print_line, NullProgressSink);
    let finished: Arc<Mutex<Option<(i32, ResultSummary)>>> = Arc::new(Mutex::new(None));
    let slot = finished.clone();
    if let Err(err) = engine.submit(operation, move |result| {
        if let Ok(mut slot) = slot.lock() {
            *slot = Some((exit_code_for(result), result.summary()));
        }
    }) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let started = Instant::now();
    let mut cancel_sent: Option<Instant> = None;
    let mut killed = false;
    loop {
        engine.tick();
        if engine.is_idle() {
            break;
        }
        if let Some(after) = args.cancel_after {
            if cancel_sent.is_none() && started.elapsed() >= after {
                engine.on_cancel_requested();
                cancel_sent = Some(Instant::now());
            }
        }
        if let Some(sent) = cancel_sent {
            if !killed && sent.elapsed() >= grace {
                killed = engine.force_kill();
            }
        }
        std::thread::sleep(tick);
    }

    let Some((code, summary)) = finished.lock().ok().and_then(|mut slot| slot.take()) else {
        std::process::exit(1);
    };
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
        );
    }
    std::process::exit(code);
}
