use anyhow::{bail, Context};
use base64::{engine::general_purpose, Engine as _};
use clap::{Arg, Command};
use log::LevelFilter;
use rmt_filter::config::{ConfigLoader, FileConfigLoader, KeyValueConfig, Settings, DEFAULT_CONFIG};
use rmt_filter::controller::CoreController;
use rmt_filter::interceptor::{parse_capture, Direction, QueueBackend};
use rmt_filter::monitor::FilterSession;
use rmt_filter::status::{ConsoleSink, LogSink, RecordingSink, StatusSink};
use serde::Serialize;
use std::io::{BufRead, IsTerminal};
use std::path::Path;
use std::process;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    let matches = Command::new("rmt-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inline chat-traffic spam filter")
        .long_about(
            "rmt-filter diverts chat packets, normalizes their text (decompression,\n\
             encoding detection, confusable folding, deobfuscation) and drops those\n\
             whose weighted rule score reaches the spam threshold.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("rmt-filter.conf"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a commented default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and print the effective settings as YAML")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-payload")
                .long("test-payload")
                .value_name("FILE")
                .help("Normalize and score a single payload file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("base64")
                .long("base64")
                .help("The --test-payload file holds base64 text")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("direction")
                .long("direction")
                .value_name("DIR")
                .help("Direction used for --test-payload (in or out)")
                .default_value("in"),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .help("Run a capture file (<in|out> <base64> per line) through the full pipeline")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print --test-payload and --replay results as JSON")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("rmt-filter.conf");
    let json = matches.get_flag("json");

    let result = if matches.get_flag("test-config") {
        test_config(config_path)
    } else if let Some(payload_file) = matches.get_one::<String>("test-payload") {
        let direction = matches
            .get_one::<String>("direction")
            .map(String::as_str)
            .unwrap_or("in");
        test_payload(config_path, payload_file, matches.get_flag("base64"), direction, json)
    } else if let Some(capture_file) = matches.get_one::<String>("replay") {
        replay(config_path, capture_file, json)
    } else {
        run_shell(config_path)
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Falls back to the built-in defaults when the file does not exist.
fn config_loader(path: &str) -> Box<dyn ConfigLoader> {
    if Path::new(path).exists() {
        Box::new(FileConfigLoader::new(path))
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Box::new(KeyValueConfig::parse(DEFAULT_CONFIG))
    }
}

fn load_settings(path: &str) -> anyhow::Result<Settings> {
    let config = config_loader(path).load()?;
    Settings::from_source(&config).with_context(|| format!("invalid configuration in {path}"))
}

fn generate_default_config(path: &str) {
    match std::fs::write(path, DEFAULT_CONFIG) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(path: &str) -> anyhow::Result<()> {
    println!("Testing configuration {path}...");
    let settings = load_settings(path)?;

    for rule in settings.rules.iter().filter(|rule| !rule.is_valid()) {
        println!("  warning: rule '{}' will never match", rule.name());
    }
    for warning in settings.deobfuscator.cycle_warnings() {
        println!("  warning: {warning}");
    }

    let yaml = serde_yaml::to_string(&settings.summary()).context("failed to render settings")?;
    println!("{yaml}");
    println!("Configuration is valid");
    Ok(())
}

#[derive(Serialize)]
struct PayloadReport {
    direction: Direction,
    encoding: Option<String>,
    inflated: bool,
    text: Option<String>,
    verdict: rmt_filter::Verdict,
}

fn test_payload(
    config_path: &str,
    payload_file: &str,
    is_base64: bool,
    direction: &str,
    json: bool,
) -> anyhow::Result<()> {
    let direction: Direction = direction.parse().map_err(anyhow::Error::msg)?;
    let raw = std::fs::read(payload_file).with_context(|| format!("failed to read {payload_file}"))?;
    let payload = if is_base64 {
        let text = String::from_utf8(raw).context("base64 payload is not text")?;
        general_purpose::STANDARD
            .decode(text.trim())
            .context("invalid base64 payload")?
    } else {
        raw
    };

    let session = FilterSession::from_settings(load_settings(config_path)?, 0);
    let (normalized, verdict) = session.classify(&payload, direction);

    let report = PayloadReport {
        direction,
        encoding: normalized.as_ref().map(|n| n.encoding.to_string()),
        inflated: normalized.as_ref().is_some_and(|n| n.inflated),
        text: normalized.map(|n| n.text),
        verdict,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Payload: {payload_file} ({} bytes, {direction})", payload.len());
    match &report.text {
        Some(text) => {
            println!(
                "Encoding: {}{}",
                report.encoding.as_deref().unwrap_or("unknown"),
                if report.inflated { " (inflated)" } else { "" }
            );
            println!("Normalized: {text:?}");
        }
        None => println!("Normalized: <no text>"),
    }
    println!("Score: {}", report.verdict.score);
    if !report.verdict.matched_rules.is_empty() {
        println!("Matched: {}", report.verdict.matched_rules.join(", "));
    }
    println!("Verdict: {}", report.verdict.classification);
    Ok(())
}

#[derive(Serialize)]
struct ReplayReport {
    packets: usize,
    counters: rmt_filter::Counters,
    messages: Vec<rmt_filter::StatusMessage>,
}

fn replay(config_path: &str, capture_file: &str, json: bool) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(capture_file).with_context(|| format!("failed to read {capture_file}"))?;
    let packets = parse_capture(&content)?;
    let total = packets.len() as u64;

    let recording = Arc::new(RecordingSink::new());
    let sink: Arc<dyn StatusSink> = if json {
        recording.clone()
    } else {
        Arc::new(ConsoleSink::new(std::io::stdout().is_terminal()))
    };

    let backend = Arc::new(QueueBackend::with_packets(packets));
    let mut controller = CoreController::new(config_loader(config_path), backend, sink);
    controller.configure_and_start()?;

    let deadline = Instant::now() + REPLAY_TIMEOUT;
    while controller.counters().total() < total {
        if Instant::now() >= deadline {
            controller.stop();
            bail!(
                "replay timed out: {} of {total} packets processed",
                controller.counters().total()
            );
        }
        thread::sleep(Duration::from_millis(5));
    }
    controller.stop();

    if json {
        let report = ReplayReport {
            packets: total as usize,
            counters: controller.counters(),
            messages: recording.messages(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

enum ShellInput {
    Line(String),
    Interrupt,
    Eof,
}

fn run_shell(config_path: &str) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel();

    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(ShellInput::Interrupt);
    })
    .context("failed to install signal handler")?;

    thread::Builder::new()
        .name("rmt-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(ShellInput::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to read from stdin: {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(ShellInput::Eof);
        })
        .context("failed to spawn stdin reader")?;

    let sink: Arc<dyn StatusSink> = if std::io::stdout().is_terminal() {
        Arc::new(ConsoleSink::new(true))
    } else {
        Arc::new(LogSink)
    };
    let backend = Arc::new(QueueBackend::new());
    let mut controller = CoreController::new(config_loader(config_path), backend.clone(), sink);

    println!("rmt-filter {} shell", env!("CARGO_PKG_VERSION"));
    println!("Commands: start, stop, reload, bypass, ack, status, feed FILE, quit");
    println!("Traffic comes from the in-process queue; use 'feed' to push a capture file into it.");

    for input in rx {
        let line = match input {
            ShellInput::Line(line) => line,
            ShellInput::Interrupt => {
                log::info!("Received shutdown signal, stopping filter...");
                break;
            }
            ShellInput::Eof => break,
        };

        match line.trim() {
            "" => {}
            "start" => {
                if let Err(e) = controller.configure_and_start() {
                    log::error!("Start failed: {e}");
                }
            }
            "stop" => {
                if controller.stop().is_none() {
                    println!("Filter is not running");
                }
            }
            "reload" => {
                if let Err(e) = controller.reload() {
                    log::error!("Reload failed: {e}");
                }
            }
            "bypass" => {
                controller.toggle_bypass();
            }
            "ack" => {
                if controller.acknowledge_fault().is_none() {
                    println!("No fault pending");
                }
            }
            "status" => print_status(&controller),
            "quit" | "exit" => break,
            command if command.starts_with("feed") => {
                let path = command["feed".len()..].trim();
                if path.is_empty() {
                    println!("Usage: feed FILE");
                } else if let Err(e) = feed_capture(&backend, path) {
                    log::error!("Feed failed: {e:#}");
                }
            }
            other => println!("Unknown command '{other}'"),
        }
    }

    controller.stop();
    Ok(())
}

fn feed_capture(backend: &QueueBackend, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let count = backend
        .feed(parse_capture(&content)?)
        .context("filter is not running")?;
    println!("Queued {count} packets from {path}");
    Ok(())
}

fn print_status(controller: &CoreController) {
    let state = controller.state();
    println!("Phase: {:?}", controller.phase());
    println!(
        "Running: {} | Bypass: {} | Stopping: {}",
        state.running, state.bypass_mode, state.stopping
    );
    if state.fault {
        println!(
            "Fault: {}",
            state.fault_reason.as_deref().unwrap_or("unknown fault")
        );
    }
    if let Some(generation) = controller.session_generation() {
        println!("Session: {generation}");
    }
    let workers = controller.worker_states();
    if !workers.is_empty() {
        println!("Workers: {workers:?}");
    }
    controller.report_counters();
}
