use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use companion::api::{Analyzer, Gateway};
use companion::capture::CommandCapturer;
use companion::events::{self, Event, EventReceiver};
use companion::logging::SessionLog;
use companion::{Config, Mode, Orchestrator, ProviderKind, Selection, Settings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "companion", about = "Screenshot companion -- capture, analyze, iterate")]
struct Cli {
    /// Path to companion.toml (defaults to companion.toml next to this exe)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dotfile with API keys, checked before ./.env and ~/.companion/.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Starting mode: code or general
    #[arg(short, long)]
    mode: Option<String>,

    /// Provider to use: openai, gemini or local
    #[arg(short, long)]
    provider: Option<String>,

    /// Model name for the selected provider
    #[arg(long)]
    model: Option<String>,
}

const HELP: &str = "\
Commands:
  capture                   Take a screenshot into the next slot
  add <file>                Add an existing image file as a screenshot
  analyze                   Analyze the current screenshots now
  reset                     Clear screenshots and previous results
  mode [code|general]       Switch mode (toggles when no argument)
  model <provider> [model]  Select provider/model (\"auto\" to clear)
  providers                 List providers and whether they are usable
  status                    Show slots, mode and worker state
  help                      Show this help
  quit                      Exit";

fn timestamp() -> String {
    chrono::Local::now().format("[%H:%M:%S]").to_string()
}

fn parse_provider(name: &str) -> Result<ProviderKind> {
    match ProviderKind::parse(name) {
        Some(kind) => Ok(kind),
        None => bail!("Unknown provider '{name}' (expected openai, gemini or local)"),
    }
}

// --- Event printer ---

async fn print_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            Event::Status(text) => println!("{} {text}", timestamp()),
            Event::Loading(true) => println!("{} Working...", timestamp()),
            Event::Loading(false) => {}
            Event::ImageAdded { slot, path, data_url } => println!(
                "{} Slot {slot}: {} ({} bytes inline)",
                timestamp(),
                path.display(),
                data_url.len()
            ),
            Event::AnalysisResult(markdown) => {
                println!();
                println!("{markdown}");
                println!();
            }
            Event::ContextReset => println!("{} Screenshots cleared", timestamp()),
            Event::LanguageDetected(language) => {
                println!("{} Detected language: {language}", timestamp())
            }
            Event::ModelChanged { provider, model } => println!(
                "{} Model selection: {} / {}",
                timestamp(),
                provider.map_or_else(|| "auto".to_string(), |p| p.to_string()),
                model.as_deref().unwrap_or("default")
            ),
            Event::ModeChanged(mode) => println!("{} Mode: {mode}", timestamp()),
        }
    }
}

// --- Commands ---

fn print_providers(gateway: &Gateway) {
    println!("Providers:");
    for kind in ProviderKind::ALL {
        let state = if gateway.is_usable(kind) { "ready" } else { "no key" };
        println!("  {kind:<7} {:<24} {state}", gateway.default_model(kind));
    }
    match gateway.resolve(&Selection::default()) {
        Some(target) => println!("Default: {target}"),
        None => println!("Default: none (add an API key or select local)"),
    }
}

fn print_status(orchestrator: &Orchestrator, gateway: &Gateway) {
    let snap = orchestrator.snapshot();
    println!("Mode:      {}", snap.mode);
    match gateway.resolve(&snap.selection) {
        Some(target) => println!("Model:     {target}"),
        None => println!("Model:     none"),
    }
    println!("Slots:     {}/{} filled", snap.slots.len(), snap.max_slots);
    for slot in &snap.slots {
        println!(
            "  {}: {} ({})",
            slot.index,
            slot.path.display(),
            slot.captured_at.format("%H:%M:%S")
        );
    }
    println!("Context:   {}", if snap.has_context { "yes" } else { "no" });
    let worker = match (snap.running, snap.rerun_requested) {
        (false, _) => "idle",
        (true, false) => "running",
        (true, true) => "running, rerun queued",
    };
    println!("Worker:    {worker}");
    if snap.debounce_pending {
        println!("Analysis scheduled");
    }
}

async fn add_file(orchestrator: &Orchestrator, path: &Path) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    orchestrator
        .ingest(bytes)
        .await
        .with_context(|| format!("Cannot add {}", path.display()))?;
    Ok(())
}

/// Returns false when the shell should exit.
async fn dispatch(line: &str, orchestrator: &Orchestrator, gateway: &Gateway) -> Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else { return Ok(true) };
    let args: Vec<&str> = words.collect();

    match command {
        "capture" | "c" => {
            // Failures are reported on the event channel.
            let _ = orchestrator.capture().await;
        }
        "add" => match args.first() {
            Some(file) => add_file(orchestrator, Path::new(file)).await?,
            None => bail!("Usage: add <file>"),
        },
        "analyze" | "a" => {
            orchestrator.request_analysis();
        }
        "reset" | "r" => orchestrator.reset(),
        "mode" | "m" => match args.first() {
            Some(name) => match Mode::parse(name) {
                Some(mode) => orchestrator.set_mode(mode),
                None => bail!("Unknown mode '{name}' (expected code or general)"),
            },
            None => {
                orchestrator.toggle_mode();
            }
        },
        "model" => match args.as_slice() {
            ["auto"] => orchestrator.set_model(None, None),
            [provider] => orchestrator.set_model(Some(parse_provider(provider)?), None),
            [provider, model] => {
                orchestrator.set_model(Some(parse_provider(provider)?), Some(model.to_string()))
            }
            _ => bail!("Usage: model <provider> [model]"),
        },
        "providers" => print_providers(gateway),
        "status" | "s" => print_status(orchestrator, gateway),
        "help" | "h" | "?" => println!("{HELP}"),
        "quit" | "q" | "exit" => return Ok(false),
        other => bail!("Unknown command '{other}'. Type 'help' for a list."),
    }
    Ok(true)
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_file = companion::config::load_dotenv(cli.env_file.as_deref());
    let mut config = Config::load(cli.config.as_deref());
    if let Some(ref name) = cli.mode {
        config.analysis.mode =
            Mode::parse(name).with_context(|| format!("Unknown mode '{name}'"))?;
    }
    let provider = cli.provider.as_deref().map(parse_provider).transpose()?;

    let logging = companion::init_tracing(&config);
    info!("=== Companion starting (v{}) ===", env!("CARGO_PKG_VERSION"));
    if let Some(ref path) = env_file {
        info!("Loaded environment from {}", path.display());
    }

    let settings = Settings::from_config(&config);
    let gateway = Arc::new(Gateway::new(config.api.clone()));
    let capturer = CommandCapturer::new(
        config.capture.command.clone(),
        settings.screenshot_dir.join("raw"),
    );
    let session_log = if config.logging.enabled {
        config.log_directory().and_then(|dir| SessionLog::create(&dir))
    } else {
        None
    };

    let (tx, rx) = events::channel();
    let printer = tokio::spawn(print_events(rx));

    let orchestrator = Orchestrator::new(settings, gateway.clone(), tx)
        .with_capturer(Arc::new(capturer))
        .with_session_log(session_log.clone());

    println!("Screenshot Companion -- type 'help' for commands.");
    if let Some(log) = session_log {
        println!("Session log: {}", log.path().display());
    }
    if !logging {
        println!("Debug logging disabled.");
    }
    if provider.is_some() || cli.model.is_some() {
        orchestrator.set_model(provider, cli.model.clone());
    }
    match gateway.resolve(&orchestrator.snapshot().selection) {
        Some(target) => println!("Using {target}, {} mode.", orchestrator.snapshot().mode),
        None => println!("No AI model configured. Set OPENAI_API_KEY or GEMINI_API_KEY, or 'model local'."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match dispatch(line.trim(), &orchestrator, &gateway).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("{} {e:#}", timestamp()),
        }
    }

    info!("=== Companion exiting ===");
    drop(orchestrator);
    printer.abort();
    Ok(())
}
