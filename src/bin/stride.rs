//! Stride CLI - Command-line interface for Synheart Stride
//!
//! Commands:
//! - finalize: Build a completed session record from a recorded activity
//! - simulate: Run a paired handheld/companion session over an in-memory link
//! - config: Print the effective configuration

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use synheart_stride::aggregator::{FinalizeRequest, SessionAggregator};
use synheart_stride::biometrics::MemoryBiometricStore;
use synheart_stride::link::protocol::{CommandEvent, Event, ScheduleEntry, ScheduleReply};
use synheart_stride::link::{LinkChannel, MemoryLink};
use synheart_stride::projector::AppStateProjector;
use synheart_stride::session::{SessionService, SessionStatus};
use synheart_stride::types::{
    ActivityKind, BiometricKind, BiometricSample, LocationSample, LocationType, SessionState,
    TimeRange,
};
use synheart_stride::{logging, StrideConfig, PRODUCER_NAME, STRIDE_VERSION};

/// Stride - Companion link and biometric session engine
#[derive(Parser)]
#[command(name = "stride")]
#[command(author = "Synheart AI Inc")]
#[command(version = STRIDE_VERSION)]
#[command(about = "Aggregate workout biometrics and drive paired sessions", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a completed session record from a recorded activity (JSON)
    Finalize {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Simulate a companion-triggered session between two in-memory devices
    Simulate {
        /// Activity kind (running, walking, cycling, hiking, rowing, other)
        #[arg(long, default_value = "running", value_parser = parse_activity)]
        activity: ActivityKind,

        /// Location type (indoor, outdoor)
        #[arg(long, default_value = "outdoor", value_parser = parse_location)]
        location: LocationType,

        /// Number of sample ticks to generate
        #[arg(long, default_value = "10")]
        ticks: u32,

        /// Milliseconds between sample ticks
        #[arg(long, default_value = "200")]
        tick_ms: u64,

        /// Drop the link for this many ticks halfway through the session
        #[arg(long, default_value = "0")]
        disconnect_ticks: u32,
    },

    /// Print the effective configuration
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn parse_activity(raw: &str) -> Result<ActivityKind, String> {
    ActivityKind::parse(raw).ok_or_else(|| format!("unknown activity '{}'", raw))
}

fn parse_location(raw: &str) -> Result<LocationType, String> {
    LocationType::parse(raw).ok_or_else(|| format!("unknown location '{}'", raw))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), StrideCliError> {
    let config = StrideConfig::load(cli.config.as_deref())?;
    logging::init(&config.logging);

    match cli.command {
        Commands::Finalize { input, output } => cmd_finalize(&config, &input, &output),

        Commands::Simulate {
            activity,
            location,
            ticks,
            tick_ms,
            disconnect_ticks,
        } => {
            let plan = SimulationPlan {
                activity,
                location,
                ticks,
                tick: Duration::from_millis(tick_ms.max(1)),
                disconnect_ticks,
            };
            cmd_simulate(&config, plan)
        }

        Commands::Config { json } => cmd_config(&config, json),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, StrideCliError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

// finalize

/// Recorded activity accepted by `stride finalize`
#[derive(Debug, Deserialize)]
struct RecordedActivity {
    #[serde(default)]
    id: Option<Uuid>,
    activity: ActivityKind,
    location: LocationType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    samples: Vec<BiometricSample>,
    #[serde(default)]
    route: Vec<LocationSample>,
}

fn read_input(input: &Path) -> Result<String, StrideCliError> {
    if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            return Err(StrideCliError::NoInput);
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn write_output(output: &Path, content: &str) -> Result<(), StrideCliError> {
    if output.to_string_lossy() == "-" {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", content)?;
        stdout.flush()?;
    } else {
        fs::write(output, format!("{}\n", content))?;
    }
    Ok(())
}

fn cmd_finalize(config: &StrideConfig, input: &Path, output: &Path) -> Result<(), StrideCliError> {
    let recorded: RecordedActivity = serde_json::from_str(&read_input(input)?)?;
    if recorded.end < recorded.start {
        return Err(StrideCliError::InvalidRange);
    }

    let store = MemoryBiometricStore::new();
    store.record_all(recorded.samples);
    store.record_route(recorded.route);

    let aggregator = SessionAggregator::new(Arc::new(store), config.aggregation.clone());
    let request = FinalizeRequest {
        id: recorded.id.unwrap_or_else(Uuid::new_v4),
        activity: recorded.activity,
        location: recorded.location,
        range: TimeRange::new(recorded.start, recorded.end),
    };

    let record = runtime()?.block_on(aggregator.finalize(request));
    let envelope = serde_json::json!({
        "producer": PRODUCER_NAME,
        "version": STRIDE_VERSION,
        "record": record,
    });
    write_output(output, &serde_json::to_string_pretty(&envelope)?)
}

// simulate

struct SimulationPlan {
    activity: ActivityKind,
    location: LocationType,
    ticks: u32,
    tick: Duration,
    disconnect_ticks: u32,
}

fn emit(line: serde_json::Value) {
    println!("{}", line);
}

fn demo_schedule() -> ScheduleReply {
    let entry = |day: &str, activity: ActivityKind, name: &str| ScheduleEntry {
        day: day.to_string(),
        activity,
        name: name.to_string(),
    };
    ScheduleReply {
        entries: vec![
            entry("mon", ActivityKind::Running, "Easy run"),
            entry("wed", ActivityKind::Cycling, "Tempo ride"),
            entry("sat", ActivityKind::Hiking, "Long hike"),
        ],
    }
}

async fn wait_for_state(
    status: &mut watch::Receiver<SessionStatus>,
    state: SessionState,
) -> Result<(), StrideCliError> {
    status
        .wait_for(|s| s.state == state)
        .await
        .map(|_| ())
        .map_err(|_| StrideCliError::Simulation(format!("session never reached {}", state)))
}

fn cmd_simulate(config: &StrideConfig, plan: SimulationPlan) -> Result<(), StrideCliError> {
    runtime()?.block_on(simulate(config, plan))
}

async fn simulate(config: &StrideConfig, plan: SimulationPlan) -> Result<(), StrideCliError> {
    let (memory, handheld_end, companion_end) = MemoryLink::pair();
    let handheld_link = LinkChannel::spawn("handheld", Arc::new(handheld_end), &config.link);
    let companion_link = LinkChannel::spawn("companion", Arc::new(companion_end), &config.link);

    let store = Arc::new(MemoryBiometricStore::new());
    let handheld = SessionService::spawn(
        SessionAggregator::new(store.clone(), config.aggregation.clone()),
        handheld_link.clone(),
        &config.session,
        demo_schedule(),
    )?;
    let companion = SessionService::spawn(
        SessionAggregator::new(Arc::new(MemoryBiometricStore::new()), config.aggregation.clone()),
        companion_link.clone(),
        &config.session,
        ScheduleReply::default(),
    )?;

    memory.set_reachable(true);
    handheld_link.activate()?;
    companion_link.activate()?;
    companion_link
        .watch_connection()
        .wait_for(|c| c.is_deliverable())
        .await
        .map_err(|_| StrideCliError::Simulation("companion link never connected".to_string()))?;

    let mut projector = AppStateProjector::new();
    emit(serde_json::json!({ "event": "projection", "state": projector.refresh(&companion_link).await }));

    let mut status = handheld.watch_status();
    companion_link.send(&Event::Command(CommandEvent::start(plan.activity, plan.location)))?;
    wait_for_state(&mut status, SessionState::Active).await?;
    emit(serde_json::json!({ "event": "projection", "state": projector.refresh(&companion_link).await }));

    let mut peer_metrics = companion.watch_peer_metrics();
    let disconnect_at = plan.ticks / 2;
    let mut distance = 0.0;
    let mut energy = 0.0;

    for tick in 0..plan.ticks {
        tokio::time::sleep(plan.tick).await;
        let now = Utc::now();
        let secs = plan.tick.as_secs_f64();

        if plan.disconnect_ticks > 0 && tick == disconnect_at {
            memory.set_reachable(false);
            emit(serde_json::json!({ "event": "link", "reachable": false, "tick": tick }));
        }
        if plan.disconnect_ticks > 0 && tick == disconnect_at + plan.disconnect_ticks {
            memory.set_reachable(true);
            emit(serde_json::json!({ "event": "link", "reachable": true, "tick": tick }));
        }

        let step = 2.8 * secs;
        distance += step;
        energy += 0.18 * secs;
        let heart_rate = 128.0 + (tick % 12) as f64 * 2.5;
        let cadence = 162.0 + (tick % 5) as f64;

        store.record_all([
            BiometricSample::new(BiometricKind::HeartRate, now, heart_rate),
            BiometricSample::new(BiometricKind::Distance, now, step),
            BiometricSample::new(BiometricKind::Energy, now, 0.18 * secs),
            BiometricSample::new(BiometricKind::Cadence, now, cadence),
        ]);
        store.push_live(BiometricSample::new(BiometricKind::HeartRate, now, heart_rate));
        store.push_live(BiometricSample::new(BiometricKind::Distance, now, distance));
        store.push_live(BiometricSample::new(BiometricKind::Energy, now, energy));
        store.push_live(BiometricSample::new(BiometricKind::Cadence, now, cadence));

        if plan.location == LocationType::Outdoor {
            let fix = LocationSample {
                latitude: 52.5200 + distance * 0.000009,
                longitude: 13.4050,
                timestamp: now,
                vertical_accuracy: 3.0,
                altitude: 34.0 + (tick as f64 * 0.7).sin() * 4.0,
            };
            store.record_route([fix.clone()]);
            store.push_fix(fix);
        }

        if peer_metrics.has_changed().unwrap_or(false) {
            if let Some(metrics) = peer_metrics.borrow_and_update().clone() {
                emit(serde_json::json!({ "event": "metrics", "tick": tick, "metrics": metrics }));
            }
        }
    }

    memory.set_reachable(true);
    let record = handheld.end().await?;
    emit(serde_json::json!({ "event": "record", "record": record }));

    emit(serde_json::json!({ "event": "projection", "state": projector.refresh(&companion_link).await }));
    emit(serde_json::json!({
        "event": "summary",
        "handheld_pending": handheld_link.pending_len().await?,
        "companion_pending": companion_link.pending_len().await?,
    }));

    handheld_link.shutdown();
    companion_link.shutdown();
    Ok(())
}

// config

fn cmd_config(config: &StrideConfig, json: bool) -> Result<(), StrideCliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml());
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum StrideCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Config(synheart_stride::ConfigError),
    Link(synheart_stride::LinkError),
    Session(synheart_stride::SessionError),
    Simulation(String),
    NoInput,
    InvalidRange,
}

impl From<io::Error> for StrideCliError {
    fn from(e: io::Error) -> Self {
        StrideCliError::Io(e)
    }
}

impl From<serde_json::Error> for StrideCliError {
    fn from(e: serde_json::Error) -> Self {
        StrideCliError::Json(e)
    }
}

impl From<synheart_stride::ConfigError> for StrideCliError {
    fn from(e: synheart_stride::ConfigError) -> Self {
        StrideCliError::Config(e)
    }
}

impl From<synheart_stride::LinkError> for StrideCliError {
    fn from(e: synheart_stride::LinkError) -> Self {
        StrideCliError::Link(e)
    }
}

impl From<synheart_stride::SessionError> for StrideCliError {
    fn from(e: synheart_stride::SessionError) -> Self {
        StrideCliError::Session(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<StrideCliError> for CliError {
    fn from(e: StrideCliError) -> Self {
        match e {
            StrideCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            StrideCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Input must be a recorded activity object with activity, location, start and end".to_string()),
            },
            StrideCliError::Config(e) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'stride config' to see the expected layout".to_string()),
            },
            StrideCliError::Link(e) => CliError {
                code: "LINK_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            StrideCliError::Session(e) => CliError {
                code: "SESSION_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            StrideCliError::Simulation(message) => CliError {
                code: "SIMULATION_FAILED".to_string(),
                message,
                hint: Some("Re-run with STRIDE_LOG=debug for link traces".to_string()),
            },
            StrideCliError::NoInput => CliError {
                code: "NO_INPUT".to_string(),
                message: "stdin is a terminal, expected a recorded activity".to_string(),
                hint: Some("Pipe a JSON file or pass --input <path>".to_string()),
            },
            StrideCliError::InvalidRange => CliError {
                code: "INVALID_RANGE".to_string(),
                message: "Activity end is before its start".to_string(),
                hint: None,
            },
        }
    }
}
