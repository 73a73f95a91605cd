//! Vibration station daemon
//!
//! Runs the operating-mode state machine until power-off, a reboot request
//! or Ctrl+C. Board drivers plug in through `hardware::StationBackend`; this
//! binary drives the simulated backend, whose button and toggle switch are
//! operated from stdin (`short`, `long`, `press <ms>`, `manual`, `auto`).
//!
//! Exit status: 0 after Ctrl+C or power-off, 75 when the station needs a
//! reboot (left to the supervisor), 1 on any other fatal error.
//!
//! Usage:
//!   vibration-station --auto-config auto.json --manual-config manual.json --tone 50:1.0

use clap::Parser;
use log::{error, info};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vibration_station::button::{ClassifierSettings, InputClassifier, ReadPolicy};
use vibration_station::clock::{Clock, ManualClock, SystemClock};
use vibration_station::config::ConfigFiles;
use vibration_station::fsm::{ControllerSettings, LongPressPolicy, OperatingModeController, StationExit, StationIo};
use vibration_station::hardware::sim::{
    spawn_console_input, SimStorage, SimulatedBackend, SimulatedIndicator, SimulatedPower, SimulatedSwitch,
};
use vibration_station::hardware::{PowerControl, SystemPower};
use vibration_station::pipeline::{MeasurementPipeline, RetryPolicy};

/// Exit status asking the supervisor for a reboot (EX_TEMPFAIL)
const EXIT_REBOOT_REQUIRED: i32 = 75;

#[derive(Parser, Debug)]
#[command(name = "vibration-station")]
#[command(about = "Run the vibration measurement station", long_about = None)]
struct Args {
    /// Config file loaded on entering automatic mode
    #[arg(long, default_value = "config_auto.json")]
    auto_config: PathBuf,

    /// Config file loaded on entering manual mode
    #[arg(long, default_value = "config_manual.json")]
    manual_config: PathBuf,

    /// State machine poll interval in milliseconds
    #[arg(long, default_value = "50")]
    poll_ms: u64,

    /// Presses shorter than this (ms) are ignored as noise
    #[arg(long, default_value = "5")]
    debounce_down_ms: u64,

    /// Presses at least this long (ms) are long presses
    #[arg(long, default_value = "1500")]
    long_press_ms: u64,

    /// Presses starting this soon (ms) after a release are ignored
    #[arg(long, default_value = "500")]
    debounce_up_ms: u64,

    /// How long (ms) a press stays readable
    #[arg(long, default_value = "2000")]
    memory_ms: u64,

    /// Button read policy: "consume" or "expire"
    #[arg(long, default_value = "consume")]
    read_policy: String,

    /// Long press while waiting: "charge", "shutdown" or "log"
    #[arg(long, default_value = "charge")]
    long_press: String,

    /// Consecutive failures before a reboot is requested
    #[arg(long, default_value = "10")]
    max_failures: u32,

    /// Simulated vibration tone as FREQ:AMPLITUDE (repeatable)
    #[arg(long = "tone", value_parser = parse_tone)]
    tones: Vec<(f64, f64)>,

    /// Amplitude of the simulated uniform noise
    #[arg(long, default_value = "0.05")]
    noise: f64,

    /// Keep records in memory instead of the configured HDF5 directories
    #[arg(long)]
    memory_store: bool,

    /// Run waits instantly on a simulated clock
    #[arg(long)]
    fast_clock: bool,

    /// Really power the host off in shutdown mode
    #[arg(long)]
    power_off: bool,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_tone(s: &str) -> Result<(f64, f64), String> {
    let (freq, amplitude) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FREQ:AMPLITUDE, got '{}'", s))?;
    let freq: f64 = freq.trim().parse().map_err(|e| format!("bad frequency '{}': {}", freq, e))?;
    let amplitude: f64 = amplitude
        .trim()
        .parse()
        .map_err(|e| format!("bad amplitude '{}': {}", amplitude, e))?;
    Ok((freq, amplitude))
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run(args: Args) -> Result<StationExit, Box<dyn std::error::Error>> {
    let read_policy: ReadPolicy = args.read_policy.parse()?;
    let long_press_policy: LongPressPolicy = args.long_press.parse()?;

    info!(
        "Using config files: {} and {}",
        args.auto_config.display(),
        args.manual_config.display()
    );

    let clock: Arc<dyn Clock> = if args.fast_clock {
        info!("Fast clock: waits complete instantly");
        Arc::new(ManualClock::starting_at(chrono::Local::now()))
    } else {
        Arc::new(SystemClock)
    };

    let tones = if args.tones.is_empty() {
        vec![(50.0, 1.0)]
    } else {
        args.tones.clone()
    };
    let storage = if args.memory_store {
        SimStorage::memory()
    } else {
        SimStorage::Disk
    };
    let backend = SimulatedBackend::new(tones, args.noise, storage);

    let classifier = InputClassifier::new(ClassifierSettings {
        debounce_down: Duration::from_millis(args.debounce_down_ms),
        long_press_threshold: Duration::from_millis(args.long_press_ms),
        debounce_up: Duration::from_millis(args.debounce_up_ms),
        memory_window: Duration::from_millis(args.memory_ms),
        read_policy,
    });
    let slot = classifier.slot();
    let switch = SimulatedSwitch::new(false);
    spawn_console_input(classifier, switch.clone(), clock.clone())?;

    let power: Box<dyn PowerControl> = if args.power_off {
        Box::new(SystemPower)
    } else {
        Box::new(SimulatedPower::new())
    };

    let retry = RetryPolicy {
        max_failures: args.max_failures.max(1),
        ..Default::default()
    };
    let mut station = OperatingModeController::new(
        MeasurementPipeline::new(Box::new(backend), clock.clone(), retry),
        Box::new(ConfigFiles {
            auto: args.auto_config,
            manual: args.manual_config,
        }),
        slot,
        StationIo {
            indicator: Box::new(SimulatedIndicator::new()),
            switch: Box::new(switch),
            power,
        },
        clock,
        ControllerSettings {
            poll_interval: Duration::from_millis(args.poll_ms),
            long_press_policy,
        },
    );

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })?;

    Ok(station.run(&stop)?)
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.log_file.as_ref()) {
        eprintln!("Error: could not open log file: {}", e);
        std::process::exit(1);
    }

    match run(args) {
        Ok(StationExit::Stopped) => info!("Station stopped"),
        Ok(StationExit::PowerOff) => info!("Station powered off"),
        Ok(StationExit::RebootRequired { failures }) => {
            error!("Station needs a reboot after {} failed measurements", failures);
            std::process::exit(EXIT_REBOOT_REQUIRED);
        }
        Err(e) => {
            error!("Station failed: {}", e);
            std::process::exit(1);
        }
    }
}
