//! Vibration Data Collector
//!
//! Takes manual captures outside the state machine: loads one config, puts
//! the batteries on measure, runs the manual sequence and persists each
//! capture. With `--merge-only` it just moves records from the temporary
//! store into the canonical one.
//!
//! Usage:
//!   collector --config manual.json --count 3
//!   collector --config auto.json --merge-only

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vibration_station::clock::{Clock, ManualClock, SystemClock};
use vibration_station::config::MeasurementConfig;
use vibration_station::hardware::sim::{SimStorage, SimulatedBackend};
use vibration_station::persistence::LocalDestination;
use vibration_station::pipeline::{MeasurementPipeline, RetryPolicy};

#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(about = "Take manual vibration captures and persist them", long_about = None)]
struct Args {
    /// Measurement config file
    #[arg(short, long, default_value = "config_manual.json")]
    config: PathBuf,

    /// Number of captures to take
    #[arg(short = 'n', long, default_value = "1")]
    count: u32,

    /// Only merge pending temporary records, take no capture
    #[arg(long)]
    merge_only: bool,

    /// Simulated vibration tone as FREQ:AMPLITUDE (repeatable)
    #[arg(long = "tone", value_parser = parse_tone)]
    tones: Vec<(f64, f64)>,

    /// Amplitude of the simulated uniform noise
    #[arg(long, default_value = "0.05")]
    noise: f64,

    /// Run settling and scan waits instantly
    #[arg(long)]
    fast_clock: bool,
}

fn parse_tone(s: &str) -> Result<(f64, f64), String> {
    let (freq, amplitude) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FREQ:AMPLITUDE, got '{}'", s))?;
    let freq = freq.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let amplitude = amplitude.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok((freq, amplitude))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));
    let args = Args::parse();

    let config = MeasurementConfig::load(&args.config)?;

    println!("Vibration Data Collector");
    println!("========================");
    println!("Config: {}", args.config.display());
    println!("Location: {}", config.location);
    println!("Write to: {:?}", config.write_to);
    println!(
        "Capture: {} min at {} Hz on channels {:?} after {} min settling",
        config.measurement_duration, config.sampling_rate, config.channels, config.settling_time
    );
    println!();

    let clock: Arc<dyn Clock> = if args.fast_clock {
        Arc::new(ManualClock::starting_at(chrono::Local::now()))
    } else {
        Arc::new(SystemClock)
    };
    let tones = if args.tones.is_empty() {
        vec![(50.0, 1.0)]
    } else {
        args.tones.clone()
    };
    let backend = SimulatedBackend::new(tones, args.noise, SimStorage::Disk);
    let mut pipeline = MeasurementPipeline::new(Box::new(backend), clock, RetryPolicy::default());
    pipeline.reset(config)?;

    if args.merge_only {
        let report = pipeline.merge_pending()?;
        println!("Merged {} file(s): {} dataset(s) copied, {} skipped", report.files, report.copied, report.skipped);
        return Ok(());
    }

    // Setup Ctrl+C handler; a capture in progress always finishes
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping after the current capture...");
        r.store(false, Ordering::SeqCst);
    })?;

    pipeline.power_measure()?;
    let mut result = Ok(());
    for index in 1..=args.count {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        println!("Capture {} of {}...", index, args.count);
        match pipeline.run_manual_sequence() {
            Ok(outcome) => {
                println!("  Timestamp: {}", outcome.timestamp.format("%Y-%m-%d %H:%M:%S"));
                if let Some((destination, path)) = &outcome.report.local {
                    let store = match destination {
                        LocalDestination::Canonical => "network drive",
                        LocalDestination::Temporary => "temporary store",
                    };
                    println!("  Saved to {}: {}", store, path);
                }
                if let Some(e) = &outcome.report.merge_error {
                    println!("  Pending temporary files not merged: {}", e);
                }
                if outcome.report.remote_written {
                    println!("  Uploaded to remote store");
                }
                for analysis in &outcome.analyses {
                    for (label, amplitude) in &analysis.peaks {
                        println!("  Channel {} {:<16} {:.6}", analysis.channel, label, amplitude);
                    }
                }
            }
            Err(e) => {
                eprintln!("\nError during capture: {}", e);
                result = Err(e);
                break;
            }
        }
    }

    if let Err(e) = pipeline.power_charge() {
        eprintln!("Failed to return batteries to charge: {}", e);
    }
    result?;
    println!("\nCollection complete!");
    Ok(())
}
