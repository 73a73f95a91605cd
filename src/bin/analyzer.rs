//! Vibration Data Analyzer
//!
//! Offline report for one stored capture: per-channel statistics, PSD
//! parameters, the strongest spectral peaks and the integrated band
//! amplitudes.
//!
//! Usage:
//!   analyzer --input /media/vibration/d/2024-03.h5 --all
//!   analyzer --input 2024-03.h5 --group 2024-03-07 --dataset 14-30 --spectrum --window hum:45:55
//!   analyzer --input 2024-03.h5 --config auto.json --peaks

use clap::Parser;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use vibration_station::config::{AnalysisWindow, MeasurementConfig};
use vibration_station::spectral::{analyze_channel, ChannelAnalysis, PsdMethod, PsdOptions};
use vibration_station::store::{Hdf5Store, HierarchicalStore, StoredDataset};

#[derive(Parser, Debug)]
#[command(name = "analyzer")]
#[command(about = "Analyze a stored vibration capture from an HDF5 file", long_about = None)]
struct Args {
    /// Input HDF5 file path
    #[arg(short, long)]
    input: PathBuf,

    /// Date group (default: latest in file)
    #[arg(short, long)]
    group: Option<String>,

    /// Minute dataset (default: latest in group)
    #[arg(short, long)]
    dataset: Option<String>,

    /// PSD method: "welch", "fft" or "rfft"
    #[arg(short, long, default_value = "welch")]
    method: String,

    /// Number of segments for spectral averaging
    #[arg(short, long, default_value = "32")]
    subdivision: usize,

    /// Analysis window as LABEL:LOW:HIGH in Hz (repeatable)
    #[arg(short, long = "window", value_parser = parse_window)]
    windows: Vec<AnalysisWindow>,

    /// Take analysis windows, method and subdivision from a station config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compute per-channel statistics
    #[arg(long)]
    statistics: bool,

    /// List the strongest spectral peaks
    #[arg(long)]
    spectrum: bool,

    /// Integrate the PSD over the analysis windows
    #[arg(long)]
    peaks: bool,

    /// Run all analyses
    #[arg(long)]
    all: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_window(s: &str) -> Result<AnalysisWindow, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [label, low, high] = parts.as_slice() else {
        return Err(format!("expected LABEL:LOW:HIGH, got '{}'", s));
    };
    let low_hz: f64 = low.parse().map_err(|e| format!("bad low frequency '{}': {}", low, e))?;
    let high_hz: f64 = high.parse().map_err(|e| format!("bad high frequency '{}': {}", high, e))?;
    if low_hz >= high_hz {
        return Err(format!("window '{}' needs LOW < HIGH", label));
    }
    Ok(AnalysisWindow {
        label: label.to_string(),
        low_hz,
        high_hz,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"));
    let args = Args::parse();

    let run_statistics = args.all || args.statistics;
    let run_spectrum = args.all || args.spectrum;
    let run_peaks = args.all || args.peaks;

    if !run_statistics && !run_spectrum && !run_peaks {
        eprintln!("Error: Must specify at least one analysis type (--statistics, --spectrum, --peaks, or --all)");
        std::process::exit(1);
    }

    let mut options = PsdOptions {
        method: args.method.parse::<PsdMethod>()?,
        subdivision_factor: args.subdivision.max(1),
        ..Default::default()
    };
    let mut windows = args.windows.clone();
    if let Some(path) = &args.config {
        let config = MeasurementConfig::load(path)?;
        options.method = config.psd_method;
        options.subdivision_factor = config.subdivision_factor;
        windows.extend(config.analysis_windows);
    }

    // Open the file through the station's store
    let dir = args
        .input
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let file = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or("input must name an HDF5 file")?
        .to_string();
    let store = Hdf5Store::new(dir);

    let group = match &args.group {
        Some(group) => group.clone(),
        None => store.groups(&file)?.pop().ok_or("file contains no date groups")?,
    };
    let name = match &args.dataset {
        Some(name) => name.clone(),
        None => store
            .datasets(&file, &group)?
            .pop()
            .ok_or("date group contains no datasets")?,
    };

    println!("Loading {}/{} from {}...", group, name, args.input.display());
    let dataset = store.read_dataset(&file, &group, &name)?;
    let channels = split_channels(&dataset);
    if channels.iter().all(|(_, samples)| samples.is_empty()) {
        eprintln!("Error: No samples in dataset");
        return Ok(());
    }

    let mut output: Box<dyn Write> = if let Some(path) = &args.output {
        Box::new(File::create(path)?)
    } else {
        Box::new(io::stdout())
    };

    write_header(&mut output, &group, &name, &dataset)?;

    if run_statistics {
        writeln!(output, "\n{}", "=".repeat(80))?;
        writeln!(output, "STATISTICAL ANALYSIS")?;
        writeln!(output, "{}", "=".repeat(80))?;
        run_statistics_analysis(&mut output, &channels)?;
    }

    if run_spectrum || run_peaks {
        let rate = dataset.attrs.actual_sampling_rate;
        let analyses = channels
            .iter()
            .map(|(channel, samples)| analyze_channel(*channel, samples, rate, &options, &windows))
            .collect::<Result<Vec<_>, _>>()?;

        if run_spectrum {
            writeln!(output, "\n{}", "=".repeat(80))?;
            writeln!(output, "SPECTRAL ANALYSIS (PSD)")?;
            writeln!(output, "{}", "=".repeat(80))?;
            run_spectrum_analysis(&mut output, &analyses, &options, rate)?;
        }

        if run_peaks {
            writeln!(output, "\n{}", "=".repeat(80))?;
            writeln!(output, "INTEGRATED PEAKS")?;
            writeln!(output, "{}", "=".repeat(80))?;
            run_peaks_analysis(&mut output, &analyses, &windows)?;
        }
    }

    writeln!(output, "\n{}", "=".repeat(80))?;
    writeln!(output, "Analysis complete!")?;

    Ok(())
}

/// De-interleave a stored capture into (channel, samples) pairs
fn split_channels(dataset: &StoredDataset) -> Vec<(u8, Vec<f64>)> {
    let stride = dataset.attrs.channels.len().max(1);
    dataset
        .attrs
        .channels
        .iter()
        .enumerate()
        .map(|(position, &channel)| {
            let samples = dataset.data.iter().skip(position).step_by(stride).copied().collect();
            (channel, samples)
        })
        .collect()
}

fn write_header(output: &mut dyn Write, group: &str, name: &str, dataset: &StoredDataset) -> io::Result<()> {
    let attrs = &dataset.attrs;
    writeln!(output, "{}", "=".repeat(80))?;
    writeln!(output, "VIBRATION DATA ANALYSIS REPORT")?;
    writeln!(output, "{}", "=".repeat(80))?;
    writeln!(output)?;
    writeln!(output, "Capture Information:")?;
    writeln!(output, "  Dataset: {}/{}", group, name)?;
    writeln!(output, "  Timestamp: {}", attrs.timestamp)?;
    writeln!(output, "  DAQ address: {}", attrs.address)?;
    writeln!(output, "  Channels: {:?}", attrs.channels)?;
    writeln!(output, "  Samples per channel: {}", attrs.samples_per_channel)?;
    writeln!(output, "  Sampling rate: {:.1} Hz (actual {:.3} Hz)", attrs.sampling_rate, attrs.actual_sampling_rate)?;
    if attrs.actual_sampling_rate > 0.0 {
        writeln!(
            output,
            "  Duration: {:.2}s",
            attrs.samples_per_channel as f64 / attrs.actual_sampling_rate
        )?;
    }
    Ok(())
}

// ============================================================================
// STATISTICS ANALYSIS
// ============================================================================

#[derive(Debug)]
struct Stats {
    mean: f64,
    rms: f64,
    std_dev: f64,
    min: f64,
    max: f64,
    peak_to_peak: f64,
}

fn compute_stats(data: &[f64]) -> Stats {
    let n = data.len().max(1) as f64;
    let mean = data.iter().sum::<f64>() / n;
    let rms = (data.iter().map(|&x| x * x).sum::<f64>() / n).sqrt();
    let variance = data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;
    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Stats {
        mean,
        rms,
        std_dev: variance.sqrt(),
        min,
        max,
        peak_to_peak: max - min,
    }
}

fn run_statistics_analysis(output: &mut dyn Write, channels: &[(u8, Vec<f64>)]) -> io::Result<()> {
    writeln!(output)?;
    writeln!(output, "Sensor Output Statistics (V):")?;
    writeln!(output, "{:-<80}", "")?;
    writeln!(
        output,
        "{:<10} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Channel", "Mean", "RMS", "Std Dev", "Min", "Max", "Peak-Peak"
    )?;
    writeln!(output, "{:-<80}", "")?;

    for (channel, samples) in channels {
        let stats = compute_stats(samples);
        writeln!(
            output,
            "{:<10} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5} {:>12.5}",
            channel, stats.mean, stats.rms, stats.std_dev, stats.min, stats.max, stats.peak_to_peak
        )?;
    }
    Ok(())
}

// ============================================================================
// SPECTRAL ANALYSIS
// ============================================================================

struct SpectralPeak {
    frequency: f64,
    density: f64,
}

/// Local PSD maxima above 10% of the strongest bin, strongest first
fn find_peaks(frequency: &[f64], psd: &[f64]) -> Vec<SpectralPeak> {
    if psd.len() < 3 {
        return Vec::new();
    }
    let threshold = psd.iter().copied().fold(0.0, f64::max) * 0.1;
    let mut peaks: Vec<SpectralPeak> = (1..psd.len() - 1)
        .filter(|&i| psd[i] > threshold && psd[i] > psd[i - 1] && psd[i] > psd[i + 1])
        .map(|i| SpectralPeak {
            frequency: frequency[i],
            density: psd[i],
        })
        .collect();

    peaks.sort_by(|a, b| b.density.total_cmp(&a.density));
    peaks
}

fn run_spectrum_analysis(
    output: &mut dyn Write,
    analyses: &[ChannelAnalysis],
    options: &PsdOptions,
    sampling_rate: f64,
) -> io::Result<()> {
    writeln!(output)?;
    writeln!(output, "PSD Parameters:")?;
    writeln!(output, "  Method: {}", options.method)?;
    writeln!(output, "  Subdivision factor: {}", options.subdivision_factor)?;
    if let Some(first) = analyses.first() {
        writeln!(output, "  Frequency resolution: {:.4} Hz", first.spectrum.frequency_step())?;
    }
    writeln!(output, "  Max frequency: {:.1} Hz", sampling_rate / 2.0)?;

    for analysis in analyses {
        // DC and its neighbour carry no vibration content
        let (frequency, psd) = analysis.spectrum.clipped(2);
        let peaks = find_peaks(frequency, psd);

        writeln!(output, "\nChannel {} - Top 5 Spectral Peaks:", analysis.channel)?;
        if peaks.is_empty() {
            writeln!(output, "  No significant peaks detected")?;
        } else {
            for (i, peak) in peaks.iter().take(5).enumerate() {
                writeln!(
                    output,
                    "  {}. {:.2} Hz (density: {:.4e} V²/Hz)",
                    i + 1,
                    peak.frequency,
                    peak.density
                )?;
            }
        }
    }
    Ok(())
}

fn run_peaks_analysis(
    output: &mut dyn Write,
    analyses: &[ChannelAnalysis],
    windows: &[AnalysisWindow],
) -> io::Result<()> {
    writeln!(output)?;
    if windows.is_empty() {
        writeln!(output, "No analysis windows given (use --window or --config)")?;
        return Ok(());
    }

    writeln!(output, "{:<10} {:<20} {:>12} {:>12} {:>14}", "Channel", "Window", "Low (Hz)", "High (Hz)", "Amplitude")?;
    writeln!(output, "{:-<80}", "")?;
    for analysis in analyses {
        for window in windows {
            let amplitude = analysis.peaks.get(&window.label).copied().unwrap_or(0.0);
            writeln!(
                output,
                "{:<10} {:<20} {:>12.2} {:>12.2} {:>14.6}",
                analysis.channel, window.label, window.low_hz, window.high_hz, amplitude
            )?;
        }
    }
    Ok(())
}
