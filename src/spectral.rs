//! Power spectral density estimation and band integration
//!
//! Pure functions, no state. Three estimators are available:
//!
//! * [`PsdMethod::Fft`]: plain segmented FFT, averaged magnitudes.
//! * [`PsdMethod::Welch`]: Hann-windowed, half-overlapping periodogram
//!   average (density scaling). Usually the better choice, but it does not
//!   carry a meaningful DC component.
//! * [`PsdMethod::Rfft`]: segmented real FFT with optional power-of-two
//!   padding.
//!
//! ```
//! use vibration_station::spectral::{derive_psd, PsdMethod, PsdOptions};
//!
//! let fs = 1000.0;
//! let samples: Vec<f64> = (0..4096)
//!     .map(|i| (2.0 * std::f64::consts::PI * 50.0 * i as f64 / fs).sin())
//!     .collect();
//! let options = PsdOptions { method: PsdMethod::Welch, subdivision_factor: 4, ..Default::default() };
//! let spectrum = derive_psd(&samples, fs, &options)?;
//! assert_eq!(spectrum.frequency.len(), spectrum.psd.len());
//! # Ok::<(), vibration_station::StationError>(())
//! ```

use crate::config::AnalysisWindow;
use crate::error::{Result, StationError};
use log::warn;
use num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::BTreeMap;
use std::f64::consts::{PI, SQRT_2};

/// PSD estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsdMethod {
    Fft,
    Welch,
    Rfft,
}

impl PsdMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PsdMethod::Fft => "fft",
            PsdMethod::Welch => "welch",
            PsdMethod::Rfft => "rfft",
        }
    }
}

impl std::str::FromStr for PsdMethod {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fft" => Ok(PsdMethod::Fft),
            "welch" => Ok(PsdMethod::Welch),
            "rfft" => Ok(PsdMethod::Rfft),
            other => Err(StationError::InvalidArgument(format!("invalid PSD method '{}'", other))),
        }
    }
}

impl std::fmt::Display for PsdMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-segment trend removal (Welch only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detrend {
    #[default]
    None,
    /// Subtract the segment mean
    Constant,
    /// Subtract the least-squares line through the segment
    Linear,
}

/// Parameters for [`derive_psd`]
#[derive(Debug, Clone, PartialEq)]
pub struct PsdOptions {
    pub method: PsdMethod,
    /// Number of equal segments the trace is split into
    pub subdivision_factor: usize,
    /// Transform length relative to the segment (fft, rfft) or trace (welch)
    pub fft_length_factor: Option<f64>,
    pub pad_to_power_of_two: bool,
    pub one_sided: bool,
    pub detrend: Detrend,
}

impl Default for PsdOptions {
    fn default() -> Self {
        Self {
            method: PsdMethod::Welch,
            subdivision_factor: 1,
            fft_length_factor: None,
            pad_to_power_of_two: false,
            one_sided: true,
            detrend: Detrend::None,
        }
    }
}

/// Frequency axis and PSD of one capture
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumResult {
    pub frequency: Vec<f64>,
    pub psd: Vec<f64>,
    pub method: PsdMethod,
}

impl SpectrumResult {
    /// Spacing of the frequency axis (0 for fewer than two bins)
    pub fn frequency_step(&self) -> f64 {
        match self.frequency.as_slice() {
            [first, second, ..] => second - first,
            _ => 0.0,
        }
    }

    /// Drop the first `bins` entries (DC and its neighbour)
    pub fn clipped(&self, bins: usize) -> (&[f64], &[f64]) {
        let start = bins.min(self.frequency.len());
        (&self.frequency[start..], &self.psd[start..])
    }
}

/// Band label → bandwidth-weighted RMS amplitude
pub type IntegratedPeaks = BTreeMap<String, f64>;

/// Derive the power spectral density of an equally spaced time trace
pub fn derive_psd(samples: &[f64], sampling_rate: f64, options: &PsdOptions) -> Result<SpectrumResult> {
    if samples.is_empty() {
        return Err(StationError::InvalidArgument("cannot derive a PSD from an empty trace".into()));
    }
    if !(sampling_rate > 0.0) {
        return Err(StationError::InvalidArgument(format!(
            "sampling rate must be positive, got {}",
            sampling_rate
        )));
    }
    if options.subdivision_factor == 0 {
        return Err(StationError::InvalidArgument("subdivision factor must be at least 1".into()));
    }
    if let Some(factor) = options.fft_length_factor {
        if !(factor > 0.0) {
            return Err(StationError::InvalidArgument(format!(
                "fft length factor must be positive, got {}",
                factor
            )));
        }
    }

    // Single-segment power-of-two padding is applied in front of the trace
    let padded;
    let samples = if options.pad_to_power_of_two && options.subdivision_factor == 1 {
        let deficit = samples.len().next_power_of_two() - samples.len();
        padded = std::iter::repeat(0.0).take(deficit).chain(samples.iter().copied()).collect::<Vec<_>>();
        padded.as_slice()
    } else {
        samples
    };

    let (frequency, psd) = match options.method {
        PsdMethod::Fft => fft_psd(samples, sampling_rate, options)?,
        PsdMethod::Welch => welch_psd(samples, sampling_rate, options)?,
        PsdMethod::Rfft => rfft_psd(samples, sampling_rate, options)?,
    };

    Ok(SpectrumResult {
        frequency,
        psd,
        method: options.method,
    })
}

fn scaled_length(length: usize, factor: Option<f64>) -> usize {
    match factor {
        Some(f) => (length as f64 * f) as usize,
        None => length,
    }
}

/// Copy `segment` into a complex buffer of length `n`, truncating or zero-padding
fn complex_buffer(segment: &[f64], n: usize) -> Vec<Complex<f64>> {
    let mut buffer = vec![Complex::new(0.0, 0.0); n];
    for (slot, &x) in buffer.iter_mut().zip(segment) {
        slot.re = x;
    }
    buffer
}

/// Move the zero-frequency bin to the centre
fn fftshift<T>(values: &mut [T]) {
    let half = values.len() / 2;
    values.rotate_right(half);
}

fn fft_psd(samples: &[f64], sampling_rate: f64, options: &PsdOptions) -> Result<(Vec<f64>, Vec<f64>)> {
    let segments = options.subdivision_factor;
    let part_length = samples.len() / segments;
    if part_length == 0 {
        return Err(StationError::InvalidArgument(format!(
            "subdivision factor {} exceeds trace length {}",
            segments,
            samples.len()
        )));
    }
    let n = scaled_length(part_length, options.fft_length_factor);
    if n == 0 {
        return Err(StationError::InvalidArgument("transform length rounds to zero".into()));
    }
    let frequency_step = sampling_rate / n as f64;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);

    let mut magnitude_sum: Vec<f64> = Vec::new();
    for segment in samples.chunks_exact(part_length).take(segments) {
        let mut buffer = complex_buffer(segment, n);
        fft.process(&mut buffer);

        let mut magnitude: Vec<f64> = buffer.iter().map(|c| c.norm() / n as f64).collect();
        fftshift(&mut magnitude);

        if options.one_sided {
            // Fold the negative half: |X|·√2 everywhere except at f = 0
            magnitude = magnitude.split_off(n / 2);
            for (i, m) in magnitude.iter_mut().enumerate() {
                if i > 0 {
                    *m *= SQRT_2;
                }
            }
        }

        if magnitude_sum.is_empty() {
            magnitude_sum = magnitude;
        } else {
            for (acc, m) in magnitude_sum.iter_mut().zip(magnitude) {
                *acc += m;
            }
        }
    }

    let psd: Vec<f64> = magnitude_sum
        .iter()
        .map(|&sum| {
            let mean = sum / segments as f64;
            mean * mean / frequency_step
        })
        .collect();

    let bins = psd.len();
    let frequency: Vec<f64> = if options.one_sided {
        (0..bins).map(|i| i as f64 * frequency_step).collect()
    } else {
        let half_span = frequency_step * (bins as f64 - 1.0) / 2.0;
        (0..bins).map(|i| -half_span + i as f64 * frequency_step).collect()
    };

    Ok((frequency, psd))
}

/// Periodic Hann window, the form used for spectral estimation
fn hann_window(length: usize) -> Vec<f64> {
    if length == 1 {
        return vec![1.0];
    }
    (0..length)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / length as f64).cos())
        .collect()
}

fn detrend_in_place(segment: &mut [f64], detrend: Detrend) {
    let n = segment.len() as f64;
    match detrend {
        Detrend::None => {}
        Detrend::Constant => {
            let mean = segment.iter().sum::<f64>() / n;
            segment.iter_mut().for_each(|x| *x -= mean);
        }
        Detrend::Linear => {
            let mean_t = (n - 1.0) / 2.0;
            let mean_x = segment.iter().sum::<f64>() / n;
            let (mut cov, mut var) = (0.0, 0.0);
            for (i, &x) in segment.iter().enumerate() {
                let dt = i as f64 - mean_t;
                cov += dt * (x - mean_x);
                var += dt * dt;
            }
            let slope = if var > 0.0 { cov / var } else { 0.0 };
            for (i, x) in segment.iter_mut().enumerate() {
                *x -= mean_x + slope * (i as f64 - mean_t);
            }
        }
    }
}

fn welch_psd(samples: &[f64], sampling_rate: f64, options: &PsdOptions) -> Result<(Vec<f64>, Vec<f64>)> {
    let nperseg = (samples.len() / options.subdivision_factor).min(samples.len());
    if nperseg == 0 {
        return Err(StationError::InvalidArgument(format!(
            "subdivision factor {} exceeds trace length {}",
            options.subdivision_factor,
            samples.len()
        )));
    }
    let nfft = match options.fft_length_factor {
        Some(_) => scaled_length(samples.len(), options.fft_length_factor),
        None => nperseg,
    };
    if nfft < nperseg {
        return Err(StationError::InvalidArgument(format!(
            "transform length {} shorter than segment length {}",
            nfft, nperseg
        )));
    }

    let noverlap = nperseg / 2;
    let step = nperseg - noverlap;
    let segment_count = (samples.len() - noverlap) / step;

    let window = hann_window(nperseg);
    let scale = 1.0 / (sampling_rate * window.iter().map(|w| w * w).sum::<f64>());

    let bins = if options.one_sided { nfft / 2 + 1 } else { nfft };
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nfft);

    let mut psd = vec![0.0; bins];
    let mut segment = vec![0.0; nperseg];
    for k in 0..segment_count {
        segment.copy_from_slice(&samples[k * step..k * step + nperseg]);
        detrend_in_place(&mut segment, options.detrend);
        for (x, w) in segment.iter_mut().zip(&window) {
            *x *= w;
        }

        let mut buffer = complex_buffer(&segment, nfft);
        fft.process(&mut buffer);
        for (acc, c) in psd.iter_mut().zip(&buffer) {
            *acc += c.norm_sqr() * scale;
        }
    }
    psd.iter_mut().for_each(|p| *p /= segment_count as f64);

    if options.one_sided {
        // Double everything but DC, and Nyquist when the length is even
        let last = if nfft % 2 == 0 { bins - 1 } else { bins };
        for p in psd.iter_mut().take(last).skip(1) {
            *p *= 2.0;
        }
        let frequency = (0..bins).map(|k| k as f64 * sampling_rate / nfft as f64).collect();
        Ok((frequency, psd))
    } else {
        let mut frequency: Vec<f64> = (0..nfft)
            .map(|k| {
                let k = if k < (nfft + 1) / 2 { k as f64 } else { k as f64 - nfft as f64 };
                k * sampling_rate / nfft as f64
            })
            .collect();
        fftshift(&mut frequency);
        fftshift(&mut psd);
        Ok((frequency, psd))
    }
}

fn rfft_psd(samples: &[f64], sampling_rate: f64, options: &PsdOptions) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut segments = options.subdivision_factor;
    let mut sample_size = samples.len() / segments;
    if sample_size == 0 {
        warn!(
            "Subdivision factor {} bigger than sample size {}, reducing to maximal value",
            segments,
            samples.len()
        );
        sample_size = 1;
        segments = samples.len();
    }

    let n = if options.pad_to_power_of_two && segments != 1 {
        let target = sample_size as f64 * options.fft_length_factor.unwrap_or(1.0);
        target.log2().ceil().exp2() as usize
    } else {
        scaled_length(sample_size, options.fft_length_factor)
    };
    if n == 0 {
        return Err(StationError::InvalidArgument("transform length rounds to zero".into()));
    }

    let bins = n / 2 + 1;
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);

    let mut psd = vec![0.0; bins];
    for segment in samples[..sample_size * segments].chunks_exact(sample_size) {
        let mut buffer = complex_buffer(segment, n);
        fft.process(&mut buffer);
        for (acc, c) in psd.iter_mut().zip(&buffer) {
            *acc += c.norm_sqr();
        }
    }

    let scale = 2.0 / (sampling_rate * n as f64);
    psd.iter_mut().for_each(|p| *p = *p / segments as f64 * scale);
    // DC has no negative-frequency mirror
    psd[0] /= 2.0;

    let frequency = (0..bins).map(|k| k as f64 * sampling_rate / n as f64).collect();
    Ok((frequency, psd))
}

/// Integrate the PSD over each analysis window
///
/// Each band yields `sqrt(mean(psd[band]²) · (high - low))`, where the band's
/// bins are located by binary search in the sorted `frequency` axis. Bands
/// are resolved independently; overlap is not checked.
pub fn integrate_peaks(frequency: &[f64], psd: &[f64], windows: &[AnalysisWindow]) -> IntegratedPeaks {
    let mut peaks = IntegratedPeaks::new();

    for window in windows {
        let start = frequency.partition_point(|&f| f < window.low_hz);
        let end = frequency.partition_point(|&f| f < window.high_hz).min(psd.len());

        let amplitude = if start < end {
            let band = &psd[start..end];
            let mean_square = band.iter().map(|p| p * p).sum::<f64>() / band.len() as f64;
            (mean_square * (window.high_hz - window.low_hz)).sqrt()
        } else {
            warn!(
                "Analysis window '{}' [{}, {}] Hz contains no spectrum bins",
                window.label, window.low_hz, window.high_hz
            );
            0.0
        };

        peaks.insert(window.label.clone(), amplitude);
    }

    peaks
}

/// Spectrum and band amplitudes of one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAnalysis {
    pub channel: u8,
    pub spectrum: SpectrumResult,
    pub peaks: IntegratedPeaks,
}

/// Derive the PSD of one channel trace and integrate it over `windows`
pub fn analyze_channel(
    channel: u8,
    samples: &[f64],
    sampling_rate: f64,
    options: &PsdOptions,
    windows: &[AnalysisWindow],
) -> Result<ChannelAnalysis> {
    let spectrum = derive_psd(samples, sampling_rate, options)?;
    let peaks = integrate_peaks(&spectrum.frequency, &spectrum.psd, windows);
    Ok(ChannelAnalysis {
        channel,
        spectrum,
        peaks,
    })
}
