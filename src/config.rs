//! Measurement session configuration
//!
//! A config file is plain JSON. It is parsed once per mode entry into a
//! [`MeasurementConfig`], which is immutable for the rest of the session.
//!
//! ```json
//! {
//!     "location": "D",
//!     "write_to": "both",
//!     "sampling_rate": 1000.0,
//!     "settling_time": 5.0,
//!     "measurement_time": 10.0,
//!     "measurement_period": 30.0,
//!     "subdivision_factor": 32,
//!     "analysis_windows": {"low": [1.0, 10.0], "mid": [10.0, 100.0]},
//!     "token": "..."
//! }
//! ```

use crate::clock::minutes;
use crate::error::{Result, StationError};
use crate::spectral::PsdMethod;
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest allowed spacing between automatic measurements, in minutes
pub const MAX_MEASUREMENT_PERIOD_MIN: f64 = 60.0;

/// Where measurement records are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Hierarchical files on the network drive (temp store as fallback)
    Local,
    /// Remote time-series store only
    Remote,
    /// Remote store first, then the local files
    Both,
}

impl WriteTarget {
    pub fn writes_remote(&self) -> bool {
        matches!(self, WriteTarget::Remote | WriteTarget::Both)
    }

    pub fn writes_local(&self) -> bool {
        matches!(self, WriteTarget::Local | WriteTarget::Both)
    }
}

impl std::str::FromStr for WriteTarget {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h5py" | "local" | "hdf5" => Ok(WriteTarget::Local),
            "influxdb" | "remote" => Ok(WriteTarget::Remote),
            "both" => Ok(WriteTarget::Both),
            other => Err(StationError::Config(format!("Unknown write_to target '{}'", other))),
        }
    }
}

/// A named frequency band for peak integration
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisWindow {
    pub label: String,
    pub low_hz: f64,
    pub high_hz: f64,
}

/// Remote time-series store settings
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStoreConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub time_trace_bucket: String,
    pub spectrum_bucket: String,
    pub peaks_bucket: String,
}

/// Local hierarchical store settings
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStoreConfig {
    /// `None` means one file per month (`%Y-%m.h5`)
    pub filename: Option<String>,
    pub network_drive: PathBuf,
    pub save_location: PathBuf,
    pub temp_save_location: PathBuf,
    pub mount_retries: u32,
    pub mount_retry_delay: Duration,
    /// File server that must answer a ping before mounting, if any
    pub server: Option<String>,
    pub server_retries: u32,
    pub server_retry_delay: Duration,
}

/// Validated, immutable configuration for one measurement session
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementConfig {
    pub location: String,
    pub write_to: WriteTarget,
    pub sampling_rate: f64,
    /// Minutes
    pub settling_time: f64,
    /// Minutes
    pub measurement_duration: f64,
    /// Minutes, never above [`MAX_MEASUREMENT_PERIOD_MIN`]
    pub measurement_period: f64,
    pub subdivision_factor: usize,
    pub psd_method: PsdMethod,
    pub channels: Vec<u8>,
    /// Sorted by label, the order peaks are reported in
    pub analysis_windows: Vec<AnalysisWindow>,
    pub remote: Option<RemoteStoreConfig>,
    pub local: Option<LocalStoreConfig>,
}

/// On-disk layout of a config file, before validation
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_location")]
    location: String,
    #[serde(default = "default_write_to")]
    write_to: String,
    #[serde(default = "default_sampling_rate")]
    sampling_rate: f64,
    #[serde(default = "default_settling_time")]
    settling_time: f64,
    #[serde(default = "default_measurement_time")]
    measurement_time: f64,
    #[serde(default = "default_measurement_period")]
    measurement_period: f64,
    #[serde(default = "default_subdivision_factor")]
    subdivision_factor: usize,
    #[serde(default = "default_psd_method")]
    psd_method: String,
    #[serde(default = "default_channels")]
    channels: Vec<u8>,
    analysis_windows: Option<BTreeMap<String, [f64; 2]>>,

    token: Option<String>,
    #[serde(default = "default_org")]
    org: String,
    #[serde(default = "default_url")]
    url: String,
    #[serde(default = "default_time_trace_bucket")]
    time_trace_bucket: String,
    #[serde(default = "default_spectrum_bucket")]
    spectrum_bucket: String,
    #[serde(default = "default_peaks_bucket")]
    peaks_bucket: String,

    #[serde(default = "default_filename")]
    filename: String,
    #[serde(default = "default_network_drive")]
    network_drive: PathBuf,
    #[serde(default = "default_save_location")]
    save_location: PathBuf,
    #[serde(default = "default_temp_save_location")]
    temp_save_location: PathBuf,
    #[serde(default = "default_mount_retries")]
    mount_retries: u32,
    /// Seconds
    #[serde(default = "default_mount_retry_delay")]
    mount_retry_delay: f64,
    server: Option<String>,
    #[serde(default = "default_server_retries")]
    server_retries: u32,
    /// Seconds
    #[serde(default = "default_server_retry_delay")]
    server_retry_delay: f64,
}

fn default_location() -> String {
    "HPP".to_string()
}

fn default_write_to() -> String {
    "h5py".to_string()
}

fn default_sampling_rate() -> f64 {
    1000.0
}

fn default_settling_time() -> f64 {
    5.0
}

fn default_measurement_time() -> f64 {
    10.0
}

fn default_measurement_period() -> f64 {
    30.0
}

fn default_subdivision_factor() -> usize {
    32
}

fn default_psd_method() -> String {
    "welch".to_string()
}

fn default_channels() -> Vec<u8> {
    vec![0]
}

fn default_org() -> String {
    "PhotonicsVibration".to_string()
}

fn default_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_time_trace_bucket() -> String {
    "TimeTraceData".to_string()
}

fn default_spectrum_bucket() -> String {
    "SpectrumData".to_string()
}

fn default_peaks_bucket() -> String {
    "IntegratedPeaksData".to_string()
}

fn default_filename() -> String {
    "default".to_string()
}

fn default_network_drive() -> PathBuf {
    PathBuf::from("/media/vibration")
}

fn default_save_location() -> PathBuf {
    PathBuf::from("/media/vibration/d")
}

fn default_temp_save_location() -> PathBuf {
    PathBuf::from("/home/pi/Documents/temp_file_storage")
}

fn default_mount_retries() -> u32 {
    10
}

fn default_mount_retry_delay() -> f64 {
    2.0
}

fn default_server_retries() -> u32 {
    10
}

fn default_server_retry_delay() -> f64 {
    5.0
}

impl MeasurementConfig {
    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StationError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate config JSON
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| StationError::Config(format!("Malformed config: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let write_to: WriteTarget = raw.write_to.parse()?;
        let psd_method: PsdMethod = raw
            .psd_method
            .parse()
            .map_err(|e| StationError::Config(format!("psd_method: {}", e)))?;

        if !(raw.sampling_rate > 0.0) {
            return Err(StationError::Config(format!(
                "sampling_rate must be positive, got {}",
                raw.sampling_rate
            )));
        }
        if !(raw.measurement_time > 0.0) || !(raw.measurement_period > 0.0) || raw.settling_time < 0.0 {
            return Err(StationError::Config(
                "measurement_time and measurement_period must be positive, settling_time non-negative".into(),
            ));
        }
        if raw.subdivision_factor == 0 {
            return Err(StationError::Config("subdivision_factor must be at least 1".into()));
        }
        if raw.channels.is_empty() {
            return Err(StationError::Config("channels must list at least one DAQ channel".into()));
        }

        let mut measurement_period = raw.measurement_period;
        if measurement_period > MAX_MEASUREMENT_PERIOD_MIN {
            warn!(
                "Desired period of {} min too long, reduced to {}",
                measurement_period, MAX_MEASUREMENT_PERIOD_MIN
            );
            measurement_period = MAX_MEASUREMENT_PERIOD_MIN;
        }
        if raw.measurement_time + raw.settling_time > measurement_period {
            warn!(
                "Measurements too frequent ({} + {} min > {} min period), some will be skipped",
                raw.measurement_time, raw.settling_time, measurement_period
            );
        }

        let windows = raw
            .analysis_windows
            .ok_or_else(|| StationError::Config("Missing required key 'analysis_windows'".into()))?;
        let mut analysis_windows = Vec::with_capacity(windows.len());
        for (label, [low_hz, high_hz]) in windows {
            if !(low_hz < high_hz) {
                return Err(StationError::Config(format!(
                    "Analysis window '{}' must have low < high, got [{}, {}]",
                    label, low_hz, high_hz
                )));
            }
            analysis_windows.push(AnalysisWindow { label, low_hz, high_hz });
        }

        let remote = if write_to.writes_remote() {
            let token = raw
                .token
                .ok_or_else(|| StationError::Config("Missing required key 'token' for remote store".into()))?;
            Some(RemoteStoreConfig {
                url: raw.url,
                token,
                org: raw.org,
                time_trace_bucket: raw.time_trace_bucket,
                spectrum_bucket: raw.spectrum_bucket,
                peaks_bucket: raw.peaks_bucket,
            })
        } else {
            None
        };

        let local = if write_to.writes_local() {
            Some(LocalStoreConfig {
                filename: (raw.filename != "default").then_some(raw.filename),
                network_drive: raw.network_drive,
                save_location: raw.save_location,
                temp_save_location: raw.temp_save_location,
                mount_retries: raw.mount_retries.max(1),
                mount_retry_delay: Duration::from_secs_f64(raw.mount_retry_delay.max(0.0)),
                server: raw.server.filter(|host| !host.trim().is_empty()),
                server_retries: raw.server_retries.max(1),
                server_retry_delay: Duration::from_secs_f64(raw.server_retry_delay.max(0.0)),
            })
        } else {
            None
        };

        Ok(Self {
            location: raw.location,
            write_to,
            sampling_rate: raw.sampling_rate,
            settling_time: raw.settling_time,
            measurement_duration: raw.measurement_time,
            measurement_period,
            subdivision_factor: raw.subdivision_factor,
            psd_method,
            channels: raw.channels,
            analysis_windows,
            remote,
            local,
        })
    }

    pub fn settling_duration(&self) -> Duration {
        minutes(self.settling_time)
    }

    pub fn measurement_seconds(&self) -> f64 {
        self.measurement_duration * 60.0
    }

    /// Number of samples each channel records during one capture
    pub fn samples_per_channel(&self) -> usize {
        (self.sampling_rate * self.measurement_seconds()).round() as usize
    }
}

/// Which of the two session configs a mode loads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProfile {
    Auto,
    Manual,
}

/// Supplies a fresh config whenever the state machine enters a mode
pub trait ConfigSource: Send {
    fn load(&self, profile: ConfigProfile) -> Result<MeasurementConfig>;
}

/// The two JSON files the station reads its sessions from
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    pub auto: PathBuf,
    pub manual: PathBuf,
}

impl ConfigSource for ConfigFiles {
    fn load(&self, profile: ConfigProfile) -> Result<MeasurementConfig> {
        match profile {
            ConfigProfile::Auto => MeasurementConfig::load(&self.auto),
            ConfigProfile::Manual => MeasurementConfig::load(&self.manual),
        }
    }
}

/// Fixed in-memory configs, for dry runs and tests
#[derive(Debug, Clone)]
pub struct StaticConfigs {
    pub auto: MeasurementConfig,
    pub manual: MeasurementConfig,
}

impl ConfigSource for StaticConfigs {
    fn load(&self, profile: ConfigProfile) -> Result<MeasurementConfig> {
        Ok(match profile {
            ConfigProfile::Auto => self.auto.clone(),
            ConfigProfile::Manual => self.manual.clone(),
        })
    }
}
