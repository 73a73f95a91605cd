//! Persisting measurement records
//!
//! A record goes to the remote time-series store, to the local hierarchical
//! store, or to both, as the session config says. The canonical local store
//! lives on a network drive. When that drive cannot be mounted the record
//! goes to a temporary store on the station itself, and [`PersistenceLayer::merge_pending`]
//! moves it over once the drive is back.

use crate::clock::Clock;
use crate::config::{MeasurementConfig, WriteTarget};
use crate::error::{Result, StationError};
use crate::hardware::Capture;
use crate::spectral::ChannelAnalysis;
use crate::store::mount::{connect, NetworkMount, SystemMount};
use crate::store::remote::{InfluxClient, Point, RemoteTimeSeriesStore};
use crate::store::{
    day_group, minute_dataset, month_file_name, named_file, timestamp_attr, DatasetAttrs, Hdf5Store,
    HierarchicalStore, StoredDataset,
};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::sync::Arc;

/// Spectrum bins dropped before upload (DC and its neighbour)
pub const SPECTRUM_CLIP_BINS: usize = 2;

/// Canonical store, its fallback and the drive the canonical store needs
pub struct LocalStores {
    pub canonical: Box<dyn HierarchicalStore>,
    pub temp: Box<dyn HierarchicalStore>,
    pub mount: Box<dyn NetworkMount>,
}

/// Which local store received a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDestination {
    Canonical,
    Temporary,
}

/// Outcome of one [`PersistenceLayer::merge_pending`] run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    pub files: usize,
    pub copied: usize,
    pub skipped: usize,
}

/// Outcome of one [`PersistenceLayer::save`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveReport {
    pub remote_written: bool,
    pub local: Option<(LocalDestination, String)>,
    pub merged: MergeReport,
    /// Set when the record was stored but pending temp files could not be
    /// merged. They stay in place for the next save.
    pub merge_error: Option<String>,
}

pub struct PersistenceLayer {
    local: Option<LocalStores>,
    remote: Option<Box<dyn RemoteTimeSeriesStore>>,
    clock: Arc<dyn Clock>,
}

impl PersistenceLayer {
    pub fn new(
        local: Option<LocalStores>,
        remote: Option<Box<dyn RemoteTimeSeriesStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { local, remote, clock }
    }

    /// HDF5 stores, the system mount table and an InfluxDB client, as configured
    pub fn from_config(config: &MeasurementConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mount = match &config.local {
            Some(local) => SystemMount::new(&local.network_drive).with_server(local.server.clone()),
            None => SystemMount::new(""),
        };
        Self::from_config_with_mount(config, Box::new(mount), clock)
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied mount
    pub fn from_config_with_mount(
        config: &MeasurementConfig,
        mount: Box<dyn NetworkMount>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let local = config.local.as_ref().map(|local| LocalStores {
            canonical: Box::new(Hdf5Store::new(&local.save_location)) as Box<dyn HierarchicalStore>,
            temp: Box::new(Hdf5Store::new(&local.temp_save_location)) as Box<dyn HierarchicalStore>,
            mount,
        });
        let remote = config
            .remote
            .as_ref()
            .map(|remote| Box::new(InfluxClient::new(remote.clone())) as Box<dyn RemoteTimeSeriesStore>);
        Ok(Self::new(local, remote, clock))
    }

    /// Persist one capture and its per-channel analyses
    ///
    /// Remote failures are returned in remote-only mode. In combined mode
    /// they are logged and the local store still receives the record.
    pub fn save(
        &mut self,
        capture: &Capture,
        analyses: &[ChannelAnalysis],
        timestamp: DateTime<Local>,
        config: &MeasurementConfig,
    ) -> Result<SaveReport> {
        let mut report = SaveReport::default();

        if config.write_to.writes_remote() {
            match self.save_remote(capture, analyses, timestamp, config) {
                Ok(()) => report.remote_written = true,
                Err(e) if config.write_to == WriteTarget::Both => {
                    warn!("Remote write failed, keeping the local copy only: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if config.write_to.writes_local() {
            let (destination, path) = self.save_local(capture, timestamp, config)?;
            report.local = Some((destination, path));
            if destination == LocalDestination::Canonical {
                if let Some(local) = self.local.as_mut() {
                    match merge_stores(local) {
                        Ok(merged) => report.merged = merged,
                        Err(e) => {
                            warn!("Record saved, but merging pending temporary files failed: {}", e);
                            report.merge_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn save_remote(
        &mut self,
        capture: &Capture,
        analyses: &[ChannelAnalysis],
        timestamp: DateTime<Local>,
        config: &MeasurementConfig,
    ) -> Result<()> {
        let settings = config
            .remote
            .as_ref()
            .ok_or_else(|| StationError::Config("remote store selected but not configured".into()))?;
        let remote = self
            .remote
            .as_mut()
            .ok_or_else(|| StationError::Config("no remote store client available".into()))?;

        let start_ns = timestamp
            .timestamp_nanos_opt()
            .ok_or_else(|| StationError::Persistence(format!("timestamp {} out of range", timestamp)))?;

        remote.refresh()?;

        debug!("Start writing traces...");
        let mut trace = Vec::new();
        for raw in capture.split_channels() {
            trace.extend(time_trace_points(
                raw.channel,
                &raw.samples,
                raw.actual_sampling_rate,
                start_ns,
                &timestamp,
                &config.location,
            ));
        }
        remote.write(&settings.time_trace_bucket, &trace)?;

        debug!("Start writing PSDs...");
        let mut spectra = Vec::new();
        let mut peaks = Vec::new();
        for analysis in analyses {
            let (frequency, psd) = analysis.spectrum.clipped(SPECTRUM_CLIP_BINS);
            spectra.extend(spectrum_points(
                analysis.channel,
                frequency,
                psd,
                config.measurement_seconds(),
                start_ns,
                &timestamp,
                &config.location,
            ));
            peaks.push(peaks_point(analysis, start_ns, &timestamp, &config.location));
        }
        remote.write(&settings.spectrum_bucket, &spectra)?;

        debug!("Write peaks...");
        remote.write(&settings.peaks_bucket, &peaks)?;

        info!(
            "Wrote {} trace, {} spectrum and {} peak points to {}",
            trace.len(),
            spectra.len(),
            peaks.len(),
            settings.url
        );
        Ok(())
    }

    fn save_local(
        &mut self,
        capture: &Capture,
        timestamp: DateTime<Local>,
        config: &MeasurementConfig,
    ) -> Result<(LocalDestination, String)> {
        let settings = config
            .local
            .as_ref()
            .ok_or_else(|| StationError::Config("local store selected but not configured".into()))?;
        let local = self
            .local
            .as_mut()
            .ok_or_else(|| StationError::Config("no local store available".into()))?;

        let file = settings
            .filename
            .as_deref()
            .map(named_file)
            .unwrap_or_else(|| month_file_name(&timestamp));
        let group = day_group(&timestamp);
        let dataset = StoredDataset {
            data: capture.data.clone(),
            attrs: DatasetAttrs {
                channels: capture.channels.clone(),
                samples_per_channel: capture.samples_per_channel as u64,
                sampling_rate: capture.sampling_rate,
                address: capture.address,
                actual_sampling_rate: capture.actual_sampling_rate,
                timestamp: timestamp_attr(&timestamp),
            },
        };

        let mounted = connect(local.mount.as_mut(), settings, self.clock.as_ref());
        let (destination, store) = match mounted {
            Ok(()) => (LocalDestination::Canonical, local.canonical.as_mut()),
            Err(e) => {
                warn!("Connection to network drive failed, data will be saved locally: {}", e);
                (LocalDestination::Temporary, local.temp.as_mut())
            }
        };

        let name = write_record(store, &file, &group, &timestamp, &dataset)?;
        let path = format!("{}/{}/{}", file, group, name);
        info!("Saved capture to {:?} store as {}", destination, path);
        Ok((destination, path))
    }

    /// Move every temporary record into the canonical store
    ///
    /// Files are handled in sorted order. Datasets already present in the
    /// canonical store are skipped, never overwritten. Each temp file is
    /// deleted once processed. Nothing pending means nothing to do, so this
    /// is safe to call at any time.
    pub fn merge_pending(&mut self, config: &MeasurementConfig) -> Result<MergeReport> {
        let Some(local) = self.local.as_mut() else {
            return Ok(MergeReport::default());
        };
        if local.temp.list_files()?.is_empty() {
            return Ok(MergeReport::default());
        }
        if let Some(settings) = &config.local {
            connect(local.mount.as_mut(), settings, self.clock.as_ref())?;
        }
        merge_stores(local)
    }
}

/// Write `dataset` under its minute name, or its second name if the minute is taken
fn write_record(
    store: &mut dyn HierarchicalStore,
    file: &str,
    group: &str,
    timestamp: &DateTime<Local>,
    dataset: &StoredDataset,
) -> Result<String> {
    store.ensure_group(file, group)?;
    let mut name = minute_dataset(timestamp);
    if store.contains_dataset(file, group, &name)? {
        let fallback = timestamp.format("%H-%M-%S").to_string();
        warn!("Dataset {}/{}/{} exists, saving as {}", file, group, name, fallback);
        name = fallback;
    }
    store.write_dataset(file, group, &name, dataset)?;
    Ok(name)
}

fn merge_stores(local: &mut LocalStores) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    for file in local.temp.list_files()? {
        debug!("Merging temporary file {}", file);
        for group in local.temp.groups(&file)? {
            local.canonical.ensure_group(&file, &group)?;
            for name in local.temp.datasets(&file, &group)? {
                if local.canonical.contains_dataset(&file, &group, &name)? {
                    info!("Dataset {}/{}/{} already exists, skipped", file, group, name);
                    report.skipped += 1;
                    continue;
                }
                let dataset = local.temp.read_dataset(&file, &group, &name)?;
                local.canonical.write_dataset(&file, &group, &name, &dataset)?;
                report.copied += 1;
            }
        }
        local.temp.delete(&file)?;
        report.files += 1;
    }
    if report.files > 0 {
        info!(
            "Merged {} temporary file(s): {} dataset(s) copied, {} skipped",
            report.files, report.copied, report.skipped
        );
    }
    Ok(report)
}

fn tagged(point: Point, channel: u8, timestamp: &DateTime<Local>, location: &str) -> Point {
    point
        .tag("date_string", day_group(timestamp))
        .tag("time_string", minute_dataset(timestamp))
        .tag("location", location)
        .tag("channel", channel.to_string())
}

/// One `accelerometer_data` point per sample
pub fn time_trace_points(
    channel: u8,
    samples: &[f64],
    actual_sampling_rate: f64,
    start_ns: i64,
    timestamp: &DateTime<Local>,
    location: &str,
) -> Vec<Point> {
    let step_ns = 1e9 / actual_sampling_rate;
    samples
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let point = Point::new("accelerometer_data", start_ns + (i as f64 * step_ns) as i64)
                .field("sensor_output", value);
            tagged(point, channel, timestamp, location)
        })
        .collect()
}

/// One `spectrum_data` point per bin, the frequency axis mapped onto time
///
/// Bin `f` lands at `start + f / seconds_to_Hz` seconds, where
/// `seconds_to_Hz = max(f) / measurement_seconds`.
pub fn spectrum_points(
    channel: u8,
    frequency: &[f64],
    psd: &[f64],
    measurement_seconds: f64,
    start_ns: i64,
    timestamp: &DateTime<Local>,
    location: &str,
) -> Vec<Point> {
    let max_frequency = frequency.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let seconds_to_hz = max_frequency / measurement_seconds;
    if !(seconds_to_hz > 0.0) || !seconds_to_hz.is_finite() {
        warn!("Spectrum of channel {} has no positive frequency axis, not uploaded", channel);
        return Vec::new();
    }
    frequency
        .iter()
        .zip(psd)
        .map(|(&f, &p)| {
            let point = Point::new("spectrum_data", start_ns + (f * 1e9 / seconds_to_hz) as i64)
                .field("spectrum", p)
                .tag("seconds_to_Hz", seconds_to_hz.to_string());
            tagged(point, channel, timestamp, location)
        })
        .collect()
}

/// One `integrated_peaks` point holding every band amplitude
pub fn peaks_point(analysis: &ChannelAnalysis, start_ns: i64, timestamp: &DateTime<Local>, location: &str) -> Point {
    let point = analysis
        .peaks
        .iter()
        .fold(Point::new("integrated_peaks", start_ns), |point, (label, &amplitude)| {
            point.field(label, amplitude)
        });
    tagged(point, analysis.channel, timestamp, location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hardware::sim::SimulatedMount;
    use crate::spectral::{analyze_channel, PsdOptions};
    use crate::store::remote::MemoryRemote;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    struct Harness {
        layer: PersistenceLayer,
        canonical: MemoryStore,
        temp: MemoryStore,
        mount: SimulatedMount,
        remote: MemoryRemote,
        clock: ManualClock,
    }

    fn harness(mounted: bool) -> Harness {
        let canonical = MemoryStore::new();
        let temp = MemoryStore::new();
        let mount = SimulatedMount::new(mounted);
        let remote = MemoryRemote::new();
        let clock = ManualClock::starting_at(Local.with_ymd_and_hms(2024, 3, 7, 14, 0, 0).unwrap());
        let layer = PersistenceLayer::new(
            Some(LocalStores {
                canonical: Box::new(canonical.clone()),
                temp: Box::new(temp.clone()),
                mount: Box::new(mount.clone()),
            }),
            Some(Box::new(remote.clone())),
            Arc::new(clock.clone()),
        );
        Harness {
            layer,
            canonical,
            temp,
            mount,
            remote,
            clock,
        }
    }

    fn config(write_to: &str) -> MeasurementConfig {
        MeasurementConfig::from_json_str(&format!(
            r#"{{"write_to": "{}", "token": "t", "location": "D",
                "measurement_time": 0.01, "mount_retries": 3,
                "analysis_windows": {{"low": [1.0, 20.0], "high": [20.0, 45.0]}}}}"#,
            write_to
        ))
        .unwrap()
    }

    fn capture(at: DateTime<Local>) -> (Capture, Vec<ChannelAnalysis>) {
        let fs = 100.0;
        let data: Vec<f64> = (0..600)
            .map(|i| (2.0 * std::f64::consts::PI * 10.0 * i as f64 / fs).sin())
            .collect();
        let capture = Capture {
            channels: vec![0],
            samples_per_channel: 600,
            sampling_rate: fs,
            actual_sampling_rate: fs,
            address: 0,
            acquired_at: at,
            data,
        };
        let options = PsdOptions {
            subdivision_factor: 4,
            ..Default::default()
        };
        let windows = config("h5py").analysis_windows;
        let analyses = capture
            .split_channels()
            .iter()
            .map(|raw| analyze_channel(raw.channel, &raw.samples, fs, &options, &windows).unwrap())
            .collect();
        (capture, analyses)
    }

    #[test]
    fn test_unmounted_save_then_merge() {
        let mut h = harness(false);
        let config = config("h5py");
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 5).unwrap();
        let (capture, analyses) = capture(at);

        let report = h.layer.save(&capture, &analyses, at, &config).unwrap();
        assert_eq!(
            report.local,
            Some((LocalDestination::Temporary, "2024-03.h5/2024-03-07/14-30".to_string()))
        );
        assert_eq!(h.temp.dataset_count(), 1);
        assert_eq!(h.canonical.dataset_count(), 0);
        // Three mount attempts, two seconds apart
        assert_eq!(h.clock.elapsed(), std::time::Duration::from_secs(4));

        h.mount.set_reachable(true);
        let merged = h.layer.merge_pending(&config).unwrap();
        assert_eq!(merged, MergeReport { files: 1, copied: 1, skipped: 0 });
        assert!(h.temp.list_files().unwrap().is_empty());
        let stored = h.canonical.read_dataset("2024-03.h5", "2024-03-07", "14-30").unwrap();
        assert_eq!(stored.data, capture.data);
        assert_eq!(stored.attrs.timestamp, "2024-03-07:14-30-05");
        assert_eq!(stored.attrs.samples_per_channel, 600);

        let again = h.layer.merge_pending(&config).unwrap();
        assert_eq!(again, MergeReport::default());
        assert_eq!(h.canonical.dataset_count(), 1);
    }

    #[test]
    fn test_canonical_save_merges_pending() {
        let mut h = harness(false);
        let config = config("local");
        let first = Local.with_ymd_and_hms(2024, 3, 7, 14, 0, 0).unwrap();
        let (capture_a, analyses_a) = capture(first);
        h.layer.save(&capture_a, &analyses_a, first, &config).unwrap();

        h.mount.set_reachable(true);
        let second = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 0).unwrap();
        let (capture_b, analyses_b) = capture(second);
        let report = h.layer.save(&capture_b, &analyses_b, second, &config).unwrap();
        assert_eq!(report.local.unwrap().0, LocalDestination::Canonical);
        assert_eq!(report.merged.copied, 1);
        assert_eq!(h.canonical.datasets("2024-03.h5", "2024-03-07").unwrap(), vec!["14-00", "14-30"]);
        assert_eq!(h.temp.dataset_count(), 0);
    }

    /// Temp store holding one file whose groups cannot be read
    struct UnreadableTemp;

    impl HierarchicalStore for UnreadableTemp {
        fn list_files(&self) -> Result<Vec<String>> {
            Ok(vec!["2024-02.h5".to_string()])
        }

        fn groups(&self, file: &str) -> Result<Vec<String>> {
            Err(StationError::Storage(format!("{} is truncated", file)))
        }

        fn datasets(&self, _file: &str, _group: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn ensure_group(&mut self, _file: &str, _group: &str) -> Result<()> {
            Ok(())
        }

        fn contains_dataset(&self, _file: &str, _group: &str, _name: &str) -> Result<bool> {
            Ok(false)
        }

        fn write_dataset(&mut self, _file: &str, _group: &str, _name: &str, _dataset: &StoredDataset) -> Result<()> {
            Ok(())
        }

        fn read_dataset(&self, file: &str, group: &str, name: &str) -> Result<StoredDataset> {
            Err(StationError::Storage(format!("{}/{}/{} unreadable", file, group, name)))
        }

        fn delete(&mut self, _file: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_merge_keeps_saved_record() {
        let canonical = MemoryStore::new();
        let clock = ManualClock::starting_at(Local.with_ymd_and_hms(2024, 3, 7, 14, 0, 0).unwrap());
        let mut layer = PersistenceLayer::new(
            Some(LocalStores {
                canonical: Box::new(canonical.clone()),
                temp: Box::new(UnreadableTemp),
                mount: Box::new(SimulatedMount::new(true)),
            }),
            None,
            Arc::new(clock),
        );
        let config = config("h5py");
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 0).unwrap();
        let (capture, analyses) = capture(at);

        let report = layer.save(&capture, &analyses, at, &config).unwrap();
        assert_eq!(report.local.unwrap().0, LocalDestination::Canonical);
        assert!(report.merge_error.unwrap().contains("truncated"));
        assert_eq!(report.merged, MergeReport::default());
        assert_eq!(canonical.dataset_count(), 1);

        // Reconciling on request still reports the bad file
        assert!(layer.merge_pending(&config).is_err());
    }

    #[test]
    fn test_merge_skips_existing_datasets() {
        let mut h = harness(true);
        let config = config("h5py");
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 15, 0).unwrap();
        let (capture, analyses) = capture(at);
        h.layer.save(&capture, &analyses, at, &config).unwrap();

        let mut temp = h.temp.clone();
        let mut duplicate = h.canonical.read_dataset("2024-03.h5", "2024-03-07", "09-15").unwrap();
        duplicate.data[0] = 42.0;
        temp.ensure_group("2024-03.h5", "2024-03-07").unwrap();
        temp.write_dataset("2024-03.h5", "2024-03-07", "09-15", &duplicate).unwrap();

        let merged = h.layer.merge_pending(&config).unwrap();
        assert_eq!(merged, MergeReport { files: 1, copied: 0, skipped: 1 });
        let kept = h.canonical.read_dataset("2024-03.h5", "2024-03-07", "09-15").unwrap();
        assert_eq!(kept.data[0], capture.data[0]);
    }

    #[test]
    fn test_same_minute_saved_under_seconds() {
        let mut h = harness(true);
        let config = config("h5py");
        let first = Local.with_ymd_and_hms(2024, 3, 7, 9, 15, 2).unwrap();
        let second = Local.with_ymd_and_hms(2024, 3, 7, 9, 15, 40).unwrap();
        let (capture, analyses) = capture(first);
        h.layer.save(&capture, &analyses, first, &config).unwrap();
        let report = h.layer.save(&capture, &analyses, second, &config).unwrap();
        assert_eq!(report.local.unwrap().1, "2024-03.h5/2024-03-07/09-15-40");
        assert_eq!(h.canonical.dataset_count(), 2);
    }

    #[test]
    fn test_remote_records() {
        let mut h = harness(true);
        let config = config("influxdb");
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 0).unwrap();
        let (capture, analyses) = capture(at);

        let report = h.layer.save(&capture, &analyses, at, &config).unwrap();
        assert!(report.remote_written);
        assert!(report.local.is_none());
        assert_eq!(h.canonical.dataset_count(), 0);

        let trace = h.remote.points("TimeTraceData");
        assert_eq!(trace.len(), 600);
        assert_eq!(trace[1].timestamp_ns - trace[0].timestamp_ns, 10_000_000);
        assert_eq!(trace[0].tags["location"], "D");
        assert_eq!(trace[0].tags["time_string"], "14-30");

        let spectrum = h.remote.points("SpectrumData");
        assert_eq!(spectrum.len(), analyses[0].spectrum.frequency.len() - SPECTRUM_CLIP_BINS);
        // The highest bin maps onto the end of the measurement
        let end_ns = at.timestamp_nanos_opt().unwrap() + (config.measurement_seconds() * 1e9) as i64;
        assert!((spectrum.last().unwrap().timestamp_ns - end_ns).abs() < 1000);

        let peaks = h.remote.points("IntegratedPeaksData");
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].fields.len(), 2);
        assert!(peaks[0].fields["low"] > peaks[0].fields["high"]);
    }

    #[test]
    fn test_remote_failure_surfaces_in_remote_mode() {
        let mut h = harness(true);
        h.remote.set_failing(true);
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 0).unwrap();
        let (capture, analyses) = capture(at);
        let err = h.layer.save(&capture, &analyses, at, &config("remote")).unwrap_err();
        assert!(matches!(err, StationError::Connectivity(_)));
    }

    #[test]
    fn test_remote_failure_falls_back_in_combined_mode() {
        let mut h = harness(true);
        h.remote.set_failing(true);
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 0).unwrap();
        let (capture, analyses) = capture(at);
        let report = h.layer.save(&capture, &analyses, at, &config("both")).unwrap();
        assert!(!report.remote_written);
        assert_eq!(report.local.unwrap().0, LocalDestination::Canonical);
        assert_eq!(h.canonical.dataset_count(), 1);
    }

    #[test]
    fn test_merge_with_nothing_pending_is_noop() {
        let mut h = harness(false);
        let report = h.layer.merge_pending(&config("h5py")).unwrap();
        assert_eq!(report, MergeReport::default());
        assert_eq!(h.clock.elapsed(), std::time::Duration::ZERO);
    }
}
