//! Simulated station hardware
//!
//! Stand-ins for the relay board, the DAQ HAT, the toggle switch, the LEDs,
//! the network drive and the power button, so the whole station can run on
//! a development machine. Handles are cheap clones sharing one state, which
//! lets a test keep a handle while the station owns another.

use super::daq::{DataAcquisitionDevice, ScanStatus};
use super::{Indicator, ModeSwitch, PowerControl, PowerRelay, StationBackend};
use crate::button::InputClassifier;
use crate::clock::Clock;
use crate::config::MeasurementConfig;
use crate::error::{Result, StationError};
use crate::persistence::{LocalStores, PersistenceLayer};
use crate::store::mount::NetworkMount;
use crate::store::remote::{MemoryRemote, RemoteTimeSeriesStore};
use crate::store::MemoryStore;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Relay board keeping its line levels in memory
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    lines: Arc<Mutex<[[bool; 2]; 2]>>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every line is in measure position
    pub fn is_measuring(&self) -> bool {
        self.lines().iter().flatten().all(|&line| line)
    }

    /// True when every line is in charge position
    pub fn is_charging(&self) -> bool {
        self.lines().iter().flatten().all(|&line| !line)
    }

    fn lines(&self) -> [[bool; 2]; 2] {
        *self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, channel: usize, level: bool) -> Result<()> {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let lines = lines
            .get_mut(channel)
            .ok_or_else(|| StationError::MeasurementFailure(format!("no relay channel {}", channel)))?;
        *lines = [level, level];
        Ok(())
    }
}

impl PowerRelay for SimulatedRelay {
    fn set_measure(&mut self, channel: usize) -> Result<()> {
        self.set(channel, true)
    }

    fn set_charge(&mut self, channel: usize) -> Result<()> {
        self.set(channel, false)
    }

    fn read_state(&self, channel: usize) -> Result<[bool; 2]> {
        self.lines()
            .get(channel)
            .copied()
            .ok_or_else(|| StationError::MeasurementFailure(format!("no relay channel {}", channel)))
    }
}

/// DAQ producing a sum of sine tones plus uniform noise
///
/// A scan "runs" for as many one-second polls as its nominal length.
pub struct SimulatedDaq {
    tones: Vec<(f64, f64)>,
    noise_amplitude: f64,
    rng: StdRng,
    channels: Vec<u8>,
    samples_per_channel: usize,
    sampling_rate: f64,
    polls_remaining: u64,
    running: bool,
    cleaned_up: bool,
    truncate_to: Option<usize>,
    overruns: bool,
    failing_scans: Arc<AtomicU32>,
}

impl SimulatedDaq {
    /// `tones` are (frequency Hz, amplitude) pairs
    pub fn new(tones: Vec<(f64, f64)>, noise_amplitude: f64) -> Self {
        Self {
            tones,
            noise_amplitude,
            rng: StdRng::seed_from_u64(0x5eed),
            channels: vec![0],
            samples_per_channel: 0,
            sampling_rate: 1.0,
            polls_remaining: 0,
            running: false,
            cleaned_up: false,
            truncate_to: None,
            overruns: false,
            failing_scans: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Share a counter of upcoming scans that stop early
    pub fn with_fault_counter(mut self, failing_scans: Arc<AtomicU32>) -> Self {
        self.failing_scans = failing_scans;
        self
    }

    /// Make the next scan deliver only `samples` values
    pub fn truncate_next_scan(&mut self, samples: usize) {
        self.truncate_to = Some(samples);
    }

    /// Report hardware and buffer overruns while scanning
    pub fn report_overruns(&mut self, overruns: bool) {
        self.overruns = overruns;
    }

    pub fn cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    fn sample(&mut self, index: usize) -> f64 {
        let t = index as f64 / self.sampling_rate;
        let signal: f64 = self
            .tones
            .iter()
            .map(|&(freq, amplitude)| amplitude * (2.0 * PI * freq * t).sin())
            .sum();
        let noise = if self.noise_amplitude > 0.0 {
            self.noise_amplitude * self.rng.random_range(-1.0..1.0)
        } else {
            0.0
        };
        signal + noise
    }
}

impl DataAcquisitionDevice for SimulatedDaq {
    fn address(&self) -> u8 {
        0
    }

    fn configure(&mut self, channels: &[u8], samples_per_channel: usize, sampling_rate: f64) -> Result<f64> {
        if channels.is_empty() || !(sampling_rate > 0.0) {
            return Err(StationError::AcquisitionFault("invalid scan configuration".into()));
        }
        self.channels = channels.to_vec();
        self.samples_per_channel = samples_per_channel;
        self.sampling_rate = sampling_rate;
        self.cleaned_up = false;
        Ok(sampling_rate)
    }

    fn start_scan(&mut self) -> Result<()> {
        let failing = self
            .failing_scans
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.truncate_to = Some(self.samples_per_channel / 2);
        }
        self.polls_remaining = (self.samples_per_channel as f64 / self.sampling_rate).ceil() as u64;
        self.running = true;
        debug!("Simulated scan started ({} polls)", self.polls_remaining);
        Ok(())
    }

    fn poll_status(&mut self) -> Result<ScanStatus> {
        self.polls_remaining = self.polls_remaining.saturating_sub(1);
        if self.polls_remaining == 0 {
            self.running = false;
        }
        Ok(ScanStatus {
            running: self.running,
            hardware_overrun: self.overruns,
            buffer_overrun: self.overruns,
        })
    }

    fn read_buffer(&mut self, _timeout: Duration) -> Result<Vec<f64>> {
        let stride = self.channels.len();
        let mut total = stride * self.samples_per_channel;
        if let Some(limit) = self.truncate_to.take() {
            total = total.min(limit);
        }
        let data = (0..total).map(|i| self.sample(i / stride)).collect();
        Ok(data)
    }

    fn cleanup(&mut self) -> Result<()> {
        self.running = false;
        self.cleaned_up = true;
        Ok(())
    }
}

/// Toggle switch held in an atomic flag
#[derive(Debug, Clone, Default)]
pub struct SimulatedSwitch {
    manual: Arc<AtomicBool>,
}

impl SimulatedSwitch {
    pub fn new(manual: bool) -> Self {
        Self {
            manual: Arc::new(AtomicBool::new(manual)),
        }
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }
}

impl ModeSwitch for SimulatedSwitch {
    fn is_manual(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }
}

/// LEDs that log their changes
#[derive(Debug, Clone, Default)]
pub struct SimulatedIndicator {
    levels: Arc<Mutex<(bool, bool)>>,
}

impl SimulatedIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current (red, green) levels
    pub fn levels(&self) -> (bool, bool) {
        *self.levels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Indicator for SimulatedIndicator {
    fn set_leds(&mut self, red: bool, green: bool) {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        if *levels != (red, green) {
            debug!("LEDs red={} green={}", red, green);
            *levels = (red, green);
        }
    }
}

/// Power control that only records the request
#[derive(Debug, Clone, Default)]
pub struct SimulatedPower {
    powered_off: Arc<AtomicBool>,
}

impl SimulatedPower {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn powered_off(&self) -> bool {
        self.powered_off.load(Ordering::SeqCst)
    }
}

impl PowerControl for SimulatedPower {
    fn power_off(&mut self) -> Result<()> {
        info!("Simulated power-off");
        self.powered_off.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Network drive whose availability is set by hand
#[derive(Debug, Clone)]
pub struct SimulatedMount {
    mounted: Arc<AtomicBool>,
    reachable: Arc<AtomicBool>,
}

impl SimulatedMount {
    pub fn new(mounted: bool) -> Self {
        Self {
            mounted: Arc::new(AtomicBool::new(mounted)),
            reachable: Arc::new(AtomicBool::new(mounted)),
        }
    }

    /// Whether a `mount()` call succeeds
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.mounted.store(false, Ordering::SeqCst);
        }
    }
}

impl NetworkMount for SimulatedMount {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn mount(&mut self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            self.mounted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Where the simulated backend keeps its records
#[derive(Debug, Clone)]
pub enum SimStorage {
    /// HDF5 files at the configured paths, remote writes really sent
    Disk,
    /// Volatile stores, remote points kept in memory
    Memory {
        canonical: MemoryStore,
        temp: MemoryStore,
        remote: MemoryRemote,
    },
}

impl SimStorage {
    pub fn memory() -> Self {
        SimStorage::Memory {
            canonical: MemoryStore::new(),
            temp: MemoryStore::new(),
            remote: MemoryRemote::new(),
        }
    }
}

/// Backend wiring every simulated device together
pub struct SimulatedBackend {
    pub relay: SimulatedRelay,
    pub mount: SimulatedMount,
    /// Number of upcoming scans that stop early
    pub daq_faults: Arc<AtomicU32>,
    tones: Vec<(f64, f64)>,
    noise_amplitude: f64,
    storage: SimStorage,
}

impl SimulatedBackend {
    pub fn new(tones: Vec<(f64, f64)>, noise_amplitude: f64, storage: SimStorage) -> Self {
        Self {
            relay: SimulatedRelay::new(),
            mount: SimulatedMount::new(true),
            daq_faults: Arc::new(AtomicU32::new(0)),
            tones,
            noise_amplitude,
            storage,
        }
    }
}

impl StationBackend for SimulatedBackend {
    fn open_relay(&mut self) -> Result<Box<dyn PowerRelay>> {
        Ok(Box::new(self.relay.clone()))
    }

    fn open_daq(&mut self) -> Result<Box<dyn DataAcquisitionDevice>> {
        Ok(Box::new(
            SimulatedDaq::new(self.tones.clone(), self.noise_amplitude).with_fault_counter(self.daq_faults.clone()),
        ))
    }

    fn open_persistence(&mut self, config: &MeasurementConfig, clock: Arc<dyn Clock>) -> Result<PersistenceLayer> {
        match &self.storage {
            SimStorage::Disk => PersistenceLayer::from_config_with_mount(config, Box::new(self.mount.clone()), clock),
            SimStorage::Memory { canonical, temp, remote } => {
                let local = config.local.as_ref().map(|_| LocalStores {
                    canonical: Box::new(canonical.clone()),
                    temp: Box::new(temp.clone()),
                    mount: Box::new(self.mount.clone()),
                });
                let remote = config
                    .remote
                    .as_ref()
                    .map(|_| Box::new(remote.clone()) as Box<dyn RemoteTimeSeriesStore>);
                Ok(PersistenceLayer::new(local, remote, clock))
            }
        }
    }
}

/// Interpret one console command. Returns false for unknown input.
fn apply_console_command(line: &str, classifier: &mut InputClassifier, switch: &SimulatedSwitch, clock: &dyn Clock) -> bool {
    let mut words = line.split_whitespace();
    let now = clock.instant();
    match (words.next(), words.next()) {
        (Some("short"), None) => {
            classifier.on_edge(Duration::from_millis(200), now);
        }
        (Some("long"), None) => {
            classifier.on_edge(Duration::from_millis(2000), now);
        }
        (Some("press"), Some(ms)) => match ms.parse::<u64>() {
            Ok(ms) => {
                classifier.on_edge(Duration::from_millis(ms), now);
            }
            Err(_) => return false,
        },
        (Some("manual"), None) => switch.set_manual(true),
        (Some("auto"), None) => switch.set_manual(false),
        _ => return false,
    }
    true
}

/// Watch stdin for simulated button presses and switch flips
///
/// Commands: `short`, `long`, `press <ms>`, `manual`, `auto`.
pub fn spawn_console_input(
    mut classifier: InputClassifier,
    switch: SimulatedSwitch,
    clock: Arc<dyn Clock>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("console-input".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !apply_console_command(line, &mut classifier, &switch, clock.as_ref()) {
                warn!("Unknown console command '{}' (short, long, press <ms>, manual, auto)", line);
            }
        }
        debug!("Console input closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::button::{ButtonKind, ClassifierSettings, ReadPolicy};
    use crate::clock::ManualClock;
    use chrono::Local;

    #[test]
    fn test_relay_lines() {
        let mut relay = SimulatedRelay::new();
        relay.set_measure(1).unwrap();
        assert_eq!(relay.read_state(1).unwrap(), [true, true]);
        assert_eq!(relay.read_state(0).unwrap(), [false, false]);
        assert!(relay.set_measure(2).is_err());
    }

    #[test]
    fn test_daq_tone_amplitude() {
        let mut daq = SimulatedDaq::new(vec![(1.0, 2.0)], 0.0);
        daq.configure(&[0], 4, 4.0).unwrap();
        daq.start_scan().unwrap();
        let data = daq.read_buffer(Duration::from_secs(1)).unwrap();
        assert_eq!(data.len(), 4);
        assert!((data[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_fault_counter_truncates_scans() {
        let faults = Arc::new(AtomicU32::new(1));
        let mut daq = SimulatedDaq::new(vec![], 0.0).with_fault_counter(faults.clone());
        daq.configure(&[0], 10, 10.0).unwrap();
        daq.start_scan().unwrap();
        assert_eq!(daq.read_buffer(Duration::from_secs(1)).unwrap().len(), 5);
        assert_eq!(faults.load(Ordering::SeqCst), 0);
        daq.start_scan().unwrap();
        assert_eq!(daq.read_buffer(Duration::from_secs(1)).unwrap().len(), 10);
    }

    #[test]
    fn test_mount_reachability() {
        let mut mount = SimulatedMount::new(true);
        mount.set_reachable(false);
        assert!(!mount.is_mounted());
        mount.mount().unwrap();
        assert!(!mount.is_mounted());
        mount.set_reachable(true);
        mount.mount().unwrap();
        assert!(mount.is_mounted());
    }

    #[test]
    fn test_console_commands() {
        let clock = ManualClock::starting_at(Local::now());
        let mut classifier = InputClassifier::new(ClassifierSettings {
            read_policy: ReadPolicy::Consume,
            ..Default::default()
        });
        let slot = classifier.slot();
        let switch = SimulatedSwitch::new(false);

        assert!(apply_console_command("long", &mut classifier, &switch, &clock));
        assert_eq!(slot.read(clock.instant()), ButtonKind::Long);

        clock.advance(Duration::from_secs(5));
        assert!(apply_console_command("press 300", &mut classifier, &switch, &clock));
        assert_eq!(slot.read(clock.instant()), ButtonKind::Short);

        assert!(apply_console_command("manual", &mut classifier, &switch, &clock));
        assert!(switch.is_manual());
        assert!(!apply_console_command("press soon", &mut classifier, &switch, &clock));
        assert!(!apply_console_command("explode", &mut classifier, &switch, &clock));
    }
}
