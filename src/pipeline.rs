//! One measurement, start to finish
//!
//! The pipeline sequences the battery relay, the DAQ scan, spectral
//! analysis and persistence for one capture. Recoverable faults are retried
//! with a backoff and a full reinitialization of the hardware handles. Once
//! the retry budget is spent the pipeline hands [`StationError::RebootRequired`]
//! up to whoever supervises the process.

use crate::clock::{Clock, TimeKeeper};
use crate::config::MeasurementConfig;
use crate::error::{Result, StationError};
use crate::hardware::{acquire, BatteryBank, DataAcquisitionDevice, StationBackend};
use crate::persistence::{PersistenceLayer, SaveReport};
use crate::spectral::{analyze_channel, ChannelAnalysis, PsdOptions};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Which measurement sequence is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// Pipeline switches the batteries to measure and back
    Auto,
    /// Batteries are already on measure and stay there
    Manual,
}

/// Retry budget for a failing sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures that trigger a reboot request
    pub max_failures: u32,
    /// Wait before reinitializing and trying again
    pub backoff: Duration,
    /// Wait before handing the reboot request up
    pub reboot_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 10,
            backoff: Duration::from_secs(60),
            reboot_delay: Duration::from_secs(10),
        }
    }
}

/// A completed, persisted measurement
#[derive(Debug, Clone)]
pub struct MeasurementOutcome {
    pub timestamp: DateTime<Local>,
    pub analyses: Vec<ChannelAnalysis>,
    pub report: SaveReport,
}

/// Hardware and storage handles built from one config
struct Session {
    config: MeasurementConfig,
    batteries: BatteryBank,
    daq: Box<dyn DataAcquisitionDevice>,
    persistence: PersistenceLayer,
}

pub struct MeasurementPipeline {
    backend: Box<dyn StationBackend>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    session: Option<Session>,
    consecutive_failures: u32,
}

impl MeasurementPipeline {
    /// A pipeline with no session yet. Call [`reset`](Self::reset) before measuring.
    pub fn new(backend: Box<dyn StationBackend>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            clock,
            retry,
            session: None,
            consecutive_failures: 0,
        }
    }

    /// Tear down the current handles and rebuild them for `config`
    ///
    /// The batteries come back in charge position.
    pub fn reset(&mut self, config: MeasurementConfig) -> Result<()> {
        self.teardown();
        let batteries = BatteryBank::new(self.backend.open_relay()?)?;
        let daq = self.backend.open_daq()?;
        let persistence = self.backend.open_persistence(&config, self.clock.clone())?;
        info!(
            "Pipeline ready: {} channel(s) at {} Hz, {} min per capture, writing to {:?}",
            config.channels.len(),
            config.sampling_rate,
            config.measurement_duration,
            config.write_to
        );
        self.session = Some(Session {
            config,
            batteries,
            daq,
            persistence,
        });
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut old) = self.session.take() {
            if let Err(e) = old.daq.cleanup() {
                debug!("DAQ cleanup during teardown failed: {}", e);
            }
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| StationError::Config("pipeline has no configuration loaded".into()))
    }

    pub fn config(&self) -> Option<&MeasurementConfig> {
        self.session.as_ref().map(|s| &s.config)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Put the batteries on the amplifier
    pub fn power_measure(&mut self) -> Result<()> {
        self.session()?.batteries.measure()
    }

    /// Put the batteries on the charger
    pub fn power_charge(&mut self) -> Result<()> {
        self.session()?.batteries.charge()
    }

    pub fn is_measuring(&mut self) -> Result<bool> {
        self.session()?.batteries.is_measuring()
    }

    /// Scheduled measurement: measure, settle, capture, charge, persist
    pub fn run_auto_sequence(&mut self) -> Result<MeasurementOutcome> {
        self.run_sequence(SequenceKind::Auto)
    }

    /// Button-triggered measurement. The batteries must already be on measure.
    pub fn run_manual_sequence(&mut self) -> Result<MeasurementOutcome> {
        self.run_sequence(SequenceKind::Manual)
    }

    fn run_sequence(&mut self, kind: SequenceKind) -> Result<MeasurementOutcome> {
        let config = self.session()?.config.clone();
        loop {
            let error = match self.attempt_in_session(kind, &config) {
                Ok(outcome) => {
                    self.consecutive_failures = 0;
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            if kind == SequenceKind::Auto {
                if let Err(e) = self.power_charge() {
                    warn!("Could not return batteries to charge: {}", e);
                }
            }
            if !error.is_recoverable() {
                return Err(error);
            }

            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.retry.max_failures {
                warn!(
                    "Measurement failed {} times in a row, requesting reboot in {:?}",
                    self.consecutive_failures, self.retry.reboot_delay
                );
                self.clock.sleep(self.retry.reboot_delay);
                return Err(StationError::RebootRequired {
                    failures: self.consecutive_failures,
                });
            }

            warn!(
                "{} during measurement, retrying in {:?} (failure {} of {})",
                error, self.retry.backoff, self.consecutive_failures, self.retry.max_failures
            );
            self.clock.sleep(self.retry.backoff);
            // The next attempt starts from fresh handles
            self.teardown();
        }
    }

    /// Rebuild the session if a retry tore it down, then attempt once.
    /// A failed rebuild counts as a failed attempt.
    fn attempt_in_session(&mut self, kind: SequenceKind, config: &MeasurementConfig) -> Result<MeasurementOutcome> {
        if self.session.is_none() {
            self.reset(config.clone())?;
            if kind == SequenceKind::Manual {
                self.power_measure()?;
            }
        }
        self.attempt(kind)
    }

    fn attempt(&mut self, kind: SequenceKind) -> Result<MeasurementOutcome> {
        let clock = self.clock.clone();
        let session = self.session()?;
        let config = &session.config;

        if kind == SequenceKind::Auto {
            session.batteries.measure()?;
        }

        info!("Settling for {:.1} min", config.settling_time);
        clock.sleep(config.settling_duration());

        let timestamp = clock.now();
        let timer = TimeKeeper::new(clock.as_ref());
        let capture = acquire(
            session.daq.as_mut(),
            &config.channels,
            config.samples_per_channel(),
            config.sampling_rate,
            clock.as_ref(),
        )?;

        if kind == SequenceKind::Auto {
            session.batteries.charge()?;
        }

        debug!("Computing PSDs...");
        let options = PsdOptions {
            method: config.psd_method,
            subdivision_factor: config.subdivision_factor,
            ..Default::default()
        };
        let analyses = capture
            .split_channels()
            .iter()
            .map(|raw| {
                analyze_channel(
                    raw.channel,
                    &raw.samples,
                    raw.actual_sampling_rate,
                    &options,
                    &config.analysis_windows,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let report = session.persistence.save(&capture, &analyses, timestamp, config)?;
        info!(
            "{:?} measurement of {} samples done in {:.1}s",
            kind,
            capture.data.len(),
            timer.elapsed_secs()
        );
        for analysis in &analyses {
            debug!("Channel {} integrated peaks: {:?}", analysis.channel, analysis.peaks);
        }

        Ok(MeasurementOutcome {
            timestamp,
            analyses,
            report,
        })
    }

    /// Reconcile temporary records with the canonical store
    pub fn merge_pending(&mut self) -> Result<crate::persistence::MergeReport> {
        let session = self.session()?;
        session.persistence.merge_pending(&session.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hardware::sim::{SimStorage, SimulatedBackend, SimulatedRelay};
    use crate::persistence::LocalDestination;
    use crate::store::{HierarchicalStore, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Rig {
        pipeline: MeasurementPipeline,
        relay: SimulatedRelay,
        faults: Arc<AtomicU32>,
        canonical: MemoryStore,
        clock: ManualClock,
    }

    fn config() -> MeasurementConfig {
        MeasurementConfig::from_json_str(
            r#"{"sampling_rate": 100.0, "settling_time": 0.1, "measurement_time": 0.05,
                "subdivision_factor": 4,
                "analysis_windows": {"tone": [20.0, 30.0], "rest": [30.0, 45.0]}}"#,
        )
        .unwrap()
    }

    fn rig() -> Rig {
        let storage = SimStorage::memory();
        let canonical = match &storage {
            SimStorage::Memory { canonical, .. } => canonical.clone(),
            SimStorage::Disk => unreachable!(),
        };
        let backend = SimulatedBackend::new(vec![(25.0, 1.0)], 0.01, storage);
        let relay = backend.relay.clone();
        let faults = backend.daq_faults.clone();
        let clock = ManualClock::starting_at(Local::now());
        let mut pipeline = MeasurementPipeline::new(Box::new(backend), Arc::new(clock.clone()), RetryPolicy::default());
        pipeline.reset(config()).unwrap();
        Rig {
            pipeline,
            relay,
            faults,
            canonical,
            clock,
        }
    }

    #[test]
    fn test_auto_sequence_persists_one_record() {
        let mut rig = rig();
        let outcome = rig.pipeline.run_auto_sequence().unwrap();

        assert!(rig.relay.is_charging());
        assert_eq!(rig.canonical.dataset_count(), 1);
        assert_eq!(outcome.report.local.as_ref().unwrap().0, LocalDestination::Canonical);
        assert!(outcome.analyses[0].peaks["tone"] > outcome.analyses[0].peaks["rest"]);
        // 6 s settling plus a 3 s scan
        assert_eq!(rig.clock.elapsed(), Duration::from_secs(9));
        assert_eq!(rig.pipeline.consecutive_failures(), 0);
    }

    #[test]
    fn test_auto_sequence_retries_then_succeeds() {
        let mut rig = rig();
        rig.faults.store(2, Ordering::SeqCst);
        rig.pipeline.run_auto_sequence().unwrap();

        assert_eq!(rig.faults.load(Ordering::SeqCst), 0);
        assert_eq!(rig.canonical.dataset_count(), 1);
        assert_eq!(rig.pipeline.consecutive_failures(), 0);
        assert!(rig.relay.is_charging());
        // Three attempts of 9 s, two 60 s backoffs
        assert_eq!(rig.clock.elapsed(), Duration::from_secs(3 * 9 + 2 * 60));
    }

    #[test]
    fn test_exhausted_retries_request_reboot() {
        let mut rig = rig();
        rig.faults.store(100, Ordering::SeqCst);
        let err = rig.pipeline.run_auto_sequence().unwrap_err();

        assert!(matches!(err, StationError::RebootRequired { failures: 10 }));
        assert!(rig.relay.is_charging());
        assert_eq!(rig.canonical.dataset_count(), 0);
        assert_eq!(rig.faults.load(Ordering::SeqCst), 90);
    }

    #[test]
    fn test_manual_sequence_leaves_relay_alone() {
        let mut rig = rig();
        rig.pipeline.power_measure().unwrap();
        rig.faults.store(1, Ordering::SeqCst);
        rig.pipeline.run_manual_sequence().unwrap();

        assert!(rig.relay.is_measuring());
        assert!(rig.pipeline.is_measuring().unwrap());
        assert_eq!(rig.canonical.dataset_count(), 1);
    }

    #[test]
    fn test_sequence_without_config_is_fatal() {
        let backend = SimulatedBackend::new(vec![], 0.0, SimStorage::memory());
        let clock = ManualClock::starting_at(Local::now());
        let mut pipeline = MeasurementPipeline::new(Box::new(backend), Arc::new(clock.clone()), RetryPolicy::default());
        let err = pipeline.run_auto_sequence().unwrap_err();
        assert!(matches!(err, StationError::Config(_)));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_merge_pending_through_pipeline() {
        let mut rig = rig();
        assert_eq!(rig.pipeline.merge_pending().unwrap().files, 0);
        assert!(rig.canonical.list_files().unwrap().is_empty());
    }
}
