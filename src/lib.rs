//! Unattended vibration measurement station
//!
//! The station alternates between scheduled and button-triggered vibration
//! captures. It keeps the sensor amplifier on battery power only while
//! sampling, derives power spectral densities and band amplitudes from every
//! capture, and stores the results remotely, locally, or both. When the
//! network drive is away, local records go to a temporary store and are
//! merged back later.
//!
//! # Quick Start
//!
//! ## Spectral Analysis
//! ```
//! use vibration_station::config::AnalysisWindow;
//! use vibration_station::spectral::{analyze_channel, PsdMethod, PsdOptions};
//!
//! let fs = 1000.0;
//! let samples: Vec<f64> = (0..8192)
//!     .map(|i| (2.0 * std::f64::consts::PI * 120.0 * i as f64 / fs).sin())
//!     .collect();
//! let windows = vec![AnalysisWindow { label: "motor".into(), low_hz: 100.0, high_hz: 140.0 }];
//! let options = PsdOptions { method: PsdMethod::Welch, subdivision_factor: 8, ..Default::default() };
//!
//! let analysis = analyze_channel(0, &samples, fs, &options, &windows)?;
//! println!("motor band: {:.3}", analysis.peaks["motor"]);
//! # Ok::<(), vibration_station::StationError>(())
//! ```
//!
//! ## Running the Station on Simulated Hardware
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use vibration_station::button::{ClassifierSettings, InputClassifier};
//! use vibration_station::clock::{Clock, SystemClock};
//! use vibration_station::config::ConfigFiles;
//! use vibration_station::fsm::{ControllerSettings, OperatingModeController, StationIo};
//! use vibration_station::hardware::sim::*;
//! use vibration_station::pipeline::{MeasurementPipeline, RetryPolicy};
//!
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let backend = SimulatedBackend::new(vec![(50.0, 1.0)], 0.05, SimStorage::memory());
//! let classifier = InputClassifier::new(ClassifierSettings::default());
//!
//! let mut station = OperatingModeController::new(
//!     MeasurementPipeline::new(Box::new(backend), clock.clone(), RetryPolicy::default()),
//!     Box::new(ConfigFiles { auto: "auto.json".into(), manual: "manual.json".into() }),
//!     classifier.slot(),
//!     StationIo {
//!         indicator: Box::new(SimulatedIndicator::new()),
//!         switch: Box::new(SimulatedSwitch::new(false)),
//!         power: Box::new(SimulatedPower::new()),
//!     },
//!     clock,
//!     ControllerSettings::default(),
//! );
//! let exit = station.run(&AtomicBool::new(false))?;
//! println!("station stopped: {:?}", exit);
//! # Ok::<(), vibration_station::StationError>(())
//! ```

pub mod button;
pub mod clock;
pub mod config;
pub mod error;
pub mod fsm;
pub mod hardware;
pub mod persistence;
pub mod pipeline;
pub mod scheduler;
pub mod spectral;
pub mod store;

// Re-export public API
pub use button::{ButtonKind, ButtonSlot, InputClassifier, ReadPolicy};
pub use config::{MeasurementConfig, WriteTarget};
pub use error::{Result, StationError};
pub use fsm::{LongPressPolicy, OperatingMode, OperatingModeController, StationExit};
pub use pipeline::{MeasurementPipeline, RetryPolicy};
pub use spectral::{derive_psd, integrate_peaks, PsdMethod, SpectrumResult};
