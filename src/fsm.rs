//! Operating-mode state machine
//!
//! The controller owns the measurement pipeline, the scheduler, the LEDs
//! and the reading side of the button slot. Every loop iteration runs the
//! current mode's entry action and evaluates its exit conditions in table
//! order. The first match wins, and at most one transition happens per
//! iteration.
//!
//! | Mode          | Exit condition                                  |
//! |---------------|-------------------------------------------------|
//! | AutoInit      | always → AutoWait                               |
//! | AutoWait      | long press → (policy); manual switch → ManualInit; schedule due → AutoMeasure |
//! | AutoMeasure   | sequence done → AutoInit                        |
//! | ManualInit    | always → ManualWait                             |
//! | ManualWait    | long press → (policy); short press → ManualMeasure; auto switch → AutoInit |
//! | ManualMeasure | sequence done → ManualWait                      |
//! | ChargeInit    | always → Charging                               |
//! | Charging      | long press → Shutdown; switch moved → ManualInit/AutoInit |
//! | Shutdown      | terminal                                        |

use crate::button::{ButtonKind, ButtonSlot};
use crate::clock::Clock;
use crate::config::{ConfigProfile, ConfigSource};
use crate::error::{Result, StationError};
use crate::hardware::{Indicator, IndicatorState, ModeSwitch, PowerControl};
use crate::pipeline::MeasurementPipeline;
use crate::scheduler::MeasurementScheduler;
use chrono::{DateTime, Local};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default spacing of loop iterations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    AutoInit,
    AutoWait,
    AutoMeasure,
    ManualInit,
    ManualWait,
    ManualMeasure,
    ChargeInit,
    Charging,
    Shutdown,
}

/// What a long press does in `AutoWait` and `ManualWait`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LongPressPolicy {
    /// Stop measuring and charge; a second long press shuts down
    #[default]
    Charge,
    /// Power the station off straight away
    Shutdown,
    /// Log the request and keep waiting
    LogOnly,
}

impl std::str::FromStr for LongPressPolicy {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "charge" => Ok(LongPressPolicy::Charge),
            "shutdown" => Ok(LongPressPolicy::Shutdown),
            "log" | "log-only" | "logonly" => Ok(LongPressPolicy::LogOnly),
            other => Err(StationError::Config(format!("Unknown long-press policy '{}'", other))),
        }
    }
}

/// How the controller loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationExit {
    /// Shutdown mode issued a power-off
    PowerOff,
    /// The pipeline spent its retry budget
    RebootRequired { failures: u32 },
    /// A stop was requested from outside (Ctrl+C)
    Stopped,
}

/// State owned and mutated only by the controller loop
#[derive(Debug, Clone, PartialEq)]
pub struct StationState {
    pub mode: OperatingMode,
    pub next_mode: Option<OperatingMode>,
    /// Switch position (true = manual) taken on entering `ChargeInit`
    pub switch_snapshot: Option<bool>,
    pub consecutive_failures: u32,
    pub next_start: Option<DateTime<Local>>,
}

impl Default for StationState {
    fn default() -> Self {
        Self {
            mode: OperatingMode::AutoInit,
            next_mode: Some(OperatingMode::AutoInit),
            switch_snapshot: None,
            consecutive_failures: 0,
            next_start: None,
        }
    }
}

/// Station-facing outputs and inputs other than the button
pub struct StationIo {
    pub indicator: Box<dyn Indicator>,
    pub switch: Box<dyn ModeSwitch>,
    pub power: Box<dyn PowerControl>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub long_press_policy: LongPressPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            long_press_policy: LongPressPolicy::default(),
        }
    }
}

pub struct OperatingModeController {
    state: StationState,
    pipeline: MeasurementPipeline,
    configs: Box<dyn ConfigSource>,
    button: ButtonSlot,
    io: StationIo,
    scheduler: Option<MeasurementScheduler>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
}

impl OperatingModeController {
    pub fn new(
        pipeline: MeasurementPipeline,
        configs: Box<dyn ConfigSource>,
        button: ButtonSlot,
        io: StationIo,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            state: StationState::default(),
            pipeline,
            configs,
            button,
            io,
            scheduler: None,
            clock,
            settings,
        }
    }

    pub fn state(&self) -> &StationState {
        &self.state
    }

    pub fn pipeline(&self) -> &MeasurementPipeline {
        &self.pipeline
    }

    fn go(&mut self, mode: OperatingMode) {
        self.state.next_mode = Some(mode);
    }

    /// Where a long press in a wait mode leads
    fn on_long_press_in_wait(&mut self) {
        match self.settings.long_press_policy {
            LongPressPolicy::Charge => self.go(OperatingMode::ChargeInit),
            LongPressPolicy::Shutdown => self.go(OperatingMode::Shutdown),
            LongPressPolicy::LogOnly => {
                info!("Long press in {:?}: shutdown requested, ignored", self.state.mode);
                self.button.clear();
            }
        }
    }

    /// Run one loop iteration
    ///
    /// Returns `Some` once the station reaches a terminal action.
    pub fn step(&mut self) -> Result<Option<StationExit>> {
        if let Some(next) = self.state.next_mode.take() {
            info!("Entering state {:?}", next);
            self.state.mode = next;
        }

        match self.state.mode {
            OperatingMode::AutoInit => {
                self.io.indicator.show(IndicatorState::Off);
                let config = self.configs.load(ConfigProfile::Auto)?;
                let scheduler = MeasurementScheduler::new(self.clock.now(), config.settling_time, config.measurement_period);
                info!("Next automatic measurement at {}", scheduler.next_start().format("%Y-%m-%d %H:%M:%S"));
                self.state.next_start = Some(scheduler.next_start());
                self.scheduler = Some(scheduler);
                self.pipeline.reset(config)?;
                self.go(OperatingMode::AutoWait);
            }

            OperatingMode::AutoWait => {
                self.io.indicator.show(IndicatorState::Ready);
                let due = self
                    .scheduler
                    .as_ref()
                    .is_some_and(|s| s.should_start(self.clock.now()));
                if self.button.read(self.clock.instant()) == ButtonKind::Long {
                    self.on_long_press_in_wait();
                } else if self.io.switch.is_manual() {
                    self.go(OperatingMode::ManualInit);
                } else if due {
                    self.go(OperatingMode::AutoMeasure);
                }
            }

            OperatingMode::AutoMeasure => {
                self.io.indicator.show(IndicatorState::Busy);
                let result = self.pipeline.run_auto_sequence();
                self.state.consecutive_failures = self.pipeline.consecutive_failures();
                result?;
                self.go(OperatingMode::AutoInit);
            }

            OperatingMode::ManualInit => {
                self.io.indicator.show(IndicatorState::Off);
                let config = self.configs.load(ConfigProfile::Manual)?;
                self.scheduler = None;
                self.state.next_start = None;
                self.pipeline.reset(config)?;
                self.pipeline.power_measure()?;
                self.go(OperatingMode::ManualWait);
            }

            OperatingMode::ManualWait => {
                self.io.indicator.show(IndicatorState::Ready);
                match self.button.read(self.clock.instant()) {
                    ButtonKind::Long => self.on_long_press_in_wait(),
                    ButtonKind::Short => self.go(OperatingMode::ManualMeasure),
                    ButtonKind::None if !self.io.switch.is_manual() => self.go(OperatingMode::AutoInit),
                    ButtonKind::None => {}
                }
            }

            OperatingMode::ManualMeasure => {
                self.io.indicator.show(IndicatorState::Busy);
                self.button.clear();
                let result = self.pipeline.run_manual_sequence();
                self.state.consecutive_failures = self.pipeline.consecutive_failures();
                // Presses made while busy do not queue another measurement
                self.button.clear();
                result?;
                self.go(OperatingMode::ManualWait);
            }

            OperatingMode::ChargeInit => {
                self.io.indicator.show(IndicatorState::Both);
                self.state.switch_snapshot = Some(self.io.switch.is_manual());
                self.pipeline.power_charge()?;
                self.button.clear();
                self.go(OperatingMode::Charging);
            }

            OperatingMode::Charging => {
                let manual = self.io.switch.is_manual();
                if self.button.read(self.clock.instant()) == ButtonKind::Long {
                    self.go(OperatingMode::Shutdown);
                } else if Some(manual) != self.state.switch_snapshot {
                    self.go(if manual {
                        OperatingMode::ManualInit
                    } else {
                        OperatingMode::AutoInit
                    });
                }
            }

            OperatingMode::Shutdown => {
                self.io.indicator.show(IndicatorState::Both);
                if let Err(e) = self.pipeline.power_charge() {
                    warn!("Could not return batteries to charge before power-off: {}", e);
                }
                self.io.power.power_off()?;
                return Ok(Some(StationExit::PowerOff));
            }
        }

        Ok(None)
    }

    /// Drive the station until a terminal action, a fatal error or `stop`
    ///
    /// On a normal stop the LEDs go off. On a fatal error or a reboot
    /// request the LEDs signal a fault and the batteries go back on the
    /// charger before returning.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<StationExit> {
        loop {
            if stop.load(Ordering::SeqCst) {
                info!("Stop requested in {:?}", self.state.mode);
                self.release_outputs();
                return Ok(StationExit::Stopped);
            }

            self.clock.sleep(self.settings.poll_interval);

            match self.step() {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(StationError::RebootRequired { failures }) => {
                    error!("Handing reboot request to supervisor after {} failures", failures);
                    self.signal_fault();
                    return Ok(StationExit::RebootRequired { failures });
                }
                Err(e) => {
                    error!("Fatal error in {:?}: {}", self.state.mode, e);
                    self.signal_fault();
                    return Err(e);
                }
            }
        }
    }

    fn release_outputs(&mut self) {
        if let Err(e) = self.pipeline.power_charge() {
            warn!("Could not return batteries to charge: {}", e);
        }
        self.io.indicator.show(IndicatorState::Off);
    }

    fn signal_fault(&mut self) {
        self.io.indicator.show(IndicatorState::Both);
        if let Err(e) = self.pipeline.power_charge() {
            warn!("Could not return batteries to charge: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::button::{ClassifierSettings, InputClassifier, ReadPolicy};
    use crate::clock::ManualClock;
    use crate::config::{MeasurementConfig, StaticConfigs};
    use crate::hardware::sim::{
        SimStorage, SimulatedBackend, SimulatedIndicator, SimulatedPower, SimulatedRelay, SimulatedSwitch,
    };
    use crate::pipeline::RetryPolicy;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;

    struct Station {
        controller: OperatingModeController,
        classifier: InputClassifier,
        clock: ManualClock,
        switch: SimulatedSwitch,
        indicator: SimulatedIndicator,
        power: SimulatedPower,
        relay: SimulatedRelay,
        faults: Arc<AtomicU32>,
        canonical: MemoryStore,
    }

    impl Station {
        /// Press for `millis`, starting 600 ms after the current instant
        fn press(&mut self, millis: u64) {
            self.clock.advance(Duration::from_millis(600 + millis));
            self.classifier
                .on_edge(Duration::from_millis(millis), self.clock.instant())
                .unwrap();
        }

        fn step(&mut self) -> Option<StationExit> {
            self.clock.advance(DEFAULT_POLL_INTERVAL);
            self.controller.step().unwrap()
        }

        fn mode(&self) -> OperatingMode {
            self.controller.state().mode
        }

        fn next(&self) -> Option<OperatingMode> {
            self.controller.state().next_mode
        }
    }

    fn config() -> MeasurementConfig {
        MeasurementConfig::from_json_str(
            r#"{"sampling_rate": 100.0, "settling_time": 0.0, "measurement_time": 0.05,
                "measurement_period": 1.0, "subdivision_factor": 2,
                "analysis_windows": {"tone": [20.0, 30.0]}}"#,
        )
        .unwrap()
    }

    fn station(policy: ReadPolicy, long_press_policy: LongPressPolicy, retry: RetryPolicy) -> Station {
        let storage = SimStorage::memory();
        let canonical = match &storage {
            SimStorage::Memory { canonical, .. } => canonical.clone(),
            SimStorage::Disk => unreachable!(),
        };
        let backend = SimulatedBackend::new(vec![(25.0, 1.0)], 0.0, storage);
        let relay = backend.relay.clone();
        let faults = backend.daq_faults.clone();

        let clock = ManualClock::starting_at(Local.with_ymd_and_hms(2024, 3, 7, 14, 0, 30).unwrap());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let classifier = InputClassifier::new(ClassifierSettings {
            read_policy: policy,
            ..Default::default()
        });
        let switch = SimulatedSwitch::new(false);
        let indicator = SimulatedIndicator::new();
        let power = SimulatedPower::new();

        let controller = OperatingModeController::new(
            MeasurementPipeline::new(Box::new(backend), shared_clock.clone(), retry),
            Box::new(StaticConfigs {
                auto: config(),
                manual: config(),
            }),
            classifier.slot(),
            StationIo {
                indicator: Box::new(indicator.clone()),
                switch: Box::new(switch.clone()),
                power: Box::new(power.clone()),
            },
            shared_clock,
            ControllerSettings {
                poll_interval: DEFAULT_POLL_INTERVAL,
                long_press_policy,
            },
        );

        Station {
            controller,
            classifier,
            clock,
            switch,
            indicator,
            power,
            relay,
            faults,
            canonical,
        }
    }

    fn default_station() -> Station {
        station(ReadPolicy::Consume, LongPressPolicy::Charge, RetryPolicy::default())
    }

    /// Step through AutoInit into AutoWait
    fn waiting(mut s: Station) -> Station {
        s.step();
        assert_eq!(s.mode(), OperatingMode::AutoInit);
        s.step();
        assert_eq!(s.mode(), OperatingMode::AutoWait);
        s
    }

    #[test]
    fn test_auto_init_schedules_next_start() {
        let s = waiting(default_station());
        let next = s.controller.state().next_start.unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2024, 3, 7, 14, 1, 0).unwrap());
        assert_eq!(s.indicator.levels(), IndicatorState::Ready.levels());
        assert!(s.relay.is_charging());
    }

    #[test]
    fn test_scheduled_measurement_runs() {
        let mut s = waiting(default_station());
        s.clock.advance(Duration::from_secs(30));
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::AutoMeasure));

        s.step();
        assert_eq!(s.mode(), OperatingMode::AutoMeasure);
        assert_eq!(s.next(), Some(OperatingMode::AutoInit));
        assert_eq!(s.canonical.dataset_count(), 1);
        assert!(s.relay.is_charging());
        assert_eq!(s.indicator.levels(), IndicatorState::Busy.levels());
    }

    #[test]
    fn test_long_press_preempts_schedule() {
        let mut s = waiting(default_station());
        s.clock.advance(Duration::from_secs(30));
        s.press(2000);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ChargeInit));
        assert_eq!(s.canonical.dataset_count(), 0);
    }

    #[test]
    fn test_long_press_policies_in_wait() {
        let mut s = waiting(station(ReadPolicy::Consume, LongPressPolicy::LogOnly, RetryPolicy::default()));
        s.press(2000);
        s.step();
        assert_eq!(s.next(), None);
        assert_eq!(s.mode(), OperatingMode::AutoWait);

        let mut s = waiting(station(ReadPolicy::Consume, LongPressPolicy::Shutdown, RetryPolicy::default()));
        s.press(2000);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::Shutdown));
        assert_eq!(s.step(), Some(StationExit::PowerOff));
        assert!(s.power.powered_off());
    }

    #[test]
    fn test_logged_long_press_does_not_block_switch() {
        // The expiring policy would keep the press readable for 2 s
        let mut s = waiting(station(ReadPolicy::Expire, LongPressPolicy::LogOnly, RetryPolicy::default()));
        s.press(2000);
        s.step();
        assert_eq!(s.next(), None);
        assert_eq!(s.classifier.slot().peek(s.clock.instant()), ButtonKind::None);

        s.switch.set_manual(true);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ManualInit));
    }

    #[test]
    fn test_charge_init_clears_triggering_press() {
        // Under the expiring policy the long press stays readable for 2 s
        let mut s = waiting(station(ReadPolicy::Expire, LongPressPolicy::Charge, RetryPolicy::default()));
        s.press(2000);
        s.step();
        s.step();
        assert_eq!(s.mode(), OperatingMode::ChargeInit);
        assert_eq!(s.indicator.levels(), (true, true));
        s.step();
        assert_eq!(s.mode(), OperatingMode::Charging);
        assert_eq!(s.next(), None);
    }

    #[test]
    fn test_charging_waits_for_switch_change() {
        let mut s = waiting(default_station());
        s.press(2000);
        s.step();
        s.step();
        assert_eq!(s.controller.state().switch_snapshot, Some(false));
        for _ in 0..5 {
            s.step();
            assert_eq!(s.mode(), OperatingMode::Charging);
            assert_eq!(s.next(), None);
        }
        assert!(s.relay.is_charging());

        s.switch.set_manual(true);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ManualInit));
        s.step();
        assert!(s.relay.is_measuring());
    }

    #[test]
    fn test_charging_from_manual_returns_to_auto() {
        let mut s = default_station();
        s.switch.set_manual(true);
        s.step();
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ManualInit));
        s.step();
        s.step();
        assert_eq!(s.mode(), OperatingMode::ManualWait);
        s.press(2000);
        s.step();
        s.step();
        assert_eq!(s.controller.state().switch_snapshot, Some(true));

        s.step();
        assert_eq!(s.next(), None);
        s.switch.set_manual(false);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::AutoInit));
    }

    #[test]
    fn test_long_press_while_charging_shuts_down() {
        let mut s = waiting(default_station());
        s.press(2000);
        s.step();
        s.step();
        s.step();
        assert_eq!(s.mode(), OperatingMode::Charging);
        s.press(2000);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::Shutdown));
        assert_eq!(s.step(), Some(StationExit::PowerOff));
        assert!(s.power.powered_off());
        assert!(s.relay.is_charging());
    }

    #[test]
    fn test_manual_measurement_cycle() {
        let mut s = default_station();
        s.switch.set_manual(true);
        s.step();
        s.step();
        s.step();
        s.step();
        assert_eq!(s.mode(), OperatingMode::ManualWait);
        assert!(s.relay.is_measuring());

        s.press(300);
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ManualMeasure));
        s.step();
        assert_eq!(s.next(), Some(OperatingMode::ManualWait));
        assert_eq!(s.canonical.dataset_count(), 1);
        assert!(s.relay.is_measuring());

        s.switch.set_manual(false);
        s.step();
        assert_eq!(s.mode(), OperatingMode::ManualWait);
        assert_eq!(s.next(), Some(OperatingMode::AutoInit));
    }

    #[test]
    fn test_run_stops_on_request() {
        let mut s = waiting(default_station());
        let stop = AtomicBool::new(true);
        assert_eq!(s.controller.run(&stop).unwrap(), StationExit::Stopped);
        assert_eq!(s.indicator.levels(), (false, false));
    }

    #[test]
    fn test_run_hands_reboot_to_supervisor() {
        let retry = RetryPolicy {
            max_failures: 2,
            backoff: Duration::from_secs(1),
            reboot_delay: Duration::from_secs(1),
        };
        let mut s = station(ReadPolicy::Consume, LongPressPolicy::Charge, retry);
        s.faults.store(u32::MAX, std::sync::atomic::Ordering::SeqCst);
        let stop = AtomicBool::new(false);
        let exit = s.controller.run(&stop).unwrap();
        assert_eq!(exit, StationExit::RebootRequired { failures: 2 });
        assert_eq!(s.indicator.levels(), (true, true));
        assert!(s.relay.is_charging());
        assert_eq!(s.controller.state().consecutive_failures, 2);
    }
}
