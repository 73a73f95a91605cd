//! Interfaces to the station hardware
//!
//! GPIO wiring, the DAQ bus protocol and OS power control are external
//! collaborators. The station only talks to them through the traits in this
//! module, so a board-specific backend and the [`sim`] backend are
//! interchangeable.

pub mod daq;
pub mod sim;

use crate::clock::Clock;
use crate::config::MeasurementConfig;
use crate::error::{Result, StationError};
use crate::persistence::PersistenceLayer;
use log::{debug, info};
use std::process::Command;
use std::sync::Arc;

pub use daq::{acquire, Capture, DataAcquisitionDevice, RawCapture, ScanStatus};

/// Relay channels, one per battery
pub const BATTERY_CHANNELS: [usize; 2] = [0, 1];

/// Two-line relay per battery channel, switching the amplifier supply
/// between the charger and the measurement path
pub trait PowerRelay: Send {
    /// Connect the battery on `channel` to the amplifier
    fn set_measure(&mut self, channel: usize) -> Result<()>;

    /// Connect the battery on `channel` to the charger
    fn set_charge(&mut self, channel: usize) -> Result<()>;

    /// Output level of both relay lines of `channel`
    fn read_state(&self, channel: usize) -> Result<[bool; 2]>;
}

/// Both battery channels, switched together
pub struct BatteryBank {
    relay: Box<dyn PowerRelay>,
}

impl BatteryBank {
    /// Take over a relay and put every battery on the charger
    pub fn new(relay: Box<dyn PowerRelay>) -> Result<Self> {
        let mut bank = Self { relay };
        bank.charge()?;
        debug!("Initialized batteries in charging state");
        Ok(bank)
    }

    pub fn measure(&mut self) -> Result<()> {
        for channel in BATTERY_CHANNELS {
            self.relay.set_measure(channel)?;
        }
        debug!("Batteries switched to measure");
        Ok(())
    }

    pub fn charge(&mut self) -> Result<()> {
        for channel in BATTERY_CHANNELS {
            self.relay.set_charge(channel)?;
        }
        debug!("Batteries switched to charge");
        Ok(())
    }

    /// Line levels of every channel
    pub fn state(&self) -> Result<[[bool; 2]; 2]> {
        Ok([
            self.relay.read_state(BATTERY_CHANNELS[0])?,
            self.relay.read_state(BATTERY_CHANNELS[1])?,
        ])
    }

    /// True when every line of every channel is in measure position
    pub fn is_measuring(&self) -> Result<bool> {
        Ok(self.state()?.iter().flatten().all(|&line| line))
    }
}

/// Indicator pattern shown by the red/green LED pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Off,
    Ready,
    Busy,
    /// Charging, shutdown or fault
    Both,
}

impl IndicatorState {
    /// (red, green) LED levels
    pub fn levels(&self) -> (bool, bool) {
        match self {
            IndicatorState::Off => (false, false),
            IndicatorState::Ready => (false, true),
            IndicatorState::Busy => (true, false),
            IndicatorState::Both => (true, true),
        }
    }
}

/// Red/green status LEDs
pub trait Indicator: Send {
    fn set_leds(&mut self, red: bool, green: bool);

    fn show(&mut self, state: IndicatorState) {
        let (red, green) = state.levels();
        self.set_leds(red, green);
    }
}

/// Manual/auto toggle switch
pub trait ModeSwitch: Send {
    /// True when the switch line is high (manual position)
    fn is_manual(&self) -> bool;
}

/// Operating-system power control
pub trait PowerControl: Send {
    fn power_off(&mut self) -> Result<()>;
}

/// Powers the host down through `shutdown`
#[derive(Debug, Default)]
pub struct SystemPower;

impl PowerControl for SystemPower {
    fn power_off(&mut self) -> Result<()> {
        info!("Issuing system power-off");
        let status = Command::new("sudo").args(["shutdown", "-h", "now"]).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(StationError::MeasurementFailure(format!("shutdown exited with {}", status)))
        }
    }
}

/// Builds the per-session hardware and storage handles
///
/// The pipeline calls back into the backend whenever it (re)initializes, so
/// a failed session can tear everything down and start from fresh handles.
pub trait StationBackend: Send {
    fn open_relay(&mut self) -> Result<Box<dyn PowerRelay>>;

    fn open_daq(&mut self) -> Result<Box<dyn DataAcquisitionDevice>>;

    fn open_persistence(&mut self, config: &MeasurementConfig, clock: Arc<dyn Clock>) -> Result<PersistenceLayer>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimulatedRelay;

    #[test]
    fn test_bank_starts_charging() {
        let relay = SimulatedRelay::new();
        let bank = BatteryBank::new(Box::new(relay.clone())).unwrap();
        assert_eq!(bank.state().unwrap(), [[false, false], [false, false]]);
        assert!(!bank.is_measuring().unwrap());
    }

    #[test]
    fn test_bank_switches_both_channels() {
        let relay = SimulatedRelay::new();
        let mut bank = BatteryBank::new(Box::new(relay.clone())).unwrap();
        bank.measure().unwrap();
        assert!(bank.is_measuring().unwrap());
        assert!(relay.is_measuring());
        bank.charge().unwrap();
        assert!(!relay.is_measuring());
    }

    #[test]
    fn test_indicator_levels() {
        assert_eq!(IndicatorState::Off.levels(), (false, false));
        assert_eq!(IndicatorState::Ready.levels(), (false, true));
        assert_eq!(IndicatorState::Busy.levels(), (true, false));
        assert_eq!(IndicatorState::Both.levels(), (true, true));
    }
}
