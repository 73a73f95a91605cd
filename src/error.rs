//! Error types for the vibration station

use thiserror::Error;

/// Error type for station operations
#[derive(Error, Debug)]
pub enum StationError {
    /// Network storage or remote host unreachable after the retry budget
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// DAQ scan stopped unexpectedly or delivered a short buffer
    #[error("Acquisition fault: {0}")]
    AcquisitionFault(String),

    /// Any other fault inside a capture/persist sequence
    #[error("Measurement failure: {0}")]
    MeasurementFailure(String),

    /// Remote write or local store failure while persisting a record
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Missing or invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument passed to an analysis routine
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// HDF5 or file-system level storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Retry budget exhausted; the supervisor must reboot the station
    #[error("Measurement failed {failures} times in a row, reboot required")]
    RebootRequired { failures: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StationError {
    /// Whether the measurement pipeline may retry after this error.
    ///
    /// Configuration and argument errors will not go away by reinitializing
    /// hardware, and a reboot request must reach the supervisor untouched.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StationError::Config(_)
                | StationError::InvalidArgument(_)
                | StationError::RebootRequired { .. }
        )
    }
}

/// Result type for station operations
pub type Result<T> = std::result::Result<T, StationError>;
