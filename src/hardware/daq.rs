//! Timed multichannel scans on the analog-to-digital HAT

use crate::clock::{Clock, TimeKeeper};
use crate::error::{Result, StationError};
use chrono::{DateTime, Local};
use log::{info, warn};
use std::time::Duration;

/// How often a running scan is polled
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for draining the scan buffer once the scan stops
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time a scan may overrun its nominal length before it is abandoned
const SCAN_GRACE: Duration = Duration::from_secs(60);

/// Scan status flags reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatus {
    pub running: bool,
    pub hardware_overrun: bool,
    pub buffer_overrun: bool,
}

/// Multichannel DAQ that runs buffered, timed scans
pub trait DataAcquisitionDevice: Send {
    /// Board address, recorded with every capture
    fn address(&self) -> u8;

    /// Prepare a scan and return the sampling rate the hardware will achieve
    fn configure(&mut self, channels: &[u8], samples_per_channel: usize, sampling_rate: f64) -> Result<f64>;

    fn start_scan(&mut self) -> Result<()>;

    fn poll_status(&mut self) -> Result<ScanStatus>;

    /// Read the whole scan buffer, interleaved by channel
    fn read_buffer(&mut self, timeout: Duration) -> Result<Vec<f64>>;

    /// Release the scan buffer
    fn cleanup(&mut self) -> Result<()>;
}

/// One finished scan, all channels interleaved
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub channels: Vec<u8>,
    pub samples_per_channel: usize,
    pub sampling_rate: f64,
    pub actual_sampling_rate: f64,
    pub address: u8,
    pub acquired_at: DateTime<Local>,
    /// Sample `i` of channel position `k` sits at `i * channels.len() + k`
    pub data: Vec<f64>,
}

/// One channel's samples out of a [`Capture`]
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    pub channel: u8,
    pub samples: Vec<f64>,
    pub actual_sampling_rate: f64,
    pub acquired_at: DateTime<Local>,
}

impl RawCapture {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Capture {
    /// Split the interleaved buffer into per-channel traces
    pub fn split_channels(&self) -> Vec<RawCapture> {
        let stride = self.channels.len().max(1);
        self.channels
            .iter()
            .enumerate()
            .map(|(position, &channel)| RawCapture {
                channel,
                samples: self.data.iter().skip(position).step_by(stride).copied().collect(),
                actual_sampling_rate: self.actual_sampling_rate,
                acquired_at: self.acquired_at,
            })
            .collect()
    }
}

/// Run one complete scan: configure, start, poll until done, read, clean up
///
/// Overruns are logged and the scan continues. A buffer shorter than
/// `channels × samples_per_channel` means the scan stopped unexpectedly and
/// is reported as [`StationError::AcquisitionFault`].
pub fn acquire(
    device: &mut dyn DataAcquisitionDevice,
    channels: &[u8],
    samples_per_channel: usize,
    sampling_rate: f64,
    clock: &dyn Clock,
) -> Result<Capture> {
    let actual_sampling_rate = device.configure(channels, samples_per_channel, sampling_rate)?;
    info!(
        "DAQ at address {}: channels {:?}, requested {} Hz, actual {} Hz, {} samples per channel",
        device.address(),
        channels,
        sampling_rate,
        actual_sampling_rate,
        samples_per_channel
    );

    let nominal = Duration::from_secs_f64(samples_per_channel as f64 / actual_sampling_rate.max(f64::EPSILON));
    let deadline = nominal + SCAN_GRACE;

    let acquired_at = clock.now();
    let timer = TimeKeeper::new(clock);
    info!("Starting measurement scan in background");
    device.start_scan()?;

    let result = poll_until_stopped(device, clock, &timer, deadline).and_then(|_| {
        info!("Measurement finished after {:.1}s, reading buffer", timer.elapsed_secs());
        device.read_buffer(READ_TIMEOUT)
    });
    let cleanup = device.cleanup();
    let mut data = result?;
    cleanup?;

    let expected = channels.len() * samples_per_channel;
    if data.len() < expected {
        return Err(StationError::AcquisitionFault(format!(
            "scan stopped early: {} of {} samples",
            data.len(),
            expected
        )));
    }
    data.truncate(expected);
    info!("Read {} samples, buffer cleaned up", data.len());

    Ok(Capture {
        channels: channels.to_vec(),
        samples_per_channel,
        sampling_rate,
        actual_sampling_rate,
        address: device.address(),
        acquired_at,
        data,
    })
}

fn poll_until_stopped(
    device: &mut dyn DataAcquisitionDevice,
    clock: &dyn Clock,
    timer: &TimeKeeper<'_>,
    deadline: Duration,
) -> Result<()> {
    loop {
        clock.sleep(SCAN_POLL_INTERVAL);
        let status = device.poll_status()?;
        if !status.running {
            if status.hardware_overrun || status.buffer_overrun {
                warn!("Scan stopped with overrun flags set: {:?}", status);
            }
            return Ok(());
        }
        if status.hardware_overrun {
            warn!("Hardware overrun during measurement");
        } else if status.buffer_overrun {
            warn!("Buffer overrun during measurement");
        }
        if timer.elapsed_secs() > deadline.as_secs_f64() {
            return Err(StationError::AcquisitionFault(format!(
                "scan still running after {:.0}s",
                timer.elapsed_secs()
            )));
        }
    }
}
