//! Automatic measurement scheduling
//!
//! Automatic captures start on fixed boundaries past the hour (every
//! `measurement_period` minutes). The amplifier needs `settling_time` of
//! powered warm-up before sampling, so a cycle is launched that much ahead
//! of its boundary.

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};

/// Next automatic start time for a given config
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementScheduler {
    settling_min: f64,
    period_min: f64,
    next_start: DateTime<Local>,
}

/// First period boundary past the hour that still leaves room for settling
///
/// `settling_min` and `period_min` are in minutes.
pub fn compute_next_start(now: DateTime<Local>, settling_min: f64, period_min: f64) -> DateTime<Local> {
    let settled = now + ChronoDuration::milliseconds((settling_min * 60_000.0) as i64);
    let hour_start = settled
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(settled);

    let period_min = period_min.max(f64::EPSILON);
    let boundary_index = (settled.minute() as f64 / period_min).floor() + 1.0;
    let offset_ms = (boundary_index * period_min * 60_000.0).round() as i64;
    hour_start + ChronoDuration::milliseconds(offset_ms)
}

impl MeasurementScheduler {
    pub fn new(now: DateTime<Local>, settling_min: f64, period_min: f64) -> Self {
        Self {
            settling_min,
            period_min,
            next_start: compute_next_start(now, settling_min, period_min),
        }
    }

    pub fn next_start(&self) -> DateTime<Local> {
        self.next_start
    }

    /// Recompute the next start from `now`
    pub fn update(&mut self, now: DateTime<Local>) {
        self.next_start = compute_next_start(now, self.settling_min, self.period_min);
    }

    /// True once `now + settling_time` reaches the next start
    pub fn should_start(&self, now: DateTime<Local>) -> bool {
        now + ChronoDuration::milliseconds((self.settling_min * 60_000.0) as i64) >= self.next_start
    }
}
