//! Time sources shared by the scheduler, pipeline and state machine
//!
//! Every wait the station performs (settling, scan polling, mount retries,
//! backoff, the main-loop poll) goes through a [`Clock`], so the same code
//! runs against wall time on the station and against [`ManualClock`] in
//! dry runs and tests.

use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of wall time, monotonic time and blocking waits
pub trait Clock: Send + Sync {
    /// Current local wall-clock time
    fn now(&self) -> DateTime<Local>;

    /// Monotonic instant, used for button-event ageing
    fn instant(&self) -> Instant;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when slept on or advanced explicitly
///
/// Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    wall: DateTime<Local>,
    base: Instant,
    offset: Duration,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn starting_at(start: DateTime<Local>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                wall: start,
                base: Instant::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Move time forward without blocking
    pub fn advance(&self, duration: Duration) {
        let mut time = self.lock();
        time.wall += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        time.offset += duration;
    }

    /// Total time slept or advanced since creation
    pub fn elapsed(&self) -> Duration {
        self.lock().offset
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualTime> {
        // A poisoned lock only means a test thread panicked mid-advance
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        self.lock().wall
    }

    fn instant(&self) -> Instant {
        let time = self.lock();
        time.base + time.offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Tracks elapsed time on a clock since creation
pub struct TimeKeeper<'a> {
    clock: &'a dyn Clock,
    start: Instant,
}

impl<'a> TimeKeeper<'a> {
    /// Create a new TimeKeeper starting now
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            start: clock.instant(),
        }
    }

    /// Get elapsed time in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.clock.instant().duration_since(self.start).as_secs_f64()
    }
}

/// Convert fractional minutes (the unit used in station configs) to a Duration
pub fn minutes(value: f64) -> Duration {
    Duration::from_secs_f64((value * 60.0).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_sleep_advances_both_timelines() {
        let start = Local.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::starting_at(start);
        let before = clock.instant();

        clock.sleep(Duration::from_secs(90));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.instant().duration_since(before), Duration::from_secs(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(Local::now());
        let other = clock.clone();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_timekeeper() {
        let clock = ManualClock::starting_at(Local::now());
        let keeper = TimeKeeper::new(&clock);
        clock.sleep(Duration::from_millis(250));
        assert!((keeper.elapsed_secs() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_minutes() {
        assert_eq!(minutes(5.0), Duration::from_secs(300));
        assert_eq!(minutes(0.5), Duration::from_secs(30));
        assert_eq!(minutes(-1.0), Duration::ZERO);
    }
}
