//! Push-button press classification
//!
//! The edge-handling context (an interrupt callback or an input-watching
//! thread) feeds press and release edges into an [`InputClassifier`], which
//! classifies each completed press as short or long and stores the result in
//! a shared [`ButtonSlot`]. The state machine inspects the slot once per loop
//! iteration. The slot is the only state shared between the two contexts.

use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Classification of the latest button press
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonKind {
    #[default]
    None,
    Short,
    Long,
}

/// A classified press and when it was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub kind: ButtonKind,
    pub recorded_at: Instant,
}

/// What reading the slot does to the stored event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// A read hands the event out once and clears it
    #[default]
    Consume,
    /// The event stays readable until it ages past the memory window
    Expire,
}

impl std::str::FromStr for ReadPolicy {
    type Err = crate::error::StationError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "consume" => Ok(ReadPolicy::Consume),
            "expire" => Ok(ReadPolicy::Expire),
            other => Err(crate::error::StationError::Config(format!("Unknown button read policy '{}'", other))),
        }
    }
}

/// Timing thresholds for press classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierSettings {
    /// Presses shorter than this are contact noise
    pub debounce_down: Duration,
    /// Presses at least this long are long presses
    pub long_press_threshold: Duration,
    /// Presses starting this soon after the previous release are ignored
    pub debounce_up: Duration,
    /// Events older than this read as [`ButtonKind::None`]
    pub memory_window: Duration,
    pub read_policy: ReadPolicy,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            debounce_down: Duration::from_millis(5),
            long_press_threshold: Duration::from_millis(1500),
            debounce_up: Duration::from_millis(500),
            memory_window: Duration::from_secs(2),
            read_policy: ReadPolicy::Consume,
        }
    }
}

/// Single-slot, synchronized store for the latest classified press
#[derive(Debug, Clone)]
pub struct ButtonSlot {
    event: Arc<Mutex<Option<ButtonEvent>>>,
    memory_window: Duration,
    policy: ReadPolicy,
}

impl ButtonSlot {
    pub fn new(memory_window: Duration, policy: ReadPolicy) -> Self {
        Self {
            event: Arc::new(Mutex::new(None)),
            memory_window,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ButtonEvent>> {
        // The slot holds plain data; a panic elsewhere cannot leave it torn
        self.event.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the stored event
    pub fn store(&self, event: ButtonEvent) {
        *self.lock() = Some(event);
    }

    /// Kind of the stored event as seen at `now`
    ///
    /// Stale events read as [`ButtonKind::None`] and are dropped. Under
    /// [`ReadPolicy::Consume`] a fresh event is cleared by this read.
    pub fn read(&self, now: Instant) -> ButtonKind {
        let mut slot = self.lock();
        match *slot {
            Some(event) if now.saturating_duration_since(event.recorded_at) <= self.memory_window => {
                if self.policy == ReadPolicy::Consume {
                    *slot = None;
                }
                event.kind
            }
            Some(_) => {
                *slot = None;
                ButtonKind::None
            }
            None => ButtonKind::None,
        }
    }

    /// Look at the stored event without consuming it
    pub fn peek(&self, now: Instant) -> ButtonKind {
        match *self.lock() {
            Some(event) if now.saturating_duration_since(event.recorded_at) <= self.memory_window => event.kind,
            _ => ButtonKind::None,
        }
    }

    /// Drop any pending event
    pub fn clear(&self) {
        *self.lock() = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PressState {
    Idle,
    Pressed { since: Instant },
}

/// Turns press/release edges into short/long classifications
#[derive(Debug)]
pub struct InputClassifier {
    settings: ClassifierSettings,
    state: PressState,
    last_release: Option<Instant>,
    slot: ButtonSlot,
}

impl InputClassifier {
    /// Create a classifier and the slot it writes into
    pub fn new(settings: ClassifierSettings) -> Self {
        let slot = ButtonSlot::new(settings.memory_window, settings.read_policy);
        Self {
            settings,
            state: PressState::Idle,
            last_release: None,
            slot,
        }
    }

    /// Handle for the reading side
    pub fn slot(&self) -> ButtonSlot {
        self.slot.clone()
    }

    /// Falling edge: the button went down
    pub fn on_press(&mut self, at: Instant) {
        if let Some(released) = self.last_release {
            if at.saturating_duration_since(released) < self.settings.debounce_up {
                debug!("Debouncing on button up");
                return;
            }
        }
        if self.state == PressState::Idle {
            self.state = PressState::Pressed { since: at };
        }
    }

    /// Rising edge: the button came back up
    pub fn on_release(&mut self, at: Instant) {
        if let PressState::Pressed { since } = self.state {
            self.state = PressState::Idle;
            self.on_edge(at.saturating_duration_since(since), at);
        }
    }

    /// Classify a completed press of `duration`, released at `released_at`
    ///
    /// Returns the recorded kind, or `None` when the press was ignored.
    pub fn on_edge(&mut self, duration: Duration, released_at: Instant) -> Option<ButtonKind> {
        let pressed_at = released_at.checked_sub(duration).unwrap_or(released_at);
        if let Some(previous) = self.last_release {
            let gap = pressed_at.saturating_duration_since(previous);
            if gap < self.settings.debounce_up {
                debug!("Press began {:?} after previous release, ignored", gap);
                return None;
            }
        }
        self.last_release = Some(released_at);

        debug!("Button up. press length: {:.4}s", duration.as_secs_f64());
        let kind = if duration < self.settings.debounce_down {
            debug!("Press length too short ({:.4}s), ignored", duration.as_secs_f64());
            return None;
        } else if duration < self.settings.long_press_threshold {
            ButtonKind::Short
        } else {
            ButtonKind::Long
        };

        self.slot.store(ButtonEvent {
            kind,
            recorded_at: released_at,
        });
        debug!("Recorded {:?} press", kind);
        Some(kind)
    }
}
