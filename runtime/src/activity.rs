//! Activity signal tracking for runtime governance.

use parking_lot::Mutex;
use std::time::Instant;

/// Tracks the last observed input event. Input hooks (behind a plugin)
/// call [`ActivityTracker::record_activity`]; the conductor reads
/// idleness from it.
pub struct ActivityTracker {
    active_threshold_s: f64,
    last_event: Mutex<Option<Instant>>,
}

impl ActivityTracker {
    /// Tracker treating idleness below `active_threshold_s` as active.
    pub fn new(active_threshold_s: f64) -> Self {
        ActivityTracker {
            active_threshold_s: active_threshold_s.max(0.0),
            last_event: Mutex::new(None),
        }
    }

    /// Record an input event now.
    pub fn record_activity(&self) {
        *self.last_event.lock() = Some(Instant::now());
    }

    /// Seconds since the last input event; infinite before any event.
    pub fn idle_seconds(&self) -> f64 {
        self.last_event
            .lock()
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(f64::INFINITY)
    }

    /// Whether the user counts as active right now.
    pub fn user_active(&self) -> bool {
        self.idle_seconds() < self.active_threshold_s
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        ActivityTracker::new(3.0)
    }
}
