//! Backpressure controller and disk pressure evaluation.
//!
//! The controller nudges `fps_target` and `bitrate_kbps` from queue depth;
//! disk pressure levels come from free-space thresholds and can degrade
//! capture (`soft`), or hard-stop it (`critical`).

/// Disk pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLevel {
    /// Plenty of space.
    Ok,
    /// Below the warn threshold.
    Warn,
    /// Below the soft threshold: degrade capture rates.
    Soft,
    /// Below the critical threshold: stop the pipeline.
    Critical,
}

impl DiskLevel {
    /// Event string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskLevel::Ok => "ok",
            DiskLevel::Warn => "warn",
            DiskLevel::Soft => "soft",
            DiskLevel::Critical => "critical",
        }
    }
}

/// Stateful disk pressure evaluator over free-GB thresholds.
pub struct DiskPressure {
    warn_gb: u64,
    soft_gb: u64,
    critical_gb: u64,
    level: DiskLevel,
}

impl DiskPressure {
    /// New evaluator with the configured thresholds.
    pub fn new(warn_gb: u64, soft_gb: u64, critical_gb: u64) -> Self {
        DiskPressure {
            warn_gb,
            soft_gb,
            critical_gb,
            level: DiskLevel::Ok,
        }
    }

    /// Evaluate the current free space; returns `(level, changed)`.
    pub fn evaluate(&mut self, free_gb: u64) -> (DiskLevel, bool) {
        let next = if free_gb <= self.critical_gb {
            DiskLevel::Critical
        } else if free_gb <= self.soft_gb {
            DiskLevel::Soft
        } else if free_gb <= self.warn_gb {
            DiskLevel::Warn
        } else {
            DiskLevel::Ok
        };
        let changed = next != self.level;
        self.level = next;
        (next, changed)
    }

    /// Current level.
    pub fn level(&self) -> DiskLevel {
        self.level
    }
}

/// Free gigabytes on the filesystem holding `path`.
pub fn free_gb(path: &std::path::Path) -> u64 {
    fs2::available_space(path).map(|bytes| bytes >> 30).unwrap_or(u64::MAX)
}

/// Rate adjustment emitted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUpdate {
    /// New frames-per-second target.
    pub fps_target: u32,
    /// New bitrate target.
    pub bitrate_kbps: u32,
}

/// Queue-depth driven rate controller.
pub struct BackpressureController {
    max_fps: u32,
    min_fps: u32,
    max_bitrate_kbps: u32,
    min_bitrate_kbps: u32,
    capacity: usize,
}

impl BackpressureController {
    /// Controller over the frame queue of `capacity` slots.
    pub fn new(
        max_fps: u32,
        min_fps: u32,
        max_bitrate_kbps: u32,
        min_bitrate_kbps: u32,
        capacity: usize,
    ) -> Self {
        BackpressureController {
            max_fps: max_fps.max(1),
            min_fps: min_fps.max(1),
            max_bitrate_kbps: max_bitrate_kbps.max(1),
            min_bitrate_kbps: min_bitrate_kbps.max(1),
            capacity: capacity.max(1),
        }
    }

    /// Adjust rates from the observed queue depth. Depth at or above 80%
    /// of capacity halves both targets; an empty queue steps back up.
    pub fn adjust(&self, queue_depth: usize, current: RateUpdate) -> RateUpdate {
        let high_water = (self.capacity * 4).div_ceil(5);
        if queue_depth >= high_water {
            return RateUpdate {
                fps_target: (current.fps_target / 2).max(self.min_fps),
                bitrate_kbps: (current.bitrate_kbps / 2).max(self.min_bitrate_kbps),
            };
        }
        if queue_depth == 0 {
            return RateUpdate {
                fps_target: (current.fps_target.saturating_mul(2)).min(self.max_fps),
                bitrate_kbps: (current.bitrate_kbps.saturating_mul(2)).min(self.max_bitrate_kbps),
            };
        }
        current
    }
}
