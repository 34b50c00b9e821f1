//! Host CPU/RAM utilization sampling.

use parking_lot::Mutex;
use sysinfo::System;
use std::time::Instant;

/// One utilization sample, as fractions of capacity.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    /// CPU utilization (0..1), when available.
    pub cpu_utilization: Option<f64>,
    /// RAM utilization (0..1), when available.
    pub ram_utilization: Option<f64>,
    /// Monotonic sample instant.
    pub ts_monotonic: Instant,
}

/// Sampler holding the `sysinfo` system handle between refreshes; CPU
/// usage needs two refreshes to produce a meaningful delta.
pub struct ResourceSampler {
    system: Mutex<System>,
}

impl ResourceSampler {
    /// New sampler.
    pub fn new() -> Self {
        ResourceSampler {
            system: Mutex::new(System::new()),
        }
    }

    /// Sample utilization now.
    pub fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        let cpu = clamp_fraction(system.global_cpu_info().cpu_usage() as f64 / 100.0);
        let ram = if system.total_memory() > 0 {
            clamp_fraction(system.used_memory() as f64 / system.total_memory() as f64)
        } else {
            None
        };
        ResourceSnapshot {
            cpu_utilization: cpu,
            ram_utilization: ram,
            ts_monotonic: Instant::now(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        ResourceSampler::new()
    }
}

fn clamp_fraction(value: f64) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_in_range() {
        let sampler = ResourceSampler::new();
        let snapshot = sampler.sample();
        if let Some(cpu) = snapshot.cpu_utilization {
            assert!((0.0..=1.0).contains(&cpu));
        }
        if let Some(ram) = snapshot.ram_utilization {
            assert!((0.0..=1.0).contains(&ram));
        }
    }

    #[test]
    fn clamp_rejects_non_finite() {
        assert_eq!(clamp_fraction(f64::NAN), None);
        assert_eq!(clamp_fraction(1.7), Some(1.0));
        assert_eq!(clamp_fraction(-0.2), Some(0.0));
    }
}
