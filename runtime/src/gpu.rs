//! GPU lag guard and VRAM release hooks. Concrete GPU bindings live in
//! plugins; the core consumes the trait.

use serde_json::{json, Value};

/// One GPU utilization sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuSnapshot {
    /// GPU utilization fraction, when known.
    pub gpu_utilization: Option<f64>,
    /// GPU memory utilization fraction, when known.
    pub gpu_mem_utilization: Option<f64>,
    /// p95 of recent capture-to-display lag.
    pub lag_p95_ms: Option<f64>,
}

/// GPU control surface supplied by a platform plugin.
pub trait GpuController: Send + Sync {
    /// Sample current utilization.
    fn sample(&self) -> GpuSnapshot;
    /// Release cached VRAM; returns a result payload for telemetry.
    fn release_vram(&self, reason: &str) -> Value;
}

/// Controller for hosts without a managed GPU.
pub struct NullGpuController;

impl GpuController for NullGpuController {
    fn sample(&self) -> GpuSnapshot {
        GpuSnapshot::default()
    }

    fn release_vram(&self, reason: &str) -> Value {
        json!({"ok": true, "released": false, "reason": reason})
    }
}

/// Lag-guard thresholds.
#[derive(Debug, Clone)]
pub struct GpuGuardConfig {
    /// Maximum tolerated lag p95 before GPU work is blocked.
    pub lag_p95_max_ms: f64,
    /// Maximum tolerated GPU utilization.
    pub gpu_max_utilization: f64,
    /// Maximum tolerated GPU memory utilization.
    pub gpu_mem_max_utilization: f64,
}

impl Default for GpuGuardConfig {
    fn default() -> Self {
        GpuGuardConfig {
            lag_p95_max_ms: 50.0,
            gpu_max_utilization: 0.85,
            gpu_mem_max_utilization: 0.9,
        }
    }
}

/// Lag-guard verdict.
#[derive(Debug, Clone)]
pub struct GpuGuardDecision {
    /// Whether GPU work may proceed.
    pub ok: bool,
    /// Which threshold tripped (or `ok`/`no_gpu`).
    pub reason: String,
    /// Snapshot the decision was made from.
    pub snapshot: GpuSnapshot,
}

/// Evaluate the lag guard against a snapshot. Hosts without GPU data are
/// allowed through (`no_gpu`).
pub fn evaluate_gpu_guard(config: &GpuGuardConfig, snapshot: GpuSnapshot) -> GpuGuardDecision {
    if snapshot.gpu_utilization.is_none()
        && snapshot.gpu_mem_utilization.is_none()
        && snapshot.lag_p95_ms.is_none()
    {
        return GpuGuardDecision {
            ok: true,
            reason: "no_gpu".to_string(),
            snapshot,
        };
    }
    if let Some(lag) = snapshot.lag_p95_ms {
        if lag > config.lag_p95_max_ms {
            return GpuGuardDecision {
                ok: false,
                reason: "lag_p95".to_string(),
                snapshot,
            };
        }
    }
    if let Some(util) = snapshot.gpu_utilization {
        if util > config.gpu_max_utilization {
            return GpuGuardDecision {
                ok: false,
                reason: "gpu_utilization".to_string(),
                snapshot,
            };
        }
    }
    if let Some(mem) = snapshot.gpu_mem_utilization {
        if mem > config.gpu_mem_max_utilization {
            return GpuGuardDecision {
                ok: false,
                reason: "gpu_mem_utilization".to_string(),
                snapshot,
            };
        }
    }
    GpuGuardDecision {
        ok: true,
        reason: "ok".to_string(),
        snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_gpu_passes_guard() {
        let decision = evaluate_gpu_guard(&GpuGuardConfig::default(), GpuSnapshot::default());
        assert!(decision.ok);
        assert_eq!(decision.reason, "no_gpu");
    }

    #[test]
    fn high_lag_blocks_gpu_work() {
        let decision = evaluate_gpu_guard(
            &GpuGuardConfig::default(),
            GpuSnapshot {
                lag_p95_ms: Some(120.0),
                ..GpuSnapshot::default()
            },
        );
        assert!(!decision.ok);
        assert_eq!(decision.reason, "lag_p95");
    }

    #[test]
    fn utilization_under_thresholds_is_ok() {
        let decision = evaluate_gpu_guard(
            &GpuGuardConfig::default(),
            GpuSnapshot {
                gpu_utilization: Some(0.4),
                gpu_mem_utilization: Some(0.5),
                lag_p95_ms: Some(10.0),
            },
        );
        assert!(decision.ok);
    }
}
