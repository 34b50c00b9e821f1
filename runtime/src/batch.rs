//! Idle batch runner: drains processing under governor leases with SLA
//! tracking, retention-risk pressure, adaptive parallelism, a metadata
//! stability guard, and a landscape manifest summarizing the run.

use crate::conductor::IdleProcessor;
use crate::governor::{Governor, Mode, Signals};
use autocap_store::MetadataStore;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Mutable idle tuning knobs the controllers adjust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleTuning {
    /// Worker pool size for idle extraction.
    pub max_concurrency_cpu: u32,
    /// Records per batch.
    pub batch_size: u32,
    /// Records per drain run.
    pub max_items_per_run: u32,
}

impl Default for IdleTuning {
    fn default() -> Self {
        IdleTuning {
            max_concurrency_cpu: 1,
            batch_size: 3,
            max_items_per_run: 20,
        }
    }
}

/// Adaptive parallelism thresholds.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Whether adaptation runs at all.
    pub enabled: bool,
    /// Worker floor.
    pub cpu_min: u32,
    /// Worker ceiling.
    pub cpu_max: u32,
    /// Step when scaling up.
    pub cpu_step_up: u32,
    /// Step when scaling down.
    pub cpu_step_down: u32,
    /// Batch size per worker.
    pub batch_per_worker: u32,
    /// Items per worker per run.
    pub items_per_worker: u32,
    /// Pressure ratio at or below which the pool may grow.
    pub low_watermark: f64,
    /// Pressure ratio at or above which the pool shrinks.
    pub high_watermark: f64,
    /// Pending records at or below which the pool shrinks.
    pub queue_low_watermark: u64,
    /// Pending records at or above which the pool grows.
    pub queue_high_watermark: u64,
    /// Loop latency p95 target.
    pub latency_p95_target_ms: u64,
    /// Loop latency p95 hard cap.
    pub latency_p95_hard_cap_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            enabled: false,
            cpu_min: 1,
            cpu_max: 4,
            cpu_step_up: 1,
            cpu_step_down: 1,
            batch_per_worker: 3,
            items_per_worker: 20,
            low_watermark: 0.65,
            high_watermark: 0.9,
            queue_low_watermark: 64,
            queue_high_watermark: 512,
            latency_p95_target_ms: 1200,
            latency_p95_hard_cap_ms: 4000,
        }
    }
}

/// SLA controller configuration.
#[derive(Debug, Clone)]
pub struct SlaConfig {
    /// Whether SLA tracking is active.
    pub enabled: bool,
    /// Hours of retention headroom for unprocessed evidence.
    pub retention_horizon_hours: f64,
    /// Fraction of the horizon at which lag becomes a risk.
    pub lag_warn_ratio: f64,
    /// Extra workers granted under retention risk.
    pub cpu_step_up_on_risk: u32,
}

impl Default for SlaConfig {
    fn default() -> Self {
        SlaConfig {
            enabled: true,
            retention_horizon_hours: 144.0,
            lag_warn_ratio: 0.8,
            cpu_step_up_on_risk: 1,
        }
    }
}

/// Metadata DB stability guard configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Whether the guard runs.
    pub enabled: bool,
    /// Path sampled for churn.
    pub metadata_path: PathBuf,
    /// Samples taken per check.
    pub sample_count: u32,
    /// Interval between samples.
    pub poll_interval_ms: u64,
    /// Whether churn blocks the batch loop.
    pub fail_closed: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            enabled: true,
            metadata_path: PathBuf::from("data/metadata"),
            sample_count: 3,
            poll_interval_ms: 150,
            fail_closed: true,
        }
    }
}

/// Lock hashes stamped into the landscape manifest.
#[derive(Debug, Clone, Default)]
pub struct LockHashes {
    /// SHA-256 of the canonical effective configuration.
    pub effective_config_sha256: String,
    /// SHA-256 of the contract lockfile, when present.
    pub contracts_lock_sha256: Option<String>,
    /// SHA-256 of the plugin lockfile, when present.
    pub plugin_locks_sha256: Option<String>,
}

/// Batch runner configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum loops before the runner returns.
    pub max_loops: u32,
    /// Sleep between loops.
    pub sleep_ms: u64,
    /// Whether the governor must report `IDLE_DRAIN` to proceed.
    pub require_idle: bool,
    /// CPU utilization limit for the pressure ratio.
    pub cpu_limit: f64,
    /// RAM utilization limit for the pressure ratio.
    pub ram_limit: f64,
    /// Adaptive parallelism settings.
    pub adaptive: AdaptiveConfig,
    /// SLA settings.
    pub sla: SlaConfig,
    /// Metadata stability guard.
    pub guard: GuardConfig,
    /// Lock hashes for the manifest.
    pub locks: LockHashes,
    /// Run id for the manifest.
    pub run_id: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_loops: 500,
            sleep_ms: 200,
            require_idle: true,
            cpu_limit: 0.5,
            ram_limit: 0.5,
            adaptive: AdaptiveConfig::default(),
            sla: SlaConfig::default(),
            guard: GuardConfig::default(),
            locks: LockHashes::default(),
            run_id: "run".into(),
        }
    }
}

/// Outcome of one batch run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Whether the backlog drained.
    pub done: bool,
    /// Why the loop stopped early, when it did.
    pub blocked_reason: Option<String>,
    /// Loops executed.
    pub loops: u32,
    /// Final SLA snapshot.
    pub sla: Value,
    /// SLO alert labels.
    pub slo_alerts: Vec<String>,
    /// Landscape manifest (also persisted to metadata when wired).
    pub manifest: Value,
    /// Per-loop step rows.
    pub steps: Vec<Value>,
}

/// Run the idle batch loop.
pub fn run_processing_batch(
    governor: &Governor,
    signals_fn: &(dyn Fn() -> Signals + Sync),
    processor: &dyn IdleProcessor,
    tuning: &mut IdleTuning,
    config: &BatchConfig,
    metadata: Option<&MetadataStore>,
) -> BatchOutcome {
    let mut steps: Vec<Value> = Vec::new();
    let mut done = false;
    let mut blocked_reason: Option<String> = None;
    let mut previous_sla: Option<Value> = None;

    let guard = metadata_db_guard(&config.guard);
    let guard_blocked = config.guard.fail_closed
        && !guard
            .get("ok")
            .and_then(Value::as_bool)
            .unwrap_or(true);
    if guard_blocked {
        blocked_reason = Some(
            guard
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("metadata_db_unstable")
                .to_string(),
        );
    }

    if !guard_blocked {
        for loop_idx in 0..config.max_loops.max(1) {
            let mut signals = signals_fn();
            if !config.require_idle {
                // Manual drain lane: keep budget enforcement, bypass the
                // idle-mode hard gate.
                signals.fixture_override = true;
                signals.idle_seconds = f64::INFINITY;
                signals.user_active = false;
            }
            let sla_pressure =
                apply_retention_sla_pressure(tuning, previous_sla.as_ref(), &config.sla, &config.adaptive);
            let adaptive = apply_adaptive_parallelism(tuning, &signals, &steps, config);
            let decision = governor.decide(&signals);
            if config.require_idle && decision.mode != Mode::IdleDrain {
                blocked_reason = Some(decision.reason.clone());
                break;
            }
            if !decision.heavy_allowed {
                blocked_reason = Some(decision.reason.clone());
                break;
            }
            let lease = governor.lease("batch.idle.extract", decision.budget_remaining_ms, true);
            if !lease.allowed || lease.granted_ms == 0 {
                blocked_reason = Some("budget_unavailable".to_string());
                break;
            }
            let require_idle = config.require_idle;
            let should_abort = || -> bool {
                let mut sig = signals_fn();
                if !require_idle {
                    sig.idle_seconds = f64::INFINITY;
                    sig.user_active = false;
                }
                governor.should_preempt(&sig)
            };
            let started = Instant::now();
            let result = processor.process_step(&should_abort, lease.granted_ms);
            let consumed_ms = started.elapsed().as_millis() as u64;
            governor.release(&lease, consumed_ms.max(result.consumed_ms));

            let mut snapshot = json!({
                "loop": loop_idx,
                "mode": decision.mode.as_str(),
                "reason": decision.reason,
                "budget_granted_ms": lease.granted_ms,
                "consumed_ms": consumed_ms.max(result.consumed_ms),
                "done": result.done,
            });
            if let Some(adaptive) = adaptive {
                snapshot["adaptive_idle"] = adaptive;
            }
            if let Some(pressure) = sla_pressure {
                snapshot["sla_pressure"] = pressure;
            }
            if let Some(stats) = &result.stats {
                snapshot["idle_stats"] = stats.clone();
            }
            let mut with_current = steps.clone();
            with_current.push(snapshot.clone());
            let sla = estimate_sla_snapshot(&config.sla, &with_current);
            snapshot["sla"] = sla.clone();
            previous_sla = Some(sla);
            steps.push(snapshot);
            if result.done {
                done = true;
                break;
            }
            if config.sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(config.sleep_ms.clamp(10, 5000)));
            }
        }
    }

    let sla = estimate_sla_snapshot(&config.sla, &steps);
    let slo_alerts = derive_slo_alerts(&sla, &guard);
    let manifest = build_landscape_manifest(config, &steps, &sla, done, &blocked_reason, &guard, &slo_alerts);
    if let Some(store) = metadata {
        persist_manifest(store, config, &manifest);
    }
    BatchOutcome {
        done,
        blocked_reason,
        loops: steps.len() as u32,
        sla,
        slo_alerts,
        manifest,
        steps,
    }
}

/// Scale up the worker pool when the previous SLA snapshot flagged
/// retention risk. Bounded by `adaptive.cpu_max`.
fn apply_retention_sla_pressure(
    tuning: &mut IdleTuning,
    previous_sla: Option<&Value>,
    sla: &SlaConfig,
    adaptive: &AdaptiveConfig,
) -> Option<Value> {
    if !sla.enabled {
        return None;
    }
    let at_risk = previous_sla
        .and_then(|snapshot| snapshot.get("retention_risk"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !at_risk {
        return None;
    }
    let cpu_max = adaptive.cpu_max.max(tuning.max_concurrency_cpu);
    let next = (tuning.max_concurrency_cpu + sla.cpu_step_up_on_risk.max(1)).min(cpu_max);
    if next == tuning.max_concurrency_cpu {
        return None;
    }
    tuning.max_concurrency_cpu = next;
    tuning.batch_size = (next * adaptive.batch_per_worker).max(1);
    tuning.max_items_per_run = (next * adaptive.items_per_worker).max(1);
    Some(json!({
        "action": "sla_scale_up",
        "max_concurrency_cpu": tuning.max_concurrency_cpu,
        "batch_size": tuning.batch_size,
        "max_items_per_run": tuning.max_items_per_run,
    }))
}

/// Apply the adaptive decision table (evaluated in order): pressure high,
/// pressure low, latency hard cap, latency target, queue high, queue low.
fn apply_adaptive_parallelism(
    tuning: &mut IdleTuning,
    signals: &Signals,
    steps: &[Value],
    config: &BatchConfig,
) -> Option<Value> {
    let adaptive = &config.adaptive;
    if !adaptive.enabled {
        return None;
    }
    let cpu_limit = if config.cpu_limit > 0.0 { config.cpu_limit } else { 0.5 };
    let ram_limit = if config.ram_limit > 0.0 { config.ram_limit } else { 0.5 };
    let mut ratios = Vec::new();
    if let Some(cpu) = signals.cpu_utilization {
        ratios.push(cpu / cpu_limit);
    }
    if let Some(ram) = signals.ram_utilization {
        ratios.push(ram / ram_limit);
    }
    let pressure_ratio = ratios.iter().cloned().fold(None::<f64>, |acc, ratio| {
        Some(acc.map_or(ratio, |best| best.max(ratio)))
    });

    let pending_records = steps
        .last()
        .map(|row| {
            row.get("idle_stats")
                .and_then(|stats| stats.get("pending_records"))
                .and_then(Value::as_u64)
                .or_else(|| {
                    row.get("sla")
                        .and_then(|sla| sla.get("pending_records"))
                        .and_then(Value::as_u64)
                })
                .unwrap_or(0)
        })
        .unwrap_or(0);
    let latency_p95 = percentile_95(
        steps
            .iter()
            .rev()
            .take(32)
            .filter_map(|row| row.get("consumed_ms").and_then(Value::as_u64))
            .filter(|ms| *ms > 0),
    );

    let current = tuning.max_concurrency_cpu;
    let cpu_min = adaptive.cpu_min.max(1);
    let cpu_max = adaptive.cpu_max.max(cpu_min);
    let mut action = "hold";
    let mut reason = "pressure_mid";
    let mut next = current;
    if let Some(ratio) = pressure_ratio {
        if ratio >= adaptive.high_watermark {
            action = "scale_down";
            reason = "pressure_high";
            next = current.saturating_sub(adaptive.cpu_step_down).max(cpu_min);
        } else if ratio <= adaptive.low_watermark {
            action = "scale_up";
            reason = "pressure_low";
            next = (current + adaptive.cpu_step_up).min(cpu_max);
        }
    }
    if action == "hold" && latency_p95 >= adaptive.latency_p95_hard_cap_ms && current > cpu_min {
        action = "scale_down";
        reason = "latency_p95_hard_cap";
        next = current
            .saturating_sub(adaptive.cpu_step_down.max(2))
            .max(cpu_min);
    } else if action == "hold" && latency_p95 > adaptive.latency_p95_target_ms && current > cpu_min
    {
        action = "scale_down";
        reason = "latency_p95_target_exceeded";
        next = current.saturating_sub(adaptive.cpu_step_down).max(cpu_min);
    } else if action == "hold"
        && pending_records >= adaptive.queue_high_watermark
        && current < cpu_max
        && latency_p95 <= adaptive.latency_p95_target_ms
    {
        action = "scale_up";
        reason = "queue_high";
        next = (current + adaptive.cpu_step_up).min(cpu_max);
    } else if action == "hold"
        && !steps.is_empty()
        && pending_records <= adaptive.queue_low_watermark
        && current > cpu_min
        && pressure_ratio.map(|r| r >= adaptive.low_watermark).unwrap_or(false)
    {
        action = "scale_down";
        reason = "queue_low";
        next = current.saturating_sub(adaptive.cpu_step_down).max(cpu_min);
    }
    if next != current {
        tuning.max_concurrency_cpu = next;
        tuning.batch_size = (next * adaptive.batch_per_worker).max(1);
        tuning.max_items_per_run = (next * adaptive.items_per_worker).max(1);
    }
    Some(json!({
        "enabled": true,
        "action": action,
        "reason": reason,
        "pressure_ratio": pressure_ratio.map(autocap_spec::float_token).unwrap_or(Value::Null),
        "pending_records": pending_records,
        "loop_latency_p95_ms": latency_p95,
        "max_concurrency_cpu": tuning.max_concurrency_cpu,
        "batch_size": tuning.batch_size,
        "max_items_per_run": tuning.max_items_per_run,
    }))
}

/// Estimate the SLA snapshot from recent step rows.
fn estimate_sla_snapshot(config: &SlaConfig, steps: &[Value]) -> Value {
    let mut completed: u64 = 0;
    let mut consumed_ms: u64 = 0;
    let mut pending: u64 = 0;
    let mut latencies = Vec::new();
    for row in steps {
        let ms = row.get("consumed_ms").and_then(Value::as_u64).unwrap_or(0);
        consumed_ms += ms;
        if ms > 0 {
            latencies.push(ms);
        }
        if let Some(stats) = row.get("idle_stats") {
            completed += stats
                .get("records_completed")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(p) = stats.get("pending_records").and_then(Value::as_u64) {
                pending = p;
            }
        }
    }
    let throughput = if consumed_ms > 0 {
        completed as f64 / (consumed_ms as f64 / 1000.0)
    } else {
        0.0
    };
    let projected_lag_hours = if pending > 0 {
        if throughput > 0.0 {
            pending as f64 / throughput / 3600.0
        } else {
            f64::INFINITY
        }
    } else {
        0.0
    };
    let retention_risk = config.enabled
        && pending > 0
        && (projected_lag_hours.is_infinite()
            || projected_lag_hours > config.retention_horizon_hours * warn_ratio(config));
    json!({
        "enabled": config.enabled,
        "pending_records": pending,
        "completed_records": completed,
        "throughput_records_per_s": autocap_spec::float_token(throughput),
        "projected_lag_hours": autocap_spec::float_token(projected_lag_hours),
        "loop_latency_p95_ms": percentile_95(latencies.into_iter()),
        "retention_horizon_hours": autocap_spec::float_token(config.retention_horizon_hours),
        "retention_risk": retention_risk,
    })
}

fn warn_ratio(config: &SlaConfig) -> f64 {
    if config.lag_warn_ratio > 0.0 {
        config.lag_warn_ratio
    } else {
        0.8
    }
}

fn derive_slo_alerts(sla: &Value, guard: &Value) -> Vec<String> {
    let mut alerts = Vec::new();
    if sla.get("retention_risk").and_then(Value::as_bool).unwrap_or(false) {
        alerts.push("retention_risk".to_string());
    }
    let pending = sla.get("pending_records").and_then(Value::as_u64).unwrap_or(0);
    let throughput = sla
        .get("throughput_records_per_s")
        .and_then(Value::as_str)
        .and_then(|text| text.parse::<f64>().ok())
        .unwrap_or(0.0);
    if pending > 0 && throughput <= 0.0 {
        alerts.push("throughput_zero_with_backlog".to_string());
    }
    if !guard.get("ok").and_then(Value::as_bool).unwrap_or(true) {
        alerts.push("metadata_db_unstable".to_string());
    }
    alerts
}

/// Sample the metadata store path for churn: any difference in
/// size/mtime/inode across samples counts as instability.
fn metadata_db_guard(config: &GuardConfig) -> Value {
    if !config.enabled {
        return json!({"enabled": false, "ok": true, "reason": "disabled"});
    }
    let exists = config.metadata_path.exists();
    if !exists {
        return json!({
            "enabled": true,
            "ok": false,
            "reason": "metadata_db_missing",
            "path": config.metadata_path.to_string_lossy(),
        });
    }
    let count = config.sample_count.clamp(1, 32);
    let interval = Duration::from_millis(config.poll_interval_ms.min(2000));
    let mut churn = 0u32;
    let mut previous = file_signature(&config.metadata_path);
    for _ in 1..count {
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
        let current = file_signature(&config.metadata_path);
        if current != previous {
            churn += 1;
        }
        previous = current;
    }
    let stable = churn == 0;
    json!({
        "enabled": true,
        "ok": stable,
        "stable": stable,
        "churn_events": churn,
        "reason": if stable { "ok" } else { "metadata_db_churn_detected" },
        "path": config.metadata_path.to_string_lossy(),
    })
}

fn file_signature(path: &Path) -> Option<(u64, i64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|dur| dur.as_nanos() as i64)
        .unwrap_or(0);
    Some((meta.len(), mtime))
}

fn percentile_95(values: impl Iterator<Item = u64>) -> u64 {
    let mut ordered: Vec<u64> = values.collect();
    if ordered.is_empty() {
        return 0;
    }
    ordered.sort_unstable();
    let idx = ((0.95 * ordered.len() as f64).ceil() as usize).saturating_sub(1);
    ordered[idx.min(ordered.len() - 1)]
}

fn build_landscape_manifest(
    config: &BatchConfig,
    steps: &[Value],
    sla: &Value,
    done: bool,
    blocked_reason: &Option<String>,
    guard: &Value,
    slo_alerts: &[String],
) -> Value {
    let payload = json!({
        "schema_version": 1,
        "record_type": "derived.landscape.manifest",
        "run_id": config.run_id,
        "ts_utc": autocap_spec::now_utc(),
        "effective_config_sha256": config.locks.effective_config_sha256,
        "contracts_lock_sha256": config.locks.contracts_lock_sha256.clone().unwrap_or_default(),
        "plugin_locks_sha256": config.locks.plugin_locks_sha256.clone().unwrap_or_default(),
        "done": done,
        "blocked_reason": blocked_reason.clone().unwrap_or_default(),
        "loops": steps.len(),
        "steps": steps,
        "sla": sla,
        "metadata_db_guard": guard,
        "slo_alerts": slo_alerts,
    });
    autocap_spec::with_payload_hash(payload).unwrap_or(Value::Null)
}

fn persist_manifest(store: &MetadataStore, config: &BatchConfig, manifest: &Value) {
    let token: String = config
        .locks
        .effective_config_sha256
        .chars()
        .take(16)
        .collect();
    let token = if token.is_empty() { "unknown".to_string() } else { token };
    let record_id = format!("{}/derived.landscape.manifest/{token}", config.run_id);
    match store.get(&record_id) {
        Ok(Some(_)) => {}
        _ => {
            if let Err(err) = store.put_new(&record_id, manifest) {
                tracing::warn!(error = %err, "landscape manifest persist failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::StepResult;
    use crate::governor::GovernorConfig;
    use parking_lot::Mutex;

    struct ScriptedIdle {
        pending: Mutex<u64>,
        complete_per_step: u64,
    }
    impl IdleProcessor for ScriptedIdle {
        fn process_step(&self, _abort: &dyn Fn() -> bool, _budget: u64) -> StepResult {
            let mut pending = self.pending.lock();
            let completed = self.complete_per_step.min(*pending);
            *pending -= completed;
            StepResult {
                done: *pending == 0,
                consumed_ms: 20,
                stats: Some(json!({
                    "records_completed": completed,
                    "pending_records": *pending,
                })),
            }
        }
        fn pending_records(&self) -> u64 {
            *self.pending.lock()
        }
    }

    fn idle_signals() -> Signals {
        Signals {
            idle_seconds: 120.0,
            ..Signals::default()
        }
    }

    fn governor() -> Governor {
        Governor::new(GovernorConfig {
            window_budget_ms: 1_000_000,
            per_job_max_ms: 10_000,
            ..GovernorConfig::default()
        })
    }

    fn config_with_guard(dir: &Path) -> BatchConfig {
        BatchConfig {
            sleep_ms: 0,
            guard: GuardConfig {
                metadata_path: dir.to_path_buf(),
                poll_interval_ms: 0,
                ..GuardConfig::default()
            },
            ..BatchConfig::default()
        }
    }

    #[test]
    fn drains_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let governor = governor();
        let processor = ScriptedIdle {
            pending: Mutex::new(6),
            complete_per_step: 2,
        };
        let mut tuning = IdleTuning::default();
        let outcome = run_processing_batch(
            &governor,
            &idle_signals,
            &processor,
            &mut tuning,
            &config_with_guard(dir.path()),
            None,
        );
        assert!(outcome.done);
        assert!(outcome.blocked_reason.is_none());
        assert_eq!(outcome.loops, 3);
        assert!(outcome.manifest.get("payload_hash").is_some());
    }

    #[test]
    fn active_user_blocks_loop() {
        let dir = tempfile::tempdir().unwrap();
        let governor = governor();
        let processor = ScriptedIdle {
            pending: Mutex::new(100),
            complete_per_step: 1,
        };
        let mut tuning = IdleTuning::default();
        let active = || Signals {
            idle_seconds: 0.0,
            user_active: true,
            ..Signals::default()
        };
        let outcome = run_processing_batch(
            &governor,
            &active,
            &processor,
            &mut tuning,
            &config_with_guard(dir.path()),
            None,
        );
        assert!(!outcome.done);
        assert_eq!(outcome.blocked_reason.as_deref(), Some("active_user"));
        assert_eq!(outcome.loops, 0);
    }

    #[test]
    fn retention_risk_scales_workers_next_loop() {
        let dir = tempfile::tempdir().unwrap();
        let governor = governor();
        // Pending stays high and nothing completes: throughput is zero.
        let processor = ScriptedIdle {
            pending: Mutex::new(200),
            complete_per_step: 0,
        };
        let mut tuning = IdleTuning::default();
        let mut config = config_with_guard(dir.path());
        config.max_loops = 3;
        config.sla.cpu_step_up_on_risk = 2;
        config.adaptive.cpu_max = 8;
        let outcome = run_processing_batch(
            &governor,
            &idle_signals,
            &processor,
            &mut tuning,
            &config,
            None,
        );
        assert!(!outcome.done);
        assert!(tuning.max_concurrency_cpu >= 3);
        let scaled = outcome
            .steps
            .iter()
            .any(|row| row.get("sla_pressure").is_some());
        assert!(scaled, "expected an sla_scale_up row: {:?}", outcome.steps);
        assert!(outcome.slo_alerts.contains(&"retention_risk".to_string()));
        assert!(outcome
            .slo_alerts
            .contains(&"throughput_zero_with_backlog".to_string()));
    }

    #[test]
    fn adaptive_pressure_high_scales_down() {
        let dir = tempfile::tempdir().unwrap();
        let governor = governor();
        let processor = ScriptedIdle {
            pending: Mutex::new(4),
            complete_per_step: 4,
        };
        let mut tuning = IdleTuning {
            max_concurrency_cpu: 4,
            batch_size: 12,
            max_items_per_run: 80,
        };
        let mut config = config_with_guard(dir.path());
        config.adaptive.enabled = true;
        config.cpu_limit = 0.5;
        let loaded = || Signals {
            idle_seconds: 120.0,
            cpu_utilization: Some(0.5), // ratio 1.0 >= high watermark
            ..Signals::default()
        };
        let outcome = run_processing_batch(
            &governor,
            &loaded,
            &processor,
            &mut tuning,
            &config,
            None,
        );
        assert!(outcome.done);
        assert_eq!(tuning.max_concurrency_cpu, 3);
        let row = &outcome.steps[0]["adaptive_idle"];
        assert_eq!(row["action"], json!("scale_down"));
        assert_eq!(row["reason"], json!("pressure_high"));
    }

    #[test]
    fn missing_metadata_path_fails_closed() {
        let governor = governor();
        let processor = ScriptedIdle {
            pending: Mutex::new(4),
            complete_per_step: 4,
        };
        let mut tuning = IdleTuning::default();
        let config = BatchConfig {
            guard: GuardConfig {
                metadata_path: PathBuf::from("/nonexistent/metadata-path"),
                poll_interval_ms: 0,
                ..GuardConfig::default()
            },
            ..BatchConfig::default()
        };
        let outcome = run_processing_batch(
            &governor,
            &idle_signals,
            &processor,
            &mut tuning,
            &config,
            None,
        );
        assert!(!outcome.done);
        assert_eq!(outcome.blocked_reason.as_deref(), Some("metadata_db_missing"));
        assert!(outcome
            .slo_alerts
            .contains(&"metadata_db_unstable".to_string()));
    }
}
