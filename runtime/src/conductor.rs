//! Runtime conductor: assembles signals, enqueues idle housekeeping on
//! cadence, audits mode transitions, releases GPU memory on activity,
//! maintains the processing watchdog, and emits runtime telemetry.

use crate::activity::ActivityTracker;
use crate::fullscreen::{fullscreen_verdict, FullscreenProbe};
use crate::governor::{Governor, Mode, Signals};
use crate::gpu::{evaluate_gpu_guard, GpuController, GpuGuardConfig};
use crate::resources::ResourceSampler;
use crate::scheduler::{stats_payload, Job, JobOutcome, Scheduler, SchedulerRunStats};
use crate::RuntimeError;
use autocap_store::{AuditLog, EventBuilder, MediaStore, MetadataStore, TelemetryStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one idle processing step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Whether the backlog is drained.
    pub done: bool,
    /// Milliseconds consumed.
    pub consumed_ms: u64,
    /// Optional processor stats (`pending_records`, `records_completed`).
    pub stats: Option<Value>,
}

/// Idle extraction processor (OCR/VLM extractors live behind plugins).
pub trait IdleProcessor: Send + Sync {
    /// Run one bounded step of idle processing.
    fn process_step(&self, should_abort: &dyn Fn() -> bool, budget_ms: u64) -> StepResult;
    /// Records still waiting for processing.
    fn pending_records(&self) -> u64;
}

/// Conductor configuration.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Loop sleep between ticks.
    pub sleep_ms: u64,
    /// Idle extraction enabled.
    pub idle_enabled: bool,
    /// Lease estimate for idle steps.
    pub idle_estimate_ms: u64,
    /// Research cadence enabled.
    pub research_enabled: bool,
    /// Seconds between research runs.
    pub research_interval_s: f64,
    /// Seconds between storage pressure samples.
    pub pressure_interval_s: f64,
    /// Seconds between retention sweeps.
    pub retention_interval_s: f64,
    /// Retention horizon for evidence, e.g. `14d` (`off` disables).
    pub retention_spec: String,
    /// Watchdog enabled.
    pub watchdog_enabled: bool,
    /// Seconds without an idle heartbeat before `stalled`.
    pub stall_seconds: f64,
    /// Minimum idleness before the watchdog expects idle passes.
    pub min_idle_seconds: f64,
    /// Telemetry emission enabled.
    pub telemetry_enabled: bool,
    /// Seconds between telemetry events.
    pub telemetry_interval_s: f64,
    /// Release VRAM when the user returns.
    pub release_vram_on_active: bool,
    /// Deadline between VRAM release attempts.
    pub release_vram_deadline_ms: u64,
    /// Deadline for heavy work to drain after suspension.
    pub suspend_deadline_ms: u64,
    /// Budget for heavy work to resume after idle returns.
    pub resume_budget_ms: u64,
    /// Fixture override lane for tests and manual drains.
    pub fixture_override: bool,
    /// Idle threshold below which the user counts as active.
    pub active_window_s: f64,
    /// GPU guard thresholds.
    pub gpu_guard: GpuGuardConfig,
    /// Whether GPU-only jobs may run while the user is active.
    pub gpu_allow_during_active: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        ConductorConfig {
            sleep_ms: 2000,
            idle_enabled: true,
            idle_estimate_ms: 2000,
            research_enabled: true,
            research_interval_s: 1800.0,
            pressure_interval_s: 3600.0,
            retention_interval_s: 3600.0,
            retention_spec: "off".into(),
            watchdog_enabled: true,
            stall_seconds: 300.0,
            min_idle_seconds: 0.0,
            telemetry_enabled: true,
            telemetry_interval_s: 5.0,
            release_vram_on_active: true,
            release_vram_deadline_ms: 250,
            suspend_deadline_ms: 500,
            resume_budget_ms: 3000,
            fixture_override: false,
            active_window_s: 3.0,
            gpu_guard: GpuGuardConfig::default(),
            gpu_allow_during_active: false,
        }
    }
}

/// Capabilities the conductor orchestrates.
pub struct ConductorDeps {
    /// Governor shared with the scheduler.
    pub governor: Arc<Governor>,
    /// Scheduler (owned; ticked from the conductor loop).
    pub scheduler: Scheduler,
    /// Event builder for journal/ledger records.
    pub builder: Arc<EventBuilder>,
    /// Telemetry snapshot store.
    pub telemetry: Arc<TelemetryStore>,
    /// Audit log for mode transitions and force stops.
    pub audit: Arc<AuditLog>,
    /// Input activity tracker.
    pub activity: Arc<ActivityTracker>,
    /// CPU/RAM sampler.
    pub resources: Arc<ResourceSampler>,
    /// GPU controller (release + sampling).
    pub gpu: Arc<dyn GpuController>,
    /// OS fullscreen probe, when a platform plugin supplies one.
    pub fullscreen_probe: Option<Arc<dyn FullscreenProbe>>,
    /// Window record supplier (window metadata tracker capability).
    pub window_record: Option<Arc<dyn Fn() -> Option<Value> + Send + Sync>>,
    /// Idle processor, when extraction plugins are loaded.
    pub idle: Option<Arc<dyn IdleProcessor>>,
    /// Metadata store (pipeline DAG, retention bookkeeping).
    pub metadata: Arc<MetadataStore>,
    /// Media store (retention sweep).
    pub media: Arc<MediaStore>,
    /// Data directory (disk pressure sampling).
    pub data_dir: PathBuf,
}

/// Idle-step heartbeats shared between the conductor and the scheduled
/// idle job closure.
#[derive(Default)]
struct IdleMarks {
    last_idle_run: Option<Instant>,
    last_idle_ok: Option<Instant>,
    last_idle_error: Option<String>,
    last_idle_error_at: Option<Instant>,
}

#[derive(Default)]
struct ConductorStats {
    last_research_run: Option<Instant>,
    last_pressure_sample: Option<Instant>,
    last_retention_run: Option<Instant>,
    last_telemetry_emit: Option<Instant>,
    last_mode: Option<Mode>,
    suspend_requested_at: Option<Instant>,
    resume_requested_at: Option<Instant>,
    suspend_acked: bool,
    resume_acked: bool,
    last_watchdog_state: Option<String>,
    last_watchdog_event_at: Option<Instant>,
    last_fullscreen: Option<bool>,
    last_gpu_guard_ok: Option<bool>,
    last_gpu_release_at: Option<Instant>,
    fixture_override_audited: bool,
    dag_persisted: bool,
    last_watchdog: Option<Value>,
}

/// The conductor.
pub struct Conductor {
    config: ConductorConfig,
    deps: Mutex<ConductorDeps>,
    state: Mutex<ConductorStats>,
    idle_marks: Arc<Mutex<IdleMarks>>,
    queued: Mutex<HashSet<String>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Conductor {
    /// Build a conductor over its dependencies.
    pub fn new(config: ConductorConfig, deps: ConductorDeps) -> Arc<Self> {
        Arc::new(Conductor {
            config,
            deps: Mutex::new(deps),
            state: Mutex::new(ConductorStats::default()),
            idle_marks: Arc::new(Mutex::new(IdleMarks::default())),
            queued: Mutex::new(HashSet::new()),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Assemble the signal map for this tick.
    pub fn signals(&self, query_intent: Option<bool>) -> Signals {
        let deps = self.deps.lock();
        let mut idle_seconds = deps.activity.idle_seconds();
        let mut user_active = idle_seconds < self.config.active_window_s;
        if self.config.fixture_override {
            idle_seconds = f64::INFINITY;
            user_active = false;
            let mut state = self.state.lock();
            if !state.fixture_override_audited {
                state.fixture_override_audited = true;
                let _ = deps.audit.append(
                    "runtime.fixture_override",
                    "runtime.conductor",
                    "ok",
                    json!({"run_id": deps.builder.run_id()}),
                );
            }
        }
        let resources = deps.resources.sample();
        let window_record = deps.window_record.as_ref().and_then(|supplier| supplier());
        let verdict = fullscreen_verdict(
            deps.fullscreen_probe.as_deref(),
            window_record.as_ref(),
        );
        let gpu_decision = evaluate_gpu_guard(&self.config.gpu_guard, deps.gpu.sample());
        let gpu_only_allowed = !verdict.fullscreen
            && gpu_decision.ok
            && (self.config.gpu_allow_during_active || !user_active);
        {
            let mut state = self.state.lock();
            self.emit_fullscreen_transition(&deps, &mut state, &verdict);
            self.emit_gpu_guard_transition(&deps, &mut state, gpu_decision.ok);
        }
        Signals {
            idle_seconds,
            user_active,
            query_intent: query_intent.unwrap_or(false),
            suspend_workers: None,
            allow_query_heavy: None,
            cpu_utilization: resources.cpu_utilization,
            ram_utilization: resources.ram_utilization,
            fullscreen_active: verdict.fullscreen,
            gpu_only_allowed,
            fixture_override: self.config.fixture_override,
            run_id: Some(deps.builder.run_id().to_string()),
        }
    }

    /// Run one conductor tick. Safe to call from tests without the
    /// background thread.
    pub fn run_once(&self) -> Result<Value, RuntimeError> {
        self.persist_pipeline_dag()?;
        let signals = self.signals(None);
        if !signals.fullscreen_active {
            self.schedule_idle();
            self.schedule_research();
            self.schedule_storage_pressure();
            self.schedule_storage_retention();
        }
        let (executed, stats) = {
            let mut deps = self.deps.lock();
            let executed = deps.scheduler.run_pending(&signals);
            let stats = deps.scheduler.last_stats();
            (executed, stats)
        };
        self.handle_mode_transitions(&stats);
        self.maybe_release_gpu(&signals, &stats);
        let watchdog = self.watchdog_payload(&signals, &stats);
        self.maybe_emit_watchdog_event(&watchdog);
        self.emit_telemetry(&signals, &executed, &stats, &watchdog);
        {
            let mut queued = self.queued.lock();
            for name in &executed {
                queued.remove(name);
            }
        }
        self.state.lock().last_watchdog = Some(watchdog.clone());
        Ok(json!({
            "executed": executed,
            "stats": stats_payload(&stats),
            "watchdog": watchdog,
        }))
    }

    /// Latest watchdog payload.
    pub fn watchdog_state(&self) -> Option<Value> {
        self.state.lock().last_watchdog.clone()
    }

    /// Start the background loop.
    pub fn start(self: &Arc<Self>) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let conductor = Arc::clone(self);
        let sleep = Duration::from_millis(self.config.sleep_ms.max(100));
        *thread = Some(
            std::thread::Builder::new()
                .name("runtime-conductor".into())
                .spawn(move || {
                    while !conductor.stop.load(Ordering::SeqCst) {
                        if let Err(err) = conductor.run_once() {
                            tracing::error!(error = %err, "conductor tick failed");
                        }
                        std::thread::sleep(sleep);
                    }
                })
                .unwrap_or_else(|err| panic!("spawn runtime-conductor: {err}")),
        );
    }

    /// Stop the background loop and join it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn persist_pipeline_dag(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if state.dag_persisted {
            return Ok(());
        }
        state.dag_persisted = true;
        drop(state);
        let deps = self.deps.lock();
        let run_id = deps.builder.run_id().to_string();
        let record_id = format!("{run_id}/derived.pipeline_dag/v1");
        let record = autocap_spec::with_payload_hash(json!({
            "record_type": "derived.pipeline_dag",
            "schema_version": 1,
            "run_id": run_id,
            "ts_utc": autocap_spec::now_utc(),
            "dag": {
                "stages": ["capture", "ingest", "process", "index", "query"],
                "deps": [
                    ["capture", "ingest"],
                    ["index", "query"],
                    ["ingest", "process"],
                    ["process", "index"],
                ],
            },
        }))
        .unwrap_or(Value::Null);
        deps.metadata.put_replace(&record_id, &record)?;
        Ok(())
    }

    fn schedule_idle(&self) {
        if !self.config.idle_enabled {
            return;
        }
        let deps = self.deps.lock();
        let Some(processor) = deps.idle.clone() else {
            return;
        };
        drop(deps);
        if !self.queued.lock().insert("idle.extract".to_string()) {
            return;
        }
        let telemetry = self.deps.lock().telemetry.clone();
        let marks = Arc::clone(&self.idle_marks);
        let job = Job::steppable(
            "idle.extract",
            true,
            self.config.idle_estimate_ms,
            Box::new(move |should_abort, budget_ms| {
                marks.lock().last_idle_run = Some(Instant::now());
                let started = Instant::now();
                let result = processor.process_step(should_abort, budget_ms);
                let consumed_ms = started.elapsed().as_millis() as u64;
                let mut payload = json!({
                    "ts_utc": autocap_spec::now_utc(),
                    "done": result.done,
                    "consumed_ms": consumed_ms,
                });
                if let Some(stats) = &result.stats {
                    if let (Some(target), Some(source)) =
                        (payload.as_object_mut(), stats.as_object())
                    {
                        for (key, value) in source {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                    let mut idle_marks = marks.lock();
                    let completed = stats
                        .get("records_completed")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    if completed > 0 {
                        idle_marks.last_idle_ok = Some(Instant::now());
                    }
                    let errors = stats.get("errors").and_then(Value::as_u64).unwrap_or(0);
                    if errors > 0 {
                        idle_marks.last_idle_error = Some("idle_errors".to_string());
                        idle_marks.last_idle_error_at = Some(Instant::now());
                    }
                }
                telemetry.record("processing.idle", payload);
                JobOutcome {
                    done: result.done,
                    consumed_ms: consumed_ms.max(result.consumed_ms),
                }
            }),
        )
        .gpu_heavy(json!({"task": "idle.extract"}));
        self.deps.lock().scheduler.enqueue(job);
    }

    fn schedule_research(&self) {
        if !self.config.research_enabled {
            return;
        }
        let due = {
            let state = self.state.lock();
            state
                .last_research_run
                .map(|at| at.elapsed().as_secs_f64() >= self.config.research_interval_s)
                .unwrap_or(true)
        };
        if !due || !self.queued.lock().insert("idle.research".to_string()) {
            return;
        }
        self.state.lock().last_research_run = Some(Instant::now());
        let telemetry = self.deps.lock().telemetry.clone();
        let job = Job::steppable(
            "idle.research",
            true,
            1500,
            Box::new(move |_abort, _budget| {
                telemetry.record(
                    "idle.research",
                    json!({"ts_utc": autocap_spec::now_utc(), "done": true}),
                );
                JobOutcome {
                    done: true,
                    consumed_ms: 1,
                }
            }),
        )
        .gpu_heavy(json!({"task": "idle.research"}));
        self.deps.lock().scheduler.enqueue(job);
    }

    fn schedule_storage_pressure(&self) {
        let due = {
            let state = self.state.lock();
            state
                .last_pressure_sample
                .map(|at| at.elapsed().as_secs_f64() >= self.config.pressure_interval_s.max(60.0))
                .unwrap_or(true)
        };
        if !due || !self.queued.lock().insert("storage.pressure".to_string()) {
            return;
        }
        self.state.lock().last_pressure_sample = Some(Instant::now());
        let deps = self.deps.lock();
        let builder = Arc::clone(&deps.builder);
        let data_dir = deps.data_dir.clone();
        drop(deps);
        let job = Job::once(
            "storage.pressure",
            true,
            300,
            Box::new(move || {
                let free_bytes = fs2::available_space(&data_dir).unwrap_or(u64::MAX);
                let payload = json!({
                    "ts_utc": autocap_spec::now_utc(),
                    "free_bytes": free_bytes,
                    "free_gb": free_bytes >> 30,
                });
                let _ = builder.journal_event("disk.pressure", payload.clone());
                let _ = builder.ledger_entry("storage.pressure", vec![], vec![], payload);
            }),
        );
        self.deps.lock().scheduler.enqueue(job);
    }

    fn schedule_storage_retention(&self) {
        let horizon_hours = parse_retention_hours(&self.config.retention_spec);
        let due = {
            let state = self.state.lock();
            state
                .last_retention_run
                .map(|at| at.elapsed().as_secs_f64() >= self.config.retention_interval_s.max(60.0))
                .unwrap_or(true)
        };
        if !due || !self.queued.lock().insert("storage.retention".to_string()) {
            return;
        }
        self.state.lock().last_retention_run = Some(Instant::now());
        let deps = self.deps.lock();
        let builder = Arc::clone(&deps.builder);
        let metadata = Arc::clone(&deps.metadata);
        let media = Arc::clone(&deps.media);
        drop(deps);
        let job = Job::once(
            "storage.retention",
            true,
            500,
            Box::new(move || {
                let swept = match horizon_hours {
                    Some(hours) => sweep_expired_segments(&metadata, &media, hours),
                    None => Vec::new(),
                };
                let payload = json!({
                    "ts_utc": autocap_spec::now_utc(),
                    "horizon_hours": horizon_hours,
                    "swept_count": swept.len(),
                    "swept_samples": swept.iter().take(5).collect::<Vec<_>>(),
                });
                let _ = builder.journal_event("storage.retention", payload.clone());
                let _ = builder.ledger_entry("storage.retention", swept, vec![], payload);
            }),
        );
        self.deps.lock().scheduler.enqueue(job);
    }

    fn handle_mode_transitions(&self, stats: &SchedulerRunStats) {
        let mode = stats.mode.clone();
        let deps = self.deps.lock();
        let mut state = self.state.lock();
        let now = Instant::now();
        let parsed = match mode.as_str() {
            "IDLE_DRAIN" => Mode::IdleDrain,
            "USER_QUERY" => Mode::UserQuery,
            _ => Mode::ActiveCaptureOnly,
        };
        if state.last_mode != Some(parsed) {
            state.last_mode = Some(parsed);
            match parsed {
                Mode::ActiveCaptureOnly => {
                    state.suspend_requested_at = Some(now);
                    state.resume_requested_at = None;
                    state.suspend_acked = false;
                }
                Mode::IdleDrain => {
                    state.resume_requested_at = Some(now);
                    state.suspend_requested_at = None;
                    state.resume_acked = false;
                }
                Mode::UserQuery => {}
            }
            let _ = deps.audit.append(
                "runtime.mode_change",
                "runtime.conductor",
                "ok",
                json!({"mode": mode, "reason": stats.reason}),
            );
        }
        if parsed == Mode::ActiveCaptureOnly {
            if let Some(requested_at) = state.suspend_requested_at {
                let elapsed_ms = requested_at.elapsed().as_millis() as u64;
                let inflight = stats.inflight_heavy + deps.scheduler.queued_heavy() as u64;
                if !state.suspend_acked && inflight == 0 {
                    state.suspend_acked = true;
                    let _ = deps.audit.append(
                        "runtime.suspend_ack",
                        "runtime.scheduler",
                        "ok",
                        json!({"elapsed_ms": elapsed_ms}),
                    );
                }
                if elapsed_ms > self.config.suspend_deadline_ms && inflight > 0 {
                    drop(state);
                    drop(deps);
                    let removed = self
                        .deps
                        .lock()
                        .scheduler
                        .force_stop("active_suspend_deadline");
                    let deps = self.deps.lock();
                    let _ = deps.audit.append(
                        "runtime.force_stop",
                        "runtime.scheduler",
                        if removed > 0 { "ok" } else { "noop" },
                        json!({"elapsed_ms": elapsed_ms, "removed_jobs": removed}),
                    );
                    return;
                }
            }
        } else if parsed == Mode::IdleDrain {
            if let Some(requested_at) = state.resume_requested_at {
                let elapsed_ms = requested_at.elapsed().as_millis() as u64;
                if !state.resume_acked && stats.admitted_heavy > 0 {
                    state.resume_acked = true;
                    let _ = deps.audit.append(
                        "runtime.resume_ack",
                        "runtime.scheduler",
                        "ok",
                        json!({"elapsed_ms": elapsed_ms}),
                    );
                } else if !state.resume_acked && elapsed_ms > self.config.resume_budget_ms {
                    let _ = deps.audit.append(
                        "runtime.resume_late",
                        "runtime.scheduler",
                        "warn",
                        json!({"elapsed_ms": elapsed_ms, "budget_ms": self.config.resume_budget_ms}),
                    );
                }
            }
        }
    }

    fn maybe_release_gpu(&self, signals: &Signals, stats: &SchedulerRunStats) {
        if !self.config.release_vram_on_active || !signals.user_active {
            return;
        }
        let deadline = Duration::from_millis(self.config.release_vram_deadline_ms.max(1));
        {
            let state = self.state.lock();
            if state
                .last_gpu_release_at
                .map(|at| at.elapsed() < deadline)
                .unwrap_or(false)
            {
                return;
            }
        }
        let deps = self.deps.lock();
        let result = deps.gpu.release_vram("user_active");
        let payload = json!({
            "event": "gpu.release",
            "ts_utc": autocap_spec::now_utc(),
            "mode": stats.mode,
            "user_active": true,
            "result": result,
        });
        deps.telemetry.record("gpu.release", payload.clone());
        let _ = deps.builder.journal_event("gpu.release", payload);
        self.state.lock().last_gpu_release_at = Some(Instant::now());
    }

    fn watchdog_payload(&self, signals: &Signals, stats: &SchedulerRunStats) -> Value {
        let marks = self.idle_marks.lock();
        let mut payload = json!({
            "enabled": self.config.watchdog_enabled && self.config.idle_enabled,
            "state": "disabled",
            "reason": Value::Null,
            "stall_seconds": self.config.stall_seconds,
            "min_idle_seconds": self.config.min_idle_seconds,
            "idle_seconds": autocap_spec::float_token(signals.idle_seconds),
            "user_active": signals.user_active,
        });
        if !self.config.watchdog_enabled || !self.config.idle_enabled {
            payload["reason"] = json!("idle_disabled");
            return payload;
        }
        if signals.user_active || signals.idle_seconds < self.config.min_idle_seconds {
            payload["state"] = json!("paused");
            payload["reason"] = json!(if signals.user_active {
                "active_user"
            } else {
                "idle_short"
            });
            return payload;
        }
        if !stats.heavy_allowed || stats.mode == "ACTIVE_CAPTURE_ONLY" {
            payload["state"] = json!("paused");
            payload["reason"] = json!(stats.reason.clone());
            return payload;
        }
        let errored = match (marks.last_idle_error_at, marks.last_idle_ok) {
            (Some(error_at), Some(ok_at)) => error_at > ok_at,
            (Some(_), None) => true,
            _ => false,
        };
        if errored {
            payload["state"] = json!("error");
            payload["reason"] = json!("idle_error");
            payload["error"] = json!(marks.last_idle_error.clone());
            return payload;
        }
        let Some(last_run) = marks.last_idle_run else {
            payload["state"] = json!("pending");
            payload["reason"] = json!("no_idle_runs");
            return payload;
        };
        let age = last_run.elapsed().as_secs_f64();
        payload["age_seconds"] = autocap_spec::float_token(age);
        if age >= self.config.stall_seconds {
            payload["state"] = json!("stalled");
            payload["reason"] = json!("no_idle_heartbeat");
        } else {
            payload["state"] = json!("ok");
        }
        payload
    }

    fn maybe_emit_watchdog_event(&self, watchdog: &Value) {
        let Some(state_str) = watchdog.get("state").and_then(Value::as_str) else {
            return;
        };
        let mut state = self.state.lock();
        let previous = state.last_watchdog_state.clone();
        let event_type = match state_str {
            "stalled" | "error" => {
                let throttle = Duration::from_secs_f64(self.config.stall_seconds.max(60.0));
                if previous.as_deref() == Some(state_str)
                    && state
                        .last_watchdog_event_at
                        .map(|at| at.elapsed() < throttle)
                        .unwrap_or(false)
                {
                    state.last_watchdog_state = Some(state_str.to_string());
                    return;
                }
                Some(format!("processing.watchdog.{state_str}"))
            }
            "ok" if matches!(previous.as_deref(), Some("stalled") | Some("error")) => {
                Some("processing.watchdog.restore".to_string())
            }
            _ => None,
        };
        state.last_watchdog_state = Some(state_str.to_string());
        let Some(event_type) = event_type else {
            return;
        };
        state.last_watchdog_event_at = Some(Instant::now());
        drop(state);
        let deps = self.deps.lock();
        let mut payload = watchdog.clone();
        payload["event"] = json!(event_type.clone());
        let _ = deps.builder.journal_event(&event_type, payload);
    }

    fn emit_telemetry(
        &self,
        signals: &Signals,
        executed: &[String],
        stats: &SchedulerRunStats,
        watchdog: &Value,
    ) {
        let deps = self.deps.lock();
        deps.telemetry.record("processing.watchdog", watchdog.clone());
        if !self.config.telemetry_enabled {
            return;
        }
        {
            let state = self.state.lock();
            let interval = self.config.telemetry_interval_s.max(0.5);
            if state
                .last_telemetry_emit
                .map(|at| at.elapsed().as_secs_f64() < interval)
                .unwrap_or(false)
            {
                return;
            }
        }
        let payload = json!({
            "mode": stats.mode,
            "reason": stats.reason,
            "idle_seconds": autocap_spec::float_token(signals.idle_seconds),
            "user_active": signals.user_active,
            "fullscreen": signals.fullscreen_active,
            "budget": {
                "remaining_ms": stats.budget_remaining_ms,
                "spent_ms": stats.budget_spent_ms,
                "window_ms": stats.budget_window_ms,
                "inflight_heavy": stats.inflight_heavy,
            },
            "jobs": {
                "completed": stats.completed_jobs,
                "admitted_heavy": stats.admitted_heavy,
                "deferred": stats.deferred_jobs,
                "preempted": stats.preempted_jobs,
                "ran_light": stats.ran_light,
                "ran_gpu_only": stats.ran_gpu_only,
                "routed": stats.routed_jobs,
            },
            "executed": executed,
            "watchdog": watchdog,
        });
        deps.telemetry.record("runtime", payload.clone());
        let _ = deps.builder.journal_event("runtime.telemetry", payload);
        self.state.lock().last_telemetry_emit = Some(Instant::now());
    }

    fn emit_fullscreen_transition(
        &self,
        deps: &ConductorDeps,
        state: &mut ConductorStats,
        verdict: &crate::fullscreen::FullscreenVerdict,
    ) {
        let current = verdict.fullscreen;
        let Some(previous) = state.last_fullscreen else {
            state.last_fullscreen = Some(current);
            return;
        };
        if previous == current {
            return;
        }
        state.last_fullscreen = Some(current);
        let event = if current {
            "runtime.fullscreen_halt"
        } else {
            "runtime.fullscreen_resume"
        };
        let payload = json!({
            "event": event,
            "fullscreen": current,
            "reason": verdict.reason,
        });
        deps.telemetry.record("runtime.fullscreen", payload.clone());
        let _ = deps.audit.append(event, "runtime.conductor", "ok", payload.clone());
        let _ = deps.builder.journal_event(event, payload);
    }

    fn emit_gpu_guard_transition(
        &self,
        deps: &ConductorDeps,
        state: &mut ConductorStats,
        ok: bool,
    ) {
        let Some(previous) = state.last_gpu_guard_ok else {
            state.last_gpu_guard_ok = Some(ok);
            return;
        };
        if previous == ok {
            return;
        }
        state.last_gpu_guard_ok = Some(ok);
        let event = if ok {
            "runtime.gpu_guard_ok"
        } else {
            "runtime.gpu_guard_blocked"
        };
        let payload = json!({"event": event, "ok": ok});
        deps.telemetry.record("runtime.gpu_guard", payload.clone());
        let _ = deps.builder.journal_event(event, payload);
    }

}

fn sweep_expired_segments(
    metadata: &MetadataStore,
    media: &MediaStore,
    horizon_hours: f64,
) -> Vec<String> {
    let mut swept = Vec::new();
    let now = chrono::Utc::now();
    let Ok(segments) = metadata.records_of_type("evidence.capture.segment") else {
        return swept;
    };
    for (segment_id, mut record) in segments {
        let Some(end) = record
            .get("ts_end_utc")
            .and_then(Value::as_str)
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        else {
            continue;
        };
        let age_hours = (now - end.with_timezone(&chrono::Utc)).num_seconds() as f64 / 3600.0;
        if age_hours <= horizon_hours {
            continue;
        }
        if media.remove(&segment_id).is_ok() {
            if let Some(map) = record.as_object_mut() {
                map.insert("retained".to_string(), json!(false));
            }
            let _ = metadata.put_replace(&segment_id, &record);
            swept.push(segment_id);
        }
    }
    swept
}

/// Parse a retention spec like `14d`, `72h`, `90m` into hours. `off`,
/// `none`, `infinite`, and `0` disable retention.
pub fn parse_retention_hours(spec: &str) -> Option<f64> {
    let text = spec.trim().to_ascii_lowercase();
    if matches!(text.as_str(), "" | "infinite" | "inf" | "off" | "none" | "disabled" | "0") {
        return None;
    }
    let digits: String = text.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let unit: String = text
        .chars()
        .skip(digits.len())
        .filter(|ch| !ch.is_whitespace())
        .collect();
    let value: f64 = digits.parse().ok()?;
    match unit.chars().next().unwrap_or('d') {
        'h' => Some(value),
        'm' => Some(value / 60.0),
        's' => Some(value / 3600.0),
        _ => Some(value * 24.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use crate::gpu::NullGpuController;
    use crate::scheduler::SchedulerConfig;
    use autocap_store::{FsyncPolicy, JournalWriter, LedgerWriter};
    use std::path::Path;

    struct CountingIdle {
        steps_until_done: Mutex<u64>,
    }
    impl IdleProcessor for CountingIdle {
        fn process_step(&self, _abort: &dyn Fn() -> bool, _budget: u64) -> StepResult {
            let mut left = self.steps_until_done.lock();
            let done = *left == 0;
            if !done {
                *left -= 1;
            }
            StepResult {
                done,
                consumed_ms: 5,
                stats: Some(json!({"records_completed": 1, "pending_records": *left})),
            }
        }
        fn pending_records(&self) -> u64 {
            *self.steps_until_done.lock()
        }
    }

    fn deps(dir: &Path, idle: Option<Arc<dyn IdleProcessor>>) -> ConductorDeps {
        let journal = Arc::new(
            JournalWriter::open(&dir.join("journal.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let ledger =
            Arc::new(LedgerWriter::open(&dir.join("ledger.ndjson"), FsyncPolicy::None).unwrap());
        let builder = Arc::new(EventBuilder::new(
            "run-x".into(),
            journal,
            ledger,
            None,
            64,
            &json!({}),
        ));
        let governor = Arc::new(Governor::new(GovernorConfig {
            cpu_max_utilization: 1.5,
            ram_max_utilization: 1.5,
            ..GovernorConfig::default()
        }));
        ConductorDeps {
            governor: Arc::clone(&governor),
            scheduler: Scheduler::new(governor, SchedulerConfig::default()),
            builder,
            telemetry: Arc::new(TelemetryStore::default()),
            audit: Arc::new(AuditLog::open(&dir.join("audit.ndjson")).unwrap()),
            activity: Arc::new(ActivityTracker::default()),
            resources: Arc::new(ResourceSampler::new()),
            gpu: Arc::new(NullGpuController),
            fullscreen_probe: None,
            window_record: None,
            idle,
            metadata: Arc::new(MetadataStore::open(&dir.join("metadata"), FsyncPolicy::None).unwrap()),
            media: Arc::new(MediaStore::open(&dir.join("media"), FsyncPolicy::None).unwrap()),
            data_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn pipeline_dag_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), None);
        let metadata = Arc::clone(&deps.metadata);
        let conductor = Conductor::new(ConductorConfig::default(), deps);
        conductor.run_once().unwrap();
        conductor.run_once().unwrap();
        let record = metadata.get("run-x/derived.pipeline_dag/v1").unwrap().unwrap();
        assert_eq!(record["record_type"], json!("derived.pipeline_dag"));
        assert!(autocap_spec::records::payload_hash_valid(&record));
    }

    #[test]
    fn idle_job_runs_when_idle_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let idle: Arc<dyn IdleProcessor> = Arc::new(CountingIdle {
            steps_until_done: Mutex::new(1),
        });
        let deps = deps(dir.path(), Some(idle));
        let telemetry = Arc::clone(&deps.telemetry);
        let conductor = Conductor::new(ConductorConfig::default(), deps);
        // No activity recorded: idle_seconds is infinite, mode is IDLE_DRAIN.
        conductor.run_once().unwrap();
        conductor.run_once().unwrap();
        assert!(telemetry.latest("processing.idle").is_some());
    }

    #[test]
    fn mode_change_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path(), None);
        let audit = Arc::clone(&deps.audit);
        let conductor = Conductor::new(ConductorConfig::default(), deps);
        conductor.run_once().unwrap();
        let rows = audit.read_all().unwrap();
        assert!(rows.iter().any(|row| row.action == "runtime.mode_change"));
    }

    #[test]
    fn user_return_force_stops_heavy_work_within_deadline() {
        struct NeverDone;
        impl IdleProcessor for NeverDone {
            fn process_step(&self, _abort: &dyn Fn() -> bool, _budget: u64) -> StepResult {
                StepResult {
                    done: false,
                    consumed_ms: 1,
                    stats: None,
                }
            }
            fn pending_records(&self) -> u64 {
                1
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let idle: Arc<dyn IdleProcessor> = Arc::new(NeverDone);
        let deps = deps(dir.path(), Some(idle));
        let audit = Arc::clone(&deps.audit);
        let activity = Arc::clone(&deps.activity);
        let config = ConductorConfig {
            suspend_deadline_ms: 10,
            ..ConductorConfig::default()
        };
        let conductor = Conductor::new(config, deps);

        // Idle tick: the heavy steppable runs, does not finish, requeues.
        conductor.run_once().unwrap();
        // User returns: mode flips to ACTIVE_CAPTURE_ONLY.
        activity.record_activity();
        conductor.run_once().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        activity.record_activity();
        conductor.run_once().unwrap();

        let rows = audit.read_all().unwrap();
        let force_stop = rows
            .iter()
            .find(|row| row.action == "runtime.force_stop")
            .expect("expected a force stop audit row");
        assert_eq!(force_stop.outcome, "ok");
        assert_eq!(force_stop.details["removed_jobs"], json!(1));
    }

    #[test]
    fn retention_spec_parsing() {
        assert_eq!(parse_retention_hours("14d"), Some(336.0));
        assert_eq!(parse_retention_hours("72h"), Some(72.0));
        assert_eq!(parse_retention_hours("90m"), Some(1.5));
        assert_eq!(parse_retention_hours("off"), None);
        assert_eq!(parse_retention_hours("infinite"), None);
    }
}
