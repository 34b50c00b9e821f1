//! Runtime governor: decides the active mode from the signal map and
//! issues bounded work leases.
//!
//! The governor never fails; a misconfigured instance degrades to
//! `ACTIVE_CAPTURE_ONLY` so heavy work stays off the foreground path.

use crate::leases::{BudgetWindow, Lease};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Runtime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Capture continues; all heavy work is suspended.
    ActiveCaptureOnly,
    /// Idle: heavy processing may drain.
    IdleDrain,
    /// A user query is in flight and may use heavy resources.
    UserQuery,
}

impl Mode {
    /// Wire string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ActiveCaptureOnly => "ACTIVE_CAPTURE_ONLY",
            Mode::IdleDrain => "IDLE_DRAIN",
            Mode::UserQuery => "USER_QUERY",
        }
    }

    /// Whether heavy work may run in this mode.
    pub fn heavy_allowed(&self) -> bool {
        matches!(self, Mode::IdleDrain | Mode::UserQuery)
    }
}

/// Signal map handed to `decide`. This is the governor's sole input.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// Seconds since the last input event.
    pub idle_seconds: f64,
    /// Whether the user is currently active.
    pub user_active: bool,
    /// Whether a user query wants heavy resources.
    pub query_intent: bool,
    /// Per-tick override of the configured suspend policy.
    pub suspend_workers: Option<bool>,
    /// Per-tick override of the query-heavy policy.
    pub allow_query_heavy: Option<bool>,
    /// CPU utilization fraction (0..1), when sampled.
    pub cpu_utilization: Option<f64>,
    /// RAM utilization fraction (0..1), when sampled.
    pub ram_utilization: Option<f64>,
    /// Whether a fullscreen application is in the foreground.
    pub fullscreen_active: bool,
    /// Whether GPU-only jobs may run this tick.
    pub gpu_only_allowed: bool,
    /// Test-fixture lane: forces idle-shaped signals upstream.
    pub fixture_override: bool,
    /// Run id for audit payloads.
    pub run_id: Option<String>,
}

/// Governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Seconds of idleness before `IDLE_DRAIN`.
    pub idle_window_s: f64,
    /// Whether user activity suspends heavy workers.
    pub suspend_workers: bool,
    /// Whether `query_intent` may enter `USER_QUERY`.
    pub allow_query_heavy: bool,
    /// CPU utilization ceiling; above it heavy work is forced off.
    pub cpu_max_utilization: f64,
    /// RAM utilization ceiling; above it heavy work is forced off.
    pub ram_max_utilization: f64,
    /// Rolling lease window length.
    pub window_s: u64,
    /// Budget per rolling window.
    pub window_budget_ms: u64,
    /// Per-lease grant ceiling.
    pub per_job_max_ms: u64,
    /// Heavy leases allowed concurrently.
    pub max_heavy_concurrency: usize,
    /// Grace before preemption fires after a mode change.
    pub preempt_grace_ms: u64,
    /// Outer bound before in-flight heavy work is force-stopped.
    pub suspend_deadline_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            idle_window_s: 45.0,
            suspend_workers: true,
            allow_query_heavy: false,
            cpu_max_utilization: 0.6,
            ram_max_utilization: 0.8,
            window_s: 60,
            window_budget_ms: 20_000,
            per_job_max_ms: 5_000,
            max_heavy_concurrency: 1,
            preempt_grace_ms: 0,
            suspend_deadline_ms: 500,
        }
    }
}

impl GovernorConfig {
    fn sanitized(mut self) -> (Self, bool) {
        let mut misconfigured = false;
        if !self.idle_window_s.is_finite() || self.idle_window_s < 0.0 {
            self.idle_window_s = 45.0;
            misconfigured = true;
        }
        for limit in [&mut self.cpu_max_utilization, &mut self.ram_max_utilization] {
            if !limit.is_finite() || *limit <= 0.0 || *limit > 1.5 {
                *limit = 0.6;
                misconfigured = true;
            }
        }
        if self.window_budget_ms == 0 {
            self.window_budget_ms = 20_000;
            misconfigured = true;
        }
        (self, misconfigured)
    }
}

/// A mode decision with its reason.
#[derive(Debug, Clone)]
pub struct GovernorDecision {
    /// Decided mode.
    pub mode: Mode,
    /// Why the mode was chosen.
    pub reason: String,
    /// Whether heavy jobs may be admitted.
    pub heavy_allowed: bool,
    /// Milliseconds still grantable in the rolling window.
    pub budget_remaining_ms: u64,
}

struct GovernorState {
    last_mode: Mode,
    mode_changed_at: Instant,
}

/// The runtime governor.
pub struct Governor {
    config: GovernorConfig,
    misconfigured: bool,
    budget: BudgetWindow,
    state: Mutex<GovernorState>,
}

impl Governor {
    /// Build a governor; invalid configuration degrades conservatively.
    pub fn new(config: GovernorConfig) -> Self {
        let (config, misconfigured) = config.sanitized();
        if misconfigured {
            tracing::warn!("governor configuration sanitized; running conservative");
        }
        let budget = BudgetWindow::new(
            config.window_s,
            config.window_budget_ms,
            config.per_job_max_ms,
            config.max_heavy_concurrency,
        );
        Governor {
            config,
            misconfigured,
            budget,
            state: Mutex::new(GovernorState {
                last_mode: Mode::ActiveCaptureOnly,
                mode_changed_at: Instant::now(),
            }),
        }
    }

    /// Governor with defaults.
    pub fn with_defaults() -> Self {
        Governor::new(GovernorConfig::default())
    }

    /// Active configuration.
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide the mode for the given signals.
    pub fn decide(&self, signals: &Signals) -> GovernorDecision {
        let (mode, reason) = self.classify(signals);
        let mut state = self.state.lock();
        if state.last_mode != mode {
            state.last_mode = mode;
            state.mode_changed_at = Instant::now();
        }
        drop(state);
        GovernorDecision {
            mode,
            reason,
            heavy_allowed: mode.heavy_allowed(),
            budget_remaining_ms: self.budget.remaining_ms(),
        }
    }

    fn classify(&self, signals: &Signals) -> (Mode, String) {
        if self.misconfigured {
            return (Mode::ActiveCaptureOnly, "misconfigured".to_string());
        }
        // Resource ceilings override idleness entirely.
        let cpu_over = signals
            .cpu_utilization
            .map(|cpu| cpu > self.config.cpu_max_utilization)
            .unwrap_or(false);
        let ram_over = signals
            .ram_utilization
            .map(|ram| ram > self.config.ram_max_utilization)
            .unwrap_or(false);
        if cpu_over || ram_over {
            return (Mode::ActiveCaptureOnly, "resource_budget".to_string());
        }

        let suspend_workers = signals.suspend_workers.unwrap_or(self.config.suspend_workers);
        let allow_query_heavy = signals
            .allow_query_heavy
            .unwrap_or(self.config.allow_query_heavy);
        if signals.query_intent && allow_query_heavy {
            return (Mode::UserQuery, "query_intent".to_string());
        }
        if signals.user_active && suspend_workers {
            return (Mode::ActiveCaptureOnly, "active_user".to_string());
        }
        if signals.idle_seconds >= self.config.idle_window_s {
            return (Mode::IdleDrain, "idle_window".to_string());
        }
        if signals.user_active && !suspend_workers {
            return (Mode::IdleDrain, "active_workers_allowed".to_string());
        }
        if signals.query_intent {
            // Conservative: query heavy disabled, stay on capture.
            return (Mode::ActiveCaptureOnly, "query_heavy_disabled".to_string());
        }
        (Mode::ActiveCaptureOnly, "not_idle".to_string())
    }

    /// Request a lease. Denials carry `granted_ms == 0`; callers defer the
    /// job instead of failing it.
    pub fn lease(&self, job_name: &str, requested_ms: u64, heavy: bool) -> Lease {
        self.budget.lease(job_name, requested_ms, heavy)
    }

    /// Release a lease with the milliseconds consumed.
    pub fn release(&self, lease: &Lease, consumed_ms: u64) {
        self.budget.release(lease, consumed_ms);
    }

    /// Rolling-window budget view.
    pub fn budget(&self) -> &BudgetWindow {
        &self.budget
    }

    /// Whether in-flight heavy work should be preempted now. True once
    /// the mode has left `IDLE_DRAIN`/`USER_QUERY` and `preempt_grace_ms`
    /// has elapsed since the transition.
    pub fn should_preempt(&self, signals: &Signals) -> bool {
        let decision = self.decide(signals);
        if decision.mode.heavy_allowed() {
            return false;
        }
        let state = self.state.lock();
        let since_change = state.mode_changed_at.elapsed();
        since_change >= Duration::from_millis(self.config.preempt_grace_ms)
    }

    /// Suspend deadline for the conductor's force-stop path.
    pub fn suspend_deadline(&self) -> Duration {
        Duration::from_millis(self.config.suspend_deadline_ms)
    }
}
