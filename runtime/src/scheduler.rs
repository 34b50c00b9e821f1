//! Cooperative FIFO scheduler honoring governor decisions.
//!
//! Jobs are either one-shot closures or steppable units returning
//! `{done, consumed_ms}`. Admission is checked independently per job, so
//! light jobs never starve behind deferred heavy ones.

use crate::governor::{Governor, Mode, Signals};
use crate::wsl2::Wsl2Queue;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Result of one steppable unit of work.
#[derive(Debug, Clone, Copy)]
pub struct JobOutcome {
    /// Whether the job finished.
    pub done: bool,
    /// Milliseconds consumed by this step.
    pub consumed_ms: u64,
}

type OnceFn = Box<dyn FnOnce() + Send>;
type StepFn = Box<dyn FnMut(&dyn Fn() -> bool, u64) -> JobOutcome + Send>;

enum JobKind {
    Once(OnceFn),
    Steppable(StepFn),
}

/// A scheduled job.
pub struct Job {
    /// Job name (also the lease name).
    pub name: String,
    kind: JobKind,
    /// Whether the job needs a heavy lease.
    pub heavy: bool,
    /// Whether the job prefers GPU execution (routable to WSL2).
    pub gpu_heavy: bool,
    /// Whether the job can only run on the GPU.
    pub gpu_only: bool,
    /// Estimated runtime used for lease requests.
    pub estimated_ms: u64,
    /// Opaque payload (routed jobs ship it to the external queue).
    pub payload: Value,
}

impl Job {
    /// One-shot job.
    pub fn once(name: impl Into<String>, heavy: bool, estimated_ms: u64, fn_: OnceFn) -> Self {
        Job {
            name: name.into(),
            kind: JobKind::Once(fn_),
            heavy,
            gpu_heavy: false,
            gpu_only: false,
            estimated_ms,
            payload: Value::Null,
        }
    }

    /// Steppable job.
    pub fn steppable(
        name: impl Into<String>,
        heavy: bool,
        estimated_ms: u64,
        step: StepFn,
    ) -> Self {
        Job {
            name: name.into(),
            kind: JobKind::Steppable(step),
            heavy,
            gpu_heavy: false,
            gpu_only: false,
            estimated_ms,
            payload: Value::Null,
        }
    }

    /// Mark the job GPU-heavy (eligible for WSL2 routing).
    pub fn gpu_heavy(mut self, payload: Value) -> Self {
        self.gpu_heavy = true;
        self.payload = payload;
        self
    }

    /// Mark the job GPU-only.
    pub fn gpu_only(mut self) -> Self {
        self.gpu_only = true;
        self
    }
}

/// Stats for one `run_pending` tick.
#[derive(Debug, Clone, Default)]
pub struct SchedulerRunStats {
    /// Mode string for the tick.
    pub mode: String,
    /// Decision reason.
    pub reason: String,
    /// Whether heavy work was admissible.
    pub heavy_allowed: bool,
    /// Budget still grantable at end of tick.
    pub budget_remaining_ms: u64,
    /// Budget spent inside the rolling window.
    pub budget_spent_ms: u64,
    /// Configured window budget.
    pub budget_window_ms: u64,
    /// Heavy leases outstanding at end of tick.
    pub inflight_heavy: u64,
    /// Heavy jobs admitted this tick.
    pub admitted_heavy: u64,
    /// Jobs that finished this tick.
    pub completed_jobs: u64,
    /// Jobs deferred (no lease, wrong mode, or gpu gate).
    pub deferred_jobs: u64,
    /// Jobs dropped by a force stop.
    pub preempted_jobs: u64,
    /// Light jobs run.
    pub ran_light: u64,
    /// GPU-only jobs run.
    pub ran_gpu_only: u64,
    /// GPU-heavy jobs routed to the external queue.
    pub routed_jobs: u64,
    /// Monotonic seconds since scheduler start.
    pub ts_monotonic: f64,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Route `gpu_heavy` jobs to the WSL2 queue when available.
    pub route_gpu_to_wsl2: bool,
    /// Admit `gpu_only` jobs during active use when the GPU guard allows.
    pub gpu_allow_during_active: bool,
}

/// Cooperative FIFO scheduler.
pub struct Scheduler {
    governor: Arc<Governor>,
    config: SchedulerConfig,
    queue: VecDeque<Job>,
    wsl2: Option<Arc<Wsl2Queue>>,
    aborted: Arc<AtomicBool>,
    started: Instant,
    last_stats: SchedulerRunStats,
    preempted_total: u64,
}

impl Scheduler {
    /// New scheduler over a governor.
    pub fn new(governor: Arc<Governor>, config: SchedulerConfig) -> Self {
        Scheduler {
            governor,
            config,
            queue: VecDeque::new(),
            wsl2: None,
            aborted: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            last_stats: SchedulerRunStats::default(),
            preempted_total: 0,
        }
    }

    /// Attach the WSL2 routing queue.
    pub fn with_wsl2(mut self, queue: Arc<Wsl2Queue>) -> Self {
        self.wsl2 = Some(queue);
        self
    }

    /// Enqueue a job at the tail.
    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job);
    }

    /// Jobs currently queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a job with `name` is queued.
    pub fn has_queued(&self, name: &str) -> bool {
        self.queue.iter().any(|job| job.name == name)
    }

    /// Heavy (or GPU-only) jobs still queued.
    pub fn queued_heavy(&self) -> usize {
        self.queue
            .iter()
            .filter(|job| job.heavy || job.gpu_only)
            .count()
    }

    /// Run one tick: admit, execute, and re-enqueue unfinished steppables.
    /// Returns the names of jobs that completed (or were routed).
    pub fn run_pending(&mut self, signals: &Signals) -> Vec<String> {
        self.aborted.store(false, Ordering::SeqCst);
        let decision = self.governor.decide(signals);
        let mut stats = SchedulerRunStats {
            mode: decision.mode.as_str().to_string(),
            reason: decision.reason.clone(),
            heavy_allowed: decision.heavy_allowed,
            budget_window_ms: self.governor.budget().window_budget_ms(),
            preempted_jobs: self.preempted_total,
            ..SchedulerRunStats::default()
        };
        self.preempted_total = 0;
        let mut executed = Vec::new();
        let mut requeue: VecDeque<Job> = VecDeque::new();

        while let Some(mut job) = self.queue.pop_front() {
            // GPU-only gate.
            if job.gpu_only {
                let mode_ok = decision.heavy_allowed
                    || (self.config.gpu_allow_during_active && signals.user_active);
                if !(signals.gpu_only_allowed && mode_ok) {
                    stats.deferred_jobs += 1;
                    requeue.push_back(job);
                    continue;
                }
            }
            // Light jobs run unconditionally.
            if !job.heavy && !job.gpu_only {
                let outcome = self.run_job(&mut job, signals, self.governor.config().per_job_max_ms);
                stats.ran_light += 1;
                if outcome.done {
                    stats.completed_jobs += 1;
                    executed.push(job.name.clone());
                } else {
                    requeue.push_back(job);
                }
                continue;
            }
            if job.heavy && !decision.heavy_allowed {
                stats.deferred_jobs += 1;
                requeue.push_back(job);
                continue;
            }
            // Route GPU-heavy jobs to the external queue when configured.
            if job.gpu_heavy && self.config.route_gpu_to_wsl2 {
                if let Some(queue) = &self.wsl2 {
                    let run_id = signals.run_id.clone().unwrap_or_else(|| "run".to_string());
                    let dispatch = queue.dispatch(&job.name, &job.payload, &run_id, false);
                    if dispatch.ok {
                        stats.routed_jobs += 1;
                        executed.push(job.name.clone());
                        continue;
                    }
                    tracing::debug!(
                        job = %job.name,
                        reason = %dispatch.reason,
                        "wsl2 dispatch deferred"
                    );
                    stats.deferred_jobs += 1;
                    requeue.push_back(job);
                    continue;
                }
            }
            let lease = self.governor.lease(&job.name, job.estimated_ms.max(1), true);
            if !lease.allowed {
                stats.deferred_jobs += 1;
                requeue.push_back(job);
                continue;
            }
            stats.admitted_heavy += 1;
            if job.gpu_only {
                stats.ran_gpu_only += 1;
            }
            let budget = lease
                .granted_ms
                .min(self.governor.config().per_job_max_ms);
            let outcome = self.run_job(&mut job, signals, budget);
            self.governor.release(&lease, outcome.consumed_ms);
            if outcome.done {
                stats.completed_jobs += 1;
                executed.push(job.name.clone());
            } else {
                requeue.push_back(job);
            }
        }
        self.queue = requeue;

        stats.budget_remaining_ms = self.governor.budget().remaining_ms();
        stats.budget_spent_ms = self.governor.budget().spent_ms();
        stats.inflight_heavy = self.governor.budget().inflight_heavy() as u64;
        stats.ts_monotonic = self.started.elapsed().as_secs_f64();
        self.last_stats = stats;
        executed
    }

    /// Stats of the last tick.
    pub fn last_stats(&self) -> SchedulerRunStats {
        self.last_stats.clone()
    }

    /// Drop all queued heavy jobs; in-flight steppables observe the abort
    /// flag through `should_abort`. Returns the number removed.
    pub fn force_stop(&mut self, reason: &str) -> usize {
        self.aborted.store(true, Ordering::SeqCst);
        let before = self.queue.len();
        self.queue.retain(|job| !job.heavy && !job.gpu_only);
        let removed = before - self.queue.len();
        self.preempted_total += removed as u64;
        tracing::info!(reason, removed, "scheduler force stop");
        removed
    }

    fn run_job(&self, job: &mut Job, signals: &Signals, budget_ms: u64) -> JobOutcome {
        let governor = Arc::clone(&self.governor);
        let aborted = Arc::clone(&self.aborted);
        let signals = signals.clone();
        let should_abort = move || -> bool {
            aborted.load(Ordering::SeqCst) || governor.should_preempt(&signals)
        };
        match &mut job.kind {
            JobKind::Once(_) => {
                let JobKind::Once(fn_) =
                    std::mem::replace(&mut job.kind, JobKind::Once(Box::new(|| {})))
                else {
                    unreachable!("kind checked above");
                };
                let started = Instant::now();
                fn_();
                JobOutcome {
                    done: true,
                    consumed_ms: started.elapsed().as_millis() as u64,
                }
            }
            JobKind::Steppable(step) => step(&should_abort, budget_ms),
        }
    }
}

/// Run stats serialized for telemetry.
pub fn stats_payload(stats: &SchedulerRunStats) -> Value {
    json!({
        "mode": stats.mode,
        "reason": stats.reason,
        "heavy_allowed": stats.heavy_allowed,
        "budget_remaining_ms": stats.budget_remaining_ms,
        "budget_spent_ms": stats.budget_spent_ms,
        "budget_window_ms": stats.budget_window_ms,
        "inflight_heavy": stats.inflight_heavy,
        "admitted_heavy": stats.admitted_heavy,
        "completed_jobs": stats.completed_jobs,
        "deferred_jobs": stats.deferred_jobs,
        "preempted_jobs": stats.preempted_jobs,
        "ran_light": stats.ran_light,
        "ran_gpu_only": stats.ran_gpu_only,
        "routed_jobs": stats.routed_jobs,
        "ts_monotonic": autocap_spec::float_token(stats.ts_monotonic),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::GovernorConfig;
    use std::sync::atomic::AtomicU64;

    fn idle_signals() -> Signals {
        Signals {
            idle_seconds: 90.0,
            ..Signals::default()
        }
    }

    fn active_signals() -> Signals {
        Signals {
            idle_seconds: 0.0,
            user_active: true,
            ..Signals::default()
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(Governor::with_defaults()),
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn light_jobs_run_in_any_mode() {
        let mut scheduler = scheduler();
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        scheduler.enqueue(Job::once("light.tick", false, 10, Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        let executed = scheduler.run_pending(&active_signals());
        assert_eq!(executed, vec!["light.tick".to_string()]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.last_stats().ran_light, 1);
    }

    #[test]
    fn heavy_jobs_defer_until_idle() {
        let mut scheduler = scheduler();
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        scheduler.enqueue(Job::once("idle.extract", true, 100, Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(scheduler.run_pending(&active_signals()).is_empty());
        assert_eq!(scheduler.last_stats().deferred_jobs, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let executed = scheduler.run_pending(&idle_signals());
        assert_eq!(executed, vec!["idle.extract".to_string()]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.last_stats().admitted_heavy, 1);
    }

    #[test]
    fn unfinished_steppable_requeues_at_tail() {
        let mut scheduler = scheduler();
        let steps = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&steps);
        scheduler.enqueue(Job::steppable(
            "idle.extract",
            true,
            100,
            Box::new(move |_abort, _budget| {
                let step = seen.fetch_add(1, Ordering::SeqCst);
                JobOutcome {
                    done: step >= 1,
                    consumed_ms: 10,
                }
            }),
        ));
        assert!(scheduler.run_pending(&idle_signals()).is_empty());
        assert_eq!(scheduler.queued(), 1);
        let executed = scheduler.run_pending(&idle_signals());
        assert_eq!(executed.len(), 1);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn force_stop_drops_heavy_jobs_and_counts_preempted() {
        let mut scheduler = scheduler();
        scheduler.enqueue(Job::once("idle.extract", true, 100, Box::new(|| {})));
        scheduler.enqueue(Job::once("light.tick", false, 10, Box::new(|| {})));
        let removed = scheduler.force_stop("active_suspend_deadline");
        assert_eq!(removed, 1);
        assert_eq!(scheduler.queued(), 1);
        scheduler.run_pending(&active_signals());
        assert_eq!(scheduler.last_stats().preempted_jobs, 1);
    }

    #[test]
    fn gpu_only_jobs_need_gpu_signal() {
        let mut scheduler = scheduler();
        scheduler.enqueue(Job::once("gpu.embed", true, 100, Box::new(|| {})).gpu_only());
        let mut signals = idle_signals();
        assert!(scheduler.run_pending(&signals).is_empty());
        assert_eq!(scheduler.last_stats().deferred_jobs, 1);
        signals.gpu_only_allowed = true;
        let executed = scheduler.run_pending(&signals);
        assert_eq!(executed.len(), 1);
        assert_eq!(scheduler.last_stats().ran_gpu_only, 1);
    }

    #[test]
    fn budget_exhaustion_defers_not_fails() {
        let governor = Arc::new(Governor::new(GovernorConfig {
            window_budget_ms: 50,
            per_job_max_ms: 50,
            ..GovernorConfig::default()
        }));
        let mut scheduler = Scheduler::new(governor, SchedulerConfig::default());
        scheduler.enqueue(Job::steppable(
            "idle.extract",
            true,
            50,
            Box::new(|_abort, budget| JobOutcome {
                done: true,
                consumed_ms: budget,
            }),
        ));
        scheduler.enqueue(Job::once("idle.research", true, 50, Box::new(|| {})));
        let executed = scheduler.run_pending(&idle_signals());
        // First job consumed the whole window; second is deferred.
        assert_eq!(executed, vec!["idle.extract".to_string()]);
        assert_eq!(scheduler.last_stats().deferred_jobs, 1);
        assert_eq!(scheduler.queued(), 1);
    }
}
