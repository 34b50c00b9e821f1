//! Rolling-window millisecond budget for heavy work leases.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A granted (or denied) admission for one job.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Job the lease was requested for.
    pub job_name: String,
    /// Whether the lease was granted.
    pub allowed: bool,
    /// Milliseconds granted (0 when denied).
    pub granted_ms: u64,
    /// Whether the lease counts against heavy concurrency.
    pub heavy: bool,
    pub(crate) id: u64,
}

struct WindowState {
    spent: Vec<(Instant, u64)>,
    outstanding: Vec<(u64, u64, bool)>, // (lease id, granted_ms, heavy)
    next_id: u64,
}

/// Budget of `window_budget_ms` spendable per rolling `window_s`, with a
/// per-job cap and a heavy-concurrency cap. Unused grant returns to the
/// pool at release time.
pub struct BudgetWindow {
    window: Duration,
    window_budget_ms: u64,
    per_job_max_ms: u64,
    max_heavy_concurrency: usize,
    state: Mutex<WindowState>,
}

impl BudgetWindow {
    /// New budget window.
    pub fn new(
        window_s: u64,
        window_budget_ms: u64,
        per_job_max_ms: u64,
        max_heavy_concurrency: usize,
    ) -> Self {
        BudgetWindow {
            window: Duration::from_secs(window_s.max(1)),
            window_budget_ms,
            per_job_max_ms: per_job_max_ms.max(1),
            max_heavy_concurrency: max_heavy_concurrency.max(1),
            state: Mutex::new(WindowState {
                spent: Vec::new(),
                outstanding: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Request a lease of up to `requested_ms`.
    pub fn lease(&self, job_name: &str, requested_ms: u64, heavy: bool) -> Lease {
        let now = Instant::now();
        let mut state = self.state.lock();
        prune(&mut state.spent, now, self.window);
        if heavy {
            let inflight_heavy = state
                .outstanding
                .iter()
                .filter(|(_, _, is_heavy)| *is_heavy)
                .count();
            if inflight_heavy >= self.max_heavy_concurrency {
                return Lease {
                    job_name: job_name.to_string(),
                    allowed: false,
                    granted_ms: 0,
                    heavy,
                    id: 0,
                };
            }
        }
        let spent: u64 = state.spent.iter().map(|(_, ms)| ms).sum();
        let reserved: u64 = state.outstanding.iter().map(|(_, ms, _)| ms).sum();
        let remaining = self.window_budget_ms.saturating_sub(spent + reserved);
        let granted = requested_ms.min(self.per_job_max_ms).min(remaining);
        if granted == 0 {
            return Lease {
                job_name: job_name.to_string(),
                allowed: false,
                granted_ms: 0,
                heavy,
                id: 0,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.outstanding.push((id, granted, heavy));
        Lease {
            job_name: job_name.to_string(),
            allowed: true,
            granted_ms: granted,
            heavy,
            id,
        }
    }

    /// Release a lease, recording the milliseconds actually consumed.
    /// Consumption is capped at the grant; unused credit is returned.
    pub fn release(&self, lease: &Lease, consumed_ms: u64) {
        if !lease.allowed {
            return;
        }
        let mut state = self.state.lock();
        state.outstanding.retain(|(id, _, _)| *id != lease.id);
        let charged = consumed_ms.min(lease.granted_ms);
        if charged > 0 {
            state.spent.push((Instant::now(), charged));
        }
    }

    /// Milliseconds spent inside the current window.
    pub fn spent_ms(&self) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        prune(&mut state.spent, now, self.window);
        state.spent.iter().map(|(_, ms)| ms).sum()
    }

    /// Milliseconds still grantable in the current window.
    pub fn remaining_ms(&self) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        prune(&mut state.spent, now, self.window);
        let spent: u64 = state.spent.iter().map(|(_, ms)| ms).sum();
        let reserved: u64 = state.outstanding.iter().map(|(_, ms, _)| ms).sum();
        self.window_budget_ms.saturating_sub(spent + reserved)
    }

    /// Heavy leases currently outstanding.
    pub fn inflight_heavy(&self) -> usize {
        self.state
            .lock()
            .outstanding
            .iter()
            .filter(|(_, _, heavy)| *heavy)
            .count()
    }

    /// Configured window budget.
    pub fn window_budget_ms(&self) -> u64 {
        self.window_budget_ms
    }
}

fn prune(spent: &mut Vec<(Instant, u64)>, now: Instant, window: Duration) {
    spent.retain(|(at, _)| now.duration_since(*at) <= window);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_are_capped_per_job() {
        let budget = BudgetWindow::new(60, 10_000, 2_000, 2);
        let lease = budget.lease("idle.extract", 5_000, true);
        assert!(lease.allowed);
        assert_eq!(lease.granted_ms, 2_000);
        budget.release(&lease, 500);
        assert_eq!(budget.spent_ms(), 500);
    }

    #[test]
    fn unused_credit_returns_to_pool() {
        let budget = BudgetWindow::new(60, 1_000, 1_000, 2);
        let lease = budget.lease("idle.extract", 1_000, true);
        assert_eq!(lease.granted_ms, 1_000);
        // While outstanding, the pool is exhausted.
        assert!(!budget.lease("idle.research", 100, true).allowed);
        budget.release(&lease, 200);
        let next = budget.lease("idle.research", 1_000, true);
        assert_eq!(next.granted_ms, 800);
    }

    #[test]
    fn heavy_concurrency_is_capped() {
        let budget = BudgetWindow::new(60, 100_000, 10_000, 1);
        let first = budget.lease("a", 1_000, true);
        assert!(first.allowed);
        assert!(!budget.lease("b", 1_000, true).allowed);
        // Light leases are unaffected by the heavy cap.
        assert!(budget.lease("c", 1_000, false).allowed);
        budget.release(&first, 1_000);
        assert!(budget.lease("b", 1_000, true).allowed);
    }

    #[test]
    fn overconsumption_is_charged_at_grant() {
        let budget = BudgetWindow::new(60, 1_000, 1_000, 2);
        let lease = budget.lease("a", 400, true);
        budget.release(&lease, 9_999);
        assert_eq!(budget.spent_ms(), 400);
    }
}
