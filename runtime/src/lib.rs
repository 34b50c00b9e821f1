//! Runtime governance: mode decisions, work leases, the cooperative
//! scheduler, the conductor loop, the idle batch runner with its SLA
//! controller, and the WSL2 GPU routing queue.

/// Activity signal tracking.
pub mod activity;
/// Idle batch runner + SLA controller + adaptive parallelism.
pub mod batch;
/// Conductor loop orchestrating capture-adjacent housekeeping.
pub mod conductor;
/// Fullscreen detection policy.
pub mod fullscreen;
/// Governor: mode decisions and preemption.
pub mod governor;
/// GPU guard and VRAM release hooks.
pub mod gpu;
/// Rolling-window lease budget.
pub mod leases;
/// Host resource sampling.
pub mod resources;
/// Cooperative FIFO scheduler.
pub mod scheduler;
/// Filesystem-mediated WSL2 GPU job queue.
pub mod wsl2;

pub use activity::ActivityTracker;
pub use batch::{run_processing_batch, BatchConfig, BatchOutcome, IdleTuning};
pub use conductor::{Conductor, ConductorDeps, IdleProcessor, StepResult};
pub use fullscreen::{fullscreen_verdict, FullscreenProbe, FullscreenVerdict, WindowRect};
pub use governor::{Governor, GovernorConfig, GovernorDecision, Mode, Signals};
pub use gpu::{GpuController, GpuGuardConfig, GpuGuardDecision, GpuSnapshot, NullGpuController};
pub use leases::{BudgetWindow, Lease};
pub use scheduler::{Job, JobOutcome, Scheduler, SchedulerConfig, SchedulerRunStats};
pub use wsl2::{Wsl2DispatchResult, Wsl2Queue, Wsl2QueueConfig};

use thiserror::Error;

/// Errors raised by the runtime layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Storage layer failure while recording runtime evidence.
    #[error(transparent)]
    Store(#[from] autocap_store::StoreError),
    /// Queue directory failure.
    #[error("runtime io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure for runtime payloads.
    #[error("runtime encode: {0}")]
    Encode(#[from] serde_json::Error),
}
