//! Capture pipeline: three OS threads (grab, encode, write) joined by two
//! bounded queues, producing sealed segment containers with crash-safe
//! spool handling.

/// Backpressure controller and disk pressure levels.
pub mod backpressure;
/// Segment container writers (AVI-MJPEG, ZIP, ffmpeg MP4).
pub mod container;
/// Frame fingerprinting and dedupe policy.
pub mod dedupe;
/// Lossless screenshot frame records.
pub mod frames;
/// Three-stage capture pipeline.
pub mod pipeline;
/// Bounded queues with explicit drop policies.
pub mod queues;
/// Segment spool writer.
pub mod segment;
/// Frame source abstraction (platform bindings live behind this trait).
pub mod source;

pub use backpressure::{BackpressureController, DiskLevel, DiskPressure};
pub use container::{ContainerKind, ContainerWriter};
pub use dedupe::{DedupeDecision, DedupePolicy, FrameDeduper};
pub use frames::{FrameOutcome, FrameRecorder};
pub use pipeline::{CaptureConfig, CapturePipeline, PipelineHandles};
pub use queues::{BoundedQueue, DropPolicy, PushOutcome};
pub use segment::{SegmentArtifact, SegmentWriter};
pub use source::{Frame, FrameSource, SyntheticFrameSource};

use thiserror::Error;

/// Errors raised by the capture pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Container-level failure (encode or close).
    #[error("container: {0}")]
    Container(String),
    /// Spool or media filesystem failure.
    #[error("capture io: {0}")]
    Io(#[from] std::io::Error),
    /// Storage layer failure while sealing.
    #[error(transparent)]
    Store(#[from] autocap_store::StoreError),
    /// Zip container failure.
    #[error("zip container: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// The requested container cannot run on this host.
    #[error("container unavailable: {0}")]
    ContainerUnavailable(String),
}
