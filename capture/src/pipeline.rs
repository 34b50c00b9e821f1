//! Three-stage capture pipeline: grab → encode → write.
//!
//! Grab pushes frames into a `drop_oldest` bounded queue and owns disk
//! pressure + backpressure; encode drains frames into segment containers
//! honoring `Flush`/`Stop` sentinels and segment boundaries; write seals
//! each finished segment through media, metadata, journal, and ledger.

use crate::backpressure::{free_gb, BackpressureController, DiskLevel, DiskPressure, RateUpdate};
use crate::container::{resolve_container, ContainerKind};
use crate::dedupe::{DedupePolicy, FingerprintAlgo, FrameDeduper};
use crate::queues::{BoundedQueue, DropPolicy};
use crate::segment::{SegmentArtifact, SegmentWriter};
use crate::source::{Frame, FrameSource};
use autocap_spec::{prefixed_id, with_payload_hash};
use autocap_store::{EventBuilder, MediaStore, MetadataStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capture configuration consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Run id for segment record ids.
    pub run_id: String,
    /// Data directory (disk pressure is sampled here).
    pub data_dir: PathBuf,
    /// Spool directory for in-flight segment containers.
    pub spool_dir: PathBuf,
    /// Target frames per second.
    pub fps_target: u32,
    /// Floor for backpressure degradation.
    pub min_fps: u32,
    /// Target bitrate.
    pub bitrate_kbps: u32,
    /// Floor for backpressure degradation.
    pub min_bitrate_kbps: u32,
    /// Segment length in seconds of monotonic time.
    pub segment_seconds: u64,
    /// Requested container.
    pub container: ContainerKind,
    /// Encoder label (`cpu` or `nvenc`).
    pub encoder: String,
    /// Optional explicit ffmpeg path.
    pub ffmpeg_path: Option<PathBuf>,
    /// Frame queue capacity.
    pub max_queue_depth: usize,
    /// Disk pressure thresholds in free GB.
    pub disk_warn_gb: u64,
    /// Soft threshold: degrade rates.
    pub disk_soft_gb: u64,
    /// Critical threshold: hard stop.
    pub disk_critical_gb: u64,
    /// Dedupe toggle.
    pub dedupe_enabled: bool,
    /// Dedupe fingerprint algorithm.
    pub dedupe_algo: FingerprintAlgo,
    /// Dedupe policy.
    pub dedupe_policy: DedupePolicy,
    /// Fingerprint sampling bound (0 = whole frame).
    pub dedupe_sample_bytes: usize,
    /// Forced re-store interval for `drop_exact`.
    pub dedupe_force_interval_s: f64,
    /// JPEG quality recorded into metadata.
    pub jpeg_quality: u32,
    /// Monitor index recorded into metadata.
    pub monitor_index: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            run_id: "run".into(),
            data_dir: PathBuf::from("data"),
            spool_dir: PathBuf::from("data/spool"),
            fps_target: 30,
            min_fps: 5,
            bitrate_kbps: 8000,
            min_bitrate_kbps: 1000,
            segment_seconds: 60,
            container: ContainerKind::AviMjpeg,
            encoder: "cpu".into(),
            ffmpeg_path: None,
            max_queue_depth: 5,
            disk_warn_gb: 200,
            disk_soft_gb: 100,
            disk_critical_gb: 50,
            dedupe_enabled: true,
            dedupe_algo: FingerprintAlgo::Blake3,
            dedupe_policy: DedupePolicy::MarkOnly,
            dedupe_sample_bytes: 0,
            dedupe_force_interval_s: 0.0,
            jpeg_quality: 90,
            monitor_index: 0,
        }
    }
}

/// Optional metadata probe (window tracker, input tracker) attached to
/// sealed segments.
pub trait MetadataProbe: Send + Sync {
    /// Snapshot the probe's current payload.
    fn snapshot(&self) -> Option<Value>;
}

enum FrameItem {
    Frame(Frame),
    Flush,
    Stop,
}

enum SegmentItem {
    Artifact(SegmentArtifact),
    Stop,
}

#[derive(Default)]
struct DropStats {
    dropped_segment: u64,
    queue_depth_max: usize,
}

/// Live pipeline handles.
pub struct PipelineHandles {
    stop: Arc<AtomicBool>,
    frame_queue: Arc<BoundedQueue<FrameItem>>,
    threads: Vec<JoinHandle<()>>,
    sealed_count: Arc<AtomicU64>,
}

impl PipelineHandles {
    /// Request a flush: the encoder closes the current segment at the
    /// next sentinel without stopping capture.
    pub fn flush(&self) {
        self.frame_queue.push(FrameItem::Flush);
    }

    /// Request a stop and join every stage.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.frame_queue.push(FrameItem::Stop);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Wait for the pipeline to drain after the source ends.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Segments sealed so far.
    pub fn sealed_count(&self) -> u64 {
        self.sealed_count.load(Ordering::SeqCst)
    }

    /// Whether a stop was requested (e.g. by critical disk pressure).
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// The capture pipeline.
pub struct CapturePipeline {
    config: CaptureConfig,
    media: Arc<MediaStore>,
    metadata: Arc<MetadataStore>,
    builder: Arc<EventBuilder>,
    window_probe: Option<Arc<dyn MetadataProbe>>,
    input_probe: Option<Arc<dyn MetadataProbe>>,
}

impl CapturePipeline {
    /// Wire a pipeline over the storage capabilities.
    pub fn new(
        config: CaptureConfig,
        media: Arc<MediaStore>,
        metadata: Arc<MetadataStore>,
        builder: Arc<EventBuilder>,
    ) -> Self {
        CapturePipeline {
            config,
            media,
            metadata,
            builder,
            window_probe: None,
            input_probe: None,
        }
    }

    /// Attach a window metadata probe.
    pub fn with_window_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.window_probe = Some(probe);
        self
    }

    /// Attach an input metadata probe.
    pub fn with_input_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.input_probe = Some(probe);
        self
    }

    /// Start the three stages against a frame source.
    pub fn start(self, source: Box<dyn FrameSource>) -> PipelineHandles {
        let stop = Arc::new(AtomicBool::new(false));
        let frame_queue = Arc::new(BoundedQueue::new(
            self.config.max_queue_depth,
            DropPolicy::DropOldest,
        ));
        let segment_queue = Arc::new(BoundedQueue::new(3, DropPolicy::Block));
        let drops = Arc::new(Mutex::new(DropStats::default()));
        let rate = Arc::new(Mutex::new(RateUpdate {
            fps_target: self.config.fps_target,
            bitrate_kbps: self.config.bitrate_kbps,
        }));
        let sealed_count = Arc::new(AtomicU64::new(0));

        let (container, ffmpeg_path) =
            resolve_container(self.config.container, self.config.ffmpeg_path.as_deref());
        if container != self.config.container {
            let _ = self.builder.journal_event(
                "capture.container_fallback",
                json!({
                    "requested": self.config.container.as_str(),
                    "used": container.as_str(),
                }),
            );
        }

        let grab = {
            let config = self.config.clone();
            let stop = Arc::clone(&stop);
            let frame_queue = Arc::clone(&frame_queue);
            let drops = Arc::clone(&drops);
            let rate = Arc::clone(&rate);
            let builder = Arc::clone(&self.builder);
            std::thread::Builder::new()
                .name("capture-grab".into())
                .spawn(move || {
                    grab_loop(config, source, stop, frame_queue, drops, rate, builder);
                })
                .unwrap_or_else(|err| panic!("spawn capture-grab: {err}"))
        };

        let encode = {
            let config = self.config.clone();
            let stop = Arc::clone(&stop);
            let frame_queue = Arc::clone(&frame_queue);
            let segment_queue = Arc::clone(&segment_queue);
            let drops = Arc::clone(&drops);
            let rate = Arc::clone(&rate);
            std::thread::Builder::new()
                .name("capture-encode".into())
                .spawn(move || {
                    encode_loop(
                        config,
                        container,
                        ffmpeg_path,
                        stop,
                        frame_queue,
                        segment_queue,
                        drops,
                        rate,
                    );
                })
                .unwrap_or_else(|err| panic!("spawn capture-encode: {err}"))
        };

        let write = {
            let config = self.config;
            let media = self.media;
            let metadata = self.metadata;
            let builder = self.builder;
            let window_probe = self.window_probe;
            let input_probe = self.input_probe;
            let segment_queue = Arc::clone(&segment_queue);
            let sealed_count = Arc::clone(&sealed_count);
            std::thread::Builder::new()
                .name("capture-write".into())
                .spawn(move || {
                    write_loop(
                        config,
                        media,
                        metadata,
                        builder,
                        window_probe,
                        input_probe,
                        segment_queue,
                        sealed_count,
                    );
                })
                .unwrap_or_else(|err| panic!("spawn capture-write: {err}"))
        };

        PipelineHandles {
            stop,
            frame_queue,
            threads: vec![grab, encode, write],
            sealed_count,
        }
    }
}

fn grab_loop(
    config: CaptureConfig,
    mut source: Box<dyn FrameSource>,
    stop: Arc<AtomicBool>,
    frame_queue: Arc<BoundedQueue<FrameItem>>,
    drops: Arc<Mutex<DropStats>>,
    rate: Arc<Mutex<RateUpdate>>,
    builder: Arc<EventBuilder>,
) {
    let controller = BackpressureController::new(
        config.fps_target,
        config.min_fps,
        config.bitrate_kbps,
        config.min_bitrate_kbps,
        config.max_queue_depth,
    );
    let mut disk = DiskPressure::new(
        config.disk_warn_gb,
        config.disk_soft_gb,
        config.disk_critical_gb,
    );
    let mut deduper = FrameDeduper::new(
        config.dedupe_enabled,
        config.dedupe_algo,
        config.dedupe_policy,
        config.dedupe_sample_bytes,
        config.dedupe_force_interval_s,
    );
    let mut last_disk_check: Option<Instant> = None;
    let mut degraded = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let fps = rate.lock().fps_target;
        let Some(frame) = source.next_frame(fps) else {
            break;
        };
        let now_mono = frame.ts_monotonic;
        let decision = deduper.decide(&frame.data, now_mono);
        if !decision.store {
            continue;
        }

        let outcome = frame_queue.push(FrameItem::Frame(frame));
        let dropped = outcome.dropped() as u64;
        let depth = frame_queue.len();
        {
            let mut stats = drops.lock();
            stats.dropped_segment += dropped;
            stats.queue_depth_max = stats.queue_depth_max.max(depth);
        }
        if dropped > 0 {
            let _ = builder.journal_event(
                "capture.drop",
                json!({
                    "dropped_frames": dropped,
                    "queue_depth": depth,
                    "policy": DropPolicy::DropOldest.as_str(),
                }),
            );
        }

        let due = last_disk_check
            .map(|at| at.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            last_disk_check = Some(Instant::now());
            let free = free_gb(&config.data_dir);
            let (level, changed) = disk.evaluate(free);
            if changed {
                let _ = builder.journal_event(
                    "disk.pressure",
                    json!({
                        "level": level.as_str(),
                        "free_gb": free,
                        "warn_gb": config.disk_warn_gb,
                        "soft_gb": config.disk_soft_gb,
                        "critical_gb": config.disk_critical_gb,
                    }),
                );
            }
            match level {
                DiskLevel::Critical => {
                    let _ = builder.journal_event(
                        "disk.critical",
                        json!({"free_gb": free, "threshold_gb": config.disk_critical_gb}),
                    );
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
                DiskLevel::Soft => {
                    let mut current = rate.lock();
                    let next = RateUpdate {
                        fps_target: (current.fps_target / 2).max(config.min_fps),
                        bitrate_kbps: (current.bitrate_kbps / 2).max(config.min_bitrate_kbps),
                    };
                    if *current != next {
                        degraded = true;
                        *current = next;
                        let _ = builder.journal_event(
                            "capture.degrade",
                            json!({
                                "fps_target": next.fps_target,
                                "bitrate_kbps": next.bitrate_kbps,
                                "level": level.as_str(),
                            }),
                        );
                    }
                }
                DiskLevel::Ok if degraded => {
                    degraded = false;
                    *rate.lock() = RateUpdate {
                        fps_target: config.fps_target,
                        bitrate_kbps: config.bitrate_kbps,
                    };
                }
                _ => {}
            }
        }

        let current = *rate.lock();
        let update = controller.adjust(frame_queue.len(), current);
        if update != current {
            tracing::info!(
                fps_prev = current.fps_target,
                fps_target = update.fps_target,
                bitrate_prev_kbps = current.bitrate_kbps,
                bitrate_target_kbps = update.bitrate_kbps,
                queue_depth = frame_queue.len(),
                "capture rate change"
            );
            *rate.lock() = update;
        }
    }
    frame_queue.push(FrameItem::Stop);
}

#[allow(clippy::too_many_arguments)]
fn encode_loop(
    config: CaptureConfig,
    container: ContainerKind,
    ffmpeg_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    frame_queue: Arc<BoundedQueue<FrameItem>>,
    segment_queue: Arc<BoundedQueue<SegmentItem>>,
    drops: Arc<Mutex<DropStats>>,
    rate: Arc<Mutex<RateUpdate>>,
) {
    let mut segment: Option<SegmentWriter> = None;
    let mut segment_seq: u64 = 0;

    let finalize_current =
        |segment: &mut Option<SegmentWriter>, segment_queue: &BoundedQueue<SegmentItem>| {
            if let Some(writer) = segment.take() {
                match writer.finalize() {
                    Ok(Some(mut artifact)) => {
                        let mut stats = drops.lock();
                        artifact.dropped_frames = stats.dropped_segment;
                        artifact.queue_depth_max = stats.queue_depth_max;
                        stats.dropped_segment = 0;
                        stats.queue_depth_max = 0;
                        drop(stats);
                        segment_queue.push(SegmentItem::Artifact(artifact));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "segment finalize failed");
                    }
                }
            }
        };

    loop {
        let Some(item) = frame_queue.pop(Duration::from_millis(200)) else {
            continue;
        };
        match item {
            FrameItem::Stop => {
                finalize_current(&mut segment, &segment_queue);
                segment_queue.push(SegmentItem::Stop);
                break;
            }
            FrameItem::Flush => {
                finalize_current(&mut segment, &segment_queue);
            }
            FrameItem::Frame(frame) => {
                if stop.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(writer) = &segment {
                    let (width, height) = writer.dimensions();
                    if width != 0 && (frame.width != width || frame.height != height) {
                        finalize_current(&mut segment, &segment_queue);
                    }
                }
                if segment.is_none() {
                    let current = *rate.lock();
                    let segment_id = prefixed_id(
                        &config.run_id,
                        "evidence.capture.segment",
                        segment_seq,
                    );
                    segment_seq += 1;
                    segment = Some(SegmentWriter::new(
                        &config.spool_dir,
                        segment_id,
                        container,
                        config.encoder.clone(),
                        current.fps_target,
                        current.bitrate_kbps,
                        ffmpeg_path.clone(),
                    ));
                }
                let writer = segment
                    .as_mut()
                    .unwrap_or_else(|| unreachable!("segment created above"));
                if let Err(err) = writer.add_frame(&frame) {
                    tracing::error!(error = %err, "frame encode failed");
                    segment = None;
                    continue;
                }
                if writer.elapsed_s(frame.ts_monotonic) >= config.segment_seconds as f64 {
                    finalize_current(&mut segment, &segment_queue);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_loop(
    config: CaptureConfig,
    media: Arc<MediaStore>,
    metadata: Arc<MetadataStore>,
    builder: Arc<EventBuilder>,
    window_probe: Option<Arc<dyn MetadataProbe>>,
    input_probe: Option<Arc<dyn MetadataProbe>>,
    segment_queue: Arc<BoundedQueue<SegmentItem>>,
    sealed_count: Arc<AtomicU64>,
) {
    loop {
        let Some(item) = segment_queue.pop(Duration::from_millis(500)) else {
            continue;
        };
        match item {
            SegmentItem::Stop => break,
            SegmentItem::Artifact(artifact) => {
                match seal_segment(
                    &config,
                    &media,
                    &metadata,
                    &builder,
                    window_probe.as_deref(),
                    input_probe.as_deref(),
                    &artifact,
                ) {
                    Ok(()) => {
                        sealed_count.fetch_add(1, Ordering::SeqCst);
                        if let Err(err) = std::fs::remove_file(&artifact.path) {
                            if err.kind() != std::io::ErrorKind::NotFound {
                                tracing::warn!(error = %err, "spool cleanup failed");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            segment_id = %artifact.segment_id,
                            error = %err,
                            "segment seal failed; spool left for recovery"
                        );
                        let failure = json!({
                            "event": "capture.partial_failure",
                            "segment_id": artifact.segment_id,
                            "error": err.to_string(),
                        });
                        let _ = builder.journal_event_at(
                            "capture.partial_failure",
                            failure.clone(),
                            &artifact.ts_start_utc,
                            None,
                        );
                        let _ = builder.ledger_entry_at(
                            "capture.partial_failure",
                            vec![artifact.segment_id.clone()],
                            vec![],
                            failure,
                            &artifact.ts_start_utc,
                        );
                    }
                }
            }
        }
    }
}

fn seal_segment(
    config: &CaptureConfig,
    media: &MediaStore,
    metadata: &MetadataStore,
    builder: &EventBuilder,
    window_probe: Option<&dyn MetadataProbe>,
    input_probe: Option<&dyn MetadataProbe>,
    artifact: &SegmentArtifact,
) -> Result<(), crate::CaptureError> {
    let span = tracing::info_span!("segment_seal", segment_id = %artifact.segment_id);
    let _guard = span.enter();

    // 1. Hash while streaming into media storage.
    let mut file = File::open(&artifact.path)?;
    let (content_hash, _bytes) = media.put_stream(&artifact.segment_id, &mut file)?;

    // 2. Metadata record.
    let fps_effective = if artifact.duration_ms > 0 {
        (artifact.frame_count as u64 * 1000) / artifact.duration_ms
    } else {
        artifact.frame_count as u64
    };
    let mut record = json!({
        "record_type": "evidence.capture.segment",
        "segment_id": artifact.segment_id,
        "ts_start_utc": artifact.ts_start_utc,
        "ts_end_utc": artifact.ts_end_utc,
        "duration_ms": artifact.duration_ms,
        "frame_count": artifact.frame_count,
        "width": artifact.width,
        "height": artifact.height,
        "container": {
            "type": artifact.container.as_str(),
            "ext": artifact.container.ext(),
            "version": 1,
        },
        "fps_target": artifact.fps_target,
        "fps_effective": fps_effective,
        "bitrate_kbps": artifact.bitrate_kbps,
        "encoder": artifact.encoder,
        "jpeg_quality": config.jpeg_quality,
        "monitor_index": config.monitor_index,
        "segment_seconds": config.segment_seconds,
        "drops": {
            "frames": artifact.dropped_frames,
            "queue_depth_max": artifact.queue_depth_max,
            "policy": DropPolicy::DropOldest.as_str(),
        },
        "encode_ms_total": artifact.encode_ms_total,
        "encode_ms_max": artifact.encode_ms_max,
        "policy_snapshot_hash": builder.policy_snapshot_hash(),
        "content_hash": content_hash,
    });
    if let Some(window) = window_probe.and_then(MetadataProbe::snapshot) {
        record["window_ref"] = window;
    }
    if let Some(input) = input_probe.and_then(MetadataProbe::snapshot) {
        record["input_ref"] = input;
    }
    let record = with_payload_hash(record)
        .map_err(|err| crate::CaptureError::Container(err.to_string()))?;

    metadata.put_new(&artifact.segment_id, &record)?;

    // 3–5. Journal event, capture ledger entry, seal ledger entry.
    builder.journal_event_at(
        "capture.segment",
        record.clone(),
        &artifact.ts_start_utc,
        Some(&artifact.segment_id),
    )?;
    builder.ledger_entry_at(
        "capture",
        vec![],
        vec![artifact.segment_id.clone()],
        record,
        &artifact.ts_start_utc,
    )?;
    builder.ledger_entry_at(
        "segment.seal",
        vec![artifact.segment_id.clone()],
        vec![],
        json!({
            "event": "segment.sealed",
            "segment_id": artifact.segment_id,
            "content_hash": content_hash,
        }),
        &artifact.ts_end_utc,
    )?;
    tracing::debug!(frames = artifact.frame_count, "segment sealed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticFrameSource;
    use autocap_store::{FsyncPolicy, JournalWriter, LedgerWriter};
    use std::path::Path;

    fn fixture(dir: &Path) -> (Arc<MediaStore>, Arc<MetadataStore>, Arc<EventBuilder>) {
        let journal = Arc::new(
            JournalWriter::open(&dir.join("journal.ndjson"), FsyncPolicy::None).unwrap(),
        );
        let ledger =
            Arc::new(LedgerWriter::open(&dir.join("ledger.ndjson"), FsyncPolicy::None).unwrap());
        let builder = Arc::new(EventBuilder::new(
            "run-c".into(),
            journal,
            ledger,
            None,
            64,
            &json!({"privacy": {}}),
        ));
        let media = Arc::new(MediaStore::open(&dir.join("media"), FsyncPolicy::None).unwrap());
        let metadata =
            Arc::new(MetadataStore::open(&dir.join("metadata"), FsyncPolicy::None).unwrap());
        (media, metadata, builder)
    }

    fn config(dir: &Path) -> CaptureConfig {
        CaptureConfig {
            run_id: "run-c".into(),
            data_dir: dir.to_path_buf(),
            spool_dir: dir.join("spool"),
            segment_seconds: 3600,
            dedupe_enabled: false,
            disk_warn_gb: 0,
            disk_soft_gb: 0,
            disk_critical_gb: 0,
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn three_frames_seal_one_segment_with_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (media, metadata, builder) = fixture(dir.path());
        let pipeline = CapturePipeline::new(
            config(dir.path()),
            Arc::clone(&media),
            Arc::clone(&metadata),
            Arc::clone(&builder),
        );
        let handles = pipeline.start(Box::new(SyntheticFrameSource::new(3, 1, 1)));
        handles.join();

        let segments = metadata.records_of_type("evidence.capture.segment").unwrap();
        assert_eq!(segments.len(), 1);
        let record = &segments[0].1;
        assert_eq!(record["frame_count"], json!(3));
        let content_hash = record["content_hash"].as_str().unwrap();
        let media_bytes = media.get(&segments[0].0).unwrap();
        assert_eq!(content_hash, autocap_spec::sha256_hex(&media_bytes));
        assert!(autocap_spec::records::payload_hash_valid(record));

        let entries =
            autocap_store::ledger::read_entries(builder.ledger_path()).unwrap();
        let capture_entries: Vec<_> =
            entries.iter().filter(|entry| entry.stage == "capture").collect();
        assert_eq!(capture_entries.len(), 1);
        let seals: Vec<_> = entries
            .iter()
            .filter(|entry| entry.stage == "segment.seal")
            .collect();
        assert_eq!(seals.len(), 1);
        assert_eq!(seals[0].payload["content_hash"], json!(content_hash));
        // Seal entry follows the capture entry in chain order.
        autocap_spec::verify_chain(&entries).unwrap();
    }

    #[test]
    fn resolution_change_starts_a_new_segment() {
        struct TwoSizes {
            frames: Vec<(u32, u32)>,
        }
        impl FrameSource for TwoSizes {
            fn next_frame(&mut self, _fps: u32) -> Option<Frame> {
                let (width, height) = self.frames.pop()?;
                Some(Frame {
                    ts_utc: autocap_spec::now_utc(),
                    ts_monotonic: Instant::now(),
                    data: format!("frame-{width}x{height}").into_bytes(),
                    width,
                    height,
                })
            }
            fn backend(&self) -> &str {
                "synthetic"
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let (media, metadata, builder) = fixture(dir.path());
        let pipeline =
            CapturePipeline::new(config(dir.path()), media, Arc::clone(&metadata), builder);
        let handles = pipeline.start(Box::new(TwoSizes {
            frames: vec![(2, 2), (2, 2), (1, 1)],
        }));
        handles.join();
        let segments = metadata.records_of_type("evidence.capture.segment").unwrap();
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn critical_disk_pressure_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (media, metadata, builder) = fixture(dir.path());
        let mut cfg = config(dir.path());
        cfg.disk_critical_gb = u64::MAX; // any host is below this threshold
        let pipeline = CapturePipeline::new(cfg, media, metadata, Arc::clone(&builder));
        let handles = pipeline.start(Box::new(SyntheticFrameSource::new(100, 1, 1)));
        handles.join();
        let events = autocap_store::journal::read_events(builder.journal_path()).unwrap();
        assert!(events.iter().any(|event| event.event_type == "disk.critical"));
    }

    #[test]
    fn flush_sentinel_closes_segment_midstream() {
        let dir = tempfile::tempdir().unwrap();
        let (media, metadata, builder) = fixture(dir.path());
        let pipeline = CapturePipeline::new(
            config(dir.path()),
            media,
            Arc::clone(&metadata),
            builder,
        );
        // Source that emits two frames, then waits for a flush, then two more.
        struct Paced {
            emitted: u32,
            gate: Arc<AtomicBool>,
        }
        impl FrameSource for Paced {
            fn next_frame(&mut self, _fps: u32) -> Option<Frame> {
                if self.emitted == 2 {
                    while !self.gate.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
                if self.emitted == 4 {
                    return None;
                }
                self.emitted += 1;
                Some(Frame {
                    ts_utc: autocap_spec::now_utc(),
                    ts_monotonic: Instant::now(),
                    data: format!("frame-{}", self.emitted).into_bytes(),
                    width: 1,
                    height: 1,
                })
            }
            fn backend(&self) -> &str {
                "synthetic"
            }
        }
        let gate = Arc::new(AtomicBool::new(false));
        let handles = pipeline.start(Box::new(Paced {
            emitted: 0,
            gate: Arc::clone(&gate),
        }));
        // Give the encoder time to drain the first two frames, then flush.
        std::thread::sleep(Duration::from_millis(100));
        handles.flush();
        std::thread::sleep(Duration::from_millis(50));
        gate.store(true, Ordering::SeqCst);
        handles.join();
        let segments = metadata.records_of_type("evidence.capture.segment").unwrap();
        assert_eq!(segments.len(), 2);
    }
}
