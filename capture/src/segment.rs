//! Segment spool writer: accumulates frames into a `.tmp` container file
//! and finalizes it into a sealed-ready artifact.

use crate::container::{open_writer, ContainerKind, ContainerWriter};
use crate::source::Frame;
use crate::CaptureError;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// A finalized (but not yet sealed) segment on the spool.
#[derive(Debug, Clone)]
pub struct SegmentArtifact {
    /// Run-scoped segment id.
    pub segment_id: String,
    /// Final spool path of the container file.
    pub path: PathBuf,
    /// Frames in the container.
    pub frame_count: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// First frame timestamp.
    pub ts_start_utc: String,
    /// Derived end timestamp (start + monotonic duration).
    pub ts_end_utc: String,
    /// Monotonic duration of the segment.
    pub duration_ms: u64,
    /// Configured fps at segment open.
    pub fps_target: u32,
    /// Configured bitrate at segment open.
    pub bitrate_kbps: u32,
    /// Encoder label.
    pub encoder: String,
    /// Container kind.
    pub container: ContainerKind,
    /// Total encode time across frames.
    pub encode_ms_total: u64,
    /// Worst single-frame encode time.
    pub encode_ms_max: u64,
    /// Frames dropped while this segment accumulated.
    pub dropped_frames: u64,
    /// Deepest frame-queue depth observed for this segment.
    pub queue_depth_max: usize,
}

/// Accumulates frames for one segment into a spool `.tmp` file.
pub struct SegmentWriter {
    segment_id: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    container: ContainerKind,
    encoder: String,
    fps_target: u32,
    bitrate_kbps: u32,
    ffmpeg_path: Option<PathBuf>,
    writer: Option<Box<dyn ContainerWriter>>,
    width: u32,
    height: u32,
    frame_count: u32,
    ts_start_utc: Option<String>,
    mono_start: Option<Instant>,
    mono_end: Option<Instant>,
    encode_ms_total: u64,
    encode_ms_max: u64,
}

impl SegmentWriter {
    /// New writer spooling under `spool_dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spool_dir: &Path,
        segment_id: String,
        container: ContainerKind,
        encoder: String,
        fps_target: u32,
        bitrate_kbps: u32,
        ffmpeg_path: Option<PathBuf>,
    ) -> Self {
        let safe = autocap_spec::encode_component(&segment_id);
        let final_path = spool_dir.join(format!("{safe}.{}", container.ext()));
        let tmp_path = spool_dir.join(format!("{safe}.{}.tmp", container.ext()));
        SegmentWriter {
            segment_id,
            tmp_path,
            final_path,
            container,
            encoder,
            fps_target,
            bitrate_kbps,
            ffmpeg_path,
            writer: None,
            width: 0,
            height: 0,
            frame_count: 0,
            ts_start_utc: None,
            mono_start: None,
            mono_end: None,
            encode_ms_total: 0,
            encode_ms_max: 0,
        }
    }

    /// Segment id this writer produces.
    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    /// Dimensions locked in by the first frame (0x0 before that).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Append one frame, opening the container lazily on the first.
    pub fn add_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if self.writer.is_none() {
            if let Some(parent) = self.tmp_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.width = frame.width;
            self.height = frame.height;
            self.writer = Some(open_writer(
                self.container,
                &self.tmp_path,
                frame.width,
                frame.height,
                self.fps_target,
                self.bitrate_kbps,
                &self.encoder,
                self.ffmpeg_path.as_deref(),
            )?);
            self.ts_start_utc = Some(frame.ts_utc.clone());
            self.mono_start = Some(frame.ts_monotonic);
        }
        let encode_start = Instant::now();
        let writer = self
            .writer
            .as_mut()
            .unwrap_or_else(|| unreachable!("writer opened above"));
        writer.add_frame(&frame.data)?;
        let encode_ms = encode_start.elapsed().as_millis() as u64;
        self.encode_ms_total += encode_ms;
        self.encode_ms_max = self.encode_ms_max.max(encode_ms);
        self.frame_count = writer.frame_count();
        self.mono_end = Some(frame.ts_monotonic);
        Ok(())
    }

    /// Monotonic seconds since the first frame (0 before any frame).
    pub fn elapsed_s(&self, now: Instant) -> f64 {
        self.mono_start
            .map(|start| now.duration_since(start).as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Close the container and move the spool file from `.tmp` to its
    /// final name. Returns `None` when no frame was ever written.
    pub fn finalize(mut self) -> Result<Option<SegmentArtifact>, CaptureError> {
        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };
        if self.frame_count == 0 {
            return Ok(None);
        }
        let duration_ms = match (self.mono_start, self.mono_end) {
            (Some(start), Some(end)) => end.duration_since(start).as_millis() as u64,
            _ => 0,
        };
        writer.close()?;
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        let ts_start = self.ts_start_utc.clone().unwrap_or_else(autocap_spec::now_utc);
        let ts_end = derive_end_ts(&ts_start, duration_ms);
        Ok(Some(SegmentArtifact {
            segment_id: self.segment_id,
            path: self.final_path,
            frame_count: self.frame_count,
            width: self.width,
            height: self.height,
            ts_start_utc: ts_start,
            ts_end_utc: ts_end,
            duration_ms,
            fps_target: self.fps_target,
            bitrate_kbps: self.bitrate_kbps,
            encoder: self.encoder,
            container: self.container,
            encode_ms_total: self.encode_ms_total,
            encode_ms_max: self.encode_ms_max,
            dropped_frames: 0,
            queue_depth_max: 0,
        }))
    }

    /// Spool `.tmp` path (left behind for recovery on failure).
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }
}

fn derive_end_ts(start_utc: &str, duration_ms: u64) -> String {
    match chrono::DateTime::parse_from_rfc3339(start_utc) {
        Ok(start) => (start + chrono::Duration::milliseconds(duration_ms as i64)).to_rfc3339(),
        Err(_) => start_utc.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticFrameSource;
    use crate::FrameSource;

    #[test]
    fn finalize_without_frames_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SegmentWriter::new(
            dir.path(),
            "run/segment/0".into(),
            ContainerKind::AviMjpeg,
            "cpu".into(),
            10,
            4000,
            None,
        );
        assert!(writer.finalize().unwrap().is_none());
    }

    #[test]
    fn frames_roll_into_final_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = SyntheticFrameSource::new(3, 4, 4);
        let mut writer = SegmentWriter::new(
            dir.path(),
            "run/segment/1".into(),
            ContainerKind::AviMjpeg,
            "cpu".into(),
            10,
            4000,
            None,
        );
        while let Some(frame) = source.next_frame(10) {
            writer.add_frame(&frame).unwrap();
        }
        let artifact = writer.finalize().unwrap().unwrap();
        assert_eq!(artifact.frame_count, 3);
        assert_eq!(artifact.width, 4);
        assert!(artifact.path.exists());
        assert!(artifact.path.extension().unwrap() == "avi");
        assert!(!artifact.path.to_string_lossy().ends_with(".tmp"));
    }

    #[test]
    fn end_timestamp_derives_from_duration() {
        let end = derive_end_ts("2026-01-01T00:00:00+00:00", 1500);
        assert!(end.starts_with("2026-01-01T00:00:01.5"));
    }
}
