//! Segment container writers.
//!
//! All writers receive pre-encoded JPEG frames and persist them into a
//! single container file on the spool. The AVI writer emits a standard
//! RIFF/AVI-MJPEG layout with the headers patched at close; the ZIP
//! writer stores one `frame_N.jpg` member per frame; the ffmpeg writer
//! pipes frames into an external encoder process.

use crate::CaptureError;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Supported segment containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// RIFF AVI with MJPG streams. Default; no external tooling.
    AviMjpeg,
    /// ZIP of stored JPEG members.
    Zip,
    /// MP4 via an external ffmpeg binary.
    FfmpegMp4,
}

impl ContainerKind {
    /// Parse the configuration string form; unknown values fall back to
    /// AVI-MJPEG.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "zip" => ContainerKind::Zip,
            "ffmpeg_mp4" => ContainerKind::FfmpegMp4,
            _ => ContainerKind::AviMjpeg,
        }
    }

    /// Configuration string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::AviMjpeg => "avi_mjpeg",
            ContainerKind::Zip => "zip",
            ContainerKind::FfmpegMp4 => "ffmpeg_mp4",
        }
    }

    /// File extension for the container.
    pub fn ext(&self) -> &'static str {
        match self {
            ContainerKind::AviMjpeg => "avi",
            ContainerKind::Zip => "zip",
            ContainerKind::FfmpegMp4 => "mp4",
        }
    }
}

/// Resolve a requested container against the host: `ffmpeg_mp4` needs a
/// reachable ffmpeg binary and falls back to AVI-MJPEG without one.
/// Returns `(resolved, ffmpeg_path)`.
pub fn resolve_container(
    requested: ContainerKind,
    configured_ffmpeg: Option<&Path>,
) -> (ContainerKind, Option<PathBuf>) {
    if requested != ContainerKind::FfmpegMp4 {
        return (requested, None);
    }
    let path = configured_ffmpeg
        .filter(|path| path.exists())
        .map(Path::to_path_buf)
        .or_else(|| which::which("ffmpeg").ok());
    match path {
        Some(path) => (ContainerKind::FfmpegMp4, Some(path)),
        None => (ContainerKind::AviMjpeg, None),
    }
}

/// A writer for one segment container file.
pub trait ContainerWriter: Send {
    /// Append one encoded frame.
    fn add_frame(&mut self, jpeg: &[u8]) -> Result<(), CaptureError>;
    /// Frames written so far.
    fn frame_count(&self) -> u32;
    /// Finish the container and flush it to disk.
    fn close(self: Box<Self>) -> Result<(), CaptureError>;
}

/// Open the writer for a container kind at `path`.
pub fn open_writer(
    kind: ContainerKind,
    path: &Path,
    width: u32,
    height: u32,
    fps: u32,
    bitrate_kbps: u32,
    encoder: &str,
    ffmpeg_path: Option<&Path>,
) -> Result<Box<dyn ContainerWriter>, CaptureError> {
    match kind {
        ContainerKind::AviMjpeg => Ok(Box::new(AviMjpegWriter::create(path, width, height, fps)?)),
        ContainerKind::Zip => Ok(Box::new(ZipFrameWriter::create(path)?)),
        ContainerKind::FfmpegMp4 => {
            let ffmpeg = ffmpeg_path.ok_or_else(|| {
                CaptureError::ContainerUnavailable("ffmpeg path required for ffmpeg_mp4".into())
            })?;
            Ok(Box::new(FfmpegWriter::spawn(
                ffmpeg,
                path,
                fps,
                bitrate_kbps,
                encoder,
            )?))
        }
    }
}

const AVIH_SIZE: u32 = 56;
const STRH_SIZE: u32 = 56;
const STRF_SIZE: u32 = 40;

/// RIFF/AVI writer for MJPG streams. Header sizes and frame counts are
/// patched when the file closes.
pub struct AviMjpegWriter {
    file: File,
    width: u32,
    height: u32,
    frame_count: u32,
    movi_start: u64,
    index: Vec<(u32, u32)>, // (offset from movi list body, size)
}

impl AviMjpegWriter {
    /// Create the container and write placeholder headers.
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
        let mut file = File::create(path)?;
        let fps = fps.max(1);

        // RIFF header; total size patched at close.
        file.write_all(b"RIFF")?;
        file.write_all(&0u32.to_le_bytes())?;
        file.write_all(b"AVI ")?;

        // hdrl list: avih + one strl.
        let hdrl_size = 4 + (8 + AVIH_SIZE) + (8 + 4 + (8 + STRH_SIZE) + (8 + STRF_SIZE));
        file.write_all(b"LIST")?;
        file.write_all(&hdrl_size.to_le_bytes())?;
        file.write_all(b"hdrl")?;

        file.write_all(b"avih")?;
        file.write_all(&AVIH_SIZE.to_le_bytes())?;
        let micros_per_frame = 1_000_000 / fps;
        write_u32s(
            &mut file,
            &[
                micros_per_frame, // dwMicroSecPerFrame
                0,                // dwMaxBytesPerSec
                0,                // dwPaddingGranularity
                0x10,             // dwFlags: AVIF_HASINDEX
                0,                // dwTotalFrames (patched)
                0,                // dwInitialFrames
                1,                // dwStreams
                0,                // dwSuggestedBufferSize
                width,
                height,
                0,
                0,
                0,
                0,
            ],
        )?;

        let strl_size = 4 + (8 + STRH_SIZE) + (8 + STRF_SIZE);
        file.write_all(b"LIST")?;
        file.write_all(&strl_size.to_le_bytes())?;
        file.write_all(b"strl")?;

        file.write_all(b"strh")?;
        file.write_all(&STRH_SIZE.to_le_bytes())?;
        file.write_all(b"vids")?;
        file.write_all(b"MJPG")?;
        write_u32s(
            &mut file,
            &[
                0,   // dwFlags
                0,   // wPriority + wLanguage
                0,   // dwInitialFrames
                1,   // dwScale
                fps, // dwRate
                0,   // dwStart
                0,   // dwLength (patched)
                0,   // dwSuggestedBufferSize
                u32::MAX, // dwQuality
                0,   // dwSampleSize
                0,   // rcFrame (left/top)
                0,   // rcFrame (right/bottom)
            ],
        )?;

        file.write_all(b"strf")?;
        file.write_all(&STRF_SIZE.to_le_bytes())?;
        write_u32s(
            &mut file,
            &[
                STRF_SIZE, // biSize
                width,
                height,
                0x0018_0001, // biPlanes=1, biBitCount=24
                u32::from_le_bytes(*b"MJPG"), // biCompression
                width * height * 3,
                0,
                0,
                0,
                0,
            ],
        )?;

        // movi list; size patched at close.
        file.write_all(b"LIST")?;
        file.write_all(&0u32.to_le_bytes())?;
        file.write_all(b"movi")?;
        let movi_start = file.stream_position()?;

        Ok(AviMjpegWriter {
            file,
            width,
            height,
            frame_count: 0,
            movi_start,
            index: Vec::new(),
        })
    }

    /// Frame dimensions the container was opened with.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl ContainerWriter for AviMjpegWriter {
    fn add_frame(&mut self, jpeg: &[u8]) -> Result<(), CaptureError> {
        let offset = (self.file.stream_position()? - self.movi_start) as u32;
        self.file.write_all(b"00dc")?;
        self.file.write_all(&(jpeg.len() as u32).to_le_bytes())?;
        self.file.write_all(jpeg)?;
        if jpeg.len() % 2 == 1 {
            self.file.write_all(&[0u8])?;
        }
        self.index.push((offset, jpeg.len() as u32));
        self.frame_count += 1;
        Ok(())
    }

    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    fn close(mut self: Box<Self>) -> Result<(), CaptureError> {
        let movi_end = self.file.stream_position()?;

        // idx1 chunk.
        self.file.write_all(b"idx1")?;
        self.file
            .write_all(&((self.index.len() as u32) * 16).to_le_bytes())?;
        for (offset, size) in &self.index {
            self.file.write_all(b"00dc")?;
            self.file.write_all(&0x10u32.to_le_bytes())?; // AVIIF_KEYFRAME
            self.file.write_all(&offset.to_le_bytes())?;
            self.file.write_all(&size.to_le_bytes())?;
        }
        let file_end = self.file.stream_position()?;

        // Patch RIFF size.
        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&((file_end - 8) as u32).to_le_bytes())?;
        // Patch dwTotalFrames (avih offset: 12 + 8 + 8 header bytes + 16).
        self.file.seek(SeekFrom::Start(12 + 12 + 8 + 16))?;
        self.file.write_all(&self.frame_count.to_le_bytes())?;
        // Patch strh dwLength: strh data starts after hdrl preamble.
        let strh_data = 12 + 12 + 8 + AVIH_SIZE as u64 + 12 + 8;
        self.file.seek(SeekFrom::Start(strh_data + 8 + 24))?;
        self.file.write_all(&self.frame_count.to_le_bytes())?;
        // Patch movi list size.
        self.file.seek(SeekFrom::Start(self.movi_start - 8))?;
        self.file
            .write_all(&((movi_end - self.movi_start + 4) as u32).to_le_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// ZIP container storing one `frame_N.jpg` member per frame.
pub struct ZipFrameWriter {
    writer: zip::ZipWriter<File>,
    frame_count: u32,
}

impl ZipFrameWriter {
    /// Create the zip container.
    pub fn create(path: &Path) -> Result<Self, CaptureError> {
        Ok(ZipFrameWriter {
            writer: zip::ZipWriter::new(File::create(path)?),
            frame_count: 0,
        })
    }
}

impl ContainerWriter for ZipFrameWriter {
    fn add_frame(&mut self, jpeg: &[u8]) -> Result<(), CaptureError> {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default());
        self.writer
            .start_file(format!("frame_{}.jpg", self.frame_count), options)?;
        self.writer.write_all(jpeg)?;
        self.frame_count += 1;
        Ok(())
    }

    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    fn close(mut self: Box<Self>) -> Result<(), CaptureError> {
        let file = self.writer.finish()?;
        file.sync_data()?;
        Ok(())
    }
}

/// External ffmpeg encoder fed MJPEG frames over stdin.
pub struct FfmpegWriter {
    child: Child,
    frame_count: u32,
}

impl FfmpegWriter {
    /// Spawn ffmpeg targeting `path`.
    pub fn spawn(
        ffmpeg: &Path,
        path: &Path,
        fps: u32,
        bitrate_kbps: u32,
        encoder: &str,
    ) -> Result<Self, CaptureError> {
        let codec = if encoder == "nvenc" { "h264_nvenc" } else { "libx264" };
        let child = Command::new(ffmpeg)
            .arg("-y")
            .args(["-f", "mjpeg"])
            .args(["-r", &fps.max(1).to_string()])
            .args(["-i", "pipe:0"])
            .args(["-c:v", codec])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-b:v", &format!("{}k", bitrate_kbps.max(1))])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(FfmpegWriter {
            child,
            frame_count: 0,
        })
    }
}

impl ContainerWriter for FfmpegWriter {
    fn add_frame(&mut self, jpeg: &[u8]) -> Result<(), CaptureError> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| CaptureError::Container("ffmpeg stdin unavailable".into()))?;
        stdin.write_all(jpeg)?;
        self.frame_count += 1;
        Ok(())
    }

    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    fn close(mut self: Box<Self>) -> Result<(), CaptureError> {
        drop(self.child.stdin.take());
        let output = self.child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let head: String = stderr.chars().take(200).collect();
            return Err(CaptureError::Container(format!("ffmpeg failed: {head}")));
        }
        Ok(())
    }
}

fn write_u32s(file: &mut File, values: &[u32]) -> std::io::Result<()> {
    for value in values {
        file.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avi_writer_produces_riff_with_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.avi");
        let mut writer = Box::new(AviMjpegWriter::create(&path, 2, 2, 10).unwrap());
        writer.add_frame(b"frame-one").unwrap();
        writer.add_frame(b"frame-two!").unwrap();
        assert_eq!(writer.frame_count(), 2);
        (writer as Box<dyn ContainerWriter>).close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        // dwTotalFrames patched at the avih offset.
        let total = u32::from_le_bytes(bytes[48..52].try_into().unwrap());
        assert_eq!(total, 2);
        // idx1 chunk present with two entries.
        let idx = bytes.windows(4).position(|w| w == b"idx1").unwrap();
        let idx_len = u32::from_le_bytes(bytes[idx + 4..idx + 8].try_into().unwrap());
        assert_eq!(idx_len, 32);
    }

    #[test]
    fn zip_writer_stores_one_member_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.zip");
        let mut writer = Box::new(ZipFrameWriter::create(&path).unwrap());
        writer.add_frame(b"a").unwrap();
        writer.add_frame(b"b").unwrap();
        (writer as Box<dyn ContainerWriter>).close().unwrap();
        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "frame_0.jpg");
    }

    #[test]
    fn container_resolution_falls_back_without_ffmpeg() {
        let (resolved, path) = resolve_container(
            ContainerKind::FfmpegMp4,
            Some(Path::new("/nonexistent/ffmpeg-binary")),
        );
        if path.is_none() {
            assert_eq!(resolved, ContainerKind::AviMjpeg);
        }
        let (kind, _) = resolve_container(ContainerKind::Zip, None);
        assert_eq!(kind, ContainerKind::Zip);
    }
}
