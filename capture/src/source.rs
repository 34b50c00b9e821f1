//! Frame source abstraction. Platform capture backends (DXGI, X11, mss
//! equivalents) implement [`FrameSource`] behind a plugin; the pipeline
//! only consumes the trait.

use std::time::Instant;

/// One grabbed frame, already encoded as JPEG bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// UTC timestamp (RFC 3339) the frame was grabbed.
    pub ts_utc: String,
    /// Monotonic grab instant for duration math.
    pub ts_monotonic: Instant,
    /// Encoded JPEG bytes.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Produces frames at (approximately) the requested rate. Returning
/// `None` ends the stream; the pipeline then flushes and seals.
pub trait FrameSource: Send {
    /// Grab the next frame, honoring `fps_target` pacing internally.
    fn next_frame(&mut self, fps_target: u32) -> Option<Frame>;

    /// Backend name recorded into segment metadata.
    fn backend(&self) -> &str;
}

/// Deterministic in-memory source for tests and the synthetic gauntlet:
/// emits `count` frames of fixed dimensions with monotonic timestamps.
pub struct SyntheticFrameSource {
    remaining: u32,
    width: u32,
    height: u32,
    seq: u32,
}

impl SyntheticFrameSource {
    /// Source producing `count` frames of `width`x`height`.
    pub fn new(count: u32, width: u32, height: u32) -> Self {
        SyntheticFrameSource {
            remaining: count,
            width,
            height,
            seq: 0,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self, _fps_target: u32) -> Option<Frame> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.seq += 1;
        // Tiny fixed JPEG-ish payload; containers treat it as opaque bytes.
        let data = format!("jpeg-frame-{}", self.seq).into_bytes();
        Some(Frame {
            ts_utc: autocap_spec::now_utc(),
            ts_monotonic: Instant::now(),
            data,
            width: self.width,
            height: self.height,
        })
    }

    fn backend(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_is_finite() {
        let mut source = SyntheticFrameSource::new(2, 1, 1);
        assert!(source.next_frame(30).is_some());
        assert!(source.next_frame(30).is_some());
        assert!(source.next_frame(30).is_none());
    }
}
