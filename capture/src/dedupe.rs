//! Frame fingerprinting and dedupe policy.
//!
//! `mark_only` annotates duplicates in metadata but never drops a frame;
//! `drop_exact` may skip storing an exact duplicate inside the dedupe
//! window, with `force_interval_s` guaranteeing a periodic re-store.

use std::time::Instant;

/// Fingerprint algorithm for dedupe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgo {
    /// BLAKE3 (fast default).
    Blake3,
    /// SHA-256.
    Sha256,
}

impl FingerprintAlgo {
    /// Parse the configuration string form.
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "sha256" => FingerprintAlgo::Sha256,
            _ => FingerprintAlgo::Blake3,
        }
    }

    /// Configuration string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintAlgo::Blake3 => "blake3",
            FingerprintAlgo::Sha256 => "sha256",
        }
    }
}

/// What to do with detected duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupePolicy {
    /// Mark duplicates in metadata; never drop.
    MarkOnly,
    /// Drop exact duplicates within the window.
    DropExact,
}

/// Decision for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeDecision {
    /// Frame fingerprint (hex).
    pub fingerprint: String,
    /// Whether the frame matches the previous stored fingerprint.
    pub duplicate: bool,
    /// Whether the frame should be persisted.
    pub store: bool,
    /// Whether the store was forced by the re-store interval.
    pub forced: bool,
}

/// Stateful deduper tracking the last stored fingerprint.
pub struct FrameDeduper {
    enabled: bool,
    algo: FingerprintAlgo,
    policy: DedupePolicy,
    sample_bytes: usize,
    force_interval_s: f64,
    last_fingerprint: Option<String>,
    last_stored_at: Option<Instant>,
}

impl FrameDeduper {
    /// New deduper. `sample_bytes` of zero hashes the whole frame.
    pub fn new(
        enabled: bool,
        algo: FingerprintAlgo,
        policy: DedupePolicy,
        sample_bytes: usize,
        force_interval_s: f64,
    ) -> Self {
        FrameDeduper {
            enabled,
            algo,
            policy,
            sample_bytes,
            force_interval_s,
            last_fingerprint: None,
            last_stored_at: None,
        }
    }

    /// Fingerprint frame bytes under the configured algorithm.
    pub fn fingerprint(&self, data: &[u8]) -> String {
        let slice = if self.sample_bytes > 0 && data.len() > self.sample_bytes {
            &data[..self.sample_bytes]
        } else {
            data
        };
        match self.algo {
            FingerprintAlgo::Blake3 => autocap_spec::blake3_hex(slice),
            FingerprintAlgo::Sha256 => autocap_spec::sha256_hex(slice),
        }
    }

    /// Decide whether to store a frame observed at `now`.
    pub fn decide(&mut self, data: &[u8], now: Instant) -> DedupeDecision {
        let fingerprint = self.fingerprint(data);
        if !self.enabled {
            self.mark_stored(&fingerprint, now);
            return DedupeDecision {
                fingerprint,
                duplicate: false,
                store: true,
                forced: false,
            };
        }
        let duplicate = self.last_fingerprint.as_deref() == Some(fingerprint.as_str());
        if !duplicate {
            self.mark_stored(&fingerprint, now);
            return DedupeDecision {
                fingerprint,
                duplicate: false,
                store: true,
                forced: false,
            };
        }
        let forced = self.force_interval_s > 0.0
            && self
                .last_stored_at
                .map(|at| now.duration_since(at).as_secs_f64() >= self.force_interval_s)
                .unwrap_or(false);
        let store = match self.policy {
            DedupePolicy::MarkOnly => true,
            DedupePolicy::DropExact => forced,
        };
        if store {
            self.mark_stored(&fingerprint, now);
        }
        DedupeDecision {
            fingerprint,
            duplicate: true,
            store,
            forced,
        }
    }

    /// Active policy.
    pub fn policy(&self) -> DedupePolicy {
        self.policy
    }

    /// Whether dedupe is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn mark_stored(&mut self, fingerprint: &str, now: Instant) {
        self.last_fingerprint = Some(fingerprint.to_string());
        self.last_stored_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mark_only_never_drops() {
        let mut deduper = FrameDeduper::new(
            true,
            FingerprintAlgo::Blake3,
            DedupePolicy::MarkOnly,
            0,
            0.0,
        );
        let now = Instant::now();
        let first = deduper.decide(b"same", now);
        assert!(first.store && !first.duplicate);
        let second = deduper.decide(b"same", now);
        assert!(second.store && second.duplicate);
    }

    #[test]
    fn drop_exact_skips_duplicates_until_forced() {
        let mut deduper = FrameDeduper::new(
            true,
            FingerprintAlgo::Sha256,
            DedupePolicy::DropExact,
            0,
            1.0,
        );
        let start = Instant::now();
        assert!(deduper.decide(b"same", start).store);
        let dup = deduper.decide(b"same", start);
        assert!(dup.duplicate && !dup.store);
        let later = start + Duration::from_secs(2);
        let forced = deduper.decide(b"same", later);
        assert!(forced.duplicate && forced.store && forced.forced);
    }

    #[test]
    fn sampling_bounds_hash_input() {
        let deduper = FrameDeduper::new(
            true,
            FingerprintAlgo::Blake3,
            DedupePolicy::MarkOnly,
            4,
            0.0,
        );
        let a = deduper.fingerprint(b"abcdXXXX");
        let b = deduper.fingerprint(b"abcdYYYY");
        assert_eq!(a, b);
    }
}
