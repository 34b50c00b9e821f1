//! Filesystem-mediated WSL2 routing queue for GPU-heavy jobs.
//!
//! Requests, responses, inflight tokens, and a job-key dedupe index live
//! under `queue_dir`; the native side drains `requests/` and writes
//! `responses/`. Responses are archived under `done/`, never deleted.

use autocap_spec::{prefixed_id, sha256_canonical, sha256_text};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct Wsl2QueueConfig {
    /// Root of the outbox directory tree.
    pub queue_dir: PathBuf,
    /// Protocol version stamped into every request.
    pub protocol_version: u32,
    /// Maximum request files pending before backpressure.
    pub max_pending: usize,
    /// Maximum inflight tokens before backpressure.
    pub max_inflight: usize,
    /// Token time-to-live before reconciliation reclaims it.
    pub token_ttl_s: f64,
}

impl Wsl2QueueConfig {
    /// Defaults for a queue rooted at `queue_dir`.
    pub fn new(queue_dir: PathBuf) -> Self {
        Wsl2QueueConfig {
            queue_dir,
            protocol_version: 1,
            max_pending: 256,
            max_inflight: 1,
            token_ttl_s: 300.0,
        }
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct Wsl2DispatchResult {
    /// Whether the job is queued (or coalesced onto a pending one).
    pub ok: bool,
    /// Whether the caller may fall back to local execution.
    pub allow_fallback: bool,
    /// Request file path when queued.
    pub path: Option<PathBuf>,
    /// Machine-readable error, when not ok.
    pub error: Option<String>,
    /// `queued|dedupe_pending|missing_wsl|protocol_mismatch|token_backpressure|backpressure`.
    pub reason: String,
}

impl Wsl2DispatchResult {
    fn fail(reason: &str, error: &str, allow_fallback: bool) -> Self {
        Wsl2DispatchResult {
            ok: false,
            allow_fallback,
            path: None,
            error: Some(error.to_string()),
            reason: reason.to_string(),
        }
    }
}

/// The routing queue.
pub struct Wsl2Queue {
    config: Wsl2QueueConfig,
    seq: Mutex<u64>,
}

impl Wsl2Queue {
    /// New queue over the configured directory.
    pub fn new(config: Wsl2QueueConfig) -> Self {
        Wsl2Queue {
            config,
            seq: Mutex::new(0),
        }
    }

    /// Queue root.
    pub fn queue_dir(&self) -> &Path {
        &self.config.queue_dir
    }

    fn requests_dir(&self) -> PathBuf {
        self.config.queue_dir.join("requests")
    }

    fn responses_dir(&self) -> PathBuf {
        self.config.queue_dir.join("responses")
    }

    fn done_dir(&self) -> PathBuf {
        self.config.queue_dir.join("done")
    }

    fn tokens_dir(&self) -> PathBuf {
        self.config.queue_dir.join("tokens")
    }

    fn index_dir(&self) -> PathBuf {
        self.config.queue_dir.join("request_index")
    }

    /// Whether WSL2 routing can work on this host. The
    /// `AUTOCAPTURE_WSL2_QUEUE_FORCE` environment variable enables the
    /// queue off-Windows so round-trip mechanics stay testable.
    pub fn available(&self) -> bool {
        let force = std::env::var("AUTOCAPTURE_WSL2_QUEUE_FORCE")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if force {
            return true;
        }
        cfg!(windows) && which::which("wsl").is_ok()
    }

    fn protocol_ok(&self) -> bool {
        let path = self.config.queue_dir.join("protocol.json");
        if !path.exists() {
            return true;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            return false;
        };
        let Ok(payload) = serde_json::from_slice::<Value>(&bytes) else {
            return false;
        };
        payload
            .get("protocol_version")
            .and_then(Value::as_u64)
            .map(|version| version == self.config.protocol_version as u64)
            .unwrap_or(false)
    }

    /// Dispatch a job. Identical `(job_name, run_id, payload)` pending
    /// requests are coalesced via the job-key index.
    pub fn dispatch(
        &self,
        job_name: &str,
        payload: &Value,
        run_id: &str,
        allow_fallback: bool,
    ) -> Wsl2DispatchResult {
        if !self.available() {
            return Wsl2DispatchResult::fail("missing_wsl", "wsl2_unavailable", allow_fallback);
        }
        if !self.protocol_ok() {
            return Wsl2DispatchResult::fail(
                "protocol_mismatch",
                "protocol_mismatch",
                allow_fallback,
            );
        }
        for dir in [
            self.requests_dir(),
            self.responses_dir(),
            self.done_dir(),
            self.tokens_dir(),
            self.index_dir(),
        ] {
            if std::fs::create_dir_all(&dir).is_err() {
                return Wsl2DispatchResult::fail("io", "queue_dir_unwritable", allow_fallback);
            }
        }

        let payload_hash = sha256_canonical(payload);
        let job_key = sha256_text(&format!(
            "{job_name}|{run_id}|{payload_hash}|{}",
            self.config.protocol_version
        ));
        let index_path = self.index_dir().join(format!("{job_key}.json"));

        let seq = {
            let mut seq = self.seq.lock();
            self.reconcile_tokens();
            if index_path.exists() {
                let existing = std::fs::read(&index_path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
                    .and_then(|idx| {
                        idx.get("request_path")
                            .and_then(Value::as_str)
                            .map(PathBuf::from)
                    });
                if let Some(existing_path) = existing.filter(|path| path.exists()) {
                    return Wsl2DispatchResult {
                        ok: true,
                        allow_fallback,
                        path: Some(existing_path),
                        error: None,
                        reason: "dedupe_pending".to_string(),
                    };
                }
                let _ = std::fs::remove_file(&index_path);
            }
            let inflight = count_files(&self.tokens_dir(), "token");
            if inflight >= self.config.max_inflight {
                return Wsl2DispatchResult::fail(
                    "token_backpressure",
                    "wsl2_token_backpressure",
                    allow_fallback,
                );
            }
            *seq += 1;
            *seq
        };

        let pending = count_files(&self.requests_dir(), "json");
        if pending >= self.config.max_pending {
            return Wsl2DispatchResult::fail("backpressure", "wsl2_backpressure", allow_fallback);
        }

        let job_id = prefixed_id(run_id, "wsl2", seq);
        let safe_id = autocap_spec::encode_component(&job_id);
        let token_id = format!("{safe_id}.token");
        let ts_utc = autocap_spec::now_utc();
        let request_path = self.requests_dir().join(format!("{safe_id}.json"));
        let record = json!({
            "schema_version": self.config.protocol_version,
            "job_id": job_id,
            "job_key": job_key,
            "payload_hash": payload_hash,
            "token_id": token_id,
            "job_name": job_name,
            "run_id": run_id,
            "ts_utc": ts_utc,
            "payload": payload,
        });
        let token_payload = json!({
            "schema_version": self.config.protocol_version,
            "job_id": job_id,
            "job_key": job_key,
            "token_id": token_id,
            "ts_utc": ts_utc,
        });
        let index_payload = json!({
            "schema_version": self.config.protocol_version,
            "job_id": job_id,
            "job_key": job_key,
            "token_id": token_id,
            "request_path": request_path.to_string_lossy(),
            "ts_utc": ts_utc,
        });

        let written = write_json_atomic(&self.tokens_dir().join(&token_id), &token_payload)
            .and_then(|_| write_json_atomic(&request_path, &record))
            .and_then(|_| write_json_atomic(&index_path, &index_payload));
        if written.is_err() {
            let _ = std::fs::remove_file(self.tokens_dir().join(&token_id));
            let _ = std::fs::remove_file(&request_path);
            let _ = std::fs::remove_file(&index_path);
            return Wsl2DispatchResult::fail("io", "queue_write_failed", allow_fallback);
        }
        Wsl2DispatchResult {
            ok: true,
            allow_fallback,
            path: Some(request_path),
            error: None,
            reason: "queued".to_string(),
        }
    }

    /// Ingest worker responses in filename order; each response releases
    /// its token and archives under `done/`.
    pub fn poll_responses(&self, max_items: usize) -> Vec<Value> {
        let responses_dir = self.responses_dir();
        let _ = std::fs::create_dir_all(&responses_dir);
        let _ = std::fs::create_dir_all(self.done_dir());
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&responses_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        let mut out = Vec::new();
        for path in paths.into_iter().take(max_items) {
            let payload = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
                .unwrap_or_else(|| {
                    json!({"error": "invalid_json", "path": path.to_string_lossy()})
                });
            self.release_for_response(&payload);
            if let Some(name) = path.file_name() {
                let _ = std::fs::rename(&path, self.done_dir().join(name));
            }
            out.push(payload);
        }
        out
    }

    /// Wait for a response to `job_id`, polling every `poll` up to
    /// `timeout`. Returns `None` on timeout.
    pub fn await_response(&self, job_id: &str, timeout: Duration, poll: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let target = autocap_spec::encode_component(job_id);
        loop {
            for payload in self.poll_responses(100) {
                let candidate = payload
                    .get("job_id")
                    .and_then(Value::as_str)
                    .map(autocap_spec::encode_component);
                if candidate.as_deref() == Some(target.as_str()) {
                    return Some(payload);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(poll.max(Duration::from_millis(10)));
        }
    }

    fn reconcile_tokens(&self) {
        let Ok(entries) = std::fs::read_dir(self.tokens_dir()) else {
            return;
        };
        let now = chrono::Utc::now();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("token") {
                continue;
            }
            let payload = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
            let Some(payload) = payload else {
                let _ = std::fs::remove_file(&path);
                continue;
            };
            let issued = payload
                .get("ts_utc")
                .and_then(Value::as_str)
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok());
            let expired = issued
                .map(|ts| (now - ts.with_timezone(&chrono::Utc)).num_seconds() as f64
                    > self.config.token_ttl_s)
                .unwrap_or(false);
            if expired {
                let _ = std::fs::remove_file(&path);
                if let Some(job_key) = payload.get("job_key").and_then(Value::as_str) {
                    let _ = std::fs::remove_file(self.index_dir().join(format!("{job_key}.json")));
                }
            }
        }
    }

    fn release_for_response(&self, payload: &Value) {
        let token_id = payload
            .get("token_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                payload.get("job_id").and_then(Value::as_str).map(|job_id| {
                    format!("{}.token", autocap_spec::encode_component(job_id))
                })
            });
        let mut job_key = payload
            .get("job_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(token_id) = token_id {
            let token_path = self.tokens_dir().join(&token_id);
            if job_key.is_none() && token_path.exists() {
                job_key = std::fs::read(&token_path)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
                    .and_then(|token| {
                        token
                            .get("job_key")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
            }
            let _ = std::fs::remove_file(token_path);
        }
        if let Some(job_key) = job_key {
            let _ = std::fs::remove_file(self.index_dir().join(format!("{job_key}.json")));
        }
    }
}

fn count_files(dir: &Path, ext: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .path()
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e == ext)
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

fn write_json_atomic(path: &Path, payload: &Value) -> std::io::Result<()> {
    let tmp = path.with_extension("writing");
    std::fs::write(&tmp, serde_json::to_vec(payload)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forced_queue(dir: &Path, max_inflight: usize) -> Wsl2Queue {
        std::env::set_var("AUTOCAPTURE_WSL2_QUEUE_FORCE", "1");
        let mut config = Wsl2QueueConfig::new(dir.to_path_buf());
        config.max_inflight = max_inflight;
        Wsl2Queue::new(config)
    }

    #[test]
    fn dispatch_queues_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = forced_queue(dir.path(), 4);
        let payload = json!({"task": "ocr", "segment": "run/segment/0"});
        let first = queue.dispatch("idle.extract", &payload, "run", false);
        assert!(first.ok);
        assert_eq!(first.reason, "queued");
        let second = queue.dispatch("idle.extract", &payload, "run", false);
        assert!(second.ok);
        assert_eq!(second.reason, "dedupe_pending");
        assert_eq!(second.path, first.path);
    }

    #[test]
    fn token_backpressure_applies_at_inflight_cap() {
        let dir = tempfile::tempdir().unwrap();
        let queue = forced_queue(dir.path(), 1);
        assert!(queue.dispatch("a", &json!({"n": 1}), "run", false).ok);
        let blocked = queue.dispatch("b", &json!({"n": 2}), "run", true);
        assert!(!blocked.ok);
        assert_eq!(blocked.reason, "token_backpressure");
        assert!(blocked.allow_fallback);
    }

    #[test]
    fn protocol_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let queue = forced_queue(dir.path(), 4);
        std::fs::write(
            dir.path().join("protocol.json"),
            serde_json::to_vec(&json!({"protocol_version": 99})).unwrap(),
        )
        .unwrap();
        let result = queue.dispatch("a", &json!({}), "run", false);
        assert!(!result.ok);
        assert_eq!(result.reason, "protocol_mismatch");
    }

    #[test]
    fn response_roundtrip_releases_token_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let queue = forced_queue(dir.path(), 1);
        let dispatch = queue.dispatch("a", &json!({"n": 1}), "run", false);
        assert!(dispatch.ok);
        // Simulate the worker: read the request, write a response.
        let request: Value =
            serde_json::from_slice(&std::fs::read(dispatch.path.unwrap()).unwrap()).unwrap();
        let response = json!({
            "job_id": request["job_id"],
            "job_key": request["job_key"],
            "token_id": request["token_id"],
            "result": {"ok": true},
        });
        let response_path = dir.path().join("responses").join("0001.json");
        std::fs::write(&response_path, serde_json::to_vec(&response).unwrap()).unwrap();

        let found = queue.await_response(
            request["job_id"].as_str().unwrap(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        );
        assert!(found.is_some());
        assert!(!response_path.exists());
        assert!(dir.path().join("done").join("0001.json").exists());
        // Token released: a new job may dispatch.
        assert!(queue.dispatch("b", &json!({"n": 2}), "run", false).ok);
    }
}
