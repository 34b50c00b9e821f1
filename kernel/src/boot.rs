//! Boot and shutdown orchestration.
//!
//! Boot order: resolve paths → load layered config → crash detection and
//! crash-loop safe mode → instance lock → contract lock → stores and
//! vault → event builder → plugin registry → run manifest + run state →
//! recovery pass → conductor.

use crate::config::{cfg_bool, cfg_f64, cfg_str, cfg_u64, load_config, ConfigPaths, EffectiveConfig};
use crate::doctor::{run_doctor, DoctorCheck};
use crate::paths::{env_safe_mode, KernelPaths};
use crate::{ConfigError, KERNEL_VERSION};
use autocap_index::{build_answer, Answer, HashEmbedder, LexicalIndex, Reranker, TieredRetriever, VectorIndex};
use autocap_registry::{
    verify_contract_lock, Capability, CapabilityTable, NetworkGuard, Registry, RegistryConfig,
};
use autocap_runtime::{
    ActivityTracker, Conductor, ConductorDeps, Governor, GovernorConfig, NullGpuController,
    Scheduler, SchedulerConfig, Wsl2Queue, Wsl2QueueConfig,
};
use autocap_store::{
    run_recovery, AnchorWriter, AuditLog, BlobStore, CrashLoopDetector, EventBuilder, FsyncPolicy,
    InstanceLock, JournalWriter, LedgerWriter, MediaStore, MetadataStore, RunState, RunStateFile,
    TelemetryStore,
};
use autocap_vault::{BlobCipher, KeyRing};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Boot options.
#[derive(Debug, Clone, Default)]
pub struct KernelOptions {
    /// Force safe mode regardless of environment.
    pub safe_mode: bool,
    /// Start the conductor's background thread when configured.
    pub start_conductor: bool,
    /// Override the resolved paths (tests point this at a temp dir).
    pub paths: Option<KernelPaths>,
}

/// A booted kernel.
pub struct Kernel {
    paths: KernelPaths,
    effective: EffectiveConfig,
    safe_mode: bool,
    safe_mode_reason: Option<String>,
    run_id: String,
    started_at: String,
    _instance_lock: InstanceLock,
    journal: Arc<JournalWriter>,
    ledger: Arc<LedgerWriter>,
    media: Arc<MediaStore>,
    metadata: Arc<MetadataStore>,
    #[allow(dead_code)]
    blobs: Arc<BlobStore>,
    telemetry: Arc<TelemetryStore>,
    audit: Arc<AuditLog>,
    builder: Arc<EventBuilder>,
    capabilities: Arc<CapabilityTable>,
    load_report: autocap_registry::LoadReport,
    vault: Mutex<KeyRing>,
    conductor: Option<Arc<Conductor>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").field("run_id", &self.run_id).finish_non_exhaustive()
    }
}

impl Kernel {
    /// Boot with an empty plugin registry.
    pub fn boot(options: KernelOptions) -> Result<Kernel, ConfigError> {
        Kernel::boot_with_registry(options, &Registry::new())
    }

    /// Boot with caller-registered plugin factories.
    pub fn boot_with_registry(
        options: KernelOptions,
        registry: &Registry,
    ) -> Result<Kernel, ConfigError> {
        let paths = options.paths.clone().unwrap_or_else(KernelPaths::resolve);
        let mut safe_mode = options.safe_mode || env_safe_mode();
        let mut safe_mode_reason = safe_mode.then(|| "requested".to_string());
        let data_dir = paths.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        // The instance lock comes first: a run state left `running` by a
        // live process is not a crash.
        let instance_lock = InstanceLock::acquire(&data_dir).map_err(|err| match err {
            autocap_store::StoreError::InstanceLocked { path } => {
                ConfigError::InstanceLocked(path.display().to_string())
            }
            other => ConfigError::Store(other),
        })?;

        let previous = RunStateFile::load(&data_dir);
        let crashed_run = previous
            .as_ref()
            .filter(|state| state.state == RunState::Running)
            .map(|state| state.run_id.clone());
        let mut detector = CrashLoopDetector::load(&data_dir);
        let now = autocap_spec::now_utc();
        if crashed_run.is_some() {
            detector.record_crash(&data_dir, &now)?;
        }

        let config_paths = ConfigPaths {
            default_path: paths.in_root("config/default.json"),
            user_path: paths.config_dir.join("user.json"),
            schema_path: paths.in_root("contracts/config_schema.json"),
        };
        let mut effective = load_config(&config_paths, &data_dir, safe_mode)?;
        let window_s = cfg_u64(&effective.data, "processing.crash_loop.window_s", 600) as i64;
        let max_crashes = cfg_u64(&effective.data, "processing.crash_loop.max_crashes", 3) as usize;
        if !safe_mode && detector.is_crash_loop(&now, window_s, max_crashes) {
            tracing::warn!("crash loop detected; forcing safe mode");
            safe_mode = true;
            safe_mode_reason = Some("crash_loop".to_string());
            effective = load_config(&config_paths, &data_dir, true)?;
        }
        let config = effective.data.clone();

        // Contract lock before any plugin loading.
        let contract_lock_path = paths.in_root("contracts/lock.json");
        let enforce_locks = cfg_bool(&config, "plugins.locks.enforce", false);
        if contract_lock_path.exists() || enforce_locks {
            verify_contract_lock(&contract_lock_path, &paths.root)?;
        }

        let run_id = autocap_spec::RunId::generate().to_string();
        let policy = FsyncPolicy::parse(cfg_str(&config, "storage.fsync_policy", "batch"));
        let journal = Arc::new(JournalWriter::open(&data_dir.join("journal.ndjson"), policy)?);
        let ledger = Arc::new(LedgerWriter::open(&data_dir.join("ledger.ndjson"), policy)?);
        let anchor = open_anchor(&config)?;
        let media = Arc::new(MediaStore::open(
            Path::new(cfg_str(&config, "storage.media_dir", "data/media")),
            policy,
        )?);
        let metadata = Arc::new(MetadataStore::open(
            Path::new(cfg_str(&config, "storage.metadata_dir", "data/metadata")),
            policy,
        )?);
        let mut vault = KeyRing::load(&data_dir.join("vault"))?;
        let (blob_key_id, blob_key) = vault.active_key("blob_store")?;
        let blobs = Arc::new(BlobStore::open(
            Path::new(cfg_str(&config, "storage.blob_dir", "data/blobs")),
            policy,
            BlobCipher::new(blob_key_id, &blob_key),
        )?);
        let telemetry = Arc::new(TelemetryStore::default());
        let audit = Arc::new(AuditLog::open(&data_dir.join("audit.ndjson"))?);

        let policy_snapshot = json!({
            "privacy": config.get("privacy").cloned().unwrap_or(Value::Null),
            "capture": config.get("capture").cloned().unwrap_or(Value::Null),
        });
        let anchor_interval = cfg_u64(&config, "storage.anchor.interval", 64);
        let builder = Arc::new(EventBuilder::new(
            run_id.clone(),
            Arc::clone(&journal),
            Arc::clone(&ledger),
            anchor.clone(),
            anchor_interval,
            &policy_snapshot,
        ));

        if let Some(previous_run) = &crashed_run {
            builder.ledger_entry(
                "system",
                vec![],
                vec![],
                json!({
                    "event": "system.crash_detected",
                    "previous_run_id": previous_run,
                    "previous_ledger_head": builder.ledger_head(),
                }),
            )?;
            if safe_mode_reason.as_deref() == Some("crash_loop") {
                audit.append(
                    "kernel.safe_mode",
                    "kernel.boot",
                    "ok",
                    json!({"reason": "crash_loop"}),
                )?;
            }
        }

        // Capability table: built-ins first, then plugins.
        let guard = Arc::new(NetworkGuard::new());
        let capabilities = Arc::new(CapabilityTable::new(
            Arc::clone(&guard),
            Some(Arc::clone(&audit)),
        ));
        capabilities.register("journal.writer", Capability::Journal(Arc::clone(&journal)), false, None);
        capabilities.register("ledger.writer", Capability::Ledger(Arc::clone(&ledger)), false, None);
        if let Some(anchor) = &anchor {
            capabilities.register("anchor.writer", Capability::Anchor(Arc::clone(anchor)), false, None);
        }
        capabilities.register("storage.media", Capability::Media(Arc::clone(&media)), false, None);
        capabilities.register("storage.metadata", Capability::Metadata(Arc::clone(&metadata)), false, None);
        capabilities.register("storage.blobs", Capability::Blob(Arc::clone(&blobs)), false, None);
        capabilities.register("telemetry.store", Capability::Telemetry(Arc::clone(&telemetry)), false, None);
        capabilities.register("event.builder", Capability::EventBuilder(Arc::clone(&builder)), false, None);

        let registry_config = registry_config(&config, &paths, safe_mode);
        let load_report = registry.load(&registry_config, capabilities.as_ref())?;
        for (plugin_id, reason) in &load_report.failed {
            tracing::warn!(plugin_id = %plugin_id, reason = %reason, "plugin failed to load");
        }

        record_run_manifest(&config, &effective, &builder, &metadata, &load_report, &media)?;
        let started_at = autocap_spec::now_utc();
        builder.ledger_entry(
            "system",
            vec![],
            vec![],
            json!({
                "event": "system.start",
                "run_id": run_id,
                "kernel_version": KERNEL_VERSION,
                "safe_mode": safe_mode,
                "safe_mode_reason": safe_mode_reason,
                "config": {
                    "schema_hash": effective.schema_hash,
                    "effective_hash": effective.effective_hash,
                },
            }),
        )?;
        RunStateFile {
            run_id: run_id.clone(),
            state: RunState::Running,
            ts_utc: started_at.clone(),
            started_at: Some(started_at.clone()),
            stopped_at: None,
            ledger_head: builder.ledger_head(),
        }
        .store(&data_dir)?;

        // Recovery after the registry so capabilities are available.
        let roots = vec![
            data_dir.clone(),
            PathBuf::from(cfg_str(&config, "storage.spool_dir", "data/spool")),
            PathBuf::from(cfg_str(&config, "storage.media_dir", "data/media")),
            PathBuf::from(cfg_str(&config, "storage.blob_dir", "data/blobs")),
        ];
        run_recovery(&data_dir, &roots, &metadata, &media, &builder)?;

        let conductor = build_conductor(
            &config,
            &data_dir,
            Arc::clone(&builder),
            Arc::clone(&telemetry),
            Arc::clone(&audit),
            Arc::clone(&metadata),
            Arc::clone(&media),
        );
        if options.start_conductor && cfg_bool(&config, "processing.idle.auto_start", false) {
            conductor.start();
        }

        tracing::info!(run_id = %run_id, safe_mode, "kernel booted");
        Ok(Kernel {
            paths,
            effective,
            safe_mode,
            safe_mode_reason,
            run_id,
            started_at,
            _instance_lock: instance_lock,
            journal,
            ledger,
            media,
            metadata,
            blobs,
            telemetry,
            audit,
            builder,
            capabilities,
            load_report,
            vault: Mutex::new(vault),
            conductor: Some(conductor),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &Value {
        &self.effective.data
    }

    /// Whether the kernel is in safe mode, and why.
    pub fn safe_mode(&self) -> (bool, Option<&str>) {
        (self.safe_mode, self.safe_mode_reason.as_deref())
    }

    /// Run id of this boot.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Data directory.
    pub fn data_dir(&self) -> &Path {
        &self.paths.data_dir
    }

    /// Event builder.
    pub fn builder(&self) -> Arc<EventBuilder> {
        Arc::clone(&self.builder)
    }

    /// Telemetry store.
    pub fn telemetry(&self) -> Arc<TelemetryStore> {
        Arc::clone(&self.telemetry)
    }

    /// Capability table.
    pub fn capabilities(&self) -> Arc<CapabilityTable> {
        Arc::clone(&self.capabilities)
    }

    /// Metadata store.
    pub fn metadata(&self) -> Arc<MetadataStore> {
        Arc::clone(&self.metadata)
    }

    /// Media store.
    pub fn media(&self) -> Arc<MediaStore> {
        Arc::clone(&self.media)
    }

    /// Plugin load report from boot.
    pub fn load_report(&self) -> &autocap_registry::LoadReport {
        &self.load_report
    }

    /// Conductor handle.
    pub fn conductor(&self) -> Option<Arc<Conductor>> {
        self.conductor.clone()
    }

    /// Start the capture pipeline against a frame source (platform
    /// sources come from plugins; tests use the synthetic source).
    pub fn start_capture(
        &self,
        source: Box<dyn autocap_capture::FrameSource>,
    ) -> autocap_capture::PipelineHandles {
        let config = self.config();
        let capture_config = autocap_capture::CaptureConfig {
            run_id: self.run_id.clone(),
            data_dir: self.paths.data_dir.clone(),
            spool_dir: PathBuf::from(cfg_str(config, "storage.spool_dir", "data/spool")),
            fps_target: cfg_u64(config, "capture.video.fps_target", 30) as u32,
            min_fps: cfg_u64(config, "backpressure.min_fps", 5) as u32,
            bitrate_kbps: cfg_u64(config, "backpressure.max_bitrate_kbps", 8000) as u32,
            min_bitrate_kbps: cfg_u64(config, "backpressure.min_bitrate_kbps", 1000) as u32,
            segment_seconds: cfg_u64(config, "capture.video.segment_seconds", 60),
            container: autocap_capture::ContainerKind::parse(cfg_str(
                config,
                "capture.video.container",
                "avi_mjpeg",
            )),
            encoder: cfg_str(config, "capture.video.encoder", "cpu").to_string(),
            ffmpeg_path: None,
            max_queue_depth: cfg_u64(config, "backpressure.max_queue_depth", 5) as usize,
            disk_warn_gb: cfg_u64(config, "storage.disk_pressure.warn_free_gb", 200),
            disk_soft_gb: cfg_u64(config, "storage.disk_pressure.soft_free_gb", 100),
            disk_critical_gb: cfg_u64(config, "storage.disk_pressure.critical_free_gb", 50),
            dedupe_enabled: cfg_bool(config, "capture.dedupe.enabled", true),
            dedupe_algo: autocap_capture::dedupe::FingerprintAlgo::parse(cfg_str(
                config,
                "capture.dedupe.hash",
                "blake3",
            )),
            dedupe_policy: if cfg_str(config, "capture.dedupe.policy", "mark_only") == "drop_exact"
            {
                autocap_capture::DedupePolicy::DropExact
            } else {
                autocap_capture::DedupePolicy::MarkOnly
            },
            dedupe_sample_bytes: cfg_u64(config, "capture.dedupe.sample_bytes", 0) as usize,
            dedupe_force_interval_s: cfg_f64(config, "capture.dedupe.force_interval_s", 0.0),
            jpeg_quality: cfg_u64(config, "capture.video.jpeg_quality", 90) as u32,
            monitor_index: cfg_u64(config, "capture.video.monitor_index", 0) as u32,
        };
        autocap_capture::CapturePipeline::new(
            capture_config,
            Arc::clone(&self.media),
            Arc::clone(&self.metadata),
            Arc::clone(&self.builder),
        )
        .start(source)
    }

    /// Build the egress sanitizer over the entity-token purpose key.
    pub fn sanitizer(&self) -> Result<autocap_egress::EgressSanitizer, ConfigError> {
        let (_key_id, key) = self.vault.lock().active_key("entity_tokens")?;
        let hasher = autocap_egress::EntityHasher::new(*key.expose());
        let config = self.config();
        let recognizers = autocap_egress::RecognizerConfig {
            custom_patterns: config
                .pointer("/privacy/egress/recognizers/custom_regex")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            ..autocap_egress::RecognizerConfig::default()
        };
        let token_format = cfg_str(
            config,
            "privacy.egress.token_format",
            autocap_egress::sanitizer::DEFAULT_TOKEN_FORMAT,
        )
        .to_string();
        Ok(autocap_egress::EgressSanitizer::new(hasher, recognizers).with_token_format(token_format))
    }

    /// Run the idle batch drain loop and persist its landscape manifest.
    pub fn run_batch(&self, require_idle: bool, max_loops: u32) -> autocap_runtime::BatchOutcome {
        let config = self.config();
        let governor = Governor::new(GovernorConfig {
            idle_window_s: cfg_f64(config, "runtime.idle_window_s", 45.0),
            suspend_workers: cfg_bool(config, "runtime.mode_enforcement.suspend_workers", true),
            window_s: cfg_u64(config, "runtime.budget.window_s", 60),
            window_budget_ms: cfg_u64(config, "runtime.budget.window_budget_ms", 20_000),
            per_job_max_ms: cfg_u64(config, "runtime.budget.per_job_max_ms", 5_000),
            ..GovernorConfig::default()
        });
        let activity = ActivityTracker::new(cfg_f64(config, "runtime.active_window_s", 3.0));
        let signals_fn = move || autocap_runtime::Signals {
            idle_seconds: activity.idle_seconds(),
            user_active: activity.user_active(),
            ..autocap_runtime::Signals::default()
        };
        let contracts_hash = {
            let path = self.paths.in_root("contracts/lock.json");
            path.exists()
                .then(|| autocap_spec::sha256_file(&path).ok())
                .flatten()
        };
        let plugin_locks_hash = {
            let path = self
                .paths
                .in_root(cfg_str(config, "plugins.locks.lockfile", "config/plugin_locks.json"));
            path.exists()
                .then(|| autocap_spec::sha256_file(&path).ok())
                .flatten()
        };
        let batch_config = autocap_runtime::BatchConfig {
            max_loops,
            sleep_ms: 0,
            require_idle,
            cpu_limit: cfg_f64(config, "runtime.cpu_max_utilization", 0.6),
            ram_limit: cfg_f64(config, "runtime.ram_max_utilization", 0.8),
            adaptive: autocap_runtime::batch::AdaptiveConfig {
                enabled: cfg_bool(config, "processing.idle.adaptive_parallelism.enabled", false),
                cpu_min: cfg_u64(config, "processing.idle.adaptive_parallelism.cpu_min", 1) as u32,
                cpu_max: cfg_u64(config, "processing.idle.adaptive_parallelism.cpu_max", 4) as u32,
                ..autocap_runtime::batch::AdaptiveConfig::default()
            },
            sla: autocap_runtime::batch::SlaConfig {
                enabled: cfg_bool(config, "processing.idle.sla_control.enabled", true),
                retention_horizon_hours: autocap_runtime::conductor::parse_retention_hours(
                    cfg_str(config, "storage.retention.evidence", "off"),
                )
                .unwrap_or(cfg_f64(
                    config,
                    "processing.idle.sla_control.retention_horizon_hours",
                    144.0,
                )),
                lag_warn_ratio: cfg_f64(config, "processing.idle.sla_control.lag_warn_ratio", 0.8),
                cpu_step_up_on_risk: cfg_u64(
                    config,
                    "processing.idle.sla_control.cpu_step_up_on_risk",
                    1,
                ) as u32,
            },
            guard: autocap_runtime::batch::GuardConfig {
                enabled: cfg_bool(config, "processing.idle.metadata_db_guard.enabled", true),
                metadata_path: PathBuf::from(cfg_str(
                    config,
                    "storage.metadata_dir",
                    "data/metadata",
                )),
                sample_count: cfg_u64(config, "processing.idle.metadata_db_guard.sample_count", 3)
                    as u32,
                poll_interval_ms: cfg_u64(
                    config,
                    "processing.idle.metadata_db_guard.poll_interval_ms",
                    150,
                ),
                fail_closed: cfg_bool(config, "processing.idle.metadata_db_guard.fail_closed", true),
            },
            locks: autocap_runtime::batch::LockHashes {
                effective_config_sha256: self.effective.effective_hash.clone(),
                contracts_lock_sha256: contracts_hash,
                plugin_locks_sha256: plugin_locks_hash,
            },
            run_id: self.run_id.clone(),
        };
        let mut tuning = autocap_runtime::IdleTuning {
            max_concurrency_cpu: cfg_u64(config, "processing.idle.max_concurrency_cpu", 1) as u32,
            batch_size: cfg_u64(config, "processing.idle.batch_size", 3) as u32,
            max_items_per_run: cfg_u64(config, "processing.idle.max_items_per_run", 20) as u32,
        };
        let processor = DrainedBacklog {
            metadata: Arc::clone(&self.metadata),
        };
        autocap_runtime::run_processing_batch(
            &governor,
            &signals_fn,
            &processor,
            &mut tuning,
            &batch_config,
            Some(self.metadata.as_ref()),
        )
    }

    /// Rotate a vault purpose key; records the rotation in the ledger.
    pub fn rotate_key(&self, purpose: &str) -> Result<u32, ConfigError> {
        let (key_id, _key) = self.vault.lock().rotate(purpose)?;
        self.builder.ledger_entry(
            "system",
            vec![],
            vec![],
            json!({"event": "key.rotated", "purpose": purpose, "key_id": key_id}),
        )?;
        Ok(key_id)
    }

    /// Run the doctor checks.
    pub fn doctor(&self) -> Vec<DoctorCheck> {
        run_doctor(self)
    }

    /// Answer a query through the tiered retriever.
    pub fn query(&self, text: &str) -> Result<(Answer, Vec<Value>), ConfigError> {
        let config = self.config();
        let lexical = LexicalIndex::open(Path::new(cfg_str(
            config,
            "storage.lexical_path",
            "data/lexical.idx",
        )))
        .map_err(|err| ConfigError::MissingFile(err.to_string()))?;
        let dims = cfg_u64(config, "indexing.dims", 384) as usize;
        let embedder = Arc::new(HashEmbedder::discover(
            self.paths.bundle_dir.as_deref(),
            dims,
        ));
        let vector = VectorIndex::open(
            Path::new(cfg_str(config, "storage.vector_path", "data/vector.idx")),
            embedder,
        )
        .map_err(|err| ConfigError::MissingFile(err.to_string()))?;
        let retriever = TieredRetriever::new(
            lexical,
            vector,
            Reranker::new(),
            cfg_u64(config, "indexing.fast_threshold", 3) as usize,
            cfg_u64(config, "indexing.fusion_threshold", 5) as usize,
        );
        let result = retriever.retrieve(text);
        let citations_required = cfg_bool(config, "retrieval.citations_required", true);
        let answer = build_answer(&result.results, citations_required);
        Ok((answer, result.trace))
    }

    /// Clean shutdown: final manifest, `system.stop`, run state.
    pub fn shutdown(mut self) -> Result<(), ConfigError> {
        if let Some(conductor) = self.conductor.take() {
            conductor.stop();
        }
        let ts = autocap_spec::now_utc();
        let summary = self.summarize_journal()?;
        let stop_hash = self.builder.ledger_entry(
            "system",
            vec![],
            vec![],
            json!({
                "event": "system.stop",
                "run_id": self.run_id,
                "started_at": self.started_at,
                "summary": summary,
                "previous_ledger_head": self.builder.ledger_head(),
            }),
        )?;
        RunStateFile {
            run_id: self.run_id.clone(),
            state: RunState::Stopped,
            ts_utc: ts.clone(),
            started_at: Some(self.started_at.clone()),
            stopped_at: Some(ts),
            ledger_head: Some(stop_hash),
        }
        .store(&self.paths.data_dir)?;
        tracing::info!(run_id = %self.run_id, "kernel stopped");
        Ok(())
    }

    fn summarize_journal(&self) -> Result<Value, ConfigError> {
        let mut events = 0u64;
        let mut drops = 0u64;
        let mut errors = 0u64;
        for event in self.journal.read_all()? {
            if event.run_id != self.run_id {
                continue;
            }
            events += 1;
            if event.event_type == "capture.drop" {
                drops += event
                    .payload
                    .get("dropped_frames")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
            }
            if event.event_type.contains("error") || event.event_type.contains("failure") {
                errors += 1;
            }
        }
        Ok(json!({"events": events, "drops": drops, "errors": errors}))
    }

    pub(crate) fn paths(&self) -> &KernelPaths {
        &self.paths
    }

    pub(crate) fn ledger(&self) -> Arc<LedgerWriter> {
        Arc::clone(&self.ledger)
    }

    pub(crate) fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }
}

/// Backlog view for the built-in drain: evidence segments that have no
/// derived text yet. Extraction itself lives behind plugins; without one
/// loaded, a step completes immediately and reports the backlog size.
struct DrainedBacklog {
    metadata: Arc<MetadataStore>,
}

impl autocap_runtime::IdleProcessor for DrainedBacklog {
    fn process_step(
        &self,
        _should_abort: &dyn Fn() -> bool,
        _budget_ms: u64,
    ) -> autocap_runtime::StepResult {
        let pending = self.pending_records();
        autocap_runtime::StepResult {
            done: true,
            consumed_ms: 1,
            stats: Some(json!({
                "records_completed": 0,
                "pending_records": pending,
            })),
        }
    }

    fn pending_records(&self) -> u64 {
        let segments = self
            .metadata
            .records_of_type("evidence.capture.segment")
            .map(|records| records.len() as u64)
            .unwrap_or(0);
        let derived = self
            .metadata
            .records_of_type("derived.text.ocr")
            .map(|records| records.len() as u64)
            .unwrap_or(0);
        segments.saturating_sub(derived)
    }
}

fn open_anchor(config: &Value) -> Result<Option<Arc<AnchorWriter>>, ConfigError> {
    if !cfg_bool(config, "storage.anchor.enabled", false) {
        return Ok(None);
    }
    let path = cfg_str(config, "storage.anchor.path", "");
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(AnchorWriter::open(Path::new(path))?)))
}

fn registry_config(config: &Value, paths: &KernelPaths, safe_mode: bool) -> RegistryConfig {
    let search_paths = config
        .pointer("/plugins/search_paths")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|rel| paths.in_root(rel))
                .collect()
        })
        .unwrap_or_else(|| vec![paths.in_root("plugins")]);
    let default_pack = config
        .pointer("/plugins/default_pack")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let enabled: BTreeMap<String, bool> = config
        .pointer("/plugins/enabled")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| value.as_bool().map(|flag| (key.clone(), flag)))
                .collect()
        })
        .unwrap_or_default();
    let allowlist = config
        .pointer("/plugins/allowlist")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
    RegistryConfig {
        search_paths,
        lockfile_path: paths.in_root(cfg_str(
            config,
            "plugins.locks.lockfile",
            "config/plugin_locks.json",
        )),
        enforce_locks: cfg_bool(config, "plugins.locks.enforce", false),
        safe_mode,
        default_pack,
        allowlist,
        enabled,
        kernel_version: KERNEL_VERSION.to_string(),
        schema_versions: vec![1],
        settings: config.clone(),
    }
}

fn record_run_manifest(
    config: &Value,
    effective: &EffectiveConfig,
    builder: &EventBuilder,
    metadata: &MetadataStore,
    load_report: &autocap_registry::LoadReport,
    media: &MediaStore,
) -> Result<(), ConfigError> {
    let record_id = autocap_spec::prefixed_id(builder.run_id(), "system.run_manifest", 0);
    let manifest = autocap_spec::with_payload_hash(json!({
        "record_type": "system.run_manifest",
        "run_id": builder.run_id(),
        "ts_utc": autocap_spec::now_utc(),
        "kernel_version": KERNEL_VERSION,
        "config": {
            "schema_hash": effective.schema_hash,
            "effective_hash": effective.effective_hash,
        },
        "policy_snapshot_hash": builder.policy_snapshot_hash(),
        "plugins": load_report.loaded.clone(),
        "plugins_failed": load_report.failed.clone(),
        "storage": {
            "data_dir": cfg_str(config, "storage.data_dir", "data"),
            "media_dir": cfg_str(config, "storage.media_dir", "data/media"),
            "fsync_policy": cfg_str(config, "storage.fsync_policy", "batch"),
            "encryption_required": cfg_bool(config, "storage.encryption_required", false),
            "counts": {
                "metadata": metadata.count().unwrap_or(0),
                "media": media.count().unwrap_or(0),
            },
        },
    }))
    .unwrap_or(Value::Null);
    match metadata.put_new(&record_id, &manifest) {
        Ok(()) => {}
        Err(autocap_store::StoreError::AlreadyExists(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    builder.ledger_entry(
        "system",
        vec![],
        vec![record_id.clone()],
        json!({"event": "storage.manifest", "record_id": record_id}),
    )?;
    Ok(())
}

fn build_conductor(
    config: &Value,
    data_dir: &Path,
    builder: Arc<EventBuilder>,
    telemetry: Arc<TelemetryStore>,
    audit: Arc<AuditLog>,
    metadata: Arc<MetadataStore>,
    media: Arc<MediaStore>,
) -> Arc<Conductor> {
    let governor = Arc::new(Governor::new(GovernorConfig {
        idle_window_s: cfg_f64(config, "runtime.idle_window_s", 45.0),
        suspend_workers: cfg_bool(config, "runtime.mode_enforcement.suspend_workers", true),
        allow_query_heavy: cfg_bool(config, "runtime.allow_query_heavy", false),
        cpu_max_utilization: cfg_f64(config, "runtime.cpu_max_utilization", 0.6),
        ram_max_utilization: cfg_f64(config, "runtime.ram_max_utilization", 0.8),
        window_s: cfg_u64(config, "runtime.budget.window_s", 60),
        window_budget_ms: cfg_u64(config, "runtime.budget.window_budget_ms", 20_000),
        per_job_max_ms: cfg_u64(config, "runtime.budget.per_job_max_ms", 5_000),
        max_heavy_concurrency: cfg_u64(config, "runtime.budget.max_heavy_concurrency", 1) as usize,
        preempt_grace_ms: cfg_u64(config, "runtime.mode_enforcement.preempt_grace_ms", 0),
        suspend_deadline_ms: cfg_u64(config, "runtime.mode_enforcement.suspend_deadline_ms", 500),
    }));
    let route_wsl2 = cfg_str(config, "gpu_heavy.target", "local") == "wsl2";
    let mut scheduler = Scheduler::new(
        Arc::clone(&governor),
        SchedulerConfig {
            route_gpu_to_wsl2: route_wsl2,
            gpu_allow_during_active: cfg_bool(config, "runtime.gpu.allow_during_active", false),
        },
    );
    if route_wsl2 {
        let queue_dir = data_dir.join(cfg_str(config, "gpu_heavy.queue_dir", "wsl2_queue"));
        scheduler = scheduler.with_wsl2(Arc::new(Wsl2Queue::new(Wsl2QueueConfig::new(queue_dir))));
    }
    let conductor_config = autocap_runtime::conductor::ConductorConfig {
        sleep_ms: cfg_u64(config, "processing.idle.sleep_ms", 2000),
        idle_enabled: cfg_bool(config, "processing.idle.enabled", true),
        idle_estimate_ms: cfg_u64(config, "processing.idle.estimate_ms", 2000),
        research_enabled: cfg_bool(config, "research.enabled", true),
        research_interval_s: cfg_f64(config, "research.interval_s", 1800.0),
        pressure_interval_s: cfg_f64(config, "storage.disk_pressure.interval_s", 3600.0),
        retention_interval_s: cfg_f64(config, "storage.retention.interval_s", 3600.0),
        retention_spec: cfg_str(config, "storage.retention.evidence", "off").to_string(),
        watchdog_enabled: cfg_bool(config, "processing.watchdog.enabled", true),
        stall_seconds: cfg_f64(config, "processing.watchdog.stall_seconds", 300.0),
        min_idle_seconds: cfg_f64(config, "processing.watchdog.min_idle_seconds", 0.0),
        telemetry_enabled: cfg_bool(config, "runtime.telemetry.enabled", true),
        telemetry_interval_s: cfg_f64(config, "runtime.telemetry.emit_interval_s", 5.0),
        release_vram_on_active: cfg_bool(config, "runtime.gpu.release_vram_on_active", true),
        release_vram_deadline_ms: cfg_u64(config, "runtime.gpu.release_vram_deadline_ms", 250),
        suspend_deadline_ms: cfg_u64(config, "runtime.mode_enforcement.suspend_deadline_ms", 500),
        resume_budget_ms: cfg_u64(config, "runtime.mode_enforcement.idle_resume_budget_ms", 3000),
        fixture_override: cfg_bool(config, "runtime.mode_enforcement.fixture_override", false),
        active_window_s: cfg_f64(config, "runtime.active_window_s", 3.0),
        gpu_guard: Default::default(),
        gpu_allow_during_active: cfg_bool(config, "runtime.gpu.allow_during_active", false),
    };
    Conductor::new(
        conductor_config,
        ConductorDeps {
            governor,
            scheduler,
            builder,
            telemetry,
            audit,
            activity: Arc::new(ActivityTracker::new(cfg_f64(config, "runtime.active_window_s", 3.0))),
            resources: Arc::new(autocap_runtime::resources::ResourceSampler::new()),
            gpu: Arc::new(NullGpuController),
            fullscreen_probe: None,
            window_record: None,
            idle: None,
            metadata,
            media,
            data_dir: data_dir.to_path_buf(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path) -> KernelOptions {
        KernelOptions {
            safe_mode: false,
            start_conductor: false,
            paths: Some(KernelPaths {
                root: dir.to_path_buf(),
                config_dir: dir.join("config_user"),
                data_dir: dir.join("data"),
                bundle_dir: None,
            }),
        }
    }

    #[test]
    fn boot_writes_run_state_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::boot(options(dir.path())).unwrap();
        let run_id = kernel.run_id().to_string();
        let state = RunStateFile::load(kernel.data_dir()).unwrap();
        assert_eq!(state.state, RunState::Running);
        assert_eq!(state.run_id, run_id);
        let manifest_id = autocap_spec::prefixed_id(&run_id, "system.run_manifest", 0);
        assert!(kernel.metadata().get(&manifest_id).unwrap().is_some());
        kernel.shutdown().unwrap();
        let state = RunStateFile::load(&dir.path().join("data")).unwrap();
        assert_eq!(state.state, RunState::Stopped);
    }

    #[test]
    fn second_boot_with_held_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::boot(options(dir.path())).unwrap();
        let err = Kernel::boot(options(dir.path())).unwrap_err();
        assert!(matches!(err, ConfigError::InstanceLocked(_)));
        kernel.shutdown().unwrap();
    }

    #[test]
    fn dirty_run_state_records_crash() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kernel = Kernel::boot(options(dir.path())).unwrap();
            // Drop without shutdown: run state stays `running`.
            drop(kernel);
        }
        let kernel = Kernel::boot(options(dir.path())).unwrap();
        let entries = autocap_store::ledger::read_entries(
            &dir.path().join("data/ledger.ndjson"),
        )
        .unwrap();
        assert!(entries.iter().any(|entry| {
            entry.payload.get("event").and_then(Value::as_str) == Some("system.crash_detected")
        }));
        kernel.shutdown().unwrap();
    }

    #[test]
    fn crash_loop_forces_safe_mode() {
        let dir = tempfile::tempdir().unwrap();
        // Three dirty boots inside the window.
        for _ in 0..3 {
            let kernel = Kernel::boot(options(dir.path())).unwrap();
            drop(kernel);
        }
        let kernel = Kernel::boot(options(dir.path())).unwrap();
        let (safe_mode, reason) = kernel.safe_mode();
        assert!(safe_mode);
        assert_eq!(reason, Some("crash_loop"));
        assert!(!cfg_bool(kernel.config(), "processing.idle.enabled", true));
        kernel.shutdown().unwrap();
    }
}
