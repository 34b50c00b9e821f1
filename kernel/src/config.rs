//! Layered configuration: defaults → user overrides → environment
//! overrides → capture preset patch → safe-mode overrides →
//! metadata-only query profile → path normalization → schema validation.

use crate::paths::{env_metadata_only, resolve_under_data_dir};
use crate::ConfigError;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

/// Configuration file locations.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Shipped defaults (`config/default.json`).
    pub default_path: PathBuf,
    /// User overrides (`user.json`); optional.
    pub user_path: PathBuf,
    /// Configuration schema (`contracts/config_schema.json`).
    pub schema_path: PathBuf,
}

/// Effective configuration with provenance hashes.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// The merged configuration.
    pub data: Value,
    /// SHA-256 of the schema file.
    pub schema_hash: String,
    /// SHA-256 of the canonical merged configuration.
    pub effective_hash: String,
}

/// Built-in defaults used when no default config file exists yet.
pub fn builtin_defaults() -> Value {
    json!({
        "runtime": {
            "idle_window_s": 45,
            "active_window_s": 3,
            "mode_enforcement": {
                "suspend_workers": true,
                "suspend_deadline_ms": 500,
                "idle_resume_budget_ms": 3000,
                "preempt_grace_ms": 0,
            },
            "budget": {
                "window_s": 60,
                "window_budget_ms": 20000,
                "per_job_max_ms": 5000,
                "max_heavy_concurrency": 1,
            },
            "allow_query_heavy": false,
            "cpu_max_utilization": 0.6,
            "ram_max_utilization": 0.8,
            "telemetry": {"enabled": true, "emit_interval_s": 5},
            "gpu": {
                "release_vram_on_active": true,
                "release_vram_deadline_ms": 250,
                "allow_during_active": false,
            },
            "fullscreen_halt": {"enabled": true},
        },
        "capture": {
            "video": {
                "backend": "auto",
                "fps_target": 30,
                "segment_seconds": 60,
                "container": "avi_mjpeg",
                "encoder": "cpu",
                "jpeg_quality": 90,
                "monitor_index": 0,
            },
            "dedupe": {
                "enabled": true,
                "hash": "blake3",
                "policy": "mark_only",
                "sample_bytes": 0,
                "force_interval_s": 0,
            },
        },
        "backpressure": {
            "max_queue_depth": 5,
            "max_fps": 30,
            "min_fps": 5,
            "max_bitrate_kbps": 8000,
            "min_bitrate_kbps": 1000,
        },
        "storage": {
            "data_dir": "data",
            "media_dir": "media",
            "blob_dir": "blobs",
            "spool_dir": "spool",
            "metadata_dir": "metadata",
            "lexical_path": "lexical.idx",
            "vector_path": "vector.idx",
            "fsync_policy": "batch",
            "encryption_required": false,
            "anchor": {"enabled": false, "path": "", "interval": 64},
            "retention": {"evidence": "off"},
            "disk_pressure": {
                "warn_free_gb": 200,
                "soft_free_gb": 100,
                "critical_free_gb": 50,
                "interval_s": 3600,
            },
        },
        "processing": {
            "idle": {
                "enabled": true,
                "auto_start": false,
                "sleep_ms": 2000,
                "estimate_ms": 2000,
                "max_concurrency_cpu": 1,
                "batch_size": 3,
                "max_items_per_run": 20,
                "sla_control": {
                    "enabled": true,
                    "retention_horizon_hours": 144,
                    "lag_warn_ratio": 0.8,
                    "cpu_step_up_on_risk": 1,
                },
                "adaptive_parallelism": {"enabled": false, "cpu_min": 1, "cpu_max": 4},
                "metadata_db_guard": {
                    "enabled": true,
                    "sample_count": 3,
                    "poll_interval_ms": 150,
                    "fail_closed": true,
                },
            },
            "watchdog": {"enabled": true, "stall_seconds": 300, "min_idle_seconds": 0},
            "crash_loop": {"window_s": 600, "max_crashes": 3},
        },
        "gpu_heavy": {"target": "local", "queue_dir": "wsl2_queue"},
        "indexing": {"dims": 384, "fast_threshold": 3, "fusion_threshold": 5},
        "retrieval": {"citations_required": true},
        "privacy": {
            "egress": {
                "token_format": "⟦ENT:{type}:{token}⟧",
                "recognizers": {},
                "scope": "default",
            },
        },
        "plugins": {
            "search_paths": ["plugins"],
            "safe_mode": false,
            "default_pack": [],
            "enabled": {},
            "locks": {"enforce": false, "lockfile": "config/plugin_locks.json"},
            "permissions": {"network_allowed_plugin_ids": ["builtin.egress.gateway"]},
        },
        "kernel": {
            "required_capabilities": [],
            "safe_mode_overrides": {"processing": {"idle": {"enabled": false}}},
        },
        "query": {"metadata_only": false},
    })
}

/// Load and merge the layered configuration.
pub fn load_config(
    paths: &ConfigPaths,
    data_dir: &Path,
    safe_mode: bool,
) -> Result<EffectiveConfig, ConfigError> {
    let defaults = if paths.default_path.exists() {
        read_json(&paths.default_path)?
    } else {
        builtin_defaults()
    };
    let mut config = defaults;
    if !safe_mode && paths.user_path.exists() {
        let user = read_json(&paths.user_path)?;
        config = deep_merge(config, user);
    }
    apply_env_overrides(&mut config);
    config = apply_capture_preset(config);
    if safe_mode {
        set_path(&mut config, "plugins.safe_mode", json!(true));
        let overrides = config
            .pointer("/kernel/safe_mode_overrides")
            .cloned()
            .unwrap_or(Value::Null);
        if overrides.is_object() {
            config = deep_merge(config, overrides);
        }
    }
    config = apply_metadata_only_profile(config);
    normalize_storage_paths(&mut config, data_dir);
    let schema = if paths.schema_path.exists() {
        read_json(&paths.schema_path)?
    } else {
        // A permissive schema keeps boot working before contracts ship.
        json!({"type": "object"})
    };
    autocap_spec::schema::validate(&schema, &config)?;
    let schema_hash = autocap_spec::sha256_canonical(&schema);
    let effective_hash = autocap_spec::sha256_canonical(&config);
    Ok(EffectiveConfig {
        data: config,
        schema_hash,
        effective_hash,
    })
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let bytes = std::fs::read(path)
        .map_err(|_| ConfigError::MissingFile(path.display().to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Deep merge: objects merge recursively, everything else replaces.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

fn apply_env_overrides(config: &mut Value) {
    if let Ok(data_dir) = std::env::var("AUTOCAPTURE_DATA_DIR") {
        set_path(config, "storage.data_dir", json!(data_dir));
    }
    if std::env::var("AUTOCAPTURE_WSL2_QUEUE_FORCE").is_ok() {
        set_path(config, "gpu_heavy.target", json!("wsl2"));
    }
}

fn apply_capture_preset(config: Value) -> Value {
    let preset_name = config
        .pointer("/capture/mode_preset")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(name) = preset_name else {
        return config;
    };
    let patch = config
        .pointer(&format!("/capture/presets/{name}"))
        .cloned();
    match patch {
        Some(patch) if patch.is_object() => deep_merge(config, patch),
        _ => config,
    }
}

fn apply_metadata_only_profile(mut config: Value) -> Value {
    let requested = env_metadata_only()
        || config
            .pointer("/query/metadata_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    if !requested {
        return config;
    }
    set_path(&mut config, "plugins.safe_mode", json!(true));
    set_path(&mut config, "retrieval.vector_enabled", json!(false));
    set_path(&mut config, "processing.idle.enabled", json!(false));
    config
}

fn normalize_storage_paths(config: &mut Value, data_dir: &Path) {
    let resolved_data_dir = config
        .pointer("/storage/data_dir")
        .and_then(Value::as_str)
        .map(|configured| {
            let path = Path::new(configured);
            if path.is_absolute() {
                path.to_path_buf()
            } else if configured == "data" {
                data_dir.to_path_buf()
            } else {
                data_dir.parent().unwrap_or(data_dir).join(configured)
            }
        })
        .unwrap_or_else(|| data_dir.to_path_buf());
    set_path(
        config,
        "storage.data_dir",
        json!(resolved_data_dir.to_string_lossy()),
    );
    for key in [
        "media_dir",
        "blob_dir",
        "spool_dir",
        "metadata_dir",
        "lexical_path",
        "vector_path",
    ] {
        let pointer = format!("/storage/{key}");
        if let Some(raw) = config.pointer(&pointer).and_then(Value::as_str) {
            let resolved = resolve_under_data_dir(raw, &resolved_data_dir);
            set_path(
                config,
                &format!("storage.{key}"),
                json!(resolved.to_string_lossy()),
            );
        }
    }
}

/// Set a dotted path, creating intermediate objects.
pub fn set_path(config: &mut Value, path: &str, value: Value) {
    let mut cursor = config;
    let segments: Vec<&str> = path.split('.').collect();
    for (idx, segment) in segments.iter().enumerate() {
        if idx == segments.len() - 1 {
            if let Some(map) = cursor.as_object_mut() {
                map.insert((*segment).to_string(), value);
            }
            return;
        }
        if !cursor.get(*segment).map(Value::is_object).unwrap_or(false) {
            if let Some(map) = cursor.as_object_mut() {
                map.insert((*segment).to_string(), Value::Object(Map::new()));
            }
        }
        cursor = match cursor.get_mut(*segment) {
            Some(next) => next,
            None => return,
        };
    }
}

/// Read a string at a dotted path.
pub fn cfg_str<'a>(config: &'a Value, path: &str, default: &'a str) -> &'a str {
    config
        .pointer(&to_pointer(path))
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Read an unsigned integer at a dotted path.
pub fn cfg_u64(config: &Value, path: &str, default: u64) -> u64 {
    config
        .pointer(&to_pointer(path))
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

/// Read a float at a dotted path.
pub fn cfg_f64(config: &Value, path: &str, default: f64) -> f64 {
    config
        .pointer(&to_pointer(path))
        .and_then(Value::as_f64)
        .unwrap_or(default)
}

/// Read a bool at a dotted path.
pub fn cfg_bool(config: &Value, path: &str, default: bool) -> bool {
    config
        .pointer(&to_pointer(path))
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

fn to_pointer(path: &str) -> String {
    format!("/{}", path.replace('.', "/"))
}
