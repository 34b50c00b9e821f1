//! Doctor checks: boot-adjacent invariants an operator can inspect.

use crate::boot::Kernel;
use crate::config::{cfg_bool, cfg_str};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// One doctor check result.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub ok: bool,
    /// Human-readable detail.
    pub detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        ok,
        detail: detail.into(),
    }
}

/// Run the full check list.
pub fn run_doctor(kernel: &Kernel) -> Vec<DoctorCheck> {
    let config = kernel.config();
    let mut checks = Vec::new();

    // Data dir exists and is writable.
    let data_dir = kernel.data_dir();
    let writable = data_dir.is_dir()
        && std::fs::write(data_dir.join(".doctor_probe"), b"ok")
            .map(|_| {
                let _ = std::fs::remove_file(data_dir.join(".doctor_probe"));
            })
            .is_ok();
    checks.push(check(
        "data_dir_writable",
        writable,
        if writable { "ok" } else { "not writable" },
    ));

    // Safe mode admits only the default pack.
    let (safe_mode, _) = kernel.safe_mode();
    if safe_mode {
        let default_pack: Vec<String> = config
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
        let stray: Vec<&String> = kernel
            .load_report()
            .loaded
            .iter()
            .filter(|plugin| !default_pack.contains(plugin))
            .collect();
        checks.push(check(
            "safe_mode_default_pack",
            stray.is_empty(),
            if stray.is_empty() {
                "only default pack loaded".to_string()
            } else {
                format!("non-default plugins loaded: {stray:?}")
            },
        ));
    }

    // Required capabilities present.
    let required: Vec<String> = config
        .pointer("/kernel/required_capabilities")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let capabilities = kernel.capabilities();
    let missing: Vec<&String> = required
        .iter()
        .filter(|name| !capabilities.has(name))
        .collect();
    checks.push(check(
        "required_capabilities",
        missing.is_empty(),
        if missing.is_empty() {
            "ok".to_string()
        } else {
            format!("missing: {missing:?}")
        },
    ));

    // Capture backend supported.
    let backend = cfg_str(config, "capture.video.backend", "auto");
    let supported = matches!(backend, "auto" | "synthetic" | "platform");
    checks.push(check(
        "capture_backend",
        supported,
        if supported {
            "ok".to_string()
        } else {
            format!("unsupported: {backend}")
        },
    ));

    // Anchor store must live outside data_dir.
    let anchor_path = cfg_str(config, "storage.anchor.path", "");
    if cfg_bool(config, "storage.anchor.enabled", false) && !anchor_path.is_empty() {
        let inside = Path::new(anchor_path).starts_with(data_dir);
        checks.push(check(
            "anchor_separate_domain",
            !inside,
            if inside {
                "anchor path within data_dir"
            } else {
                "anchor store separate from data_dir"
            },
        ));
    }

    // Contract lock, when present.
    let lock_path = kernel.paths().in_root("contracts/lock.json");
    if lock_path.exists() {
        let ok = autocap_registry::verify_contract_lock(&lock_path, &kernel.paths().root).is_ok();
        checks.push(check(
            "contracts_lock",
            ok,
            if ok { "ok" } else { "mismatch" },
        ));
    }

    // Ledger chain verifies.
    let chain_ok = kernel
        .ledger()
        .verify()
        .map(|result| result.is_ok())
        .unwrap_or(false);
    checks.push(check(
        "ledger_chain",
        chain_ok,
        if chain_ok { "ok" } else { "chain broken" },
    ));

    // Network allowlist must be the egress gateway singleton.
    let allowlist: Vec<String> = config
        .pointer("/plugins/permissions/network_allowed_plugin_ids")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let singleton = allowlist == vec![autocap_registry::capability::EGRESS_GATEWAY_PLUGIN.to_string()];
    checks.push(check(
        "network_allowlist",
        singleton,
        if singleton {
            "ok"
        } else {
            "network allowlist must contain only builtin.egress.gateway"
        },
    ));

    // Registered network grants must match the allowlist too.
    let granted = capabilities.network_allowed_plugins();
    let grants_ok = granted.is_empty()
        || granted == vec![autocap_registry::capability::EGRESS_GATEWAY_PLUGIN.to_string()];
    checks.push(check(
        "network_grants",
        grants_ok,
        if grants_ok {
            "ok".to_string()
        } else {
            format!("unexpected network grants: {granted:?}")
        },
    ));

    // Audit log is appendable.
    let audit_ok = kernel
        .audit_log()
        .append("doctor.probe", "kernel.doctor", "ok", Value::Null)
        .is_ok();
    checks.push(check(
        "audit_log",
        audit_ok,
        if audit_ok { "ok" } else { "append failed" },
    ));

    checks
}
