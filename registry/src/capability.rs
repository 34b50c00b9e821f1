//! Capability table: string-keyed externally (the plugin contract),
//! typed internally through a tagged enum, with a process-wide network
//! deny guard and per-invocation audit rows.

use crate::RegistryError;
use autocap_store::{
    AnchorWriter, AuditLog, BlobStore, EventBuilder, JournalWriter, LedgerWriter, MediaStore,
    MetadataStore, TelemetryStore,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Derived-artifact extractor (OCR, VLM, UI layout) behind a plugin.
pub trait Extractor: Send + Sync {
    /// Extract derived content from an evidence record.
    fn extract(&self, record: &Value) -> Result<Value, RegistryError>;
    /// Extractor kind label, e.g. `ocr`.
    fn kind(&self) -> &str;
}

/// Generic capability surface for plugin-provided capabilities.
pub trait PluginCapability: Send + Sync {
    /// Invoke a method with a JSON payload.
    fn invoke(&self, method: &str, payload: &Value) -> Result<Value, RegistryError>;
}

/// Typed capability dispatch. The string table is the external contract;
/// dispatch inside the kernel is through these variants.
#[derive(Clone)]
pub enum Capability {
    /// Journal writer.
    Journal(Arc<JournalWriter>),
    /// Ledger writer.
    Ledger(Arc<LedgerWriter>),
    /// Anchor writer.
    Anchor(Arc<AnchorWriter>),
    /// Media store.
    Media(Arc<MediaStore>),
    /// Metadata store.
    Metadata(Arc<MetadataStore>),
    /// Encrypted blob store.
    Blob(Arc<BlobStore>),
    /// Telemetry snapshot store.
    Telemetry(Arc<TelemetryStore>),
    /// Event builder.
    EventBuilder(Arc<EventBuilder>),
    /// Derived-artifact extractor.
    Extractor(Arc<dyn Extractor>),
    /// Plugin-defined capability.
    Plugin(Arc<dyn PluginCapability>),
}

impl Capability {
    fn kind(&self) -> &'static str {
        match self {
            Capability::Journal(_) => "journal",
            Capability::Ledger(_) => "ledger",
            Capability::Anchor(_) => "anchor",
            Capability::Media(_) => "media",
            Capability::Metadata(_) => "metadata",
            Capability::Blob(_) => "blob",
            Capability::Telemetry(_) => "telemetry",
            Capability::EventBuilder(_) => "event_builder",
            Capability::Extractor(_) => "extractor",
            Capability::Plugin(_) => "plugin",
        }
    }
}

struct CapabilityEntry {
    capability: Capability,
    network_allowed: bool,
    plugin_id: Option<String>,
}

/// Process-wide network deny flag. Initialized denied at boot; only the
/// egress gateway capability may be allowed through.
pub struct NetworkGuard {
    deny: AtomicBool,
}

impl NetworkGuard {
    /// Guard starting in the denied state.
    pub fn new() -> Self {
        NetworkGuard {
            deny: AtomicBool::new(true),
        }
    }

    /// Whether the process-wide deny is active.
    pub fn denied(&self) -> bool {
        self.deny.load(Ordering::SeqCst)
    }

    /// Check an outbound attempt by a capability.
    pub fn check(&self, capability_name: &str, network_allowed: bool) -> Result<(), RegistryError> {
        if self.denied() && !network_allowed {
            return Err(RegistryError::NetworkDenied(capability_name.to_string()));
        }
        Ok(())
    }
}

impl Default for NetworkGuard {
    fn default() -> Self {
        NetworkGuard::new()
    }
}

/// The singleton plugin id allowed outbound network.
pub const EGRESS_GATEWAY_PLUGIN: &str = "builtin.egress.gateway";

/// String-keyed capability table.
pub struct CapabilityTable {
    entries: RwLock<HashMap<String, CapabilityEntry>>,
    guard: Arc<NetworkGuard>,
    audit: Option<Arc<AuditLog>>,
}

impl CapabilityTable {
    /// New table over the network guard, auditing invocations when a log
    /// is supplied.
    pub fn new(guard: Arc<NetworkGuard>, audit: Option<Arc<AuditLog>>) -> Self {
        CapabilityTable {
            entries: RwLock::new(HashMap::new()),
            guard,
            audit,
        }
    }

    /// Register (or replace) a capability.
    pub fn register(
        &self,
        name: &str,
        capability: Capability,
        network_allowed: bool,
        plugin_id: Option<&str>,
    ) {
        tracing::debug!(name, kind = capability.kind(), network_allowed, "capability registered");
        self.entries.write().insert(
            name.to_string(),
            CapabilityEntry {
                capability,
                network_allowed,
                plugin_id: plugin_id.map(str::to_string),
            },
        );
    }

    /// Fetch a capability by name.
    pub fn get(&self, name: &str) -> Result<Capability, RegistryError> {
        self.entries
            .read()
            .get(name)
            .map(|entry| entry.capability.clone())
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    /// Whether a capability is registered.
    pub fn has(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All registered capability names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a capability may use the network.
    pub fn ensure_network(&self, name: &str) -> Result<(), RegistryError> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))?;
        self.guard.check(name, entry.network_allowed)
    }

    /// Plugin ids currently granted network. The doctor check requires
    /// this to be exactly `{builtin.egress.gateway}` when non-empty.
    pub fn network_allowed_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.network_allowed)
            .filter_map(|entry| entry.plugin_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Invoke a plugin capability with audit recording.
    pub fn invoke(
        &self,
        name: &str,
        method: &str,
        payload: &Value,
    ) -> Result<Value, RegistryError> {
        let (capability, plugin_id) = {
            let entries = self.entries.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))?;
            (entry.capability.clone(), entry.plugin_id.clone())
        };
        let Capability::Plugin(target) = capability else {
            return Err(RegistryError::Plugin {
                plugin_id: plugin_id.unwrap_or_default(),
                message: format!("capability {name} is not invokable"),
            });
        };
        let result = target.invoke(method, payload);
        if let Some(audit) = &self.audit {
            let row = json!({
                "plugin_id": plugin_id.clone().unwrap_or_default(),
                "capability": name,
                "method": method,
                "ok": result.is_ok(),
                "ts_utc": autocap_spec::now_utc(),
            });
            if let Err(err) = audit.append("plugin.exec", "plugin.registry", if result.is_ok() { "ok" } else { "error" }, row) {
                tracing::warn!(error = %err, "plugin exec audit append failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl PluginCapability for Echo {
        fn invoke(&self, method: &str, payload: &Value) -> Result<Value, RegistryError> {
            if method == "fail" {
                return Err(RegistryError::Plugin {
                    plugin_id: "builtin.echo".into(),
                    message: "requested failure".into(),
                });
            }
            Ok(json!({"method": method, "payload": payload}))
        }
    }

    fn table(dir: &std::path::Path) -> (CapabilityTable, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::open(&dir.join("audit.ndjson")).unwrap());
        let table = CapabilityTable::new(Arc::new(NetworkGuard::new()), Some(Arc::clone(&audit)));
        (table, audit)
    }

    #[test]
    fn invocation_writes_audit_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (table, audit) = table(dir.path());
        table.register(
            "egress.gateway",
            Capability::Plugin(Arc::new(Echo)),
            true,
            Some(EGRESS_GATEWAY_PLUGIN),
        );
        table.invoke("egress.gateway", "send", &json!({"n": 1})).unwrap();
        let _ = table.invoke("egress.gateway", "fail", &json!({}));
        let rows = audit.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].details["ok"], json!(true));
        assert_eq!(rows[1].outcome, "error");
        assert_eq!(rows[1].details["capability"], json!("egress.gateway"));
    }

    #[test]
    fn network_denied_for_unprivileged_capability() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _audit) = table(dir.path());
        table.register(
            "extract.ocr",
            Capability::Plugin(Arc::new(Echo)),
            false,
            Some("builtin.extract.ocr"),
        );
        let err = table.ensure_network("extract.ocr").unwrap_err();
        assert!(matches!(err, RegistryError::NetworkDenied(_)));
        table.register(
            "egress.gateway",
            Capability::Plugin(Arc::new(Echo)),
            true,
            Some(EGRESS_GATEWAY_PLUGIN),
        );
        table.ensure_network("egress.gateway").unwrap();
        assert_eq!(
            table.network_allowed_plugins(),
            vec![EGRESS_GATEWAY_PLUGIN.to_string()]
        );
    }
}
