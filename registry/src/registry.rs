//! Registry load sequence: contract lock, plugin lock verification,
//! safe-mode pack, allowlist and compat filters, settings validation,
//! dependency-ordered instantiation with crash isolation, and capability
//! registration.

use crate::capability::{Capability, CapabilityTable};
use crate::lockfile::PluginLocks;
use crate::manifest::{discover_manifests, kernel_compatible, DiscoveredPlugin};
use crate::RegistryError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

/// Context handed to plugin factories at instantiation.
pub struct PluginContext<'a> {
    /// Settings stripped to the plugin's declared paths.
    pub settings: Value,
    /// Capability table for `required_capabilities` lookups.
    pub capabilities: &'a CapabilityTable,
}

/// An instantiated plugin and the capabilities it registers.
pub struct PluginInstance {
    /// Plugin id.
    pub plugin_id: String,
    /// `(capability name, capability, wants_network)` triples.
    pub capabilities: Vec<(String, Capability, bool)>,
}

/// Factory creating a plugin instance. Built-in plugins register their
/// factories at kernel wiring; external artifacts would be hosted behind
/// a sandbox implementing the same trait.
pub trait PluginFactory: Send + Sync {
    /// Instantiate the plugin.
    fn create(
        &self,
        plugin: &DiscoveredPlugin,
        context: &PluginContext<'_>,
    ) -> Result<PluginInstance, RegistryError>;
}

/// Registry configuration.
#[derive(Clone)]
pub struct RegistryConfig {
    /// Directories searched for `plugin.json`.
    pub search_paths: Vec<PathBuf>,
    /// Plugin lockfile path.
    pub lockfile_path: PathBuf,
    /// Whether lock verification is enforced.
    pub enforce_locks: bool,
    /// Safe mode: only the default pack is admissible.
    pub safe_mode: bool,
    /// Plugins admissible under safe mode.
    pub default_pack: Vec<String>,
    /// Optional allowlist; `None` admits every discovered plugin.
    pub allowlist: Option<Vec<String>>,
    /// Per-plugin enabled flags (absent means enabled).
    pub enabled: BTreeMap<String, bool>,
    /// Kernel version for compat predicates.
    pub kernel_version: String,
    /// Schema versions the kernel speaks.
    pub schema_versions: Vec<u32>,
    /// Effective configuration; stripped per plugin settings paths.
    pub settings: Value,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            search_paths: vec![PathBuf::from("plugins")],
            lockfile_path: PathBuf::from("config/plugin_locks.json"),
            enforce_locks: true,
            safe_mode: false,
            default_pack: Vec::new(),
            allowlist: None,
            enabled: BTreeMap::new(),
            kernel_version: "0.1.0".into(),
            schema_versions: vec![1],
            settings: Value::Null,
        }
    }
}

/// Outcome of a load pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Plugins instantiated and registered.
    pub loaded: Vec<String>,
    /// Plugins that failed, with reasons. Failures never poison others.
    pub failed: Vec<(String, String)>,
    /// Plugins filtered before instantiation, with reasons.
    pub skipped: Vec<(String, String)>,
}

/// The plugin registry.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a factory for a plugin id.
    pub fn register_factory(&mut self, plugin_id: &str, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(plugin_id.to_string(), factory);
    }

    /// Run the load sequence against a capability table.
    pub fn load(
        &self,
        config: &RegistryConfig,
        table: &CapabilityTable,
    ) -> Result<LoadReport, RegistryError> {
        let mut report = LoadReport::default();
        let (discovered, errors) = discover_manifests(&config.search_paths);
        for err in errors {
            report.failed.push(("<manifest>".to_string(), err.to_string()));
        }

        let locks = if config.enforce_locks {
            Some(PluginLocks::load(&config.lockfile_path)?)
        } else {
            None
        };

        let mut admitted: Vec<DiscoveredPlugin> = Vec::new();
        for plugin in discovered {
            let id = plugin.manifest.plugin_id.clone();
            if let Some(locks) = &locks {
                let mismatches = locks.verify(&id, &plugin.manifest_path, &plugin.dir)?;
                if !mismatches.is_empty() {
                    report.failed.push((id, mismatches.join(", ")));
                    continue;
                }
            }
            if config.safe_mode && !config.default_pack.contains(&id) {
                report.skipped.push((id, "safe_mode".to_string()));
                continue;
            }
            if let Some(allowlist) = &config.allowlist {
                if !allowlist.contains(&id) {
                    report.skipped.push((id, "not_allowlisted".to_string()));
                    continue;
                }
            }
            if !config.enabled.get(&id).copied().unwrap_or(true) {
                report.skipped.push((id, "disabled".to_string()));
                continue;
            }
            if !kernel_compatible(
                plugin.manifest.compat.requires_kernel.as_deref(),
                &config.kernel_version,
            ) {
                report.skipped.push((id, "incompatible_kernel".to_string()));
                continue;
            }
            let wanted = &plugin.manifest.compat.requires_schema_versions;
            if !wanted.is_empty()
                && !wanted
                    .iter()
                    .any(|version| config.schema_versions.contains(version))
            {
                report.skipped.push((id, "incompatible_schema".to_string()));
                continue;
            }
            admitted.push(plugin);
        }

        let ordered = dependency_order(admitted, &mut report);
        for plugin in ordered {
            let id = plugin.manifest.plugin_id.clone();
            let settings = strip_settings(&config.settings, &plugin.manifest.settings_paths);
            if let Some(schema) = &plugin.manifest.settings_schema {
                if let Err(err) = autocap_spec::schema::validate(schema, &settings) {
                    report.failed.push((id, format!("settings: {err}")));
                    continue;
                }
            }
            let Some(factory) = self.factories.get(&id) else {
                report.failed.push((id, "no_factory".to_string()));
                continue;
            };
            let context = PluginContext {
                settings,
                capabilities: table,
            };
            let created = std::panic::catch_unwind(AssertUnwindSafe(|| {
                factory.create(&plugin, &context)
            }));
            match created {
                Ok(Ok(instance)) => {
                    let network_permitted = plugin.manifest.permissions.network;
                    for (name, capability, wants_network) in instance.capabilities {
                        table.register(
                            &name,
                            capability,
                            wants_network && network_permitted,
                            Some(&instance.plugin_id),
                        );
                    }
                    tracing::info!(plugin_id = %id, "plugin loaded");
                    report.loaded.push(id);
                }
                Ok(Err(err)) => {
                    tracing::warn!(plugin_id = %id, error = %err, "plugin instantiation failed");
                    report.failed.push((id, err.to_string()));
                }
                Err(_) => {
                    tracing::error!(plugin_id = %id, "plugin instantiation panicked");
                    report.failed.push((id, "instantiation panicked".to_string()));
                }
            }
        }
        Ok(report)
    }
}

/// Topologically order plugins by `depends_on`; plugins whose
/// dependencies are absent (or cyclic) are recorded as failed.
fn dependency_order(plugins: Vec<DiscoveredPlugin>, report: &mut LoadReport) -> Vec<DiscoveredPlugin> {
    let ids: HashSet<String> = plugins
        .iter()
        .map(|plugin| plugin.manifest.plugin_id.clone())
        .collect();
    let mut remaining: Vec<DiscoveredPlugin> = Vec::new();
    for plugin in plugins {
        let missing: Vec<&String> = plugin
            .manifest
            .depends_on
            .iter()
            .filter(|dep| !ids.contains(*dep))
            .collect();
        if missing.is_empty() {
            remaining.push(plugin);
        } else {
            report.failed.push((
                plugin.manifest.plugin_id.clone(),
                format!("missing_dependency: {missing:?}"),
            ));
        }
    }
    let mut ordered: Vec<DiscoveredPlugin> = Vec::new();
    let mut placed: HashSet<String> = HashSet::new();
    while !remaining.is_empty() {
        let before = remaining.len();
        let (ready, waiting): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|plugin| {
            plugin
                .manifest
                .depends_on
                .iter()
                .all(|dep| placed.contains(dep))
        });
        for plugin in ready {
            placed.insert(plugin.manifest.plugin_id.clone());
            ordered.push(plugin);
        }
        remaining = waiting;
        if remaining.len() == before {
            for plugin in remaining {
                report.failed.push((
                    plugin.manifest.plugin_id.clone(),
                    "dependency_cycle".to_string(),
                ));
            }
            break;
        }
    }
    ordered
}

/// Strip a configuration value down to the declared dotted paths.
fn strip_settings(config: &Value, paths: &[String]) -> Value {
    if paths.is_empty() {
        return Value::Object(Map::new());
    }
    let mut out = Map::new();
    for path in paths {
        let mut cursor = config;
        let segments: Vec<&str> = path.split('.').collect();
        let mut found = true;
        for segment in &segments {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        // Rebuild the nested shape for this path.
        let mut node = cursor.clone();
        for segment in segments.iter().rev() {
            let mut wrapper = Map::new();
            wrapper.insert(segment.to_string(), node);
            node = Value::Object(wrapper);
        }
        merge_into(&mut out, node);
    }
    Value::Object(out)
}

fn merge_into(target: &mut Map<String, Value>, source: Value) {
    let Value::Object(source) = source else {
        return;
    };
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (inner_key, inner_value) in incoming {
                    merge_into(existing, Value::Object(Map::from_iter([(inner_key, inner_value)])));
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NetworkGuard, PluginCapability};
    use crate::lockfile::PluginLockRecord;
    use serde_json::json;
    use std::path::Path;

    struct Echo;
    impl PluginCapability for Echo {
        fn invoke(&self, _method: &str, payload: &Value) -> Result<Value, RegistryError> {
            Ok(payload.clone())
        }
    }

    struct EchoFactory {
        capability_name: String,
        wants_network: bool,
        panic_on_create: bool,
    }
    impl PluginFactory for EchoFactory {
        fn create(
            &self,
            plugin: &DiscoveredPlugin,
            _context: &PluginContext<'_>,
        ) -> Result<PluginInstance, RegistryError> {
            if self.panic_on_create {
                panic!("factory exploded");
            }
            Ok(PluginInstance {
                plugin_id: plugin.manifest.plugin_id.clone(),
                capabilities: vec![(
                    self.capability_name.clone(),
                    Capability::Plugin(Arc::new(Echo)),
                    self.wants_network,
                )],
            })
        }
    }

    fn write_plugin(root: &Path, plugin_id: &str, manifest: Value) -> (PathBuf, PathBuf) {
        let dir = root.join(plugin_id);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plugin.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
        (path, dir)
    }

    fn lock_for(root: &Path, entries: &[(&str, &PathBuf, &PathBuf)]) -> PathBuf {
        let mut plugins = BTreeMap::new();
        for (id, manifest_path, dir) in entries {
            let record =
                PluginLocks::record_for(manifest_path, dir, json!({"packages": []})).unwrap();
            plugins.insert(id.to_string(), record);
        }
        let locks = PluginLocks { plugins };
        let path = root.join("plugin_locks.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&locks).unwrap()).unwrap();
        path
    }

    fn table() -> CapabilityTable {
        CapabilityTable::new(Arc::new(NetworkGuard::new()), None)
    }

    #[test]
    fn load_sequence_verifies_locks_and_orders_dependencies() {
        let root = tempfile::tempdir().unwrap();
        let (cap_path, cap_dir) = write_plugin(
            root.path(),
            "builtin.capture.screen",
            json!({"plugin_id": "builtin.capture.screen", "version": "1.0.0"}),
        );
        let (ocr_path, ocr_dir) = write_plugin(
            root.path(),
            "builtin.extract.ocr",
            json!({
                "plugin_id": "builtin.extract.ocr",
                "version": "1.0.0",
                "depends_on": ["builtin.capture.screen"],
            }),
        );
        let lockfile = lock_for(
            root.path(),
            &[
                ("builtin.capture.screen", &cap_path, &cap_dir),
                ("builtin.extract.ocr", &ocr_path, &ocr_dir),
            ],
        );
        let mut registry = Registry::new();
        registry.register_factory(
            "builtin.capture.screen",
            Arc::new(EchoFactory {
                capability_name: "capture.screen".into(),
                wants_network: false,
                panic_on_create: false,
            }),
        );
        registry.register_factory(
            "builtin.extract.ocr",
            Arc::new(EchoFactory {
                capability_name: "extract.ocr".into(),
                wants_network: false,
                panic_on_create: false,
            }),
        );
        let config = RegistryConfig {
            search_paths: vec![root.path().to_path_buf()],
            lockfile_path: lockfile,
            ..RegistryConfig::default()
        };
        let table = table();
        let report = registry.load(&config, &table).unwrap();
        assert_eq!(
            report.loaded,
            vec!["builtin.capture.screen".to_string(), "builtin.extract.ocr".to_string()]
        );
        assert!(report.failed.is_empty());
        assert!(table.has("extract.ocr"));
    }

    #[test]
    fn lock_mismatch_rejects_only_that_plugin() {
        let root = tempfile::tempdir().unwrap();
        let (good_path, good_dir) = write_plugin(
            root.path(),
            "builtin.good",
            json!({"plugin_id": "builtin.good", "version": "1.0.0"}),
        );
        let (bad_path, bad_dir) = write_plugin(
            root.path(),
            "builtin.bad",
            json!({"plugin_id": "builtin.bad", "version": "1.0.0"}),
        );
        let lockfile = lock_for(
            root.path(),
            &[
                ("builtin.good", &good_path, &good_dir),
                ("builtin.bad", &bad_path, &bad_dir),
            ],
        );
        // Drift the bad plugin after locking.
        std::fs::write(bad_dir.join("artifact.bin"), b"drift").unwrap();
        let mut registry = Registry::new();
        for id in ["builtin.good", "builtin.bad"] {
            registry.register_factory(
                id,
                Arc::new(EchoFactory {
                    capability_name: format!("{id}.cap"),
                    wants_network: false,
                    panic_on_create: false,
                }),
            );
        }
        let config = RegistryConfig {
            search_paths: vec![root.path().to_path_buf()],
            lockfile_path: lockfile,
            ..RegistryConfig::default()
        };
        let report = registry.load(&config, &table()).unwrap();
        assert_eq!(report.loaded, vec!["builtin.good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("artifact_hash"));
    }

    #[test]
    fn safe_mode_admits_only_default_pack() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "builtin.core",
            json!({"plugin_id": "builtin.core", "version": "1.0.0"}),
        );
        write_plugin(
            root.path(),
            "thirdparty.extra",
            json!({"plugin_id": "thirdparty.extra", "version": "1.0.0"}),
        );
        let mut registry = Registry::new();
        registry.register_factory(
            "builtin.core",
            Arc::new(EchoFactory {
                capability_name: "core.cap".into(),
                wants_network: false,
                panic_on_create: false,
            }),
        );
        let config = RegistryConfig {
            search_paths: vec![root.path().to_path_buf()],
            enforce_locks: false,
            safe_mode: true,
            default_pack: vec!["builtin.core".to_string()],
            ..RegistryConfig::default()
        };
        let report = registry.load(&config, &table()).unwrap();
        assert_eq!(report.loaded, vec!["builtin.core".to_string()]);
        assert_eq!(report.skipped, vec![("thirdparty.extra".to_string(), "safe_mode".to_string())]);
    }

    #[test]
    fn panicking_factory_is_isolated() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "builtin.crashy",
            json!({"plugin_id": "builtin.crashy", "version": "1.0.0"}),
        );
        write_plugin(
            root.path(),
            "builtin.stable",
            json!({"plugin_id": "builtin.stable", "version": "1.0.0"}),
        );
        let mut registry = Registry::new();
        registry.register_factory(
            "builtin.crashy",
            Arc::new(EchoFactory {
                capability_name: "crashy.cap".into(),
                wants_network: false,
                panic_on_create: true,
            }),
        );
        registry.register_factory(
            "builtin.stable",
            Arc::new(EchoFactory {
                capability_name: "stable.cap".into(),
                wants_network: false,
                panic_on_create: false,
            }),
        );
        let config = RegistryConfig {
            search_paths: vec![root.path().to_path_buf()],
            enforce_locks: false,
            ..RegistryConfig::default()
        };
        let table = table();
        let report = registry.load(&config, &table).unwrap();
        assert_eq!(report.loaded, vec!["builtin.stable".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(table.has("stable.cap"));
        assert!(!table.has("crashy.cap"));
    }

    #[test]
    fn settings_are_stripped_and_validated() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "builtin.tuned",
            json!({
                "plugin_id": "builtin.tuned",
                "version": "1.0.0",
                "settings_paths": ["capture.video.fps_target"],
                "settings_schema": {
                    "type": "object",
                    "properties": {
                        "capture": {
                            "type": "object",
                            "properties": {
                                "video": {
                                    "type": "object",
                                    "properties": {"fps_target": {"type": "integer", "minimum": 1}},
                                },
                            },
                        },
                    },
                },
            }),
        );
        struct CheckFactory;
        impl PluginFactory for CheckFactory {
            fn create(
                &self,
                plugin: &DiscoveredPlugin,
                context: &PluginContext<'_>,
            ) -> Result<PluginInstance, RegistryError> {
                // Only the declared path survives the strip.
                assert_eq!(
                    context.settings,
                    json!({"capture": {"video": {"fps_target": 15}}})
                );
                Ok(PluginInstance {
                    plugin_id: plugin.manifest.plugin_id.clone(),
                    capabilities: vec![],
                })
            }
        }
        let mut registry = Registry::new();
        registry.register_factory("builtin.tuned", Arc::new(CheckFactory));
        let config = RegistryConfig {
            search_paths: vec![root.path().to_path_buf()],
            enforce_locks: false,
            settings: json!({
                "capture": {"video": {"fps_target": 15, "backend": "auto"}},
                "privacy": {"egress": {}},
            }),
            ..RegistryConfig::default()
        };
        let report = registry.load(&config, &table()).unwrap();
        assert_eq!(report.loaded, vec!["builtin.tuned".to_string()]);
    }
}
