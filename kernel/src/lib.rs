//! Kernel: layered configuration, boot/shutdown orchestration, crash-loop
//! handling, and doctor checks. The kernel wires the storage, capture,
//! runtime, registry, index, and egress subsystems into one process.

/// Boot and shutdown orchestration.
pub mod boot;
/// Layered configuration loading and validation.
pub mod config;
/// Doctor checks.
pub mod doctor;
/// Environment-driven path resolution.
pub mod paths;

pub use boot::{Kernel, KernelOptions};
pub use config::{load_config, ConfigPaths, EffectiveConfig};
pub use doctor::DoctorCheck;
pub use paths::KernelPaths;

use thiserror::Error;

/// Kernel version stamped into run manifests and compat predicates.
pub const KERNEL_VERSION: &str = "0.1.0";

/// Errors that abort boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file is missing.
    #[error("missing config file: {0}")]
    MissingFile(String),
    /// Configuration failed to parse.
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    /// Configuration failed schema validation.
    #[error("config schema: {0}")]
    Schema(#[from] autocap_spec::schema::SchemaError),
    /// Another process holds the instance lock.
    #[error("another instance is running: {0}")]
    InstanceLocked(String),
    /// Contract lock missing or mismatched.
    #[error(transparent)]
    Contract(#[from] autocap_registry::RegistryError),
    /// Storage failure during boot.
    #[error(transparent)]
    Store(#[from] autocap_store::StoreError),
    /// Vault failure during boot.
    #[error(transparent)]
    Vault(#[from] autocap_vault::VaultError),
    /// Filesystem failure during boot.
    #[error("kernel io: {0}")]
    Io(#[from] std::io::Error),
}
