//! Plugin and capability registry: content-addressed plugin loading with
//! lockfile enforcement, per-plugin permissions, a deny-by-default
//! network guard, and crash-isolated instantiation.

/// Capability table and the network guard.
pub mod capability;
/// Contract and plugin lockfiles.
pub mod lockfile;
/// Plugin manifest schema and discovery.
pub mod manifest;
/// Registry load sequence.
pub mod registry;

pub use capability::{Capability, CapabilityTable, NetworkGuard, PluginCapability};
pub use lockfile::{verify_contract_lock, ContractLock, PluginLockRecord, PluginLocks};
pub use manifest::{discover_manifests, DiscoveredPlugin, Permissions, PluginManifest};
pub use registry::{LoadReport, PluginFactory, PluginInstance, Registry, RegistryConfig};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Contract lockfile missing or hash-mismatched. Fatal at boot.
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// A capability without network privilege attempted network use.
    #[error("network denied for capability {0}")]
    NetworkDenied(String),
    /// Plugin instantiation or invocation failed (isolated).
    #[error("plugin {plugin_id}: {message}")]
    Plugin {
        /// Offending plugin.
        plugin_id: String,
        /// Failure detail.
        message: String,
    },
    /// Manifest file unreadable or invalid.
    #[error("manifest at {path}: {message}")]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Failure detail.
        message: String,
    },
    /// Unknown capability name requested from the table.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    /// Storage failure while auditing.
    #[error(transparent)]
    Store(#[from] autocap_store::StoreError),
    /// Filesystem failure during discovery or hashing.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
}
