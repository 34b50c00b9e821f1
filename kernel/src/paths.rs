//! Path resolution from the environment.
//!
//! `AUTOCAPTURE_ROOT` pins the repository root for contract lookups;
//! `AUTOCAPTURE_CONFIG_DIR` and `AUTOCAPTURE_DATA_DIR` relocate the
//! config and data trees; `AUTOCAPTURE_BUNDLE_DIR` points at model
//! bundles.

use std::path::{Path, PathBuf};

/// Resolved process paths.
#[derive(Debug, Clone)]
pub struct KernelPaths {
    /// Repository root (contracts, default config).
    pub root: PathBuf,
    /// Per-user configuration directory.
    pub config_dir: PathBuf,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Optional model bundle directory.
    pub bundle_dir: Option<PathBuf>,
}

impl KernelPaths {
    /// Resolve paths from the environment with sensible defaults.
    pub fn resolve() -> KernelPaths {
        let root = std::env::var("AUTOCAPTURE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let config_dir = std::env::var("AUTOCAPTURE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("autocapture")
            });
        let data_dir = std::env::var("AUTOCAPTURE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("data"));
        let bundle_dir = std::env::var("AUTOCAPTURE_BUNDLE_DIR").ok().map(PathBuf::from);
        KernelPaths {
            root,
            config_dir,
            data_dir,
            bundle_dir,
        }
    }

    /// Resolve a repo-relative path.
    pub fn in_root(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

/// Whether the safe-mode environment flag is set.
pub fn env_safe_mode() -> bool {
    env_flag("AUTOCAPTURE_SAFE_MODE")
}

/// Whether the metadata-only query profile is requested.
pub fn env_metadata_only() -> bool {
    env_flag("AUTOCAPTURE_QUERY_METADATA_ONLY")
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Resolve a possibly-relative storage path under `data_dir`, dropping a
/// redundant leading component that matches the data dir's own name (so
/// legacy `data/lexical.idx` does not become `data/data/lexical.idx`).
pub fn resolve_under_data_dir(path: &str, data_dir: &Path) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let mut components = candidate.components();
    if let (Some(first), Some(dir_name)) = (components.clone().next(), data_dir.file_name()) {
        if first.as_os_str() == dir_name {
            components.next();
            return data_dir.join(components.as_path());
        }
    }
    data_dir.join(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_data_prefix_is_dropped() {
        let data_dir = Path::new("/home/user/.autocapture/data");
        assert_eq!(
            resolve_under_data_dir("data/lexical.idx", data_dir),
            Path::new("/home/user/.autocapture/data/lexical.idx")
        );
        assert_eq!(
            resolve_under_data_dir("media", data_dir),
            Path::new("/home/user/.autocapture/data/media")
        );
        assert_eq!(
            resolve_under_data_dir("/abs/path.idx", data_dir),
            Path::new("/abs/path.idx")
        );
    }
}
