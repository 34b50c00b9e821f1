//! Run-scoped record identifiers: `<run_id>/<record_type>/<seq>`.

use serde::{Deserialize, Serialize};

/// Identifier of a single engine run. Unique per process start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh run id from the current UTC time plus a random suffix.
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("run-{stamp}-{}", &suffix[..8]))
    }

    /// Wrap an existing run id string (e.g. restored from configuration).
    pub fn from_string(value: impl Into<String>) -> Self {
        RunId(value.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a record id `<run_id>/<record_type>/<seq>`.
pub fn prefixed_id(run_id: &str, record_type: &str, seq: u64) -> String {
    format!("{run_id}/{record_type}/{seq}")
}

/// Encode a record id for use as a filesystem name: slashes become
/// underscores.
pub fn encode_component(record_id: &str) -> String {
    record_id.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_id_layout() {
        assert_eq!(prefixed_id("run-1", "segment", 7), "run-1/segment/7");
    }

    #[test]
    fn encode_component_is_path_safe() {
        let id = prefixed_id("run-1", "evidence.capture.segment", 0);
        let safe = encode_component(&id);
        assert!(!safe.contains('/'));
        assert_eq!(safe, "run-1_evidence.capture.segment_0");
    }

    #[test]
    fn generated_run_ids_differ() {
        assert_ne!(RunId::generate().as_str(), RunId::generate().as_str());
    }
}
