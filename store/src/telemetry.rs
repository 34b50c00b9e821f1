//! In-process telemetry snapshots: latest payload per category plus a
//! bounded ring buffer of history.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Telemetry store shared through the capability table.
pub struct TelemetryStore {
    max_samples: usize,
    inner: Mutex<TelemetryInner>,
}

#[derive(Default)]
struct TelemetryInner {
    latest: HashMap<String, Value>,
    history: HashMap<String, VecDeque<Value>>,
}

impl TelemetryStore {
    /// New store retaining `max_samples` history entries per category.
    pub fn new(max_samples: usize) -> Self {
        TelemetryStore {
            max_samples,
            inner: Mutex::new(TelemetryInner::default()),
        }
    }

    /// Record a payload under a category.
    pub fn record(&self, category: &str, payload: Value) {
        if category.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.latest.insert(category.to_string(), payload.clone());
        let history = inner.history.entry(category.to_string()).or_default();
        history.push_back(payload);
        while self.max_samples > 0 && history.len() > self.max_samples {
            history.pop_front();
        }
    }

    /// Latest payload for a category.
    pub fn latest(&self, category: &str) -> Option<Value> {
        self.inner.lock().latest.get(category).cloned()
    }

    /// Full snapshot: latest per category and the ring-buffer history.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        let latest: serde_json::Map<String, Value> = inner
            .latest
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let history: serde_json::Map<String, Value> = inner
            .history
            .iter()
            .map(|(key, items)| {
                (
                    key.clone(),
                    Value::Array(items.iter().cloned().collect()),
                )
            })
            .collect();
        serde_json::json!({"latest": latest, "history": history})
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        TelemetryStore::new(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_buffer_is_bounded() {
        let store = TelemetryStore::new(3);
        for idx in 0..10 {
            store.record("runtime", json!({"tick": idx}));
        }
        let snapshot = store.snapshot();
        let history = snapshot["history"]["runtime"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["tick"], json!(7));
        assert_eq!(store.latest("runtime").unwrap()["tick"], json!(9));
    }

    #[test]
    fn empty_category_is_ignored() {
        let store = TelemetryStore::default();
        store.record("", json!({"x": 1}));
        assert!(store.latest("").is_none());
    }
}
