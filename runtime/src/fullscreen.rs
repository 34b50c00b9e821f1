//! Fullscreen detection: a window rectangle that covers its monitor
//! within a small tolerance counts as fullscreen. The OS probe (behind a
//! plugin) wins when present; window-record rectangles are the fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Window + monitor rectangles extracted from a window record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRect {
    /// Window rectangle `[left, top, right, bottom]`.
    pub rect: [i64; 4],
    /// Monitor rectangle, when known.
    pub monitor_rect: Option<[i64; 4]>,
}

impl WindowRect {
    /// Parse from a window record payload (`{rect, monitor: {rect}}`).
    pub fn from_record(record: &Value) -> Option<WindowRect> {
        let window = record.get("window").unwrap_or(record);
        let rect = parse_rect(window.get("rect")?)?;
        let monitor_rect = window
            .get("monitor")
            .and_then(|monitor| monitor.get("rect"))
            .and_then(parse_rect);
        Some(WindowRect { rect, monitor_rect })
    }
}

/// Fullscreen verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullscreenVerdict {
    /// Whether the verdict is trustworthy.
    pub ok: bool,
    /// Whether a fullscreen app covers the monitor.
    pub fullscreen: bool,
    /// Why: `fullscreen|windowed|no_window|missing_rect|os_probe`.
    pub reason: String,
}

/// Operating-system fullscreen probe, supplied by a platform plugin.
pub trait FullscreenProbe: Send + Sync {
    /// Current fullscreen state, or `None` when the probe cannot tell.
    fn fullscreen(&self) -> Option<bool>;
}

const COVER_TOLERANCE: i64 = 2;

/// Decide fullscreen state. Precedence: OS probe first, window-record
/// rectangles as fallback.
pub fn fullscreen_verdict(
    probe: Option<&dyn FullscreenProbe>,
    window_record: Option<&Value>,
) -> FullscreenVerdict {
    if let Some(state) = probe.and_then(FullscreenProbe::fullscreen) {
        return FullscreenVerdict {
            ok: true,
            fullscreen: state,
            reason: "os_probe".to_string(),
        };
    }
    let Some(record) = window_record else {
        return FullscreenVerdict {
            ok: false,
            fullscreen: false,
            reason: "no_window".to_string(),
        };
    };
    let Some(window) = WindowRect::from_record(record) else {
        return FullscreenVerdict {
            ok: false,
            fullscreen: false,
            reason: "missing_rect".to_string(),
        };
    };
    let Some(monitor) = window.monitor_rect else {
        return FullscreenVerdict {
            ok: false,
            fullscreen: false,
            reason: "missing_rect".to_string(),
        };
    };
    let [left, top, right, bottom] = window.rect;
    let [mleft, mtop, mright, mbottom] = monitor;
    let covers = left <= mleft + COVER_TOLERANCE
        && top <= mtop + COVER_TOLERANCE
        && right >= mright - COVER_TOLERANCE
        && bottom >= mbottom - COVER_TOLERANCE;
    FullscreenVerdict {
        ok: true,
        fullscreen: covers,
        reason: if covers { "fullscreen" } else { "windowed" }.to_string(),
    }
}

fn parse_rect(value: &Value) -> Option<[i64; 4]> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut rect = [0i64; 4];
    for (slot, item) in rect.iter_mut().zip(items) {
        *slot = item.as_i64()?;
    }
    Some(rect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedProbe(Option<bool>);
    impl FullscreenProbe for FixedProbe {
        fn fullscreen(&self) -> Option<bool> {
            self.0
        }
    }

    fn covering_record() -> Value {
        json!({
            "window": {
                "rect": [0, 0, 1920, 1080],
                "monitor": {"rect": [0, 0, 1920, 1080]},
            }
        })
    }

    #[test]
    fn covering_window_is_fullscreen() {
        let verdict = fullscreen_verdict(None, Some(&covering_record()));
        assert!(verdict.ok && verdict.fullscreen);
        assert_eq!(verdict.reason, "fullscreen");
    }

    #[test]
    fn windowed_rect_is_not_fullscreen() {
        let record = json!({
            "rect": [100, 100, 800, 600],
            "monitor": {"rect": [0, 0, 1920, 1080]},
        });
        let verdict = fullscreen_verdict(None, Some(&record));
        assert!(verdict.ok && !verdict.fullscreen);
    }

    #[test]
    fn os_probe_wins_over_record() {
        let probe = FixedProbe(Some(false));
        let verdict = fullscreen_verdict(Some(&probe), Some(&covering_record()));
        assert!(!verdict.fullscreen);
        assert_eq!(verdict.reason, "os_probe");
    }

    #[test]
    fn missing_data_is_not_ok() {
        let verdict = fullscreen_verdict(None, None);
        assert!(!verdict.ok);
        assert_eq!(verdict.reason, "no_window");
        let probe = FixedProbe(None);
        let verdict = fullscreen_verdict(Some(&probe), Some(&json!({"rect": [0, 0]})));
        assert_eq!(verdict.reason, "missing_rect");
    }
}
