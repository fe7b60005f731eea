//! Poll interval source, re-read every cycle.
//!
//! The settings file is a small JSON object owned by the operator:
//!
//! ```json
//! { "sleep_interval": 25 }
//! ```
//!
//! Anything unusable (missing file, bad JSON, missing key, non-positive or
//! non-numeric value) falls back to the default interval.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

pub trait IntervalSource: Send + Sync {
    fn interval(&self) -> Duration;
}

/// Extract `sleep_interval` (integer or float seconds) from a settings
/// document. `None` when absent or not a finite positive number.
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let v: Value = serde_json::from_str(raw).ok()?;
    let secs = v.get("sleep_interval")?.as_f64()?;
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

#[derive(Debug, Clone)]
pub struct SettingsFileInterval {
    path: PathBuf,
    default: Duration,
}

impl SettingsFileInterval {
    pub fn new(path: impl Into<PathBuf>, default: Duration) -> Self {
        Self {
            path: path.into(),
            default,
        }
    }
}

impl IntervalSource for SettingsFileInterval {
    fn interval(&self) -> Duration {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no settings file, using default interval");
                return self.default;
            }
        };

        match parse_interval(&raw) {
            Some(d) => d,
            None => {
                warn!(
                    path = %self.path.display(),
                    default_secs = self.default.as_secs_f64(),
                    "settings file has no usable sleep_interval, using default"
                );
                self.default
            }
        }
    }
}
