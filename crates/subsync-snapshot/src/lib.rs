//! subsync-snapshot
//!
//! Last-known per-client usage, persisted between cycles as
//!
//! ```json
//! { "sec": 25, "clients": [ { "Email": "a", "Up": 1, "Down": 2, ... } ] }
//! ```
//!
//! Loading never fails: a missing or unreadable file yields the default
//! snapshot, and each top-level key is defaulted on its own. Saving replaces
//! the file atomically.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use subsync_reconcile::{baseline_from_rows, Baseline, ClientTraffic, RawClientTraffic};
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Poll interval in effect when the snapshot was written.
    pub interval: Duration,
    pub clients: Vec<ClientTraffic>,
}

impl Snapshot {
    pub fn empty(interval: Duration) -> Self {
        Self {
            interval,
            clients: Vec::new(),
        }
    }

    pub fn baseline(&self) -> Baseline {
        baseline_from_rows(&self.clients)
    }

    /// File representation. Whole-second intervals are written as integers.
    pub fn to_json(&self) -> Value {
        let sec = if self.interval.subsec_nanos() == 0 {
            json!(self.interval.as_secs())
        } else {
            json!(self.interval.as_secs_f64())
        };
        json!({
            "sec": sec,
            "clients": self.clients,
        })
    }

    /// Lenient decode: an invalid `sec` falls back to `default_interval`, an
    /// invalid `clients` to an empty list, and client rows that do not decode
    /// are dropped.
    pub fn from_json(v: &Value, default_interval: Duration) -> Self {
        let interval = v
            .get("sec")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite() && *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(default_interval);

        let mut clients = Vec::new();
        if let Some(rows) = v.get("clients").and_then(Value::as_array) {
            for (index, row) in rows.iter().enumerate() {
                let decoded = serde_json::from_value::<RawClientTraffic>(row.clone())
                    .map_err(|e| e.to_string())
                    .and_then(|raw| raw.with_defaults().map_err(|e| e.to_string()));
                match decoded {
                    Ok(t) => clients.push(t),
                    Err(error) => warn!(index, %error, "dropping snapshot client row"),
                }
            }
        }

        Self { interval, clients }
    }
}

pub trait SnapshotStore: Send + Sync {
    /// Never fails; see the crate docs for the fallback rules.
    fn load(&self) -> Snapshot;

    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    default_interval: Duration,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>, default_interval: Duration) -> Self {
        Self {
            path: path.into(),
            default_interval,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Snapshot {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot yet, starting empty");
                return Snapshot::empty(self.default_interval);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unreadable, starting empty");
                return Snapshot::empty(self.default_interval);
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(v) if v.is_object() => Snapshot::from_json(&v, self.default_interval),
            Ok(_) => {
                warn!(path = %self.path.display(), "snapshot is not a JSON object, starting empty");
                Snapshot::empty(self.default_interval)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot corrupt, starting empty");
                Snapshot::empty(self.default_interval)
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir failed: {}", parent.display()))?;
        }

        let json =
            serde_json::to_string_pretty(&snapshot.to_json()).context("serialize snapshot failed")?;

        let tmp = self.tmp_path();
        fs::write(&tmp, format!("{json}\n"))
            .with_context(|| format!("write snapshot failed: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "replace snapshot failed: {} -> {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_and_fractional_intervals_are_written_as_numbers() {
        let s = Snapshot::empty(Duration::from_secs(25));
        assert_eq!(s.to_json()["sec"], json!(25));
        let s = Snapshot::empty(Duration::from_millis(1500));
        assert_eq!(s.to_json()["sec"], json!(1.5));
    }

    #[test]
    fn keys_are_defaulted_individually() {
        let d = Duration::from_secs(25);

        let s = Snapshot::from_json(&json!({"clients": [{"Email": "a", "Up": 3}]}), d);
        assert_eq!(s.interval, d);
        assert_eq!(s.clients.len(), 1);
        assert_eq!((s.clients[0].up, s.clients[0].down, s.clients[0].enable), (3, 0, true));

        let s = Snapshot::from_json(&json!({"sec": 7, "clients": "nope"}), d);
        assert_eq!(s.interval, Duration::from_secs(7));
        assert!(s.clients.is_empty());

        let s = Snapshot::from_json(&json!({"sec": -1}), d);
        assert_eq!(s.interval, d);
    }

    #[test]
    fn undecodable_rows_are_dropped() {
        let v = json!({"sec": 25, "clients": [
            {"Email": "a", "Up": 1, "Down": 1},
            {"Up": 9},
            {"Email": "b", "Up": "not a number"},
            {"Email": "c"}
        ]});
        let s = Snapshot::from_json(&v, Duration::from_secs(25));
        let emails: Vec<&str> = s.clients.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, vec!["a", "c"]);
    }

    #[test]
    fn baseline_projects_usage_by_email() {
        let s = Snapshot {
            interval: Duration::from_secs(25),
            clients: vec![ClientTraffic::new("a", 100, 50), ClientTraffic::new("b", 1, 2)],
        };
        let b = s.baseline();
        assert_eq!(b["a"].up, 100);
        assert_eq!(b["b"].down, 2);
    }
}
