//! subsync-config
//!
//! Two configuration surfaces:
//!
//! - [`DaemonConfig`]: where things live and how the daemon behaves. Loaded
//!   once at startup from layered YAML (earlier docs are base, later docs
//!   override). Every key has a default, so no file is required.
//! - [`IntervalSource`]: the poll interval, re-read on every cycle so an
//!   operator can change it without a restart.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub mod interval;

pub use interval::{parse_interval, IntervalSource, SettingsFileInterval};

pub const DEFAULT_INTERVAL_SECS: u64 = 25;
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_DB_BUSY_TIMEOUT_SECS: u64 = 5;

/// When the sync cycle asks the panel service to reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Reload whenever any inbound's client list was rewritten.
    #[default]
    OnConfigChange,
    /// Reload only when a rewrite changed some client's `totalGB` or
    /// `expiryTime`; usage-only rewrites are left for the panel to pick up.
    OnLimitChange,
    Never,
}

impl ReloadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadPolicy::OnConfigChange => "on_config_change",
            ReloadPolicy::OnLimitChange => "on_limit_change",
            ReloadPolicy::Never => "never",
        }
    }

    /// Decide from what the merge step observed.
    pub fn should_reload(&self, config_dirty: bool, limits_changed: bool) -> bool {
        match self {
            ReloadPolicy::OnConfigChange => config_dirty,
            ReloadPolicy::OnLimitChange => config_dirty && limits_changed,
            ReloadPolicy::Never => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadConfig {
    /// argv of the restart command; the first element is the program.
    pub command: Vec<String>,
    pub policy: ReloadPolicy,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            command: ["sudo", "systemctl", "restart", "x-ui.service"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            policy: ReloadPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub db_busy_timeout_secs: u64,
    /// Snapshot file (`{"sec": .., "clients": [..]}`).
    pub snapshot_path: PathBuf,
    /// JSON file holding `sleep_interval`, re-read every cycle.
    pub settings_path: PathBuf,
    pub default_interval_secs: u64,
    /// Pause after a cycle failed on local state.
    pub error_backoff_secs: u64,
    /// Inbound protocols whose client lists are scanned.
    pub protocols: Vec<String>,
    pub reload: ReloadConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/etc/x-ui/x-ui.db"),
            db_busy_timeout_secs: DEFAULT_DB_BUSY_TIMEOUT_SECS,
            snapshot_path: PathBuf::from("/opt/xui_sync_script/localDB.json"),
            settings_path: PathBuf::from("/opt/xui_sync_script/settings.json"),
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS,
            protocols: vec!["vmess".to_string(), "vless".to_string()],
            reload: ReloadConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_secs(self.db_busy_timeout_secs)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_interval_secs == 0 {
            bail!("CONFIG_INVALID: default_interval_secs must be > 0");
        }
        if self.error_backoff_secs == 0 {
            bail!("CONFIG_INVALID: error_backoff_secs must be > 0");
        }
        if self.protocols.iter().all(|p| p.trim().is_empty()) {
            bail!("CONFIG_INVALID: protocols must name at least one protocol");
        }
        if self.reload.policy != ReloadPolicy::Never
            && self.reload.command.first().map_or(true, |p| p.trim().is_empty())
        {
            bail!(
                "CONFIG_INVALID: reload.command is empty but reload.policy={}",
                self.reload.policy.as_str()
            );
        }
        Ok(())
    }
}

/// Load and merge YAML files in order. No paths means all defaults.
pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<DaemonConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let p = p.as_ref();
        let raw = fs::read_to_string(p)
            .with_context(|| format!("failed to read yaml path: {}", p.display()))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<DaemonConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        if raw.trim().is_empty() {
            continue;
        }
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        if v_json.is_null() {
            // Empty document.
            continue;
        }
        merged = deep_merge(merged, v_json);
    }

    let cfg: DaemonConfig =
        serde_json::from_value(merged).context("config does not match DaemonConfig")?;
    cfg.validate()?;
    if cfg.reload.policy == ReloadPolicy::Never {
        warn!("reload.policy=never: panel must be reloaded by other means");
    }
    Ok(cfg)
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}
