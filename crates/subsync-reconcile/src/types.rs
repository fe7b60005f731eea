use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocols whose inbounds carry a `settings.clients` list worth scanning.
pub const DEFAULT_PROTOCOLS: &[&str] = &["vmess", "vless"];

// ---------------------------------------------------------------------------
// Traffic rows
// ---------------------------------------------------------------------------

/// Per-client traffic counters as stored in the authoritative database.
///
/// The serde names match the snapshot file written by earlier deployments
/// (`Email`, `Up`, `Expiry_Time`, ...). `sub_id` is derived from the inbound
/// config every cycle and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientTraffic {
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(skip)]
    pub sub_id: Option<String>,
    #[serde(rename = "Up")]
    pub up: i64,
    #[serde(rename = "Down")]
    pub down: i64,
    #[serde(rename = "Total")]
    pub total: i64,
    /// Positive = absolute deadline (ms), negative = relative grace marker,
    /// zero = unlimited.
    #[serde(rename = "Expiry_Time")]
    pub expiry_time: i64,
    #[serde(rename = "Enable")]
    pub enable: bool,
    #[serde(rename = "Inbound_Id")]
    pub inbound_id: i64,
    #[serde(rename = "Reset")]
    pub reset: i64,
}

impl ClientTraffic {
    pub fn new(email: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            email: email.into(),
            sub_id: None,
            up,
            down,
            total: 0,
            expiry_time: 0,
            enable: true,
            inbound_id: 0,
            reset: 0,
        }
    }

    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total;
        self
    }

    pub fn with_expiry(mut self, expiry_time: i64) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    pub fn with_inbound(mut self, inbound_id: i64) -> Self {
        self.inbound_id = inbound_id;
        self
    }

    /// Overwrite the group-wide fields. `enable`, `inbound_id` and `reset`
    /// are left as read.
    pub fn apply(&mut self, values: &GroupValues) {
        self.up = values.up;
        self.down = values.down;
        self.total = values.total;
        self.expiry_time = values.expiry_time;
    }
}

/// Nullable form of [`ClientTraffic`] as it arrives from a DB row or an old
/// snapshot entry. Every field may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawClientTraffic {
    #[serde(rename = "Email")]
    pub email: Option<String>,
    #[serde(rename = "Up")]
    pub up: Option<i64>,
    #[serde(rename = "Down")]
    pub down: Option<i64>,
    #[serde(rename = "Total")]
    pub total: Option<i64>,
    #[serde(rename = "Expiry_Time")]
    pub expiry_time: Option<i64>,
    #[serde(rename = "Enable")]
    pub enable: Option<bool>,
    #[serde(rename = "Inbound_Id")]
    pub inbound_id: Option<i64>,
    #[serde(rename = "Reset")]
    pub reset: Option<i64>,
}

/// A raw traffic row that could not be turned into a [`ClientTraffic`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrafficRowError {
    MissingEmail,
}

impl std::fmt::Display for TrafficRowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEmail => write!(f, "traffic row has empty or missing email"),
        }
    }
}

impl std::error::Error for TrafficRowError {}

impl RawClientTraffic {
    /// The defaulting step: absent counters and limits become 0, an absent
    /// enable flag becomes `true`. The email is required.
    pub fn with_defaults(self) -> Result<ClientTraffic, TrafficRowError> {
        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or(TrafficRowError::MissingEmail)?;

        Ok(ClientTraffic {
            email,
            sub_id: None,
            up: self.up.unwrap_or(0),
            down: self.down.unwrap_or(0),
            total: self.total.unwrap_or(0),
            expiry_time: self.expiry_time.unwrap_or(0),
            enable: self.enable.unwrap_or(true),
            inbound_id: self.inbound_id.unwrap_or(0),
            reset: self.reset.unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot baseline
// ---------------------------------------------------------------------------

/// Last persisted usage for one email.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageBaseline {
    pub up: i64,
    pub down: i64,
}

/// email -> last persisted usage.
pub type Baseline = BTreeMap<String, UsageBaseline>;

/// Project persisted traffic rows onto a delta baseline. Later rows win on
/// duplicate emails.
pub fn baseline_from_rows(rows: &[ClientTraffic]) -> Baseline {
    rows.iter()
        .map(|r| {
            (
                r.email.clone(),
                UsageBaseline {
                    up: r.up,
                    down: r.down,
                },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Inbounds and their client lists
// ---------------------------------------------------------------------------

/// One row of the inbounds table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRow {
    pub id: i64,
    pub protocol: String,
    /// Raw settings JSON. `None` or empty means the inbound has no settings.
    pub settings: Option<String>,
}

impl InboundRow {
    pub fn new(id: i64, protocol: impl Into<String>, settings: impl Into<String>) -> Self {
        Self {
            id,
            protocol: protocol.into(),
            settings: Some(settings.into()),
        }
    }
}

/// Settings write-back for one inbound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundSettingsUpdate {
    pub id: i64,
    pub settings: String,
}

/// Case-insensitive set of protocols whose inbounds are scanned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolAllowList {
    protocols: BTreeSet<String>,
}

impl Default for ProtocolAllowList {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOLS.iter().copied())
    }
}

impl ProtocolAllowList {
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            protocols: protocols
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, protocol: &str) -> bool {
        self.protocols
            .contains(&protocol.trim().to_ascii_lowercase())
    }
}

/// A client object from an inbound's `settings.clients` list.
///
/// The JSON object is held as-is (key order preserved) so fields this crate
/// does not know about survive a rewrite. `inbound_id` lives outside the
/// object and is never written into the settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfigEntry {
    pub inbound_id: i64,
    email: String,
    object: Map<String, Value>,
}

impl ClientConfigEntry {
    /// Wrap a client object. Returns `None` when the object has no usable
    /// `email` string.
    pub fn from_object(inbound_id: i64, object: Map<String, Value>) -> Option<Self> {
        let email = object
            .get("email")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())?
            .to_string();
        Some(Self {
            inbound_id,
            email,
            object,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// `subId` when it is a non-empty string.
    pub fn sub_id(&self) -> Option<&str> {
        self.object
            .get("subId")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn up(&self) -> i64 {
        self.number("up")
    }

    pub fn down(&self) -> i64 {
        self.number("down")
    }

    pub fn total_gb(&self) -> i64 {
        self.number("totalGB")
    }

    pub fn expiry_time(&self) -> i64 {
        self.number("expiryTime")
    }

    /// Mirror the group-wide values into the config object.
    pub fn apply(&mut self, values: &GroupValues) {
        self.object.insert("up".to_string(), Value::from(values.up));
        self.object
            .insert("down".to_string(), Value::from(values.down));
        self.object
            .insert("totalGB".to_string(), Value::from(values.total));
        self.object
            .insert("expiryTime".to_string(), Value::from(values.expiry_time));
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.object
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.object.clone())
    }

    fn number(&self, key: &str) -> i64 {
        match self.object.get(key) {
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// All config entries sharing one non-empty `subId`. Derived every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub sub_id: String,
    pub entries: Vec<ClientConfigEntry>,
}

impl Group {
    pub fn emails(&self) -> BTreeSet<&str> {
        self.entries.iter().map(ClientConfigEntry::email).collect()
    }
}

/// Canonical values every member of a group carries after reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupValues {
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub expiry_time: i64,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a group produced no writes without being merely unchanged.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkipReason {
    /// None of the group's emails has a traffic row.
    NoTrafficRows,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedGroup {
    pub sub_id: String,
    pub reason: SkipReason,
}

/// A group whose members were rewritten this cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSync {
    pub sub_id: String,
    pub values: GroupValues,
    pub delta_up: i64,
    pub delta_down: i64,
    pub members: usize,
}

/// Everything one reconciliation pass decided.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Traffic rows to write back, already carrying the group values.
    pub traffic_updates: Vec<ClientTraffic>,
    /// Config entries to merge into their inbounds.
    pub config_updates: Vec<ClientConfigEntry>,
    pub synced: Vec<GroupSync>,
    /// Groups that did not advance since the snapshot.
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedGroup>,
}

impl ReconcileOutcome {
    /// `true` when nothing needs to be written.
    pub fn is_noop(&self) -> bool {
        self.traffic_updates.is_empty() && self.config_updates.is_empty()
    }
}
