//! Config merge: rebuild each inbound's `settings.clients` from the
//! reconciled entries and decide which inbounds must be written back.
//!
//! # Rules
//!
//! - Updated entries for an inbound come first, deduplicated by email (the
//!   last update wins, the first occurrence keeps its slot).
//! - Old entries whose email was not updated follow in their original order.
//!   Old objects without an email are always carried over.
//! - An inbound is dirty only when the compact serialization of the new list
//!   differs from that of the old list. Byte equality means "no change".
//! - Dirty settings are re-serialized pretty-printed (two-space indent).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::settings::{client_values, decode_settings, SettingsDecodeError};
use crate::{ClientConfigEntry, InboundRow, InboundSettingsUpdate, ProtocolAllowList};

/// A dirty inbound and its rebuilt settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRewrite {
    pub inbound_id: i64,
    /// Full settings JSON to store.
    pub settings: String,
    /// `true` when some rewritten client got a different `totalGB` or
    /// `expiryTime` than it had before.
    pub limits_changed: bool,
    pub clients: usize,
}

impl InboundRewrite {
    pub fn to_update(&self) -> InboundSettingsUpdate {
        InboundSettingsUpdate {
            id: self.inbound_id,
            settings: self.settings.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub rewrites: Vec<InboundRewrite>,
    pub errors: Vec<SettingsDecodeError>,
}

impl MergeOutcome {
    pub fn is_dirty(&self) -> bool {
        !self.rewrites.is_empty()
    }

    pub fn limits_changed(&self) -> bool {
        self.rewrites.iter().any(|r| r.limits_changed)
    }

    pub fn updates(&self) -> Vec<InboundSettingsUpdate> {
        self.rewrites.iter().map(InboundRewrite::to_update).collect()
    }
}

fn value_email(v: &Value) -> Option<&str> {
    v.get("email").and_then(Value::as_str).map(str::trim)
}

/// `(totalGB, expiryTime)` read the way [`ClientConfigEntry`] reads them:
/// missing or non-numeric is 0.
fn limit_fields(v: &Value) -> (i64, i64) {
    let number = |key: &str| {
        v.get(key)
            .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
            .unwrap_or(0)
    };
    (number("totalGB"), number("expiryTime"))
}

fn encode(inbound_id: i64, v: &impl serde::Serialize, pretty: bool) -> Result<String, SettingsDecodeError> {
    let res = if pretty {
        serde_json::to_string_pretty(v)
    } else {
        serde_json::to_string(v)
    };
    res.map_err(|e| SettingsDecodeError::Encode {
        inbound_id,
        message: e.to_string(),
    })
}

/// Updates for one inbound, deduplicated by email: first occurrence decides
/// the position, last occurrence decides the content.
fn dedup_updates<'a>(updates: impl Iterator<Item = &'a ClientConfigEntry>) -> Vec<&'a ClientConfigEntry> {
    let mut slot: BTreeMap<&str, usize> = BTreeMap::new();
    let mut out: Vec<&ClientConfigEntry> = Vec::new();
    for u in updates {
        match slot.get(u.email()) {
            Some(&i) => out[i] = u,
            None => {
                slot.insert(u.email(), out.len());
                out.push(u);
            }
        }
    }
    out
}

fn merge_inbound(
    inbound: &InboundRow,
    updates: &[&ClientConfigEntry],
) -> Result<Option<InboundRewrite>, SettingsDecodeError> {
    let Some(mut settings) = decode_settings(inbound)? else {
        return Ok(None);
    };
    let old_clients = client_values(inbound.id, &settings)?;

    let updated_emails: BTreeSet<&str> = updates.iter().map(|u| u.email()).collect();

    let mut new_clients: Vec<Value> = updates.iter().map(|u| u.to_value()).collect();
    new_clients.extend(
        old_clients
            .iter()
            .filter(|c| !value_email(c).is_some_and(|e| updated_emails.contains(e)))
            .cloned(),
    );

    let before = encode(inbound.id, &old_clients, false)?;
    let after = encode(inbound.id, &new_clients, false)?;
    if before == after {
        return Ok(None);
    }

    let limits_changed = updates.iter().any(|u| {
        let new_limits = (u.total_gb(), u.expiry_time());
        old_clients
            .iter()
            .find(|c| value_email(c) == Some(u.email()))
            .map_or(true, |old| limit_fields(old) != new_limits)
    });

    let clients = new_clients.len();
    settings.insert("clients".to_string(), Value::Array(new_clients));

    Ok(Some(InboundRewrite {
        inbound_id: inbound.id,
        settings: encode(inbound.id, &settings, true)?,
        limits_changed,
        clients,
    }))
}

/// Merge reconciled `updates` into the client lists of every allowed inbound.
///
/// Inbounds without updates are never dirty. Inbounds whose settings fail to
/// decode are reported in [`MergeOutcome::errors`] and skipped.
pub fn merge_client_lists(
    inbounds: &[InboundRow],
    allow: &ProtocolAllowList,
    updates: &[ClientConfigEntry],
) -> MergeOutcome {
    let mut out = MergeOutcome::default();

    for inbound in inbounds.iter().filter(|ib| allow.allows(&ib.protocol)) {
        let for_inbound = dedup_updates(updates.iter().filter(|u| u.inbound_id == inbound.id));
        if for_inbound.is_empty() {
            continue;
        }

        match merge_inbound(inbound, &for_inbound) {
            Ok(Some(rewrite)) => out.rewrites.push(rewrite),
            Ok(None) => {}
            Err(e) => out.errors.push(e),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GroupValues;
    use serde_json::json;

    fn entry(inbound_id: i64, v: Value) -> ClientConfigEntry {
        match v {
            Value::Object(map) => ClientConfigEntry::from_object(inbound_id, map).unwrap(),
            _ => panic!("entry must be an object"),
        }
    }

    fn clients_of(settings: &str) -> Vec<Value> {
        let v: Value = serde_json::from_str(settings).unwrap();
        v["clients"].as_array().unwrap().clone()
    }

    fn values(up: i64, down: i64, total: i64, expiry_time: i64) -> GroupValues {
        GroupValues {
            up,
            down,
            total,
            expiry_time,
        }
    }

    #[test]
    fn updated_first_then_untouched_in_original_order() {
        let settings = json!({
            "clients": [
                {"email": "x", "subId": ""},
                {"email": "a", "subId": "g", "up": 1},
                {"email": "y"},
                {"email": "b", "subId": "g", "up": 1},
            ],
            "decryption": "none"
        })
        .to_string();
        let inbounds = vec![InboundRow::new(1, "vless", settings)];

        let mut a = entry(1, json!({"email": "a", "subId": "g", "up": 1}));
        let mut b = entry(1, json!({"email": "b", "subId": "g", "up": 1}));
        a.apply(&values(5, 5, 0, 0));
        b.apply(&values(5, 5, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a, b]);
        assert_eq!(out.rewrites.len(), 1);
        let clients = clients_of(&out.rewrites[0].settings);
        let emails: Vec<&str> = clients.iter().map(|c| c["email"].as_str().unwrap()).collect();
        assert_eq!(emails, vec!["a", "b", "x", "y"]);
        assert_eq!(clients[0]["up"], json!(5));

        let full: Value = serde_json::from_str(&out.rewrites[0].settings).unwrap();
        assert_eq!(full["decryption"], json!("none"));
    }

    #[test]
    fn duplicate_updates_keep_first_slot_last_content() {
        let settings = json!({"clients": [{"email": "a"}, {"email": "z"}]}).to_string();
        let inbounds = vec![InboundRow::new(1, "vmess", settings)];

        let mut first = entry(1, json!({"email": "a"}));
        first.apply(&values(1, 1, 0, 0));
        let mut other = entry(1, json!({"email": "b"}));
        other.apply(&values(2, 2, 0, 0));
        let mut last = entry(1, json!({"email": "a"}));
        last.apply(&values(3, 3, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[first, other, last]);
        let clients = clients_of(&out.rewrites[0].settings);
        let got: Vec<(&str, i64)> = clients
            .iter()
            .map(|c| (c["email"].as_str().unwrap(), c["up"].as_i64().unwrap_or(-1)))
            .collect();
        assert_eq!(got, vec![("a", 3), ("b", 2), ("z", -1)]);
    }

    #[test]
    fn identical_content_is_not_dirty() {
        let settings = json!({"clients": [
            {"email": "a", "up": 5, "down": 5, "totalGB": 0, "expiryTime": 0}
        ]})
        .to_string();
        let inbounds = vec![InboundRow::new(1, "vless", settings)];
        let mut a = entry(1, json!({"email": "a", "up": 5, "down": 5, "totalGB": 0, "expiryTime": 0}));
        a.apply(&values(5, 5, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a]);
        assert!(!out.is_dirty());
        assert!(out.errors.is_empty());
    }

    #[test]
    fn updates_for_other_inbounds_do_not_touch_this_one() {
        let inbounds = vec![
            InboundRow::new(1, "vless", json!({"clients": [{"email": "a"}]}).to_string()),
            InboundRow::new(2, "vless", json!({"clients": [{"email": "a"}]}).to_string()),
        ];
        let mut a2 = entry(2, json!({"email": "a"}));
        a2.apply(&values(9, 9, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a2]);
        assert_eq!(out.rewrites.len(), 1);
        assert_eq!(out.rewrites[0].inbound_id, 2);
    }

    #[test]
    fn limit_change_is_flagged_usage_only_is_not() {
        let settings = json!({"clients": [
            {"email": "a", "up": 1, "down": 1, "totalGB": 100, "expiryTime": 0}
        ]})
        .to_string();
        let inbounds = vec![InboundRow::new(1, "vless", settings)];
        let base = json!({"email": "a", "up": 1, "down": 1, "totalGB": 100, "expiryTime": 0});

        let mut usage_only = entry(1, base.clone());
        usage_only.apply(&values(2, 2, 100, 0));
        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[usage_only]);
        assert!(out.is_dirty());
        assert!(!out.limits_changed());

        let mut new_cap = entry(1, base);
        new_cap.apply(&values(2, 2, 200, 0));
        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[new_cap]);
        assert!(out.limits_changed());
    }

    #[test]
    fn missing_limit_keys_read_as_zero() {
        let settings = json!({"clients": [{"email": "a", "subId": "g"}]}).to_string();
        let inbounds = vec![InboundRow::new(1, "vless", settings)];
        let mut a = entry(1, json!({"email": "a", "subId": "g"}));
        a.apply(&values(7, 3, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a]);
        assert!(out.is_dirty());
        assert!(!out.limits_changed());
    }

    #[test]
    fn float_encoded_limits_compare_by_value() {
        let settings = r#"{"clients": [{"email": "a", "up": 1, "totalGB": 1.5e3, "expiryTime": -8.64e7}]}"#;
        let inbounds = vec![InboundRow::new(1, "vless", settings)];
        let mut a = entry(1, json!({"email": "a", "up": 1, "totalGB": 1500, "expiryTime": -86400000}));
        a.apply(&values(2, 2, 1500, -86_400_000));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a]);
        assert!(out.is_dirty());
        assert!(!out.limits_changed());
    }

    #[test]
    fn broken_settings_reported_not_fatal() {
        let inbounds = vec![
            InboundRow::new(1, "vless", "{oops"),
            InboundRow::new(2, "vless", json!({"clients": [{"email": "b"}]}).to_string()),
        ];
        let mut a = entry(1, json!({"email": "a"}));
        a.apply(&values(1, 1, 0, 0));
        let mut b = entry(2, json!({"email": "b"}));
        b.apply(&values(1, 1, 0, 0));

        let out = merge_client_lists(&inbounds, &ProtocolAllowList::default(), &[a, b]);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.rewrites.len(), 1);
        assert_eq!(out.rewrites[0].inbound_id, 2);
    }
}
