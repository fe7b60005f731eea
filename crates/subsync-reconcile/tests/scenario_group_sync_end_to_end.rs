//! Scenario: two emails in one subscription group, one of them advanced.
//!
//! # Invariants under test
//!
//! 1. `new = max + sum(forward deltas)` for both directions.
//! 2. Every traffic row and every config entry of the group carries the same
//!    Up / Down / Total / ExpiryTime afterwards.
//! 3. Groups that did not advance produce no writes.
//! 4. Entries without a `subId` are never grouped or written.
//!
//! All tests are pure in-process; no DB or filesystem required.

use serde_json::json;
use subsync_reconcile::*;

fn inbound_with(id: i64, clients: serde_json::Value) -> InboundRow {
    InboundRow::new(id, "vless", json!({ "clients": clients }).to_string())
}

fn baseline(entries: &[(&str, i64, i64)]) -> Baseline {
    entries
        .iter()
        .map(|(e, up, down)| (e.to_string(), UsageBaseline { up: *up, down: *down }))
        .collect()
}

#[test]
fn advanced_member_is_propagated_to_whole_group() {
    let inbounds = vec![inbound_with(
        1,
        json!([
            {"email": "a", "subId": "g1", "totalGB": 500, "expiryTime": 0},
            {"email": "b", "subId": "g1", "totalGB": 500, "expiryTime": 0},
        ]),
    )];
    let current = vec![
        ClientTraffic::new("a", 150, 70).with_total(500).with_inbound(1),
        ClientTraffic::new("b", 100, 50).with_total(500).with_inbound(1),
    ];
    let prior = baseline(&[("a", 100, 50), ("b", 100, 50)]);

    let (entries, errors) = extract_client_entries(&inbounds, &ProtocolAllowList::default());
    assert!(errors.is_empty());
    let groups = derive_groups(&entries);
    let out = reconcile(&current, &groups, &prior);

    assert_eq!(out.synced.len(), 1);
    let sync = &out.synced[0];
    assert_eq!(sync.sub_id, "g1");
    assert_eq!(sync.delta_up, 50);
    assert_eq!(sync.delta_down, 20);
    assert_eq!(
        sync.values,
        GroupValues {
            up: 200,
            down: 90,
            total: 500,
            expiry_time: 0
        }
    );

    assert_eq!(out.traffic_updates.len(), 2);
    for row in &out.traffic_updates {
        assert_eq!((row.up, row.down, row.total, row.expiry_time), (200, 90, 500, 0));
        assert_eq!(row.sub_id.as_deref(), Some("g1"));
    }

    assert_eq!(out.config_updates.len(), 2);
    for entry in &out.config_updates {
        assert_eq!(
            (entry.up(), entry.down(), entry.total_gb(), entry.expiry_time()),
            (200, 90, 500, 0)
        );
    }
}

#[test]
fn group_limits_take_max_total_and_resolved_expiry() {
    let inbounds = vec![inbound_with(
        1,
        json!([
            {"email": "a", "subId": "g"},
            {"email": "b", "subId": "g"},
            {"email": "c", "subId": "g"},
        ]),
    )];
    let current = vec![
        ClientTraffic::new("a", 11, 0).with_total(100).with_expiry(100),
        ClientTraffic::new("b", 10, 0).with_total(300).with_expiry(-5),
        ClientTraffic::new("c", 10, 0).with_total(200).with_expiry(0),
    ];
    let prior = baseline(&[("a", 10, 0), ("b", 10, 0), ("c", 10, 0)]);

    let (entries, _) = extract_client_entries(&inbounds, &ProtocolAllowList::default());
    let out = reconcile(&current, &derive_groups(&entries), &prior);

    let values = out.synced[0].values;
    assert_eq!(values.total, 300);
    assert_eq!(values.expiry_time, 100);
    assert_eq!(values.up, 12);
    for row in &out.traffic_updates {
        assert_eq!((row.up, row.down, row.total, row.expiry_time), (12, 0, 300, 100));
    }
}

#[test]
fn untouched_and_ungrouped_clients_produce_no_writes() {
    let inbounds = vec![inbound_with(
        1,
        json!([
            {"email": "a", "subId": "g1"},
            {"email": "b", "subId": "g1"},
            {"email": "solo"},
            {"email": "c", "subId": "g2"},
        ]),
    )];
    let current = vec![
        ClientTraffic::new("a", 100, 50),
        ClientTraffic::new("b", 100, 50),
        ClientTraffic::new("solo", 999, 999),
        ClientTraffic::new("c", 20, 0),
    ];
    let prior = baseline(&[("a", 100, 50), ("b", 100, 50), ("solo", 1, 1), ("c", 10, 0)]);

    let (entries, _) = extract_client_entries(&inbounds, &ProtocolAllowList::default());
    let out = reconcile(&current, &derive_groups(&entries), &prior);

    assert_eq!(out.unchanged, vec!["g1".to_string()]);
    assert_eq!(out.synced.len(), 1);
    assert_eq!(out.synced[0].sub_id, "g2");
    assert!(out.traffic_updates.iter().all(|r| r.email == "c"));
    assert!(out.config_updates.iter().all(|e| e.email() == "c"));
}

#[test]
fn group_without_traffic_rows_is_skipped() {
    let inbounds = vec![inbound_with(1, json!([{"email": "ghost", "subId": "g9"}]))];
    let (entries, _) = extract_client_entries(&inbounds, &ProtocolAllowList::default());
    let out = reconcile(&[], &derive_groups(&entries), &Baseline::new());

    assert!(out.is_noop());
    assert_eq!(
        out.skipped,
        vec![SkippedGroup {
            sub_id: "g9".to_string(),
            reason: SkipReason::NoTrafficRows
        }]
    );
}
