//! Scenario: file-backed snapshot store.
//!
//! # Invariants under test
//!
//! 1. Missing file loads as the default snapshot.
//! 2. Corrupt or non-object content loads as the default snapshot.
//! 3. Save then load keeps every traffic field and the interval.
//! 4. The written file uses the `sec` / `clients` keys and the capitalized
//!    client field names, so files from earlier deployments stay loadable.
//! 5. Save creates missing parent directories and leaves no temp file.

use std::fs;
use std::time::Duration;

use serde_json::Value;
use subsync_reconcile::ClientTraffic;
use subsync_snapshot::{FileSnapshotStore, Snapshot, SnapshotStore};

const DEFAULT: Duration = Duration::from_secs(25);

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("localDB.json"), DEFAULT);
    assert_eq!(store.load(), Snapshot::empty(DEFAULT));
}

#[test]
fn corrupt_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("localDB.json");
    let store = FileSnapshotStore::new(&path, DEFAULT);

    fs::write(&path, "{\"sec\": 25, \"clients\": [").unwrap();
    assert_eq!(store.load(), Snapshot::empty(DEFAULT));

    fs::write(&path, "[1, 2, 3]").unwrap();
    assert_eq!(store.load(), Snapshot::empty(DEFAULT));
}

#[test]
fn save_then_load_keeps_rows_and_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("nested").join("localDB.json");
    let store = FileSnapshotStore::new(&path, DEFAULT);

    let mut disabled = ClientTraffic::new("b", 7, 8).with_total(10).with_inbound(2);
    disabled.enable = false;
    disabled.reset = 3;
    let snap = Snapshot {
        interval: Duration::from_secs(40),
        clients: vec![
            ClientTraffic::new("a", 200, 90)
                .with_total(500)
                .with_expiry(-5)
                .with_inbound(1),
            disabled,
        ],
    };

    store.save(&snap).unwrap();
    assert!(path.exists());
    assert!(!path.with_file_name("localDB.json.tmp").exists());
    assert_eq!(store.load(), snap);
}

#[test]
fn written_file_uses_legacy_key_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("localDB.json");
    let store = FileSnapshotStore::new(&path, DEFAULT);

    store
        .save(&Snapshot {
            interval: DEFAULT,
            clients: vec![ClientTraffic::new("a", 1, 2)],
        })
        .unwrap();

    let v: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(v["sec"], 25);
    let client = v["clients"][0].as_object().unwrap();
    let mut keys: Vec<&str> = client.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["Down", "Email", "Enable", "Expiry_Time", "Inbound_Id", "Reset", "Total", "Up"]
    );
}

#[test]
fn legacy_file_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("localDB.json");
    fs::write(
        &path,
        r#"{"clients": [{"Email": "a", "Up": 100, "Down": 50, "Total": 0,
            "Expiry_Time": 0, "Enable": true, "Inbound_Id": 1, "Reset": 0}], "sec": 25.0}"#,
    )
    .unwrap();

    let snap = FileSnapshotStore::new(&path, Duration::from_secs(1)).load();
    assert_eq!(snap.interval, DEFAULT);
    assert_eq!(snap.baseline()["a"].up, 100);
}
