//! In-memory collaborators for driving [`subsync_daemon::SyncCycle`] in
//! scenario tests.
//!
//! Every fake is a cheap `Clone` over shared state: hand one clone to the
//! cycle, keep another to inspect what happened.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use subsync_config::IntervalSource;
use subsync_daemon::{ReloadTrigger, SyncCycle};
use subsync_db::TrafficRepository;
use subsync_reconcile::{ClientTraffic, InboundRow, InboundSettingsUpdate};
use subsync_snapshot::{Snapshot, SnapshotStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Traffic repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RepoState {
    inbounds: Vec<InboundRow>,
    traffics: Vec<ClientTraffic>,
    fail_fetch: bool,
    fail_update_traffic: bool,
    fail_update_inbounds: bool,
    traffic_writes: usize,
    inbound_writes: usize,
}

/// Panel database held in memory. Updates follow the SQL semantics of the
/// real repository: traffic by email, inbounds by id.
#[derive(Clone, Debug, Default)]
pub struct MemoryTrafficRepository {
    state: Arc<Mutex<RepoState>>,
}

impl MemoryTrafficRepository {
    pub fn new(inbounds: Vec<InboundRow>, traffics: Vec<ClientTraffic>) -> Self {
        let repo = Self::default();
        {
            let mut st = lock(&repo.state);
            st.inbounds = inbounds;
            st.traffics = traffics;
        }
        repo
    }

    pub fn inbounds(&self) -> Vec<InboundRow> {
        lock(&self.state).inbounds.clone()
    }

    pub fn traffics(&self) -> Vec<ClientTraffic> {
        lock(&self.state).traffics.clone()
    }

    pub fn traffic(&self, email: &str) -> Option<ClientTraffic> {
        lock(&self.state)
            .traffics
            .iter()
            .find(|t| t.email == email)
            .cloned()
    }

    /// Parsed `settings.clients` of one inbound.
    pub fn clients_of(&self, inbound_id: i64) -> Vec<Value> {
        lock(&self.state)
            .inbounds
            .iter()
            .find(|ib| ib.id == inbound_id)
            .and_then(|ib| ib.settings.as_deref())
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| v.get("clients").and_then(Value::as_array).cloned())
            .unwrap_or_default()
    }

    /// Simulate panel-side activity between cycles.
    pub fn set_usage(&self, email: &str, up: i64, down: i64) {
        let mut st = lock(&self.state);
        if let Some(t) = st.traffics.iter_mut().find(|t| t.email == email) {
            t.up = up;
            t.down = down;
        }
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        lock(&self.state).fail_fetch = fail;
    }

    pub fn set_fail_update_traffic(&self, fail: bool) {
        lock(&self.state).fail_update_traffic = fail;
    }

    pub fn set_fail_update_inbounds(&self, fail: bool) {
        lock(&self.state).fail_update_inbounds = fail;
    }

    /// Calls to `update_client_traffics` / `update_inbounds` that went through.
    pub fn write_calls(&self) -> (usize, usize) {
        let st = lock(&self.state);
        (st.traffic_writes, st.inbound_writes)
    }
}

#[async_trait]
impl TrafficRepository for MemoryTrafficRepository {
    async fn fetch_inbounds(&self) -> Result<Vec<InboundRow>> {
        let st = lock(&self.state);
        if st.fail_fetch {
            bail!("fetch_inbounds failed: database is locked");
        }
        Ok(st.inbounds.clone())
    }

    async fn fetch_client_traffics(&self) -> Result<Vec<ClientTraffic>> {
        let st = lock(&self.state);
        if st.fail_fetch {
            bail!("fetch_client_traffics failed: database is locked");
        }
        Ok(st
            .traffics
            .iter()
            .cloned()
            .map(|mut t| {
                t.sub_id = None;
                t
            })
            .collect())
    }

    async fn update_client_traffics(&self, rows: &[ClientTraffic]) -> Result<u64> {
        let mut st = lock(&self.state);
        if st.fail_update_traffic {
            bail!("update client_traffics failed: disk I/O error");
        }
        let mut affected = 0;
        for row in rows {
            for t in st.traffics.iter_mut().filter(|t| t.email == row.email) {
                let mut stored = row.clone();
                stored.sub_id = None;
                *t = stored;
                affected += 1;
            }
        }
        st.traffic_writes += 1;
        Ok(affected)
    }

    async fn update_inbounds(&self, rows: &[InboundSettingsUpdate]) -> Result<u64> {
        let mut st = lock(&self.state);
        if st.fail_update_inbounds {
            bail!("update inbounds failed: disk I/O error");
        }
        let mut affected = 0;
        for row in rows {
            if let Some(ib) = st.inbounds.iter_mut().find(|ib| ib.id == row.id) {
                ib.settings = Some(row.settings.clone());
                affected += 1;
            }
        }
        st.inbound_writes += 1;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SnapshotState {
    current: Snapshot,
    saves: usize,
    fail_save: bool,
}

#[derive(Clone, Debug)]
pub struct MemorySnapshotStore {
    state: Arc<Mutex<SnapshotState>>,
}

impl MemorySnapshotStore {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(SnapshotState {
                current: initial,
                saves: 0,
                fail_save: false,
            })),
        }
    }

    pub fn empty() -> Self {
        Self::new(Snapshot::empty(Duration::from_secs(25)))
    }

    pub fn current(&self) -> Snapshot {
        lock(&self.state).current.clone()
    }

    pub fn saves(&self) -> usize {
        lock(&self.state).saves
    }

    pub fn set_fail_save(&self, fail: bool) {
        lock(&self.state).fail_save = fail;
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Snapshot {
        lock(&self.state).current.clone()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut st = lock(&self.state);
        if st.fail_save {
            bail!("write snapshot failed: read-only file system");
        }
        st.current = snapshot.clone();
        st.saves += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reload trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReloadState {
    calls: usize,
    fail: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RecordingReloadTrigger {
    state: Arc<Mutex<ReloadState>>,
}

impl RecordingReloadTrigger {
    pub fn failing() -> Self {
        let t = Self::default();
        t.set_fail(true);
        t
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).calls
    }

    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

#[async_trait]
impl ReloadTrigger for RecordingReloadTrigger {
    async fn reload(&self) -> Result<()> {
        let mut st = lock(&self.state);
        st.calls += 1;
        if st.fail {
            bail!("reload command `systemctl restart x-ui` exited with exit status: 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct FixedInterval(pub Duration);

impl IntervalSource for FixedInterval {
    fn interval(&self) -> Duration {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub type TestCycle =
    SyncCycle<MemoryTrafficRepository, MemorySnapshotStore, FixedInterval, RecordingReloadTrigger>;

/// All fakes of one scenario plus the cycle wired to them.
pub struct Harness {
    pub repo: MemoryTrafficRepository,
    pub snapshots: MemorySnapshotStore,
    pub reload: RecordingReloadTrigger,
    pub cycle: TestCycle,
}

impl Harness {
    pub fn new(repo: MemoryTrafficRepository, snapshots: MemorySnapshotStore) -> Self {
        let reload = RecordingReloadTrigger::default();
        let cycle = SyncCycle::new(
            repo.clone(),
            snapshots.clone(),
            FixedInterval(Duration::from_secs(25)),
            reload.clone(),
        );
        Self {
            repo,
            snapshots,
            reload,
            cycle,
        }
    }

    pub fn map_cycle(mut self, f: impl FnOnce(TestCycle) -> TestCycle) -> Self {
        self.cycle = f(self.cycle);
        self
    }
}

/// Minimal inbound settings JSON for the given client objects.
pub fn settings_json(clients: Vec<Value>) -> String {
    serde_json::json!({
        "clients": clients,
        "decryption": "none",
        "fallbacks": []
    })
    .to_string()
}
