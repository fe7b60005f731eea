//! One sync cycle:
//!
//! `FETCH -> RECONCILE -> WRITE_TRAFFIC -> WRITE_CONFIG -> PERSIST_SNAPSHOT -> RELOAD`
//!
//! The cycle owns no state across runs except its counter. The snapshot is
//! loaded at the start and replaced wholesale at the end, after the database
//! writes went through. A failed traffic write leaves the old baseline in
//! place and the next cycle recomputes from a fresh fetch. A failed config
//! write after committed traffic rows still saves the new baseline, so the
//! next cycle does not count those rows again.

use std::fmt;

use chrono::{DateTime, Utc};
use subsync_config::{IntervalSource, ReloadPolicy};
use subsync_db::TrafficRepository;
use subsync_reconcile::{
    derive_groups, extract_client_entries, merge_client_lists, post_reconcile_rows, reconcile,
    ClientTraffic, InboundRow, MergeOutcome, ProtocolAllowList, ReconcileOutcome,
    SettingsDecodeError,
};
use subsync_snapshot::{Snapshot, SnapshotStore};
use tracing::{debug, error, info, warn};

use crate::reload::ReloadTrigger;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStage {
    Fetch,
    WriteTraffic,
    WriteConfig,
    PersistSnapshot,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::Fetch => "FETCH",
            CycleStage::WriteTraffic => "WRITE_TRAFFIC",
            CycleStage::WriteConfig => "WRITE_CONFIG",
            CycleStage::PersistSnapshot => "PERSIST_SNAPSHOT",
        }
    }

    /// Database-side failures clear up on their own (lock, restart of the
    /// panel). Local state failures get the error backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CycleStage::PersistSnapshot)
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cycle abandoned at `stage`.
#[derive(Debug)]
pub struct CycleError {
    pub stage: CycleStage,
    pub source: anyhow::Error,
}

impl CycleError {
    pub fn new(stage: CycleStage, source: anyhow::Error) -> Self {
        Self { stage, source }
    }

    pub fn is_transient(&self) -> bool {
        self.stage.is_transient()
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.stage, self.source)
    }
}

// Display already carries the cause chain.
impl std::error::Error for CycleError {}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No inbound was rewritten.
    NotNeeded,
    /// Inbounds were rewritten but the policy said not to reload.
    SuppressedByPolicy(ReloadPolicy),
    Triggered,
    /// The reload hook failed; the cycle itself still counts as done.
    Failed(String),
    DryRun,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub traffic_rows_written: u64,
    pub inbounds_written: u64,
    pub synced_groups: usize,
    pub unchanged_groups: usize,
    pub skipped_groups: usize,
    pub decode_errors: usize,
    /// Rows recorded in the new snapshot.
    pub snapshot_clients: usize,
    pub reload: ReloadOutcome,
}

/// What FETCH and RECONCILE produced. Nothing has been written yet.
#[derive(Clone, Debug)]
pub struct CyclePlan {
    pub current: Vec<ClientTraffic>,
    pub inbounds: Vec<InboundRow>,
    pub reconcile: ReconcileOutcome,
    pub merge: MergeOutcome,
    pub decode_errors: Vec<SettingsDecodeError>,
}

impl CyclePlan {
    /// Traffic table contents once the planned writes are applied.
    pub fn post_write_rows(&self) -> Vec<ClientTraffic> {
        post_reconcile_rows(&self.current, &self.reconcile.traffic_updates)
    }
}

// ---------------------------------------------------------------------------
// SyncCycle
// ---------------------------------------------------------------------------

pub struct SyncCycle<R, S, I, T> {
    repo: R,
    snapshots: S,
    interval: I,
    reload: T,
    protocols: ProtocolAllowList,
    policy: ReloadPolicy,
    dry_run: bool,
    cycle: u64,
}

impl<R, S, I, T> SyncCycle<R, S, I, T>
where
    R: TrafficRepository,
    S: SnapshotStore,
    I: IntervalSource,
    T: ReloadTrigger,
{
    pub fn new(repo: R, snapshots: S, interval: I, reload: T) -> Self {
        Self {
            repo,
            snapshots,
            interval,
            reload,
            protocols: ProtocolAllowList::default(),
            policy: ReloadPolicy::default(),
            dry_run: false,
            cycle: 0,
        }
    }

    pub fn with_protocols(mut self, protocols: ProtocolAllowList) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_policy(mut self, policy: ReloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Plan and log only: no database writes, no snapshot, no reload.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn interval_source(&self) -> &I {
        &self.interval
    }

    /// FETCH + RECONCILE.
    pub async fn plan(&self) -> Result<CyclePlan, CycleError> {
        let snapshot = self.snapshots.load();
        let current = self
            .repo
            .fetch_client_traffics()
            .await
            .map_err(|e| CycleError::new(CycleStage::Fetch, e))?;
        let inbounds = self
            .repo
            .fetch_inbounds()
            .await
            .map_err(|e| CycleError::new(CycleStage::Fetch, e))?;
        debug!(
            traffic_rows = current.len(),
            inbounds = inbounds.len(),
            snapshot_clients = snapshot.clients.len(),
            "fetched"
        );

        let (entries, decode_errors) = extract_client_entries(&inbounds, &self.protocols);
        let groups = derive_groups(&entries);
        let outcome = reconcile(&current, &groups, &snapshot.baseline());
        let merge = merge_client_lists(&inbounds, &self.protocols, &outcome.config_updates);

        Ok(CyclePlan {
            current,
            inbounds,
            reconcile: outcome,
            merge,
            decode_errors,
        })
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let started_at = Utc::now();

        let plan = self.plan().await?;
        log_plan(cycle, &plan);

        let mut report = CycleReport {
            cycle,
            started_at,
            dry_run: self.dry_run,
            traffic_rows_written: 0,
            inbounds_written: 0,
            synced_groups: plan.reconcile.synced.len(),
            unchanged_groups: plan.reconcile.unchanged.len(),
            skipped_groups: plan.reconcile.skipped.len(),
            decode_errors: plan.decode_errors.len() + plan.merge.errors.len(),
            snapshot_clients: 0,
            reload: ReloadOutcome::NotNeeded,
        };

        if self.dry_run {
            info!(
                cycle,
                traffic_updates = plan.reconcile.traffic_updates.len(),
                inbound_rewrites = plan.merge.rewrites.len(),
                "dry run: nothing written"
            );
            report.reload = ReloadOutcome::DryRun;
            return Ok(report);
        }

        if !plan.reconcile.traffic_updates.is_empty() {
            report.traffic_rows_written = self
                .repo
                .update_client_traffics(&plan.reconcile.traffic_updates)
                .await
                .map_err(|e| CycleError::new(CycleStage::WriteTraffic, e))?;
        }

        let snapshot = Snapshot {
            interval: self.interval.interval(),
            clients: plan.post_write_rows(),
        };

        if plan.merge.is_dirty() {
            match self.repo.update_inbounds(&plan.merge.updates()).await {
                Ok(n) => report.inbounds_written = n,
                Err(e) => {
                    // Traffic rows are committed; the baseline must follow them.
                    if report.traffic_rows_written > 0 {
                        if let Err(save_err) = self.snapshots.save(&snapshot) {
                            error!(
                                cycle,
                                error = %format!("{save_err:#}"),
                                "snapshot save after config write failure failed"
                            );
                        }
                    }
                    return Err(CycleError::new(CycleStage::WriteConfig, e));
                }
            }
        }

        self.snapshots
            .save(&snapshot)
            .map_err(|e| CycleError::new(CycleStage::PersistSnapshot, e))?;
        report.snapshot_clients = snapshot.clients.len();

        report.reload = if !plan.merge.is_dirty() {
            ReloadOutcome::NotNeeded
        } else if !self
            .policy
            .should_reload(plan.merge.is_dirty(), plan.merge.limits_changed())
        {
            info!(cycle, policy = self.policy.as_str(), "reload suppressed by policy");
            ReloadOutcome::SuppressedByPolicy(self.policy)
        } else {
            match self.reload.reload().await {
                Ok(()) => ReloadOutcome::Triggered,
                Err(e) => {
                    error!(cycle, error = %format!("{e:#}"), "panel reload failed");
                    ReloadOutcome::Failed(format!("{e:#}"))
                }
            }
        };

        info!(
            cycle,
            traffic_rows = report.traffic_rows_written,
            inbounds = report.inbounds_written,
            synced = report.synced_groups,
            "cycle complete"
        );
        Ok(report)
    }
}

fn log_plan(cycle: u64, plan: &CyclePlan) {
    for e in plan.decode_errors.iter().chain(plan.merge.errors.iter()) {
        warn!(cycle, error = %e, "inbound settings skipped");
    }
    for s in &plan.reconcile.skipped {
        warn!(cycle, sub_id = %s.sub_id, reason = ?s.reason, "group skipped");
    }
    for g in &plan.reconcile.synced {
        info!(
            cycle,
            sub_id = %g.sub_id,
            members = g.members,
            up = g.values.up,
            down = g.values.down,
            delta_up = g.delta_up,
            delta_down = g.delta_down,
            "group synced"
        );
    }
    for r in &plan.merge.rewrites {
        debug!(
            cycle,
            inbound_id = r.inbound_id,
            clients = r.clients,
            limits_changed = r.limits_changed,
            "inbound rewrite planned"
        );
    }
}
