//! The sleep loop around [`SyncCycle`].
//!
//! Cycles never overlap: the next one starts only after the previous one
//! returned and the wait elapsed. Shutdown is observed while waiting only,
//! so a cycle that has started always runs to completion.

use std::future::Future;
use std::time::Duration;

use subsync_config::IntervalSource;
use subsync_db::TrafficRepository;
use subsync_snapshot::SnapshotStore;
use tracing::{error, info, warn};

use crate::cycle::{CycleError, SyncCycle};
use crate::reload::ReloadTrigger;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub failed: u64,
}

/// How long to wait after a cycle with the given result.
pub fn next_wait(result: Result<(), &CycleError>, interval: Duration, error_backoff: Duration) -> Duration {
    match result {
        Ok(()) => interval,
        Err(e) if e.is_transient() => interval,
        Err(_) => error_backoff,
    }
}

/// Run cycles until `shutdown` resolves.
pub async fn run_loop<R, S, I, T, F>(
    cycle: &mut SyncCycle<R, S, I, T>,
    error_backoff: Duration,
    shutdown: F,
) -> RunSummary
where
    R: TrafficRepository,
    S: SnapshotStore,
    I: IntervalSource,
    T: ReloadTrigger,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut summary = RunSummary::default();

    loop {
        let result = cycle.run_cycle().await;
        summary.cycles += 1;

        let interval = cycle.interval_source().interval();
        let wait = match &result {
            Ok(_) => next_wait(Ok(()), interval, error_backoff),
            Err(e) => {
                summary.failed += 1;
                if e.is_transient() {
                    warn!(cycle = cycle.cycles(), stage = %e.stage, error = %e, "cycle abandoned");
                } else {
                    error!(cycle = cycle.cycles(), stage = %e.stage, error = %e, "cycle abandoned, backing off");
                }
                next_wait(Err(e), interval, error_backoff)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                info!(cycles = summary.cycles, failed = summary.failed, "shutdown requested, stopping");
                return summary;
            }
        }
    }
}
