//! subsync-daemon library target.
//!
//! The sync cycle, its run loop and the reload hook. The binary `main.rs`
//! only wires configuration into these; scenario tests drive them through
//! `subsync-testkit`.

pub mod cycle;
pub mod reload;
pub mod runner;

pub use cycle::{CycleError, CyclePlan, CycleReport, CycleStage, ReloadOutcome, SyncCycle};
pub use reload::{CommandReloadTrigger, ReloadTrigger};
pub use runner::{next_wait, run_loop, RunSummary};
