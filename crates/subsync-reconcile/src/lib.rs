//! subsync-reconcile
//!
//! Subscription-group usage reconciliation.
//!
//! - Members of a group (same non-empty `subId`) converge on one usage total
//! - Usage only moves forward relative to the last persisted snapshot
//! - Counter resets never produce negative usage
//! - A group that did not advance produces no writes at all
//!
//! Deterministic, pure logic. No IO. No database calls.

mod engine;
pub mod merge;
pub mod settings;
mod types;

pub use engine::{derive_groups, post_reconcile_rows, reconcile, resolve_expiry, GroupCalc};
pub use merge::{merge_client_lists, InboundRewrite, MergeOutcome};
pub use settings::{extract_client_entries, SettingsDecodeError};
pub use types::*;
