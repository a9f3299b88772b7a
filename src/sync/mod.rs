//! Write-behind delivery of local mutations.
//!
//! - [`PendingQueue`] replays queued creates/updates/deletes one record at a time
//! - [`BatchSyncer`] uploads append-only data in bulk, bisecting on 400
//! - [`TraceSync`] tracks per-item sync status for bulk uploads
//! - [`Reachability`] gates every network attempt

mod batch;
mod ledger;
mod queue;
mod reachability;

pub use batch::{BatchOutcome, BatchSyncer, SliceReport, DEFAULT_SPLIT_THRESHOLD};
pub use ledger::{
  StatusCounts, SyncStatus, TraceEntry, TraceLedger, TraceSync, TraceSyncReport,
  DEFAULT_CLAIM_LIMIT, DEFAULT_SYNCING_STALE_SECS,
};
pub use queue::{DrainFailure, DrainReport, PendingOp, PendingQueue};
pub use reachability::{Reachability, StaticReachability, TcpProbe};
