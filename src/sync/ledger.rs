//! Durable sync-status bookkeeping for bulk trace items.
//!
//! Each item moves `unsynced -> syncing -> {synced | rejected | unsynced}`.
//! `rejected` is terminal: the server refused the item, or its payload could
//! not be decoded. Items left in `syncing` by a crash are returned to
//! `unsynced` by [`TraceSync::sweep_stale`].

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::EntityKind;
use crate::cache::{Clock, SqliteStore, Syncable, SystemClock};
use crate::error::{Result, SyncError};

use super::batch::{BatchSyncer, SliceReport};

/// Default age in seconds after which a `syncing` item is considered abandoned.
pub const DEFAULT_SYNCING_STALE_SECS: i64 = 300;

/// Default cap on items claimed per upload round.
pub const DEFAULT_CLAIM_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Unsynced,
  Syncing,
  Synced,
  Rejected,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Unsynced => "unsynced",
      Self::Syncing => "syncing",
      Self::Synced => "synced",
      Self::Rejected => "rejected",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "unsynced" => Some(Self::Unsynced),
      "syncing" => Some(Self::Syncing),
      "synced" => Some(Self::Synced),
      "rejected" => Some(Self::Rejected),
      _ => None,
    }
  }
}

/// One item tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
  pub id: i64,
  pub payload: Vec<u8>,
  pub status: SyncStatus,
  pub status_changed_at: DateTime<Utc>,
}

/// Number of items per status for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
  pub unsynced: usize,
  pub syncing: usize,
  pub synced: usize,
  pub rejected: usize,
}

/// Storage for trace items and their sync status.
pub trait TraceLedger: Send + Sync {
  /// Add a new `unsynced` item, returning its id.
  fn record(&self, kind: EntityKind, payload: Vec<u8>, now: DateTime<Utc>) -> Result<i64>;

  /// Atomically move up to `limit` of the oldest `unsynced` items to `syncing`.
  fn claim_unsynced(
    &self,
    kind: EntityKind,
    limit: usize,
    now: DateTime<Utc>,
  ) -> Result<Vec<TraceEntry>>;

  fn mark(&self, ids: &[i64], status: SyncStatus, now: DateTime<Utc>) -> Result<()>;

  /// Reset `syncing` items whose status changed before `cutoff`. Returns how many.
  fn reset_syncing_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize>;

  fn counts(&self, kind: EntityKind) -> Result<StatusCounts>;

  /// Forget items already delivered. Returns how many.
  fn prune_synced(&self, kind: EntityKind) -> Result<usize>;
}

impl TraceLedger for SqliteStore {
  fn record(&self, kind: EntityKind, payload: Vec<u8>, now: DateTime<Utc>) -> Result<i64> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO trace_ledger (kind, payload, sync_status, status_changed_at)
       VALUES (?, ?, ?, ?)",
      params![
        kind.tag(),
        payload,
        SyncStatus::Unsynced.as_str(),
        now.timestamp_millis()
      ],
    )?;
    Ok(conn.last_insert_rowid())
  }

  fn claim_unsynced(
    &self,
    kind: EntityKind,
    limit: usize,
    now: DateTime<Utc>,
  ) -> Result<Vec<TraceEntry>> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let mut claimed = Vec::new();
    {
      let mut stmt = tx.prepare(
        "SELECT id, payload FROM trace_ledger
         WHERE kind = ? AND sync_status = ?
         ORDER BY id
         LIMIT ?",
      )?;
      let rows = stmt.query_map(
        params![kind.tag(), SyncStatus::Unsynced.as_str(), limit as i64],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
      )?;
      for row in rows {
        let (id, payload) = row?;
        claimed.push(TraceEntry {
          id,
          payload,
          status: SyncStatus::Syncing,
          status_changed_at: now,
        });
      }
    }

    for entry in &claimed {
      tx.execute(
        "UPDATE trace_ledger SET sync_status = ?, status_changed_at = ? WHERE id = ?",
        params![
          SyncStatus::Syncing.as_str(),
          now.timestamp_millis(),
          entry.id
        ],
      )?;
    }
    tx.commit()?;

    Ok(claimed)
  }

  fn mark(&self, ids: &[i64], status: SyncStatus, now: DateTime<Utc>) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    for id in ids {
      tx.execute(
        "UPDATE trace_ledger SET sync_status = ?, status_changed_at = ? WHERE id = ?",
        params![status.as_str(), now.timestamp_millis(), id],
      )?;
    }
    tx.commit()?;
    Ok(())
  }

  fn reset_syncing_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.lock()?;
    let reset = conn.execute(
      "UPDATE trace_ledger SET sync_status = ?, status_changed_at = ?
       WHERE sync_status = ? AND status_changed_at < ?",
      params![
        SyncStatus::Unsynced.as_str(),
        now.timestamp_millis(),
        SyncStatus::Syncing.as_str(),
        cutoff.timestamp_millis()
      ],
    )?;
    Ok(reset)
  }

  fn counts(&self, kind: EntityKind) -> Result<StatusCounts> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT sync_status, COUNT(*) FROM trace_ledger WHERE kind = ? GROUP BY sync_status",
    )?;
    let rows = stmt.query_map(params![kind.tag()], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = StatusCounts::default();
    for row in rows {
      let (status, count) = row?;
      let count = count as usize;
      match SyncStatus::parse(&status) {
        Some(SyncStatus::Unsynced) => counts.unsynced = count,
        Some(SyncStatus::Syncing) => counts.syncing = count,
        Some(SyncStatus::Synced) => counts.synced = count,
        Some(SyncStatus::Rejected) => counts.rejected = count,
        None => return Err(SyncError::Io(format!("Unknown sync status '{}'", status))),
      }
    }
    Ok(counts)
  }

  fn prune_synced(&self, kind: EntityKind) -> Result<usize> {
    let conn = self.lock()?;
    let pruned = conn.execute(
      "DELETE FROM trace_ledger WHERE kind = ? AND sync_status = ?",
      params![kind.tag(), SyncStatus::Synced.as_str()],
    )?;
    Ok(pruned)
  }
}

/// Outcome of one [`TraceSync::sync_pending`] round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSyncReport {
  pub skipped_offline: bool,
  pub claimed: usize,
  pub synced: usize,
  /// Items returned to `unsynced` for the next round
  pub failed: usize,
  /// Items refused for good, never claimed again
  pub rejected: usize,
  pub renewed_token: Option<String>,
}

/// Upload driver tying the ledger to a [`BatchSyncer`].
pub struct TraceSync<L: TraceLedger> {
  ledger: Arc<L>,
  syncer: BatchSyncer,
  clock: Arc<dyn Clock>,
  stale_after: Duration,
  claim_limit: usize,
}

impl<L: TraceLedger> TraceSync<L> {
  pub fn new(ledger: Arc<L>, syncer: BatchSyncer) -> Self {
    Self {
      ledger,
      syncer,
      clock: Arc::new(SystemClock),
      stale_after: Duration::seconds(DEFAULT_SYNCING_STALE_SECS),
      claim_limit: DEFAULT_CLAIM_LIMIT,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn with_claim_limit(mut self, limit: usize) -> Self {
    self.claim_limit = limit.max(1);
    self
  }

  /// Queue a value for the next upload round.
  pub fn record<T: Syncable>(&self, value: &T) -> Result<i64> {
    self
      .ledger
      .record(T::kind(), value.encode()?, self.clock.now())
  }

  pub fn counts(&self, kind: EntityKind) -> Result<StatusCounts> {
    self.ledger.counts(kind)
  }

  pub fn prune_synced(&self, kind: EntityKind) -> Result<usize> {
    self.ledger.prune_synced(kind)
  }

  /// Return items stuck in `syncing` longer than the staleness window to `unsynced`.
  pub fn sweep_stale(&self) -> Result<usize> {
    let now = self.clock.now();
    let reset = self.ledger.reset_syncing_before(now - self.stale_after, now)?;
    if reset > 0 {
      info!(reset, "reset stale syncing items");
    }
    Ok(reset)
  }

  /// Claim unsynced items of `kind`, upload them, and record the result.
  pub async fn sync_pending(&self, kind: EntityKind) -> Result<TraceSyncReport> {
    if !self.syncer.is_connected().await {
      debug!(kind = %kind, "offline, traces stay unsynced");
      return Ok(TraceSyncReport {
        skipped_offline: true,
        ..TraceSyncReport::default()
      });
    }

    let entries = self
      .ledger
      .claim_unsynced(kind, self.claim_limit, self.clock.now())?;
    if entries.is_empty() {
      return Ok(TraceSyncReport::default());
    }

    let claimed = entries.len();
    let mut ids = Vec::with_capacity(claimed);
    let mut values = Vec::with_capacity(claimed);
    let mut undecodable = Vec::new();
    for entry in entries {
      match serde_json::from_slice::<serde_json::Value>(&entry.payload) {
        Ok(value) => {
          ids.push(entry.id);
          values.push(value);
        }
        Err(e) => {
          warn!(kind = %kind, id = entry.id, error = %e, "undecodable trace payload");
          undecodable.push(entry.id);
        }
      }
    }

    let outcome = self.syncer.sync(kind, &values).await;

    let mut synced = Vec::new();
    let mut failed = Vec::new();
    let mut rejected = undecodable;
    for slice in &outcome.slices {
      let slice_ids = slice.range.clone().map(|i| ids[i]);
      if slice.delivered {
        synced.extend(slice_ids);
      } else if is_terminal(slice) {
        warn!(
          kind = %kind,
          items = slice.range.len(),
          status = ?slice.status,
          "traces rejected, not retried"
        );
        rejected.extend(slice_ids);
      } else {
        failed.extend(slice_ids);
      }
    }
    if outcome.skipped_offline {
      // Connectivity dropped between the check and the upload
      failed.extend(ids.iter().copied());
    }

    let now = self.clock.now();
    self.ledger.mark(&synced, SyncStatus::Synced, now)?;
    self.ledger.mark(&rejected, SyncStatus::Rejected, now)?;
    self.ledger.mark(&failed, SyncStatus::Unsynced, now)?;

    Ok(TraceSyncReport {
      skipped_offline: outcome.skipped_offline,
      claimed,
      synced: synced.len(),
      failed: failed.len(),
      rejected: rejected.len(),
      renewed_token: outcome.renewed_token().map(String::from),
    })
  }
}

/// A 400 that was not split further, or any other status on a single item.
/// Transport failures carry no status and stay retryable.
fn is_terminal(slice: &SliceReport) -> bool {
  match slice.status {
    Some(400) => true,
    Some(_) => slice.range.len() <= 1,
    None => false,
  }
}
