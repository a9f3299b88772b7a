//! Write-behind queue of local mutations awaiting delivery.

use chrono::{DateTime, Duration, Utc};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{EntityKind, RemoteApi, RemoteResponse, SlotPolicy};
use crate::cache::{CachedRecord, Clock, Mutation, RecordStore, Syncable, SystemClock};
use crate::error::{Result, SyncError};

use super::reachability::Reachability;

/// The two independent pending sub-flows per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingOp {
  /// Create or update
  Post,
  Delete,
}

impl PendingOp {
  pub const ALL: [PendingOp; 2] = [PendingOp::Post, PendingOp::Delete];

  pub fn suffix(&self) -> &'static str {
    match self {
      Self::Post => "Post",
      Self::Delete => "Delete",
    }
  }
}

/// A pending record the remote did not accept this round.
#[derive(Debug)]
pub struct DrainFailure {
  pub record_id: i64,
  pub error: SyncError,
}

/// Outcome of one drain of a pending tag.
///
/// Produced once after every item has been attempted; individual items
/// succeed or fail independently.
#[derive(Debug)]
pub struct DrainReport {
  pub kind: EntityKind,
  pub op: PendingOp,
  /// Gate reported offline, nothing attempted
  pub skipped_offline: bool,
  pub attempted: usize,
  /// Ids of records confirmed by the remote and removed locally
  pub delivered: Vec<i64>,
  pub failures: Vec<DrainFailure>,
  /// Last rotated token seen during the drain
  pub renewed_token: Option<String>,
}

impl DrainReport {
  fn new(kind: EntityKind, op: PendingOp) -> Self {
    Self {
      kind,
      op,
      skipped_offline: false,
      attempted: 0,
      delivered: Vec::new(),
      failures: Vec::new(),
      renewed_token: None,
    }
  }

  pub fn is_clean(&self) -> bool {
    !self.skipped_offline && self.failures.is_empty()
  }
}

/// Durable queue of creates/updates/deletes replayed against the remote API.
pub struct PendingQueue<S: RecordStore> {
  store: Arc<S>,
  remote: Arc<dyn RemoteApi>,
  gate: Arc<dyn Reachability>,
  clock: Arc<dyn Clock>,
  concurrency: usize,
}

impl<S: RecordStore> PendingQueue<S> {
  pub fn new(store: Arc<S>, remote: Arc<dyn RemoteApi>, gate: Arc<dyn Reachability>) -> Self {
    Self {
      store,
      remote,
      gate,
      clock: Arc::new(SystemClock),
      concurrency: 4,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Maximum number of deliveries in flight during a drain.
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// Record a create/update locally, then try to deliver it.
  ///
  /// Returns an error only if the local write failed; delivery problems
  /// are reported in the [`DrainReport`] and the item stays queued.
  pub async fn enqueue_post<T: Syncable>(&self, value: &T, ttl: Duration) -> Result<DrainReport> {
    self.stage_post(value, ttl)?;
    Ok(self.check_for_unsynced(T::kind()).await)
  }

  /// Record a delete locally, then try to deliver it.
  pub async fn enqueue_delete<T: Syncable>(&self, id: &str) -> Result<DrainReport> {
    self.stage_delete::<T>(id)?;
    Ok(self.check_for_unsynced_deletes(T::kind()).await)
  }

  /// Durably record a create/update and refresh the local cache.
  pub fn stage_post<T: Syncable>(&self, value: &T, ttl: Duration) -> Result<()> {
    let kind = T::kind();
    let tag = kind.tag();
    let post_tag = kind.pending_tag(PendingOp::Post);
    let now = self.clock.now();
    let work_item = value.encode()?;

    let mutations = match kind.slot_policy() {
      SlotPolicy::SingleSlot => vec![
        Mutation::delete_all(tag),
        Mutation::delete_all(&post_tag),
        Mutation::put(tag, T::encode_list(std::slice::from_ref(value))?, Some(now + ttl)),
        Mutation::put(&post_tag, work_item, None),
      ],
      SlotPolicy::AppendOnly => {
        let (mut values, expires_at) = self.cached_values::<T>(tag, now);
        values.push(value.clone());
        vec![
          Mutation::delete_all(tag),
          Mutation::put(tag, T::encode_list(&values)?, Some(expires_at)),
          Mutation::put(&post_tag, work_item, None),
        ]
      }
    };

    self.store.apply(&mutations)?;
    debug!(kind = %kind, "staged pending post");
    Ok(())
  }

  /// Durably record a delete and drop the value from the local cache.
  pub fn stage_delete<T: Syncable>(&self, id: &str) -> Result<()> {
    let kind = T::kind();
    let tag = kind.tag();
    let now = self.clock.now();

    let mut mutations = vec![Mutation::delete_all(tag)];
    if kind.slot_policy() == SlotPolicy::AppendOnly {
      let (values, expires_at) = self.cached_values::<T>(tag, now);
      let kept: Vec<T> = values
        .into_iter()
        .filter(|v| v.remote_id().as_deref() != Some(id))
        .collect();
      mutations.push(Mutation::put(tag, T::encode_list(&kept)?, Some(expires_at)));
    }
    mutations.push(Mutation::put(
      &kind.pending_tag(PendingOp::Delete),
      id.as_bytes().to_vec(),
      None,
    ));

    self.store.apply(&mutations)?;
    debug!(kind = %kind, id, "staged pending delete");
    Ok(())
  }

  /// Drain pending creates/updates for `kind`.
  pub async fn check_for_unsynced(&self, kind: EntityKind) -> DrainReport {
    self.drain(kind, PendingOp::Post).await
  }

  /// Drain pending deletes for `kind`.
  pub async fn check_for_unsynced_deletes(&self, kind: EntityKind) -> DrainReport {
    self.drain(kind, PendingOp::Delete).await
  }

  /// Drain every pending tag of every kind.
  pub async fn drain_all(&self) -> Vec<DrainReport> {
    let mut reports = Vec::new();
    for kind in EntityKind::ALL {
      for op in PendingOp::ALL {
        reports.push(self.drain(kind, op).await);
      }
    }
    reports
  }

  /// Attempt delivery of every pending record under `kind`/`op`.
  pub async fn drain(&self, kind: EntityKind, op: PendingOp) -> DrainReport {
    let mut report = DrainReport::new(kind, op);

    if !self.gate.is_connected().await {
      debug!(kind = %kind, op = op.suffix(), "offline, leaving pending items queued");
      report.skipped_offline = true;
      return report;
    }

    let now = self.clock.now();
    let items: Vec<CachedRecord> = match self.store.query(&kind.pending_tag(op)) {
      Ok(records) => records.into_iter().filter(|r| r.is_live_at(now)).collect(),
      Err(e) => {
        warn!(kind = %kind, op = op.suffix(), error = %e, "could not read pending queue");
        return report;
      }
    };

    if items.is_empty() {
      return report;
    }
    report.attempted = items.len();

    let outcomes: Vec<(CachedRecord, Result<RemoteResponse>)> = stream::iter(items)
      .map(|record| async move {
        let result = self.deliver(kind, op, &record).await;
        (record, result)
      })
      .buffered(self.concurrency)
      .collect()
      .await;

    for (record, result) in outcomes {
      match result {
        Ok(response) => {
          // The remote has the mutation; a failed local delete only means a
          // harmless resend next drain
          if let Err(e) = self.store.delete(&record) {
            warn!(kind = %kind, id = record.id, error = %e, "delivered but could not dequeue");
          }
          if response.renewed_token.is_some() {
            report.renewed_token = response.renewed_token;
          }
          report.delivered.push(record.id);
        }
        Err(error) => {
          warn!(kind = %kind, op = op.suffix(), id = record.id, error = %error, "delivery failed, keeping item queued");
          report.failures.push(DrainFailure {
            record_id: record.id,
            error,
          });
        }
      }
    }

    info!(
      kind = %kind,
      op = op.suffix(),
      attempted = report.attempted,
      delivered = report.delivered.len(),
      failed = report.failures.len(),
      "drain finished"
    );
    report
  }

  /// Pending records under `kind`/`op`, in insertion order.
  pub fn pending(&self, kind: EntityKind, op: PendingOp) -> Result<Vec<CachedRecord>> {
    self.store.query(&kind.pending_tag(op))
  }

  pub fn pending_count(&self, kind: EntityKind, op: PendingOp) -> Result<usize> {
    self.store.count(&kind.pending_tag(op))
  }

  /// Give up on a single pending record without delivering it.
  pub fn abandon(&self, record: &CachedRecord) -> Result<()> {
    warn!(tag = %record.type_tag, id = record.id, "abandoning pending record");
    self.store.delete(record)
  }

  /// Give up on every pending record under `kind`/`op`. Returns how many were dropped.
  pub fn abandon_all(&self, kind: EntityKind, op: PendingOp) -> Result<usize> {
    let tag = kind.pending_tag(op);
    let count = self.store.count(&tag)?;
    self.store.delete_all(&tag)?;
    warn!(tag = %tag, count, "abandoned pending records");
    Ok(count)
  }

  async fn deliver(
    &self,
    kind: EntityKind,
    op: PendingOp,
    record: &CachedRecord,
  ) -> Result<RemoteResponse> {
    match op {
      PendingOp::Post => {
        // Reject corrupt payloads before they reach the wire
        serde_json::from_slice::<serde_json::Value>(&record.payload)?;
        self
          .remote
          .create(kind, record.payload.clone())
          .await?
          .into_result()
      }
      PendingOp::Delete => {
        let id = std::str::from_utf8(&record.payload)
          .map_err(|e| SyncError::Codec(format!("pending delete id is not utf-8: {}", e)))?;
        self.remote.delete(kind, id).await?.into_result()
      }
    }
  }

  /// Currently cached values for `tag` and the expiry to carry forward.
  ///
  /// Without a live cache record the rewritten list is born expired, so the
  /// next online read refreshes it while offline reads can still serve it.
  fn cached_values<T: Syncable>(&self, tag: &str, now: DateTime<Utc>) -> (Vec<T>, DateTime<Utc>) {
    let records = match self.store.query(tag) {
      Ok(records) => records,
      Err(e) => {
        warn!(tag, error = %e, "could not read cached list");
        return (Vec::new(), now);
      }
    };

    let mut values = Vec::new();
    let mut expires_at = now;
    for record in records {
      if let Ok(decoded) = T::decode_list(&record.payload) {
        values.extend(decoded);
      }
      if let Some(record_expiry) = record.expires_at.filter(|_| record.is_live_at(now)) {
        expires_at = expires_at.max(record_expiry);
      }
    }
    (values, expires_at)
  }
}
