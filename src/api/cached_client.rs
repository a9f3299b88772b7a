//! Offline-first client that wraps the remote API with caching and queues.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheLayer, Fetched, SqliteStore, Syncable};
use crate::config::{Config, SyncConfig, TtlConfig};
use crate::error::SyncError;
use crate::sync::{
  BatchSyncer, DrainReport, PendingOp, PendingQueue, Reachability, StatusCounts, TcpProbe,
  TraceSync, TraceSyncReport,
};

use super::cache::{locations_range_tag, EntityKind, SlotPolicy};
use super::client::{HttpRemote, RemoteApi};
use super::types::{LocationPoint, Note, Profile};

/// Pending work per kind, the user-visible "still pending" state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
  pub posts: Vec<(EntityKind, usize)>,
  pub deletes: Vec<(EntityKind, usize)>,
  pub traces: StatusCounts,
}

impl PendingSummary {
  pub fn is_empty(&self) -> bool {
    self.posts.iter().chain(&self.deletes).all(|(_, n)| *n == 0) && self.traces.unsynced == 0
  }
}

/// Result of draining every queue once.
#[derive(Debug)]
pub struct SyncRound {
  pub drains: Vec<DrainReport>,
  pub traces: TraceSyncReport,
}

/// Remote data client with transparent caching and write-behind delivery.
///
/// Reads are served from cache while fresh; writes land locally first and
/// are delivered when the reachability gate allows it.
pub struct OfflineClient {
  remote: Arc<dyn RemoteApi>,
  cache: CacheLayer<SqliteStore>,
  queue: PendingQueue<SqliteStore>,
  traces: TraceSync<SqliteStore>,
  ttl: TtlConfig,
}

impl OfflineClient {
  /// Build a client from configuration: SQLite store, HTTP remote, TCP probe.
  pub fn new(config: &Config) -> Result<Self> {
    let store = Arc::new(SqliteStore::open(&config.database_path()?)?);
    let remote = Arc::new(HttpRemote::new(&config.remote, Config::get_api_token())?);
    let gate = Arc::new(TcpProbe::new(
      config.probe_target()?,
      config.reachability.timeout(),
    ));

    Ok(Self::from_parts(
      store,
      remote,
      gate,
      config.cache.ttl.clone(),
      &config.sync,
    ))
  }

  /// Assemble a client from explicit collaborators.
  pub fn from_parts(
    store: Arc<SqliteStore>,
    remote: Arc<dyn RemoteApi>,
    gate: Arc<dyn Reachability>,
    ttl: TtlConfig,
    sync: &SyncConfig,
  ) -> Self {
    let cache = CacheLayer::new(store.clone(), gate.clone());
    let queue = PendingQueue::new(store.clone(), remote.clone(), gate.clone())
      .with_concurrency(sync.concurrency);
    let syncer =
      BatchSyncer::new(remote.clone(), gate).with_split_threshold(sync.split_threshold);
    let traces = TraceSync::new(store, syncer)
      .with_stale_after(chrono::Duration::seconds(sync.syncing_stale_secs));

    Self {
      remote,
      cache,
      queue,
      traces,
      ttl,
    }
  }

  /// Get the profile, delivering any pending profile edit first.
  pub async fn get_profile(&self) -> Result<Profile> {
    self.queue.check_for_unsynced(EntityKind::Profile).await;

    let mut profiles: Vec<Profile> = self.read(EntityKind::Profile.tag(), Vec::new()).await?;
    profiles
      .pop()
      .ok_or_else(|| SyncError::Codec("remote returned no profile".to_string()).into())
  }

  /// Save the profile locally and try to deliver it.
  pub async fn update_profile(&self, profile: &Profile) -> Result<DrainReport> {
    Ok(
      self
        .queue
        .enqueue_post(profile, self.ttl.for_kind(EntityKind::Profile))
        .await?,
    )
  }

  /// List notes, delivering pending note writes first.
  pub async fn list_notes(&self) -> Result<Vec<Note>> {
    self.queue.check_for_unsynced(EntityKind::Notes).await;
    self.queue.check_for_unsynced_deletes(EntityKind::Notes).await;

    self.read(EntityKind::Notes.tag(), Vec::new()).await
  }

  pub async fn add_note(&self, note: &Note) -> Result<DrainReport> {
    Ok(
      self
        .queue
        .enqueue_post(note, self.ttl.for_kind(EntityKind::Notes))
        .await?,
    )
  }

  pub async fn delete_note(&self, id: &str) -> Result<DrainReport> {
    Ok(self.queue.enqueue_delete::<Note>(id).await?)
  }

  /// Store a trace sample for the next bulk upload.
  pub fn record_location(&self, point: &LocationPoint) -> Result<i64> {
    Ok(self.traces.record(point)?)
  }

  /// Upload unsynced location samples in bulk.
  pub async fn upload_locations(&self) -> Result<TraceSyncReport> {
    Ok(self.traces.sync_pending(EntityKind::Locations).await?)
  }

  /// Location samples recorded between `from` and `to`, cached per range.
  pub async fn locations_between(
    &self,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> Result<Vec<LocationPoint>> {
    let query = vec![
      ("from".to_string(), from.to_rfc3339()),
      ("to".to_string(), to.to_rfc3339()),
    ];
    self.read(&locations_range_tag(from, to), query).await
  }

  /// Reset uploads left in `syncing` by an interrupted run.
  pub fn sweep_stale(&self) -> Result<usize> {
    Ok(self.traces.sweep_stale()?)
  }

  /// Drain every pending queue and upload unsynced traces once.
  pub async fn drain_all(&self) -> Result<SyncRound> {
    let drains = self.queue.drain_all().await;
    let traces = self.upload_locations().await?;
    Ok(SyncRound { drains, traces })
  }

  pub fn pending_summary(&self) -> Result<PendingSummary> {
    let mut summary = PendingSummary {
      traces: self.traces.counts(EntityKind::Locations)?,
      ..PendingSummary::default()
    };
    for kind in EntityKind::ALL {
      summary
        .posts
        .push((kind, self.queue.pending_count(kind, PendingOp::Post)?));
      summary
        .deletes
        .push((kind, self.queue.pending_count(kind, PendingOp::Delete)?));
    }
    Ok(summary)
  }

  async fn read<T: Syncable>(&self, tag: &str, query: Vec<(String, String)>) -> Result<Vec<T>> {
    let ttl = self.ttl.for_kind(T::kind());
    let result = self
      .cache
      .fetch(tag, ttl, || fetch_remote::<T>(self.remote.as_ref(), &query))
      .await?;

    debug!(tag, source = ?result.source, count = result.data.len(), "read");
    Ok(result.data)
  }
}

/// Fetch `T` from the remote, decoding a single object for single-slot kinds.
async fn fetch_remote<T: Syncable>(
  remote: &dyn RemoteApi,
  query: &[(String, String)],
) -> crate::error::Result<Fetched<Vec<T>>> {
  let kind = T::kind();
  let response = remote.fetch(kind, query).await?.into_result()?;

  let data = match kind.slot_policy() {
    SlotPolicy::SingleSlot => vec![serde_json::from_slice::<T>(&response.body)?],
    SlotPolicy::AppendOnly => serde_json::from_slice::<Vec<T>>(&response.body)?,
  };
  Ok(Fetched::new(data, response.renewed_token))
}
