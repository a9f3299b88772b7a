//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CachedRecord, Mutation, RecordStore};
use super::traits::{CacheResult, Clock, Syncable, SystemClock};
use crate::error::Result;
use crate::sync::Reachability;

/// Values returned by a network fetcher, with any rotated token.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  pub data: T,
  pub renewed_token: Option<String>,
}

impl<T> Fetched<T> {
  pub fn new(data: T, renewed_token: Option<String>) -> Self {
    Self {
      data,
      renewed_token,
    }
  }
}

/// Read-through cache over a [`RecordStore`].
///
/// Unexpired records are served without touching the network. Expired
/// records are purged when the gate reports connectivity, otherwise kept
/// as an offline fallback.
pub struct CacheLayer<S: RecordStore> {
  storage: Arc<S>,
  gate: Arc<dyn Reachability>,
  clock: Arc<dyn Clock>,
}

impl<S: RecordStore> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>, gate: Arc<dyn Reachability>) -> Self {
    Self {
      storage,
      gate,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Fetch a list with cache-first strategy.
  ///
  /// 1. Unexpired, decodable records under `tag` are returned immediately
  /// 2. Otherwise `fetcher` runs and its result replaces the cached list,
  ///    expiring `ttl` from now
  /// 3. If the fetch fails and stale records survived (gate offline), they
  ///    are served in offline mode; otherwise the error propagates
  pub async fn fetch<T, F, Fut>(
    &self,
    tag: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Syncable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Fetched<Vec<T>>>>,
  {
    let now = self.clock.now();
    let records = self.load(tag);

    let mut fresh: Option<(Vec<T>, DateTime<Utc>)> = None;
    let mut expired: Vec<&CachedRecord> = Vec::new();

    for record in &records {
      if !record.is_live_at(now) {
        expired.push(record);
        continue;
      }
      match T::decode_list(&record.payload) {
        Ok(values) => {
          let (data, cached_at) = fresh.get_or_insert_with(|| (Vec::new(), record.created_at));
          data.extend(values);
          *cached_at = (*cached_at).max(record.created_at);
        }
        Err(e) => warn!(tag, id = record.id, error = %e, "discarding undecodable cache record"),
      }
    }

    if let Some((data, cached_at)) = fresh {
      debug!(tag, count = data.len(), "cache hit");
      return Ok(CacheResult::from_cache(data, cached_at));
    }

    let online = !expired.is_empty() && self.gate.is_connected().await;
    let stale = self.purge_or_keep(tag, &expired, online);

    debug!(tag, "cache miss, fetching from network");
    match fetcher().await {
      Ok(fetched) => {
        self.store(tag, &fetched.data, now + ttl);
        Ok(CacheResult::from_network(
          fetched.data,
          fetched.renewed_token,
        ))
      }
      Err(e) => match stale {
        Some((data, cached_at)) => {
          warn!(tag, error = %e, "network fetch failed, serving stale cache");
          Ok(CacheResult::offline(data, cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Drop every cached record for `tag`.
  pub fn invalidate(&self, tag: &str) {
    if let Err(e) = self.storage.delete_all(tag) {
      warn!(tag, error = %e, "failed to invalidate cache");
    }
  }

  fn load(&self, tag: &str) -> Vec<CachedRecord> {
    match self.storage.query(tag) {
      Ok(records) => records,
      Err(e) => {
        // Unreadable store behaves like an empty one
        warn!(tag, error = %e, "record store query failed, treating as miss");
        Vec::new()
      }
    }
  }

  /// Delete expired records while online; decode them for offline use otherwise.
  fn purge_or_keep<T: Syncable>(
    &self,
    tag: &str,
    expired: &[&CachedRecord],
    online: bool,
  ) -> Option<(Vec<T>, DateTime<Utc>)> {
    if expired.is_empty() {
      return None;
    }

    if online {
      let mutations: Vec<Mutation> = expired.iter().map(|r| Mutation::delete(r)).collect();
      match self.storage.apply(&mutations) {
        Ok(()) => debug!(tag, count = mutations.len(), "purged expired cache records"),
        Err(e) => warn!(tag, error = %e, "failed to purge expired cache records"),
      }
      return None;
    }

    let mut stale: Option<(Vec<T>, DateTime<Utc>)> = None;
    for record in expired {
      if let Ok(values) = T::decode_list(&record.payload) {
        let (data, cached_at) = stale.get_or_insert_with(|| (Vec::new(), record.created_at));
        data.extend(values);
        *cached_at = (*cached_at).max(record.created_at);
      }
    }
    stale
  }

  fn store<T: Syncable>(&self, tag: &str, data: &[T], expires_at: DateTime<Utc>) {
    let result = T::encode_list(data).and_then(|payload| {
      self
        .storage
        .replace(tag, payload, Some(expires_at))
    });
    if let Err(e) = result {
      warn!(tag, error = %e, "failed to write fetched data to cache");
    }
  }
}

impl<S: RecordStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      gate: Arc::clone(&self.gate),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Profile;
  use crate::cache::SqliteStore;
  use crate::error::SyncError;
  use crate::sync::StaticReachability;
  use crate::test_support::{FailingStore, FixedClock};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn profile(name: &str) -> Profile {
    Profile {
      id: Some("me".into()),
      display_name: name.into(),
      email: format!("{}@example.com", name),
      bio: None,
    }
  }

  fn layer(online: bool) -> (CacheLayer<SqliteStore>, Arc<FixedClock>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let gate = Arc::new(StaticReachability::new(online));
    let layer = CacheLayer::new(store, gate).with_clock(clock.clone());
    (layer, clock)
  }

  fn seed(layer: &CacheLayer<SqliteStore>, values: &[Profile], expires_at: Option<DateTime<Utc>>) {
    let payload = Profile::encode_list(values).unwrap();
    layer.storage().put("profile", payload, expires_at).unwrap();
  }

  #[tokio::test]
  async fn test_fresh_record_skips_network() {
    let (layer, clock) = layer(true);
    seed(&layer, &[profile("alice")], Some(clock.now() + Duration::minutes(5)));

    let calls = AtomicUsize::new(0);
    let result = layer
      .fetch("profile", Duration::minutes(5), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Fetched::new(vec![profile("network")], None))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(result.data, vec![profile("alice")]);
    assert!(result.renewed_token.is_none());
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let (layer, clock) = layer(true);
    seed(&layer, &[profile("alice")], Some(clock.now() + Duration::minutes(5)));

    layer.invalidate("profile");
    assert_eq!(layer.storage().count("profile").unwrap(), 0);

    let result = layer
      .fetch("profile", Duration::minutes(5), || async {
        Ok(Fetched::new(vec![profile("network")], None))
      })
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
  }

  #[tokio::test]
  async fn test_never_expiring_record_is_fresh() {
    let (layer, _clock) = layer(true);
    seed(&layer, &[profile("alice")], None);

    let result = layer
      .fetch::<Profile, _, _>("profile", Duration::minutes(5), || async {
        Err(SyncError::Network("should not be called".into()))
      })
      .await
      .unwrap();

    assert_eq!(result.data.len(), 1);
  }

  #[tokio::test]
  async fn test_expired_record_fetches_once_and_is_purged() {
    let (layer, clock) = layer(true);
    seed(&layer, &[profile("old")], Some(clock.now() - Duration::seconds(1)));

    let calls = AtomicUsize::new(0);
    let result = layer
      .fetch("profile", Duration::minutes(5), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Fetched::new(vec![profile("new")], Some("token-2".into())))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.renewed_token.as_deref(), Some("token-2"));

    let records = layer.storage().query("profile").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(Profile::decode_list(&records[0].payload).unwrap(), vec![profile("new")]);
    assert!(records[0].is_live_at(clock.now()));
  }

  #[tokio::test]
  async fn test_boundary_instant_counts_as_expired() {
    let (layer, clock) = layer(true);
    seed(&layer, &[profile("edge")], Some(clock.now()));

    let calls = AtomicUsize::new(0);
    layer
      .fetch("profile", Duration::minutes(5), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Fetched::new(vec![profile("new")], None))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cold_miss_propagates_network_error() {
    let (layer, _clock) = layer(true);

    let result = layer
      .fetch::<Profile, _, _>("profile", Duration::minutes(5), || async {
        Err(SyncError::Network("timeout".into()))
      })
      .await;

    assert!(matches!(result, Err(SyncError::Network(_))));
    assert!(layer.storage().query("profile").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_online_expired_and_failed_fetch_is_error() {
    let (layer, clock) = layer(true);
    seed(&layer, &[profile("old")], Some(clock.now() - Duration::minutes(1)));

    let result = layer
      .fetch::<Profile, _, _>("profile", Duration::minutes(5), || async {
        Err(SyncError::Rejected { status: 500 })
      })
      .await;

    assert!(result.is_err());
    assert!(layer.storage().query("profile").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_serves_stale_when_fetch_fails() {
    let (layer, clock) = layer(false);
    seed(&layer, &[profile("old")], Some(clock.now() - Duration::minutes(1)));

    let result = layer
      .fetch::<Profile, _, _>("profile", Duration::minutes(5), || async {
        Err(SyncError::Network("offline".into()))
      })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Offline);
    assert_eq!(result.data, vec![profile("old")]);
    // Stale record is kept until connectivity returns
    assert_eq!(layer.storage().count("profile").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_undecodable_record_falls_through_to_network() {
    let (layer, clock) = layer(true);
    layer
      .storage()
      .put("profile", b"garbage".to_vec(), Some(clock.now() + Duration::minutes(5)))
      .unwrap();

    let result = layer
      .fetch("profile", Duration::minutes(5), || async {
        Ok(Fetched::new(vec![profile("net")], None))
      })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Network);
    // Replaced, not appended next to the garbage
    assert_eq!(layer.storage().count("profile").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_store_failure_is_a_miss() {
    let layer = CacheLayer::new(
      Arc::new(FailingStore),
      Arc::new(StaticReachability::online()),
    );

    let result = layer
      .fetch("profile", Duration::minutes(5), || async {
        Ok(Fetched::new(vec![profile("net")], None))
      })
      .await
      .unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data, vec![profile("net")]);
  }
}
