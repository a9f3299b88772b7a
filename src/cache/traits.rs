//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::api::EntityKind;
use crate::error::Result;

/// Trait for entities that can be cached locally and replayed remotely.
///
/// Payloads are opaque to the record store; this trait is the only place
/// that knows how bytes map to values. Cached payloads are always lists,
/// even for single-slot entities like the profile.
pub trait Syncable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Entity kind, which determines tags and remote endpoints.
  fn kind() -> EntityKind;

  /// Identifier understood by the remote delete endpoint, if assigned.
  fn remote_id(&self) -> Option<String>;

  /// Encode a single value as a request body / pending payload.
  fn encode(&self) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(self)?)
  }

  /// Encode a list of values as a cache payload.
  fn encode_list(values: &[Self]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(values)?)
  }

  /// Decode a cache payload.
  fn decode_list(bytes: &[u8]) -> Result<Vec<Self>> {
    Ok(serde_json::from_slice(bytes)?)
  }
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Rotated auth token returned by the remote, only set on network paths
  pub renewed_token: Option<String>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, renewed_token: Option<String>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      renewed_token,
    }
  }

  /// Create a new cache result from unexpired cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
      renewed_token: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      renewed_token: None,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, not yet expired
  CacheFresh,
  /// Offline mode - cache expired and network unavailable, serving stale data
  Offline,
}
