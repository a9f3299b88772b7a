//! Read-through caching over a durable record store.
//!
//! This module provides:
//! - A payload-agnostic store of tagged blobs with optional expiry
//! - A cache layer that serves unexpired records without a network round trip
//! - Offline fallback to expired records when connectivity is gone

mod layer;
pub(crate) mod storage;
mod traits;

pub use layer::{CacheLayer, Fetched};
pub use storage::{CachedRecord, Mutation, RecordStore, SqliteStore};
pub use traits::{CacheResult, CacheSource, Clock, Syncable, SystemClock};
