//! Offline-first synchronization cache for a personal data API.
//!
//! Reads go through a TTL cache backed by SQLite; writes are recorded
//! locally and replayed against the remote API once it is reachable.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{EntityKind, OfflineClient};
pub use config::Config;
pub use error::{Result, SyncError};
