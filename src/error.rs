//! Error taxonomy shared by the store, cache, queue and batch layers.

use thiserror::Error;

/// Errors surfaced by the sync subsystem.
///
/// None of these are fatal to the process: store failures degrade to cache
/// misses, network and rejection failures leave pending work in place.
#[derive(Debug, Error)]
pub enum SyncError {
  /// Local persistence unavailable or failed mid-operation.
  #[error("record store failure: {0}")]
  Io(String),

  /// Transport-level failure (timeout, DNS, connection refused).
  #[error("network error: {0}")]
  Network(String),

  /// The remote API answered with a non-2xx status.
  #[error("remote rejected request with status {status}")]
  Rejected { status: u16 },

  /// A payload could not be encoded or decoded.
  #[error("payload codec error: {0}")]
  Codec(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// True for the 400 "bad request / likely duplicate" signal.
  pub fn is_bad_request(&self) -> bool {
    matches!(self, SyncError::Rejected { status: 400 })
  }

  /// HTTP status carried by a rejection, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      SyncError::Rejected { status } => Some(*status),
      _ => None,
    }
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Io(e.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Codec(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bad_request_detection() {
    assert!(SyncError::Rejected { status: 400 }.is_bad_request());
    assert!(!SyncError::Rejected { status: 409 }.is_bad_request());
    assert!(!SyncError::Network("timeout".into()).is_bad_request());
  }

  #[test]
  fn test_status_only_for_rejections() {
    assert_eq!(SyncError::Rejected { status: 503 }.status(), Some(503));
    assert_eq!(SyncError::Io("disk".into()).status(), None);
  }
}
