//! Record store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::db;
use crate::error::{Result, SyncError};

/// A tagged blob with optional expiry.
///
/// Cached entity lists and pending operations share this shape; pending
/// operations simply never expire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
  /// Store-assigned identity, never reused
  pub id: i64,
  pub type_tag: String,
  pub payload: Vec<u8>,
  /// Digest of tag, payload and creation time
  pub fingerprint: String,
  pub created_at: DateTime<Utc>,
  /// `None` means the record never expires
  pub expires_at: Option<DateTime<Utc>>,
}

impl CachedRecord {
  /// A record is live while its expiry lies strictly in the future.
  pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
    match self.expires_at {
      None => true,
      Some(expires_at) => expires_at > now,
    }
  }
}

/// One write applied inside a store transaction.
#[derive(Debug, Clone)]
pub enum Mutation {
  Put {
    type_tag: String,
    payload: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
  },
  DeleteAll {
    type_tag: String,
  },
  Delete {
    id: i64,
    fingerprint: String,
  },
}

impl Mutation {
  pub fn put(type_tag: &str, payload: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Self {
    Mutation::Put {
      type_tag: type_tag.to_string(),
      payload,
      expires_at,
    }
  }

  pub fn delete_all(type_tag: &str) -> Self {
    Mutation::DeleteAll {
      type_tag: type_tag.to_string(),
    }
  }

  pub fn delete(record: &CachedRecord) -> Self {
    Mutation::Delete {
      id: record.id,
      fingerprint: record.fingerprint.clone(),
    }
  }
}

/// Durable persistence of tagged blobs.
///
/// Every write goes through [`RecordStore::apply`], which must commit all
/// mutations or none of them.
pub trait RecordStore: Send + Sync {
  /// Apply mutations atomically, in order.
  fn apply(&self, mutations: &[Mutation]) -> Result<()>;

  /// All records stored under `type_tag`, in insertion order.
  fn query(&self, type_tag: &str) -> Result<Vec<CachedRecord>>;

  /// Number of records stored under `type_tag`.
  fn count(&self, type_tag: &str) -> Result<usize> {
    Ok(self.query(type_tag)?.len())
  }

  /// Append a record. Never overwrites siblings.
  fn put(&self, type_tag: &str, payload: Vec<u8>, expires_at: Option<DateTime<Utc>>) -> Result<()> {
    self.apply(&[Mutation::put(type_tag, payload, expires_at)])
  }

  fn delete_all(&self, type_tag: &str) -> Result<()> {
    self.apply(&[Mutation::delete_all(type_tag)])
  }

  /// Remove exactly one record, leaving siblings under the same tag alone.
  fn delete(&self, record: &CachedRecord) -> Result<()> {
    self.apply(&[Mutation::delete(record)])
  }

  /// Delete everything under `type_tag` and insert a single record.
  fn replace(
    &self,
    type_tag: &str,
    payload: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
  ) -> Result<()> {
    self.apply(&[
      Mutation::delete_all(type_tag),
      Mutation::put(type_tag, payload, expires_at),
    ])
  }
}

/// SQLite-based record store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, creating it if needed.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path)?;
    debug!(path = %path.display(), "opened record store");
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Open the store at the default data location.
  pub fn open_default() -> Result<Self> {
    Self::open(&db::default_path()?)
  }

  /// Non-durable store, mainly for tests.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory()?),
    })
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Io(format!("Lock poisoned: {}", e)))
  }
}

impl RecordStore for SqliteStore {
  fn apply(&self, mutations: &[Mutation]) -> Result<()> {
    if mutations.is_empty() {
      return Ok(());
    }

    let mut conn = self.lock()?;
    // Dropping an uncommitted transaction rolls it back
    let tx = conn.transaction()?;
    for mutation in mutations {
      apply_one(&tx, mutation)?;
    }
    tx.commit()?;

    Ok(())
  }

  fn query(&self, type_tag: &str) -> Result<Vec<CachedRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, type_tag, payload, fingerprint, created_at, expires_at FROM records
       WHERE type_tag = ?
       ORDER BY id",
    )?;

    let rows = stmt.query_map(params![type_tag], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, Vec<u8>>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, i64>(4)?,
        row.get::<_, Option<i64>>(5)?,
      ))
    })?;

    let mut records = Vec::new();
    for row in rows {
      let (id, type_tag, payload, fingerprint, created_at, expires_at) = row?;
      records.push(CachedRecord {
        id,
        type_tag,
        payload,
        fingerprint,
        created_at: from_millis(created_at)?,
        expires_at: expires_at.map(from_millis).transpose()?,
      });
    }

    Ok(records)
  }

  fn count(&self, type_tag: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM records WHERE type_tag = ?",
      params![type_tag],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

fn apply_one(tx: &Transaction<'_>, mutation: &Mutation) -> Result<()> {
  match mutation {
    Mutation::Put {
      type_tag,
      payload,
      expires_at,
    } => {
      let created_at = Utc::now();
      let fingerprint = fingerprint(type_tag, payload, created_at);
      tx.execute(
        "INSERT INTO records (type_tag, payload, fingerprint, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          type_tag,
          payload,
          fingerprint,
          created_at.timestamp_millis(),
          expires_at.map(|t| t.timestamp_millis())
        ],
      )?;
    }
    Mutation::DeleteAll { type_tag } => {
      tx.execute("DELETE FROM records WHERE type_tag = ?", params![type_tag])?;
    }
    Mutation::Delete { id, fingerprint } => {
      tx.execute(
        "DELETE FROM records WHERE id = ? AND fingerprint = ?",
        params![id, fingerprint],
      )?;
    }
  }
  Ok(())
}

/// Content identity of a record: SHA256 over tag, payload and creation time.
fn fingerprint(type_tag: &str, payload: &[u8], created_at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(type_tag.as_bytes());
  hasher.update([0u8]);
  hasher.update(payload);
  hasher.update(created_at.timestamp_millis().to_be_bytes());
  hex::encode(hasher.finalize())
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms)
    .ok_or_else(|| SyncError::Io(format!("Invalid timestamp in store: {}", ms)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_query_unknown_tag_is_empty() {
    let store = store();
    assert!(store.query("profile").unwrap().is_empty());
    assert_eq!(store.count("profile").unwrap(), 0);
  }

  #[test]
  fn test_put_appends_in_insertion_order() {
    let store = store();
    store.put("notes-Post", b"a".to_vec(), None).unwrap();
    store.put("notes-Post", b"b".to_vec(), None).unwrap();
    store.put("notes", b"cached".to_vec(), None).unwrap();

    let records = store.query("notes-Post").unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload, b"a");
    assert_eq!(records[1].payload, b"b");
    assert!(records.iter().all(|r| r.type_tag == "notes-Post"));
  }

  #[test]
  fn test_delete_removes_only_that_record() {
    let store = store();
    store.put("notes-Post", b"same".to_vec(), None).unwrap();
    store.put("notes-Post", b"same".to_vec(), None).unwrap();

    let records = store.query("notes-Post").unwrap();
    store.delete(&records[0]).unwrap();

    let remaining = store.query("notes-Post").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, records[1].id);
  }

  #[test]
  fn test_delete_twice_is_harmless() {
    let store = store();
    store.put("profile-Post", b"p".to_vec(), None).unwrap();
    let record = store.query("profile-Post").unwrap().remove(0);

    store.delete(&record).unwrap();
    store.delete(&record).unwrap();
    assert!(store.query("profile-Post").unwrap().is_empty());
  }

  #[test]
  fn test_delete_all_scoped_to_tag() {
    let store = store();
    store.put("profile", b"x".to_vec(), None).unwrap();
    store.put("profile-Post", b"y".to_vec(), None).unwrap();

    store.delete_all("profile").unwrap();

    assert!(store.query("profile").unwrap().is_empty());
    assert_eq!(store.count("profile-Post").unwrap(), 1);
  }

  #[test]
  fn test_replace_leaves_single_record() {
    let store = store();
    store.put("profile", b"old-1".to_vec(), None).unwrap();
    store.put("profile", b"old-2".to_vec(), None).unwrap();

    let expires = Utc::now() + Duration::minutes(5);
    store.replace("profile", b"new".to_vec(), Some(expires)).unwrap();

    let records = store.query("profile").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, b"new");
    assert_eq!(
      records[0].expires_at.map(|t| t.timestamp_millis()),
      Some(expires.timestamp_millis())
    );
  }

  #[test]
  fn test_expiry_is_exclusive() {
    let now = Utc::now();
    let record = CachedRecord {
      id: 1,
      type_tag: "profile".into(),
      payload: vec![],
      fingerprint: String::new(),
      created_at: now,
      expires_at: Some(now),
    };
    assert!(!record.is_live_at(now));
    assert!(record.is_live_at(now - Duration::milliseconds(1)));

    let pending = CachedRecord {
      expires_at: None,
      ..record
    };
    assert!(pending.is_live_at(now + Duration::days(365)));
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.put("notes-Post", b"durable".to_vec(), None).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let records = store.query("notes-Post").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, b"durable");
  }
}
