//! Fakes shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::api::{EntityKind, RemoteApi, RemoteResponse};
use crate::cache::{CachedRecord, Clock, Mutation, RecordStore};
use crate::error::{Result, SyncError};

/// Clock frozen at a chosen instant.
pub struct FixedClock {
  now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// Store whose every operation fails.
pub struct FailingStore;

impl RecordStore for FailingStore {
  fn apply(&self, _mutations: &[Mutation]) -> Result<()> {
    Err(SyncError::Io("disk unavailable".into()))
  }

  fn query(&self, _type_tag: &str) -> Result<Vec<CachedRecord>> {
    Err(SyncError::Io("disk unavailable".into()))
  }
}

/// A request observed by [`FakeRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  Fetch(EntityKind),
  Create(EntityKind, Vec<u8>),
  Delete(EntityKind, String),
  Bulk(EntityKind, Vec<serde_json::Value>),
}

type Responder = Box<dyn Fn(&Call) -> Result<RemoteResponse> + Send + Sync>;

/// Scripted remote API that records every call.
///
/// Responses come from a queue first, then from the responder.
pub struct FakeRemote {
  calls: Mutex<Vec<Call>>,
  queued: Mutex<VecDeque<Result<RemoteResponse>>>,
  responder: Responder,
}

impl FakeRemote {
  /// Answers every call with `status`.
  pub fn with_status(status: u16) -> Self {
    Self::with_responder(move |_| Ok(response(status)))
  }

  pub fn with_responder(
    responder: impl Fn(&Call) -> Result<RemoteResponse> + Send + Sync + 'static,
  ) -> Self {
    Self {
      calls: Mutex::new(Vec::new()),
      queued: Mutex::new(VecDeque::new()),
      responder: Box::new(responder),
    }
  }

  /// Answer the next call with `result` before falling back to the responder.
  pub fn push(&self, result: Result<RemoteResponse>) {
    self.queued.lock().unwrap().push_back(result);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Suspends once before answering, like a real network round trip.
  async fn answer(&self, call: Call) -> Result<RemoteResponse> {
    tokio::task::yield_now().await;
    let queued = self.queued.lock().unwrap().pop_front();
    let result = match queued {
      Some(result) => result,
      None => (self.responder)(&call),
    };
    self.calls.lock().unwrap().push(call);
    result
  }
}

pub fn response(status: u16) -> RemoteResponse {
  RemoteResponse {
    status,
    body: Vec::new(),
    renewed_token: None,
  }
}

pub fn response_with_body(status: u16, body: Vec<u8>) -> RemoteResponse {
  RemoteResponse {
    status,
    body,
    renewed_token: None,
  }
}

#[async_trait]
impl RemoteApi for FakeRemote {
  async fn fetch(&self, kind: EntityKind, _query: &[(String, String)]) -> Result<RemoteResponse> {
    self.answer(Call::Fetch(kind)).await
  }

  async fn create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse> {
    self.answer(Call::Create(kind, body)).await
  }

  async fn delete(&self, kind: EntityKind, id: &str) -> Result<RemoteResponse> {
    self.answer(Call::Delete(kind, id.to_string())).await
  }

  async fn bulk_create(&self, kind: EntityKind, body: Vec<u8>) -> Result<RemoteResponse> {
    let items: Vec<serde_json::Value> = serde_json::from_slice(&body)?;
    self.answer(Call::Bulk(kind, items)).await
  }
}
