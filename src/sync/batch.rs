//! Bulk upload with adaptive bisection on "bad request" rejections.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{EntityKind, RemoteApi};

use super::reachability::Reachability;

/// Batches larger than this are split when the server answers 400.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 10;

/// Result of one leaf of the bisection tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport {
  /// Positions in the original batch covered by this slice
  pub range: Range<usize>,
  pub delivered: bool,
  /// Final HTTP status, `None` for transport or encoding failures
  pub status: Option<u16>,
  pub renewed_token: Option<String>,
  pub error: Option<String>,
}

impl SliceReport {
  fn delivered(range: Range<usize>, status: u16, renewed_token: Option<String>) -> Self {
    Self {
      range,
      delivered: true,
      status: Some(status),
      renewed_token,
      error: None,
    }
  }

  fn failed(range: Range<usize>, status: Option<u16>, error: String) -> Self {
    Self {
      range,
      delivered: false,
      status,
      renewed_token: None,
      error: Some(error),
    }
  }
}

/// Aggregated outcome of a [`BatchSyncer::sync`] call.
///
/// Every leaf slice is reported once, in batch order; callers get a single
/// outcome rather than one completion per leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
  pub slices: Vec<SliceReport>,
  /// Number of bulk requests sent
  pub requests: usize,
  pub skipped_offline: bool,
}

impl BatchOutcome {
  /// True when every item was accepted. An empty batch trivially succeeds.
  pub fn success(&self) -> bool {
    !self.skipped_offline && self.slices.iter().all(|s| s.delivered)
  }

  pub fn delivered_indices(&self) -> Vec<usize> {
    self.indices(true)
  }

  /// Positions that failed terminally and were not retried.
  pub fn failed_indices(&self) -> Vec<usize> {
    self.indices(false)
  }

  /// Last rotated token returned by an accepted slice.
  pub fn renewed_token(&self) -> Option<&str> {
    self
      .slices
      .iter()
      .rev()
      .find_map(|s| s.renewed_token.as_deref())
  }

  fn indices(&self, delivered: bool) -> Vec<usize> {
    self
      .slices
      .iter()
      .filter(|s| s.delivered == delivered)
      .flat_map(|s| s.range.clone())
      .collect()
  }
}

/// Uploads append-only records through a bulk endpoint.
///
/// A 400 on a batch above the split threshold halves it, first half
/// `ceil(n/2)` items, and both halves are retried independently. Anything
/// else that is not 2xx is terminal for that slice.
pub struct BatchSyncer {
  remote: Arc<dyn RemoteApi>,
  gate: Arc<dyn Reachability>,
  split_threshold: usize,
}

impl BatchSyncer {
  pub fn new(remote: Arc<dyn RemoteApi>, gate: Arc<dyn Reachability>) -> Self {
    Self {
      remote,
      gate,
      split_threshold: DEFAULT_SPLIT_THRESHOLD,
    }
  }

  /// Split only batches strictly larger than `threshold`. 1 bisects down to singletons.
  pub fn with_split_threshold(mut self, threshold: usize) -> Self {
    self.split_threshold = threshold.max(1);
    self
  }

  pub fn split_threshold(&self) -> usize {
    self.split_threshold
  }

  pub async fn is_connected(&self) -> bool {
    self.gate.is_connected().await
  }

  /// Upload `items` to the bulk endpoint of `kind`.
  pub async fn sync<T: Serialize + Sync>(&self, kind: EntityKind, items: &[T]) -> BatchOutcome {
    if items.is_empty() {
      return BatchOutcome::default();
    }

    if !self.gate.is_connected().await {
      debug!(kind = %kind, count = items.len(), "offline, batch not sent");
      return BatchOutcome {
        skipped_offline: true,
        ..BatchOutcome::default()
      };
    }

    let requests = AtomicUsize::new(0);
    let slices = self.sync_slice(kind, items, 0, &requests).await;
    let outcome = BatchOutcome {
      slices,
      requests: requests.load(Ordering::SeqCst),
      skipped_offline: false,
    };

    info!(
      kind = %kind,
      items = items.len(),
      delivered = outcome.delivered_indices().len(),
      requests = outcome.requests,
      "batch sync finished"
    );
    outcome
  }

  fn sync_slice<'a, T: Serialize + Sync>(
    &'a self,
    kind: EntityKind,
    items: &'a [T],
    offset: usize,
    requests: &'a AtomicUsize,
  ) -> BoxFuture<'a, Vec<SliceReport>> {
    async move {
      let range = offset..offset + items.len();

      let body = match serde_json::to_vec(items) {
        Ok(body) => body,
        Err(e) => {
          warn!(kind = %kind, ?range, error = %e, "could not encode batch");
          return vec![SliceReport::failed(range, None, e.to_string())];
        }
      };

      requests.fetch_add(1, Ordering::SeqCst);
      let response = match self.remote.bulk_create(kind, body).await {
        Ok(response) => response,
        Err(e) => {
          warn!(kind = %kind, ?range, error = %e, "batch upload failed");
          return vec![SliceReport::failed(range, e.status(), e.to_string())];
        }
      };

      if response.is_success() {
        debug!(kind = %kind, ?range, status = response.status, "batch accepted");
        return vec![SliceReport::delivered(
          range,
          response.status,
          response.renewed_token,
        )];
      }

      if response.status == 400 && items.len() > self.split_threshold {
        let mid = (items.len() - 1) / 2;
        let (first, second) = items.split_at(mid + 1);
        info!(
          kind = %kind,
          ?range,
          first = first.len(),
          second = second.len(),
          "batch rejected, splitting"
        );

        let (mut reports, rest) = futures::join!(
          self.sync_slice(kind, first, offset, requests),
          self.sync_slice(kind, second, offset + first.len(), requests),
        );
        reports.extend(rest);
        return reports;
      }

      warn!(
        kind = %kind,
        ?range,
        status = response.status,
        "batch slice failed terminally"
      );
      vec![SliceReport::failed(
        range,
        Some(response.status),
        format!("remote rejected slice with status {}", response.status),
      )]
    }
    .boxed()
  }
}
