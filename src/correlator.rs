//! Request/response correlation.
//!
//! Every transmitted request carries a unique `requestId`. The correlator
//! keeps one one-shot handler per id; the client's single response-dispatch
//! routine looks the handler up and consumes it. The history keeps recently
//! transmitted ids so real-time notifications echoing one of them can be
//! recognized as self-originated.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ResponseError;
use crate::protocol::REQUEST_HISTORY_WINDOW;

/// Outcome delivered to a query callback
pub type QueryResult = std::result::Result<Value, ResponseError>;

/// Completion handler of a single request, invoked at most once.
pub type QueryCallback = Box<dyn FnOnce(QueryResult) + Send>;

/// One-shot handlers keyed by request id.
///
/// Handlers are `Send` but not `Sync`, so they live behind a mutex rather
/// than in a sharded map.
#[derive(Default)]
pub struct RequestCorrelator {
  pending: Mutex<HashMap<String, QueryCallback>>,
}

impl RequestCorrelator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the handler for `request_id`, replacing any previous one.
  pub fn register(&self, request_id: impl Into<String>, callback: QueryCallback) {
    self.pending.lock().insert(request_id.into(), callback);
  }

  /// Remove and return the handler, so it can only ever fire once.
  pub fn take(&self, request_id: &str) -> Option<QueryCallback> {
    self.pending.lock().remove(request_id)
  }

  pub fn is_pending(&self, request_id: &str) -> bool {
    self.pending.lock().contains_key(request_id)
  }

  pub fn len(&self) -> usize {
    self.pending.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.lock().is_empty()
  }

  pub fn clear(&self) {
    self.pending.lock().clear();
  }
}

/// Rolling window of recently transmitted request ids
pub struct RequestHistory {
  entries: DashMap<String, Instant>,
  window: Duration,
}

impl Default for RequestHistory {
  fn default() -> Self {
    Self::new(REQUEST_HISTORY_WINDOW)
  }
}

impl RequestHistory {
  pub fn new(window: Duration) -> Self {
    Self {
      entries: DashMap::new(),
      window,
    }
  }

  /// Remember `request_id` and purge entries older than the window.
  pub fn record(&self, request_id: impl Into<String>) {
    let now = Instant::now();
    self.entries.insert(request_id.into(), now);
    let window = self.window;
    self
      .entries
      .retain(|_, sent_at| now.duration_since(*sent_at) <= window);
  }

  pub fn contains(&self, request_id: &str) -> bool {
    self.entries.contains_key(request_id)
  }

  pub fn remove(&self, request_id: &str) -> bool {
    self.entries.remove(request_id).is_some()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&self) {
    self.entries.clear();
  }
}
