//! Offline queue for requests issued while the client cannot transmit.
//!
//! The queue is a strict FIFO bounded by a maximum size and a TTL. Both
//! bounds are enforced oldest-first before every admission; a bound of 0
//! disables it. On reconnection the client drains it one request at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::correlator::QueryCallback;
use crate::error::{Error, Result};
use crate::protocol::str_field;

/// Admission predicate over the outgoing payload. Rejected requests are dropped.
pub type QueueFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Default filter: every request may be queued.
pub fn accept_all() -> QueueFilter {
  Arc::new(|_| true)
}

/// Source of additional requests merged into the queue when it is drained
pub trait OfflineQueueLoader: Send + Sync {
  fn load(&self) -> Vec<QueuedRequest>;
}

impl<F> OfflineQueueLoader for F
where
  F: Fn() -> Vec<QueuedRequest> + Send + Sync,
{
  fn load(&self) -> Vec<QueuedRequest> {
    self()
  }
}

/// A request waiting for the connection to come back
pub struct QueuedRequest {
  pub payload: Value,
  pub enqueued_at: Instant,
  pub callback: Option<QueryCallback>,
}

impl QueuedRequest {
  pub fn new(payload: Value, callback: Option<QueryCallback>) -> Self {
    Self {
      payload,
      enqueued_at: Instant::now(),
      callback,
    }
  }

  pub fn request_id(&self) -> Option<&str> {
    str_field(&self.payload, "requestId")
  }

  pub fn controller(&self) -> Option<&str> {
    str_field(&self.payload, "controller")
  }

  pub fn action(&self) -> Option<&str> {
    str_field(&self.payload, "action")
  }

  fn identity(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
    (self.request_id(), self.action(), self.controller())
  }

  fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
    now.duration_since(self.enqueued_at) > ttl
  }
}

impl fmt::Debug for QueuedRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedRequest")
      .field("payload", &self.payload)
      .field("enqueued_at", &self.enqueued_at)
      .field("callback", &self.callback.is_some())
      .finish()
  }
}

#[derive(Default)]
pub struct OfflineQueue {
  items: Mutex<VecDeque<QueuedRequest>>,
}

impl OfflineQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Evict expired and overflowing entries. Returns how many were dropped.
  pub fn clean(&self, ttl: Duration, max_size: usize) -> usize {
    let mut items = self.items.lock();
    Self::evict(&mut items, ttl, max_size, 0)
  }

  /// Evict, then append `request` so the queue never exceeds `max_size`.
  pub fn admit(&self, request: QueuedRequest, ttl: Duration, max_size: usize) -> usize {
    let mut items = self.items.lock();
    let evicted = Self::evict(&mut items, ttl, max_size, 1);
    items.push_back(request);
    evicted
  }

  fn evict(
    items: &mut VecDeque<QueuedRequest>,
    ttl: Duration,
    max_size: usize,
    reserve: usize,
  ) -> usize {
    let mut evicted = 0;

    if !ttl.is_zero() {
      let now = Instant::now();
      while items.front().is_some_and(|item| item.is_expired(now, ttl)) {
        items.pop_front();
        evicted += 1;
      }
    }

    if max_size > 0 {
      while items.len() + reserve > max_size && items.pop_front().is_some() {
        evicted += 1;
      }
    }

    if evicted > 0 {
      debug!(evicted, remaining = items.len(), "offline queue cleaned");
    }
    evicted
  }

  pub fn push(&self, request: QueuedRequest) {
    self.items.lock().push_back(request);
  }

  pub fn pop(&self) -> Option<QueuedRequest> {
    self.items.lock().pop_front()
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  /// Drop every queued request, returning them in order.
  pub fn drain_all(&self) -> Vec<QueuedRequest> {
    self.items.lock().drain(..).collect()
  }

  /// Payloads currently queued, oldest first.
  pub fn snapshot(&self) -> Vec<Value> {
    self.items.lock().iter().map(|item| item.payload.clone()).collect()
  }

  /// Append loader-provided requests not already queued.
  ///
  /// Entries are matched on their requestId/action/controller triple. An
  /// entry missing any of these is a configuration error and nothing is
  /// merged.
  pub fn merge(&self, loaded: Vec<QueuedRequest>) -> Result<usize> {
    if let Some(bad) = loaded
      .iter()
      .find(|item| item.request_id().is_none() || item.action().is_none() || item.controller().is_none())
    {
      return Err(Error::InvalidQueueEntry(format!(
        "one or more missing properties: requestId, action, controller. Entry: {}",
        bad.payload
      )));
    }

    let mut items = self.items.lock();
    let mut merged = 0;
    for item in loaded {
      let duplicate = items.iter().any(|queued| queued.identity() == item.identity());
      if !duplicate {
        items.push_back(item);
        merged += 1;
      }
    }
    Ok(merged)
  }
}
