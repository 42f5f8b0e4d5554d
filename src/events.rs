//! Lifecycle event listeners.
//!
//! Any number of listeners can be registered per [`Event`]. Emission of a
//! given event type is throttled: a second emission within
//! [`EVENT_THROTTLE`](crate::protocol::EVENT_THROTTLE) of the previous one is
//! dropped, which coalesces duplicate signals coming from the transport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::EVENT_THROTTLE;

/// Events emitted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
  Connected,
  Disconnected,
  Reconnected,
  Error,
  TokenExpired,
  LoginAttempt,
  OfflineQueuePush,
  OfflineQueuePop,
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Event::Connected => "connected",
      Event::Disconnected => "disconnected",
      Event::Reconnected => "reconnected",
      Event::Error => "error",
      Event::TokenExpired => "tokenExpired",
      Event::LoginAttempt => "loginAttempt",
      Event::OfflineQueuePush => "offlineQueuePush",
      Event::OfflineQueuePop => "offlineQueuePop",
    };
    write!(f, "{}", name)
  }
}

/// Callback invoked with the event payload.
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventBus::add`], used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct EventList {
  listeners: Vec<(ListenerId, EventListener)>,
  last_emitted: Option<Instant>,
}

pub struct EventBus {
  lists: DashMap<Event, EventList>,
  next_id: AtomicU64,
  throttle: Duration,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

impl EventBus {
  pub fn new() -> Self {
    Self::with_throttle(EVENT_THROTTLE)
  }

  pub fn with_throttle(throttle: Duration) -> Self {
    Self {
      lists: DashMap::new(),
      next_id: AtomicU64::new(1),
      throttle,
    }
  }

  pub fn add<F>(&self, event: Event, listener: F) -> ListenerId
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .lists
      .entry(event)
      .or_default()
      .listeners
      .push((id, Arc::new(listener)));
    id
  }

  /// Remove one listener. Returns false if it was not registered.
  pub fn remove(&self, event: Event, id: ListenerId) -> bool {
    match self.lists.get_mut(&event) {
      Some(mut list) => {
        let before = list.listeners.len();
        list.listeners.retain(|(lid, _)| *lid != id);
        list.listeners.len() != before
      }
      None => false,
    }
  }

  /// Remove every listener of `event`, or of all events when `None`.
  pub fn remove_all(&self, event: Option<Event>) {
    match event {
      Some(event) => {
        if let Some(mut list) = self.lists.get_mut(&event) {
          list.listeners.clear();
        }
      }
      None => self.lists.clear(),
    }
  }

  pub fn listener_count(&self, event: Event) -> usize {
    self.lists.get(&event).map_or(0, |list| list.listeners.len())
  }

  /// Invoke every listener of `event` unless it fired within the throttle window.
  ///
  /// Returns whether listeners were called.
  pub fn emit(&self, event: Event, payload: &Value) -> bool {
    let listeners = {
      let Some(mut list) = self.lists.get_mut(&event) else {
        return false;
      };
      let now = Instant::now();
      if let Some(last) = list.last_emitted {
        if now.duration_since(last) < self.throttle {
          debug!(%event, "event throttled");
          return false;
        }
      }
      list.last_emitted = Some(now);
      list.listeners.clone()
    };

    // Listeners may re-enter the bus, so the shard lock is released first.
    for (_, listener) in listeners {
      listener(payload);
    }
    true
  }
}
