//! Real-time subscriptions.
//!
//! A [`Room`] is one subscription made by this client. Several rooms with
//! the same filters share one server-side room id, and notifications are
//! routed by the channel the server assigned to each subscription. The
//! [`SubscriptionRegistry`] tracks which rooms wait for an acknowledgement,
//! which are bound to a room id, and which listen on a channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{Kuzzle, WeakKuzzle};
use crate::error::{Error, ResponseError, Result};
use crate::options::{QueryOptions, RoomOptions};
use crate::protocol::{str_field, Routing, REALTIME_CONTROLLER, RENEWAL_DELAY, UNSUBSCRIBE_RETRY_INTERVAL};

/// Receives every notification forwarded to a room.
pub type NotificationListener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Told about the outcome of each subscription (re)negotiation.
pub type SubscribeCallback = Arc<dyn Fn(std::result::Result<Room, ResponseError>) + Send + Sync>;

/// Completion of a subscriber count request.
pub type CountCallback = Box<dyn FnOnce(std::result::Result<u64, ResponseError>) + Send>;

/// Notification pushed by the server on a subscription channel
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  #[serde(default)]
  pub request_id: Option<String>,
  /// `document`, `user` or `TokenExpired`
  #[serde(rename = "type", default)]
  pub kind: Option<String>,
  #[serde(default)]
  pub room: Option<String>,
  #[serde(default)]
  pub index: Option<String>,
  #[serde(default)]
  pub collection: Option<String>,
  #[serde(default)]
  pub controller: Option<String>,
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub scope: Option<String>,
  #[serde(default)]
  pub state: Option<String>,
  #[serde(default)]
  pub volatile: Value,
  #[serde(default)]
  pub result: Value,
  /// Milliseconds since the epoch
  #[serde(default)]
  pub timestamp: Option<i64>,
}

impl Notification {
  pub fn from_value(value: &Value) -> Result<Self> {
    Ok(serde_json::from_value(value.clone())?)
  }

  pub fn is_token_expired(&self) -> bool {
    self.kind.as_deref() == Some("TokenExpired")
  }

  pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
    self.timestamp.and_then(DateTime::from_timestamp_millis)
  }
}

/// Where a room stands in its subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
  Unsubscribed,
  /// Waiting for a connection to subscribe
  Pending,
  /// Subscribe request sent, no answer yet
  Subscribing,
  Active,
}

enum DeferredOp {
  Renew {
    filters: Option<Value>,
    listener: NotificationListener,
    on_subscribed: Option<SubscribeCallback>,
  },
  Unsubscribe,
  Count(CountCallback),
}

struct RoomState {
  phase: SubscriptionPhase,
  filters: Value,
  room_id: Option<String>,
  channel: Option<String>,
  last_renewal: Option<Instant>,
  subscribe_to_self: bool,
  listener: Option<NotificationListener>,
  on_subscribed: Option<SubscribeCallback>,
  deferred: Vec<DeferredOp>,
}

struct RoomInner {
  id: String,
  client: WeakKuzzle,
  index: String,
  collection: String,
  options: RoomOptions,
  state: Mutex<RoomState>,
}

/// One real-time subscription
#[derive(Clone)]
pub struct Room {
  inner: Arc<RoomInner>,
}

impl Room {
  pub fn new(
    client: &Kuzzle,
    index: impl Into<String>,
    collection: impl Into<String>,
    options: RoomOptions,
  ) -> Result<Self> {
    client.is_valid()?;
    Ok(Room {
      inner: Arc::new(RoomInner {
        id: Uuid::new_v4().to_string(),
        client: client.downgrade(),
        index: index.into(),
        collection: collection.into(),
        state: Mutex::new(RoomState {
          phase: SubscriptionPhase::Unsubscribed,
          filters: json!({}),
          room_id: None,
          channel: None,
          last_renewal: None,
          subscribe_to_self: options.subscribe_to_self,
          listener: None,
          on_subscribed: None,
          deferred: Vec::new(),
        }),
        options,
      }),
    })
  }

  /// Client-side identifier of this subscription.
  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn index(&self) -> &str {
    &self.inner.index
  }

  pub fn collection(&self) -> &str {
    &self.inner.collection
  }

  /// Server-side room id, once subscribed.
  pub fn room_id(&self) -> Option<String> {
    self.inner.state.lock().room_id.clone()
  }

  pub fn channel(&self) -> Option<String> {
    self.inner.state.lock().channel.clone()
  }

  pub fn phase(&self) -> SubscriptionPhase {
    self.inner.state.lock().phase
  }

  pub fn filters(&self) -> Value {
    self.inner.state.lock().filters.clone()
  }

  pub fn subscribe_to_self(&self) -> bool {
    self.inner.state.lock().subscribe_to_self
  }

  pub fn set_subscribe_to_self(&self, enabled: bool) {
    self.inner.state.lock().subscribe_to_self = enabled;
  }

  fn client(&self) -> Result<Kuzzle> {
    let client = self.inner.client.upgrade().ok_or(Error::Invalidated)?;
    client.is_valid()?;
    Ok(client)
  }

  fn routing(&self, action: &str) -> Routing {
    Routing::new(REALTIME_CONTROLLER, action)
      .with_index(self.inner.index.clone())
      .with_collection(self.inner.collection.clone())
  }

  /// Subscribe, or resubscribe, with `filters` (`None` keeps the current ones).
  ///
  /// A second renewal within the debounce window of the last successful one
  /// is ignored. Offline, the room is parked until the client connects.
  pub fn renew(
    &self,
    filters: Option<Value>,
    listener: NotificationListener,
    on_subscribed: Option<SubscribeCallback>,
  ) -> Result<()> {
    let client = self.client()?;

    let payload = {
      let mut st = self.inner.state.lock();
      if let Some(last) = st.last_renewal {
        if Instant::now().duration_since(last) <= RENEWAL_DELAY {
          match &filters {
            Some(filters) if *filters != st.filters => {
              debug!(room = %self.inner.id, %filters, "renewal ignored, new filters not applied");
            }
            _ => debug!(room = %self.inner.id, "renewal ignored, too close to the previous one"),
          }
          st.listener = Some(listener);
          return Ok(());
        }
      }

      if st.phase == SubscriptionPhase::Subscribing {
        st.deferred.push(DeferredOp::Renew {
          filters,
          listener,
          on_subscribed,
        });
        return Ok(());
      }

      if let Some(filters) = filters {
        st.filters = filters;
      }
      st.listener = Some(listener);
      st.on_subscribed = on_subscribed;

      if !client.is_connected() {
        st.phase = SubscriptionPhase::Pending;
        drop(st);
        client.subscriptions().add_pending(self.clone());
        return Ok(());
      }

      st.phase = SubscriptionPhase::Subscribing;
      Value::Object(subscribe_body(&st.filters, &self.inner.options))
    };

    self.release(&client);
    client.subscriptions().add_pending(self.clone());

    let options = QueryOptions::new().with_volatile(self.inner.options.volatile.clone());
    let room = self.clone();
    client.query(
      &self.routing("subscribe"),
      payload,
      &options,
      Some(Box::new(move |res| room.on_subscribe_response(res))),
    )
  }

  /// Renew with the stored listener, if the room was ever subscribed.
  pub(crate) fn resume(&self) -> Result<()> {
    let (listener, on_subscribed) = {
      let st = self.inner.state.lock();
      (st.listener.clone(), st.on_subscribed.clone())
    };
    match listener {
      Some(listener) => self.renew(None, listener, on_subscribed),
      None => Ok(()),
    }
  }

  fn on_subscribe_response(&self, res: std::result::Result<Value, ResponseError>) {
    let Some(client) = self.inner.client.upgrade() else {
      return;
    };
    client.subscriptions().remove_pending(&self.inner.id);

    let acknowledged = res.and_then(|response| {
      let result = &response["result"];
      match (str_field(result, "roomId"), str_field(result, "channel")) {
        (Some(room_id), Some(channel)) => Ok((room_id.to_string(), channel.to_string())),
        _ => Err(ResponseError::new(0, format!("malformed subscribe response: {}", response))),
      }
    });

    match acknowledged {
      Ok((room_id, channel)) => {
        let on_subscribed = {
          let mut st = self.inner.state.lock();
          st.phase = SubscriptionPhase::Active;
          st.last_renewal = Some(Instant::now());
          st.room_id = Some(room_id.clone());
          st.channel = Some(channel.clone());
          st.on_subscribed.clone()
        };
        debug!(room = %self.inner.id, room_id, channel, "subscribed");
        client.subscriptions().add_active(&room_id, self.clone());
        client.subscriptions().listen(&channel, self.clone());

        if let Some(cb) = on_subscribed {
          cb(Ok(self.clone()));
        }
        self.flush_deferred();
      }
      Err(err) => {
        warn!(room = %self.inner.id, "Subscription failed: {}", err);
        let (on_subscribed, deferred) = {
          let mut st = self.inner.state.lock();
          st.phase = SubscriptionPhase::Unsubscribed;
          (st.on_subscribed.clone(), std::mem::take(&mut st.deferred))
        };
        for op in deferred {
          if let DeferredOp::Count(cb) = op {
            cb(Err(err.clone()));
          }
        }
        if let Some(cb) = on_subscribed {
          cb(Err(err));
        }
      }
    }
  }

  fn flush_deferred(&self) {
    let deferred = std::mem::take(&mut self.inner.state.lock().deferred);
    for op in deferred {
      let outcome = match op {
        DeferredOp::Renew {
          filters,
          listener,
          on_subscribed,
        } => self.renew(filters, listener, on_subscribed),
        DeferredOp::Unsubscribe => self.unsubscribe(),
        DeferredOp::Count(cb) => {
          if self.room_id().is_some() {
            self.count(cb)
          } else {
            cb(Err(ResponseError::new(0, Error::InactiveRoom.to_string())));
            Ok(())
          }
        }
      };
      if let Err(e) = outcome {
        warn!(room = %self.inner.id, "Deferred room operation failed: {}", e);
      }
    }
  }

  /// Stop listening for notifications.
  ///
  /// The server-side room is only left once no other subscription of this
  /// client shares it.
  pub fn unsubscribe(&self) -> Result<()> {
    let client = self.client()?;
    {
      let mut st = self.inner.state.lock();
      if !client.is_connected() || st.phase == SubscriptionPhase::Subscribing {
        st.deferred.push(DeferredOp::Unsubscribe);
        return Ok(());
      }
    }
    self.release(&client);
    Ok(())
  }

  /// Detach from the channel and room id, leaving the room on the server if unused.
  fn release(&self, client: &Kuzzle) {
    let (room_id, channel) = {
      let mut st = self.inner.state.lock();
      if st.phase == SubscriptionPhase::Active {
        st.phase = SubscriptionPhase::Unsubscribed;
      }
      (st.room_id.take(), st.channel.take())
    };
    let Some(room_id) = room_id else {
      return;
    };

    let registry = client.subscriptions();
    if let Some(channel) = channel {
      registry.unlisten(&channel, &self.inner.id);
    }
    registry.remove_active(&room_id, &self.inner.id);
    if registry.has_active(&room_id) {
      return;
    }

    let routing = self.routing("unsubscribe");
    let payload = json!({ "body": { "roomId": room_id } });
    if registry.pending_is_empty() {
      send_unsubscribe(client, &routing, payload);
      return;
    }

    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        runtime.spawn(retry_unsubscribe(client.downgrade(), routing, room_id, payload));
      }
      Err(_) => {
        warn!(room_id, "No runtime to wait for pending subscriptions, unsubscribing now");
        send_unsubscribe(client, &routing, payload);
      }
    }
  }

  /// Number of subscribers of this room on the server.
  pub fn count(&self, callback: CountCallback) -> Result<()> {
    let client = self.client()?;
    let room_id = {
      let mut st = self.inner.state.lock();
      if !client.is_connected() || st.phase == SubscriptionPhase::Subscribing {
        st.deferred.push(DeferredOp::Count(callback));
        return Ok(());
      }
      st.room_id.clone().ok_or(Error::InactiveRoom)?
    };

    client.query(
      &self.routing("count"),
      json!({ "body": { "roomId": room_id } }),
      &QueryOptions::new(),
      Some(Box::new(move |res| {
        callback(res.and_then(|response| {
          response["result"]["count"]
            .as_u64()
            .ok_or_else(|| ResponseError::new(0, "count: missing count"))
        }))
      })),
    )
  }

  /// Forward a notification routed to this room's channel.
  pub(crate) fn deliver(&self, notification: &Notification, from_self: bool) {
    let listener = {
      let st = self.inner.state.lock();
      if from_self && !st.subscribe_to_self {
        return;
      }
      st.listener.clone()
    };
    if let Some(listener) = listener {
      listener(notification);
    }
  }

  /// Park the room so it is renewed when the connection comes back. The
  /// lost connection took the server-side subscription with it, so the
  /// renewal is not debounced.
  pub(crate) fn mark_pending(&self) {
    let mut st = self.inner.state.lock();
    if matches!(st.phase, SubscriptionPhase::Active | SubscriptionPhase::Subscribing) {
      st.phase = SubscriptionPhase::Pending;
    }
    st.last_renewal = None;
  }
}

fn send_unsubscribe(client: &Kuzzle, routing: &Routing, payload: Value) {
  if let Err(e) = client.query(routing, payload, &QueryOptions::new(), None) {
    warn!("Unable to unsubscribe: {}", e);
  }
}

async fn retry_unsubscribe(client: WeakKuzzle, routing: Routing, room_id: String, payload: Value) {
  loop {
    tokio::time::sleep(UNSUBSCRIBE_RETRY_INTERVAL).await;
    let Some(client) = client.upgrade() else {
      return;
    };
    if client.is_valid().is_err() {
      return;
    }
    let registry = client.subscriptions();
    if registry.pending_is_empty() {
      if !registry.has_active(&room_id) {
        send_unsubscribe(&client, &routing, payload);
      }
      return;
    }
  }
}

/// Client-wide bookkeeping of subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
  pending: DashMap<String, Room>,
  active: DashMap<String, HashMap<String, Room>>,
  channels: DashMap<String, HashMap<String, Room>>,
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_pending(&self, room: Room) {
    self.pending.insert(room.inner.id.clone(), room);
  }

  pub fn remove_pending(&self, id: &str) -> bool {
    self.pending.remove(id).is_some()
  }

  pub fn is_pending(&self, id: &str) -> bool {
    self.pending.contains_key(id)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  pub fn pending_is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn add_active(&self, room_id: &str, room: Room) {
    self
      .active
      .entry(room_id.to_string())
      .or_default()
      .insert(room.inner.id.clone(), room);
  }

  pub fn remove_active(&self, room_id: &str, id: &str) {
    self.active.remove_if_mut(room_id, |_, rooms| {
      rooms.remove(id);
      rooms.is_empty()
    });
  }

  pub fn has_active(&self, room_id: &str) -> bool {
    self.active.get(room_id).is_some_and(|rooms| !rooms.is_empty())
  }

  pub fn active_rooms(&self, room_id: &str) -> Vec<Room> {
    self
      .active
      .get(room_id)
      .map(|rooms| rooms.values().cloned().collect())
      .unwrap_or_default()
  }

  pub fn listen(&self, channel: &str, room: Room) {
    self
      .channels
      .entry(channel.to_string())
      .or_default()
      .insert(room.inner.id.clone(), room);
  }

  pub fn unlisten(&self, channel: &str, id: &str) {
    self.channels.remove_if_mut(channel, |_, rooms| {
      rooms.remove(id);
      rooms.is_empty()
    });
  }

  /// Rooms listening on `channel`.
  pub fn listeners(&self, channel: &str) -> Vec<Room> {
    self
      .channels
      .get(channel)
      .map(|rooms| rooms.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Every pending and active room, each once.
  pub fn all_rooms(&self) -> Vec<Room> {
    let mut rooms: HashMap<String, Room> = HashMap::new();
    for entry in self.pending.iter() {
      rooms.insert(entry.key().clone(), entry.value().clone());
    }
    for entry in self.active.iter() {
      for (id, room) in entry.value() {
        rooms.insert(id.clone(), room.clone());
      }
    }
    rooms.into_values().collect()
  }

  /// Move every active room back to pending. Their room ids are kept.
  pub fn demote_active(&self) -> Vec<Room> {
    let mut demoted = Vec::new();
    let room_ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
    for room_id in room_ids {
      if let Some((_, rooms)) = self.active.remove(&room_id) {
        demoted.extend(rooms.into_values());
      }
    }
    for room in &demoted {
      self.add_pending(room.clone());
    }
    demoted
  }

  pub fn clear(&self) {
    self.pending.clear();
    self.active.clear();
    self.channels.clear();
  }
}

/// Room options and filters in the shape expected by `realtime/subscribe`.
pub(crate) fn subscribe_body(filters: &Value, options: &RoomOptions) -> Map<String, Value> {
  let mut body = Map::new();
  body.insert("body".to_string(), filters.clone());
  body.insert("scope".to_string(), json!(options.scope.to_string()));
  body.insert("state".to_string(), json!(options.state.to_string()));
  body.insert("users".to_string(), json!(options.users.to_string()));
  body
}
