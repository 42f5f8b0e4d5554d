//! Kuzzle client: connection lifecycle and request dispatch.
//!
//! A [`Kuzzle`] handle is cheap to clone. All socket lifecycle events and
//! inbound messages are processed by a single event-loop task, so state
//! transitions, queue draining and response dispatch never race each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collection::Collection;
use crate::correlator::{QueryCallback, RequestCorrelator, RequestHistory};
use crate::error::{Error, ResponseError, Result};
use crate::events::{Event, EventBus, ListenerId};
use crate::options::{ClientOptions, Mode, QueryOptions};
use crate::protocol::{
  add_headers, is_token_check, str_field, Response, Routing, TokenValidity, AUTH_CONTROLLER,
  CHECK_TOKEN_ACTION, LOGIN_ACTION, LOGOUT_ACTION, SDK_VERSION, SDK_VERSION_KEY,
};
use crate::queue::{accept_all, OfflineQueue, OfflineQueueLoader, QueueFilter, QueuedRequest};
use crate::room::{Notification, Room, SubscriptionRegistry};
use crate::state::ConnectionState;
use crate::transport::{websocket_factory, Transport, TransportConfig, TransportEvent, TransportFactory};

/// Completion of a `connect()` call.
pub type ConnectCallback = Box<dyn FnOnce(std::result::Result<(), ResponseError>) + Send>;

/// Completion of a token check.
pub type TokenCallback = Box<dyn FnOnce(std::result::Result<TokenValidity, ResponseError>) + Send>;

/// Completion of a server time request.
pub type TimeCallback = Box<dyn FnOnce(std::result::Result<DateTime<Utc>, ResponseError>) + Send>;

/// Runtime-adjustable settings
#[derive(Debug, Clone, Copy)]
struct Settings {
  port: u16,
  auto_queue: bool,
  auto_reconnect: bool,
  auto_replay: bool,
  auto_resubscribe: bool,
  queue_max_size: usize,
  queue_ttl: Duration,
  replay_interval: Duration,
  reconnection_delay: Duration,
}

pub(crate) struct ClientInner {
  host: String,
  settings: RwLock<Settings>,
  state: RwLock<ConnectionState>,
  queuing: AtomicBool,
  draining: AtomicBool,
  jwt: RwLock<Option<String>>,
  default_index: RwLock<Option<String>>,
  headers: RwLock<Map<String, Value>>,
  volatile: RwLock<Map<String, Value>>,
  queue_filter: RwLock<QueueFilter>,
  queue_loader: RwLock<Option<Arc<dyn OfflineQueueLoader>>>,
  events: EventBus,
  queue: OfflineQueue,
  correlator: RequestCorrelator,
  history: RequestHistory,
  subscriptions: SubscriptionRegistry,
  collections: DashMap<(String, String), Collection>,
  factory: TransportFactory,
  transport: Mutex<Option<Arc<dyn Transport>>>,
  event_loop: Mutex<Option<JoinHandle<()>>>,
  connect_callback: Mutex<Option<ConnectCallback>>,
}

impl Drop for ClientInner {
  fn drop(&mut self) {
    if let Some(transport) = self.transport.get_mut().take() {
      transport.close();
    }
    if let Some(task) = self.event_loop.get_mut().take() {
      task.abort();
    }
  }
}

/// Kuzzle client handle
#[derive(Clone)]
pub struct Kuzzle {
  inner: Arc<ClientInner>,
}

/// Non-owning reference to a client, held by rooms and collections.
#[derive(Clone)]
pub(crate) struct WeakKuzzle(Weak<ClientInner>);

impl WeakKuzzle {
  pub(crate) fn upgrade(&self) -> Option<Kuzzle> {
    self.0.upgrade().map(|inner| Kuzzle { inner })
  }
}

impl Kuzzle {
  /// Create a client talking websocket to `host`.
  ///
  /// Connects right away unless `options.connect` is [`Mode::Manual`], in
  /// which case the client waits in the `Ready` state.
  pub fn new(host: impl Into<String>, options: ClientOptions) -> Result<Self> {
    Self::with_transport(host, options, websocket_factory())
  }

  /// Create a client using a custom transport factory.
  pub fn with_transport(
    host: impl Into<String>,
    options: ClientOptions,
    factory: TransportFactory,
  ) -> Result<Self> {
    let host = host.into();
    if host.is_empty() {
      return Err(Error::InvalidArgument(
        "host name/address can't be empty".to_string(),
      ));
    }

    let options = options.resolved();
    let settings = Settings {
      port: options.port,
      auto_queue: options.auto_queue,
      auto_reconnect: options.auto_reconnect,
      auto_replay: options.auto_replay,
      auto_resubscribe: options.auto_resubscribe,
      queue_max_size: options.queue_max_size,
      queue_ttl: options.queue_ttl,
      replay_interval: options.replay_interval,
      reconnection_delay: options.reconnection_delay,
    };

    let client = Kuzzle {
      inner: Arc::new(ClientInner {
        host,
        settings: RwLock::new(settings),
        state: RwLock::new(ConnectionState::Initializing),
        queuing: AtomicBool::new(false),
        draining: AtomicBool::new(false),
        jwt: RwLock::new(None),
        default_index: RwLock::new(options.default_index),
        headers: RwLock::new(options.headers),
        volatile: RwLock::new(options.volatile),
        queue_filter: RwLock::new(accept_all()),
        queue_loader: RwLock::new(None),
        events: EventBus::new(),
        queue: OfflineQueue::new(),
        correlator: RequestCorrelator::new(),
        history: RequestHistory::default(),
        subscriptions: SubscriptionRegistry::new(),
        collections: DashMap::new(),
        factory,
        transport: Mutex::new(None),
        event_loop: Mutex::new(None),
        connect_callback: Mutex::new(None),
      }),
    };

    match options.connect {
      Mode::Auto => client.connect()?,
      Mode::Manual => client.set_state(ConnectionState::Ready),
    }
    Ok(client)
  }

  pub(crate) fn downgrade(&self) -> WeakKuzzle {
    WeakKuzzle(Arc::downgrade(&self.inner))
  }

  // ==================== Connection lifecycle ====================

  pub fn connect(&self) -> Result<()> {
    self.connect_with(None)
  }

  /// Open the connection, reporting the outcome of the first attempt to `callback`.
  ///
  /// While a connection is already established or in progress this only
  /// invokes `callback` with success.
  pub fn connect_with(&self, callback: Option<ConnectCallback>) -> Result<()> {
    if !self.state().can_connect() {
      if let Some(cb) = callback {
        cb(Ok(()));
      }
      return Ok(());
    }

    let runtime = Handle::try_current()
      .map_err(|e| Error::Connection(format!("no tokio runtime: {}", e)))?;

    self.close_transport();
    *self.inner.connect_callback.lock() = callback;
    self.set_state(ConnectionState::Connecting);

    let config = self.transport_config();
    info!("Connecting to {}", config.url());
    let transport = (self.inner.factory)(&config);
    let (tx, rx) = mpsc::unbounded_channel();

    let task = runtime.spawn(event_loop(Arc::downgrade(&self.inner), rx));
    *self.inner.event_loop.lock() = Some(task);
    *self.inner.transport.lock() = Some(transport.clone());

    if let Err(e) = transport.open(tx) {
      self.on_connect_error(e.to_string());
    }
    Ok(())
  }

  /// Connect and wait for the first attempt to complete.
  pub async fn connect_async(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self.connect_with(Some(Box::new(move |res| {
      let _ = tx.send(res);
    })))?;
    match rx.await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(Error::Connection(e.message)),
      Err(_) => Err(Error::ChannelClosed),
    }
  }

  /// Close the connection and invalidate this client.
  ///
  /// Every later call on the client fails with [`Error::Invalidated`].
  pub fn disconnect(&self) {
    self.close_transport();
    self.set_state(ConnectionState::Disconnected);
    self.inner.subscriptions.clear();
    self.inner.correlator.clear();
    info!("Disconnected from {}", self.inner.host);
  }

  fn close_transport(&self) {
    let transport = self.inner.transport.lock().take();
    if let Some(transport) = transport {
      transport.close();
    }
    let task = self.inner.event_loop.lock().take();
    if let Some(task) = task {
      task.abort();
    }
    self.inner.collections.clear();
  }

  fn transport_config(&self) -> TransportConfig {
    let settings = *self.inner.settings.read();
    TransportConfig {
      host: self.inner.host.clone(),
      port: settings.port,
      auto_reconnect: settings.auto_reconnect,
      reconnection_delay: settings.reconnection_delay,
    }
  }

  fn set_state(&self, state: ConnectionState) {
    let previous = std::mem::replace(&mut *self.inner.state.write(), state);
    if previous != state {
      debug!(from = %previous, to = %state, "connection state changed");
    }
  }

  pub fn state(&self) -> ConnectionState {
    *self.inner.state.read()
  }

  pub fn is_connected(&self) -> bool {
    self.state().is_connected()
  }

  /// Fail with [`Error::Invalidated`] once the client has been disconnected.
  pub fn is_valid(&self) -> Result<()> {
    if self.state().is_terminal() {
      return Err(Error::Invalidated);
    }
    Ok(())
  }

  pub(crate) fn handle_transport_event(&self, event: TransportEvent) {
    match event {
      TransportEvent::Connected => self.on_connected(),
      TransportEvent::ConnectError(reason) => self.on_connect_error(reason),
      TransportEvent::Disconnected(reason) => self.on_disconnected(reason),
      TransportEvent::Reconnected => self.on_reconnected(),
      TransportEvent::Message(message) => self.dispatch_message(message),
    }
  }

  fn on_connected(&self) {
    info!("Connected to {}", self.inner.host);
    self.set_state(ConnectionState::Connected);
    self.renew_subscriptions();
    self.replay_or_report();
    self.inner.events.emit(Event::Connected, &Value::Null);
    let callback = self.inner.connect_callback.lock().take();
    if let Some(cb) = callback {
      cb(Ok(()));
    }
  }

  fn on_connect_error(&self, reason: String) {
    warn!("Unable to connect to {}: {}", self.inner.host, reason);
    self.set_state(ConnectionState::Error);
    self.inner.events.emit(Event::Error, &json!({ "message": reason }));
    let callback = self.inner.connect_callback.lock().take();
    if let Some(cb) = callback {
      cb(Err(ResponseError::new(0, reason)));
    }
  }

  fn on_disconnected(&self, reason: String) {
    warn!("Connection to {} lost: {}", self.inner.host, reason);
    self.set_state(ConnectionState::Offline);

    let settings = *self.inner.settings.read();
    if !settings.auto_reconnect {
      self.disconnect();
    }
    if settings.auto_queue {
      self.inner.queuing.store(true, Ordering::SeqCst);
    }
    if settings.auto_resubscribe {
      self.inner.subscriptions.demote_active();
      for room in self.inner.subscriptions.all_rooms() {
        room.mark_pending();
      }
    }
    self.inner.events.emit(Event::Disconnected, &Value::Null);
  }

  fn on_reconnected(&self) {
    info!("Reconnected to {}", self.inner.host);
    self.set_state(ConnectionState::Connected);

    let token = self.inner.jwt.read().clone();
    let Some(token) = token else {
      self.after_reconnect();
      return;
    };

    let client = self.downgrade();
    let checked = self.check_token(
      &token,
      Box::new(move |res| {
        let Some(client) = client.upgrade() else {
          return;
        };
        let expired = match res {
          Ok(validity) => !validity.valid,
          Err(_) => true,
        };
        if expired {
          client.expire_token();
        }
        client.after_reconnect();
      }),
    );
    if let Err(e) = checked {
      warn!("Token check after reconnection failed: {}", e);
      self.expire_token();
      self.after_reconnect();
    }
  }

  fn after_reconnect(&self) {
    let settings = *self.inner.settings.read();
    if settings.auto_resubscribe {
      self.renew_subscriptions();
    }
    if settings.auto_replay {
      self.clean_queue();
      self.replay_or_report();
    }
    self.inner.events.emit(Event::Reconnected, &Value::Null);
  }

  fn expire_token(&self) {
    *self.inner.jwt.write() = None;
    self.inner.events.emit(Event::TokenExpired, &Value::Null);
  }

  // ==================== Response dispatch ====================

  fn dispatch_message(&self, message: Value) {
    if let Some(channel) = str_field(&message, "room") {
      let rooms = self.inner.subscriptions.listeners(channel);
      if !rooms.is_empty() {
        self.dispatch_notification(&message, rooms);
        return;
      }
    }

    let response = match Response::parse(&message) {
      Ok(response) => response,
      Err(e) => {
        warn!("Dropping unreadable message: {}", e);
        return;
      }
    };
    let Some(request_id) = response.request_id.as_deref() else {
      debug!("Ignoring message without requestId");
      return;
    };

    let error = response.error();
    if let Some(err) = &error {
      if err.is_token_expired() && response.action.as_deref() != Some(LOGOUT_ACTION) {
        self.expire_token();
      }
    }

    match self.inner.correlator.take(request_id) {
      Some(cb) => match error {
        Some(err) => cb(Err(err)),
        None => cb(Ok(message)),
      },
      None => debug!(request_id, "no pending handler for response"),
    }
  }

  fn dispatch_notification(&self, message: &Value, rooms: Vec<Room>) {
    let notification = match Notification::from_value(message) {
      Ok(notification) => notification,
      Err(e) => {
        warn!("Dropping unreadable notification: {}", e);
        return;
      }
    };
    if notification.is_token_expired() {
      self.expire_token();
    }

    let request_id = notification.request_id.clone();
    let from_self = request_id
      .as_deref()
      .is_some_and(|id| self.inner.history.contains(id));

    for room in rooms {
      room.deliver(&notification, from_self);
    }
    if let (true, Some(id)) = (from_self, request_id) {
      self.inner.history.remove(&id);
    }
  }

  // ==================== Query ====================

  /// Send a request to Kuzzle.
  ///
  /// Argument errors are returned right away. Everything else, including
  /// requests discarded because the client is offline, is reported through
  /// `callback`.
  pub fn query(
    &self,
    routing: &Routing,
    payload: Value,
    options: &QueryOptions,
    callback: Option<QueryCallback>,
  ) -> Result<()> {
    self.is_valid()?;
    routing.validate()?;

    let mut request = match payload {
      Value::Object(map) => map,
      Value::Null => Map::new(),
      other => {
        return Err(Error::InvalidArgument(format!(
          "query: payload must be an object, got {}",
          other
        )))
      }
    };

    if request.get("requestId").map_or(true, Value::is_null) {
      request.insert("requestId".to_string(), json!(Uuid::new_v4().to_string()));
    }
    request.insert("controller".to_string(), json!(routing.controller));
    request.insert("action".to_string(), json!(routing.action));

    let state = self.state();
    if !options.queuable && state != ConnectionState::Connected {
      discard(Value::Object(request), callback);
      return Ok(());
    }

    if let Some(extra) = &options.volatile {
      request.insert("volatile".to_string(), Value::Object(extra.clone()));
    } else {
      request.remove("volatile");
    }
    options.apply(&mut request);

    if let Some(index) = &routing.index {
      request.insert("index".to_string(), json!(index));
    }
    if let Some(collection) = &routing.collection {
      request.insert("collection".to_string(), json!(collection));
    }

    if state == ConnectionState::Connected || !options.queuable {
      self.transmit(request, callback);
    } else if self.inner.queuing.load(Ordering::SeqCst) || options.queuable || state.is_starting() {
      self.enqueue(Value::Object(request), callback);
    } else {
      discard(Value::Object(request), callback);
    }
    Ok(())
  }

  /// Send a request and await its response.
  pub async fn query_async(
    &self,
    routing: &Routing,
    payload: Value,
    options: &QueryOptions,
  ) -> Result<Value> {
    let (tx, rx) = oneshot::channel();
    self.query(
      routing,
      payload,
      options,
      Some(Box::new(move |res| {
        let _ = tx.send(res);
      })),
    )?;
    match rx.await {
      Ok(res) => res.map_err(Error::from),
      Err(_) => Err(Error::ChannelClosed),
    }
  }

  /// Attach the client-wide data current at transmission time: volatile
  /// data (the request's own keys win), common headers and the token.
  fn stamp(&self, request: &mut Map<String, Value>) {
    let mut volatile = self.inner.volatile.read().clone();
    if let Some(Value::Object(own)) = request.remove("volatile") {
      volatile.extend(own);
    }
    volatile.insert(SDK_VERSION_KEY.to_string(), json!(SDK_VERSION));
    request.insert("volatile".to_string(), Value::Object(volatile));

    add_headers(request, &self.inner.headers.read());

    let field = |key: &str| request.get(key).and_then(Value::as_str);
    if !is_token_check(field("controller"), field("action")) {
      match self.inner.jwt.read().as_ref() {
        Some(token) => {
          request.insert("jwt".to_string(), json!(token));
        }
        None => {
          request.remove("jwt");
        }
      }
    }
  }

  fn transmit(&self, mut request: Map<String, Value>, callback: Option<QueryCallback>) {
    self.stamp(&mut request);
    self.emit_request(Value::Object(request), callback);
  }

  fn enqueue(&self, request: Value, callback: Option<QueryCallback>) {
    let filter = self.inner.queue_filter.read().clone();
    if !filter(&request) {
      debug!(request_id = ?str_field(&request, "requestId"), "request rejected by queue filter");
      return;
    }

    let settings = *self.inner.settings.read();
    self.inner.queue.admit(
      QueuedRequest::new(request.clone(), callback),
      settings.queue_ttl,
      settings.queue_max_size,
    );
    debug!(queued = self.inner.queue.len(), "request queued");
    self.inner.events.emit(Event::OfflineQueuePush, &json!({ "query": request }));
  }

  /// Register the handler, transmit, and remember the request id.
  fn emit_request(&self, request: Value, callback: Option<QueryCallback>) {
    let request_id = str_field(&request, "requestId").unwrap_or_default().to_string();
    if let Some(cb) = callback {
      self.inner.correlator.register(request_id.clone(), cb);
    }

    let transport = self.inner.transport.lock().clone();
    let sent = match transport {
      Some(transport) => transport.send(&request).map_err(Error::from),
      None => Err(Error::Transport("no transport".to_string())),
    };
    if let Err(e) = sent {
      warn!(request_id, "Unable to send request: {}", e);
      if let Some(cb) = self.inner.correlator.take(&request_id) {
        cb(Err(ResponseError::discarded(&request)));
      }
      return;
    }
    self.inner.history.record(request_id);
  }

  // ==================== Offline queue ====================

  fn clean_queue(&self) {
    let settings = *self.inner.settings.read();
    self.inner.queue.clean(settings.queue_ttl, settings.queue_max_size);
  }

  fn replay_or_report(&self) {
    if let Err(e) = self.dequeue() {
      error!("Offline queue replay aborted: {}", e);
      self.inner.events.emit(Event::Error, &json!({ "message": e.to_string() }));
    }
  }

  /// Merge loader entries, then drain the queue one request per replay interval.
  fn dequeue(&self) -> Result<()> {
    let loader = self.inner.queue_loader.read().clone();
    if let Some(loader) = loader {
      let merged = self.inner.queue.merge(loader.load())?;
      debug!(merged, "offline queue loader entries merged");
    }

    if self.inner.draining.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let runtime = match Handle::try_current() {
      Ok(runtime) => runtime,
      Err(e) => {
        self.inner.draining.store(false, Ordering::SeqCst);
        return Err(Error::Connection(format!("no tokio runtime: {}", e)));
      }
    };
    runtime.spawn(drain_queue(Arc::downgrade(&self.inner)));
    Ok(())
  }

  fn replay_one(&self) -> Option<Duration> {
    if self.state() != ConnectionState::Connected {
      return None;
    }
    let Some(item) = self.inner.queue.pop() else {
      self.inner.queuing.store(false, Ordering::SeqCst);
      return None;
    };

    let QueuedRequest { payload, callback, .. } = item;
    let request = match payload {
      Value::Object(request) => request,
      other => {
        warn!("Dropping queued request that is not an object: {}", other);
        return Some(Duration::ZERO);
      }
    };

    let popped = json!({ "query": request.clone() });
    self.transmit(request, callback);
    self.inner.events.emit(Event::OfflineQueuePop, &popped);
    Some(self.inner.settings.read().replay_interval)
  }

  /// Replay the queue by hand. No-op while offline or with `auto_replay` on.
  pub fn replay_queue(&self) -> Result<()> {
    self.is_valid()?;
    let auto_replay = self.inner.settings.read().auto_replay;
    if self.state() != ConnectionState::Offline && !auto_replay {
      self.clean_queue();
      self.dequeue()?;
    }
    Ok(())
  }

  /// Start queuing requests. Only honored while offline with `auto_queue` off.
  pub fn start_queuing(&self) {
    if self.state() == ConnectionState::Offline && !self.inner.settings.read().auto_queue {
      self.inner.queuing.store(true, Ordering::SeqCst);
    }
  }

  pub fn stop_queuing(&self) {
    if self.state() == ConnectionState::Offline && !self.inner.settings.read().auto_queue {
      self.inner.queuing.store(false, Ordering::SeqCst);
    }
  }

  pub fn is_queuing(&self) -> bool {
    self.inner.queuing.load(Ordering::SeqCst)
  }

  /// Drop every queued request without invoking their callbacks.
  pub fn flush_queue(&self) {
    let dropped = self.inner.queue.drain_all().len();
    debug!(dropped, "offline queue flushed");
  }

  /// Payloads currently waiting in the offline queue, oldest first.
  pub fn offline_queue(&self) -> Vec<Value> {
    self.inner.queue.snapshot()
  }

  pub fn set_queue_filter<F>(&self, filter: F)
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    *self.inner.queue_filter.write() = Arc::new(filter);
  }

  pub fn set_offline_queue_loader<L>(&self, loader: L)
  where
    L: OfflineQueueLoader + 'static,
  {
    *self.inner.queue_loader.write() = Some(Arc::new(loader));
  }

  // ==================== Settings ====================

  pub fn host(&self) -> &str {
    &self.inner.host
  }

  pub fn port(&self) -> u16 {
    self.inner.settings.read().port
  }

  pub fn set_auto_queue(&self, enabled: bool) {
    self.inner.settings.write().auto_queue = enabled;
  }

  pub fn set_auto_replay(&self, enabled: bool) {
    self.inner.settings.write().auto_replay = enabled;
  }

  pub fn set_auto_resubscribe(&self, enabled: bool) {
    self.inner.settings.write().auto_resubscribe = enabled;
  }

  pub fn set_queue_max_size(&self, max: usize) {
    self.inner.settings.write().queue_max_size = max;
  }

  pub fn set_queue_ttl(&self, ttl: Duration) {
    self.inner.settings.write().queue_ttl = ttl;
  }

  pub fn set_replay_interval(&self, interval: Duration) {
    self.inner.settings.write().replay_interval = interval;
  }

  /// Replace the volatile data attached to every request.
  pub fn set_volatile(&self, volatile: Map<String, Value>) {
    *self.inner.volatile.write() = volatile;
  }

  pub fn volatile(&self) -> Map<String, Value> {
    self.inner.volatile.read().clone()
  }

  /// Merge `content` into the common headers, or replace them entirely.
  pub fn set_headers(&self, content: Map<String, Value>, replace: bool) {
    let mut headers = self.inner.headers.write();
    if replace {
      *headers = content;
    } else {
      headers.extend(content);
    }
  }

  pub fn headers(&self) -> Map<String, Value> {
    self.inner.headers.read().clone()
  }

  pub fn set_default_index(&self, index: impl Into<String>) -> Result<()> {
    let index = index.into();
    if index.is_empty() {
      return Err(Error::InvalidArgument(
        "set_default_index: index name can't be empty".to_string(),
      ));
    }
    *self.inner.default_index.write() = Some(index);
    Ok(())
  }

  pub fn default_index(&self) -> Option<String> {
    self.inner.default_index.read().clone()
  }

  // ==================== Listeners ====================

  pub fn add_listener<F>(&self, event: Event, listener: F) -> Result<ListenerId>
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    self.is_valid()?;
    Ok(self.inner.events.add(event, listener))
  }

  pub fn remove_listener(&self, event: Event, id: ListenerId) -> bool {
    self.inner.events.remove(event, id)
  }

  pub fn remove_all_listeners(&self, event: Option<Event>) {
    self.inner.events.remove_all(event);
  }

  // ==================== Collections and subscriptions ====================

  /// Handle on a data collection. Falls back to the default index.
  pub fn collection(&self, collection: &str, index: Option<&str>) -> Result<Collection> {
    self.is_valid()?;
    let index = match index {
      Some(index) => index.to_string(),
      None => self.default_index().ok_or_else(|| {
        Error::InvalidArgument("collection: unable to create a collection without an index".to_string())
      })?,
    };
    if collection.is_empty() {
      return Err(Error::InvalidArgument(
        "collection: collection name can't be empty".to_string(),
      ));
    }

    let key = (index.clone(), collection.to_string());
    let handle = self
      .inner
      .collections
      .entry(key)
      .or_insert_with(|| Collection::new(self, index, collection.to_string()))
      .clone();
    Ok(handle)
  }

  pub(crate) fn subscriptions(&self) -> &SubscriptionRegistry {
    &self.inner.subscriptions
  }

  /// Number of subscriptions waiting for a server acknowledgement.
  pub fn pending_subscriptions(&self) -> usize {
    self.inner.subscriptions.pending_count()
  }

  /// Subscriptions currently bound to `room_id` on the server.
  pub fn rooms(&self, room_id: &str) -> Vec<Room> {
    self.inner.subscriptions.active_rooms(room_id)
  }

  /// Ask every known subscription to renew itself.
  pub(crate) fn renew_subscriptions(&self) {
    for room in self.inner.subscriptions.all_rooms() {
      if let Err(e) = room.resume() {
        warn!(room = room.id(), "Unable to renew subscription: {}", e);
      }
    }
  }

  pub fn request_history(&self) -> &RequestHistory {
    &self.inner.history
  }

  // ==================== Authentication ====================

  /// Ask the server whether `token` is valid. The stored token is not sent.
  pub fn check_token(&self, token: &str, callback: TokenCallback) -> Result<()> {
    if token.is_empty() {
      return Err(Error::InvalidArgument(
        "check_token: token required".to_string(),
      ));
    }
    self.query(
      &Routing::new(AUTH_CONTROLLER, CHECK_TOKEN_ACTION),
      json!({ "body": { "token": token } }),
      &QueryOptions::not_queuable(),
      Some(Box::new(move |res| {
        callback(res.map(|response| TokenValidity::from_result(&response["result"])))
      })),
    )
  }

  /// Log in with `strategy`. A returned token is stored and used from then on.
  pub fn login(
    &self,
    strategy: &str,
    credentials: Option<Value>,
    expires_in: Option<&str>,
    callback: Option<QueryCallback>,
  ) -> Result<()> {
    if strategy.is_empty() {
      return Err(Error::InvalidArgument(
        "login: strategy required".to_string(),
      ));
    }

    let mut payload = json!({
      "strategy": strategy,
      "body": credentials.unwrap_or_else(|| json!({})),
    });
    if let Some(expires_in) = expires_in {
      payload["expiresIn"] = json!(expires_in);
    }

    let client = self.downgrade();
    self.query(
      &Routing::new(AUTH_CONTROLLER, LOGIN_ACTION),
      payload,
      &QueryOptions::not_queuable(),
      Some(Box::new(move |res| {
        if let Some(client) = client.upgrade() {
          match &res {
            Ok(response) => {
              if let Some(token) = str_field(&response["result"], "jwt") {
                client.set_jwt_token(token);
              }
            }
            Err(err) => {
              client.inner.events.emit(
                Event::LoginAttempt,
                &json!({ "success": false, "error": err.message }),
              );
            }
          }
        }
        if let Some(cb) = callback {
          cb(res);
        }
      })),
    )
  }

  /// Log out. The stored token is dropped without waiting for the answer.
  pub fn logout(&self, callback: Option<QueryCallback>) -> Result<()> {
    self.query(
      &Routing::new(AUTH_CONTROLLER, LOGOUT_ACTION),
      json!({}),
      &QueryOptions::not_queuable(),
      callback,
    )?;
    *self.inner.jwt.write() = None;
    Ok(())
  }

  /// Store `token`, renew every subscription with it and report a successful login.
  pub fn set_jwt_token(&self, token: impl Into<String>) {
    *self.inner.jwt.write() = Some(token.into());
    self.renew_subscriptions();
    self
      .inner
      .events
      .emit(Event::LoginAttempt, &json!({ "success": true }));
  }

  /// Store the token found in a login response, if there is one.
  pub fn set_jwt_token_from_response(&self, response: &Value) -> bool {
    match str_field(&response["result"], "jwt") {
      Some(token) => {
        self.set_jwt_token(token);
        true
      }
      None => {
        self.inner.events.emit(
          Event::LoginAttempt,
          &json!({
            "success": false,
            "error": format!("Cannot find a valid JWT token in the following object: {}", response),
          }),
        );
        false
      }
    }
  }

  /// Forget the token and cancel every subscription made with it.
  pub fn unset_jwt_token(&self) {
    *self.inner.jwt.write() = None;
    for room in self.inner.subscriptions.all_rooms() {
      if let Err(e) = room.unsubscribe() {
        warn!(room = room.id(), "Unable to unsubscribe: {}", e);
      }
    }
  }

  pub fn jwt_token(&self) -> Option<String> {
    self.inner.jwt.read().clone()
  }

  /// Current server time.
  pub fn now(&self, callback: TimeCallback) -> Result<()> {
    self.query(
      &Routing::new("server", "now"),
      json!({}),
      &QueryOptions::new(),
      Some(Box::new(move |res| {
        callback(res.and_then(|response| {
          response["result"]["now"]
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ResponseError::new(0, "server/now: missing timestamp"))
        }))
      })),
    )
  }
}

/// Report a request that can be neither sent nor queued.
fn discard(request: Value, callback: Option<QueryCallback>) {
  debug!(request_id = ?str_field(&request, "requestId"), "request discarded");
  if let Some(cb) = callback {
    cb(Err(ResponseError::discarded(&request)));
  }
}

async fn event_loop(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
  while let Some(event) = events.recv().await {
    let Some(inner) = client.upgrade() else {
      return;
    };
    Kuzzle { inner }.handle_transport_event(event);
  }
  debug!("transport event channel closed");
}

async fn drain_queue(client: Weak<ClientInner>) {
  loop {
    let Some(inner) = client.upgrade() else {
      return;
    };
    let kuzzle = Kuzzle { inner };
    match kuzzle.replay_one() {
      Some(interval) => {
        drop(kuzzle);
        tokio::time::sleep(interval).await;
      }
      None => {
        kuzzle.inner.draining.store(false, Ordering::SeqCst);
        return;
      }
    }
  }
}
