//! Shared helpers: a scripted transport and a client wired to it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kuzzle::transport::{TransportEvents, TransportResult};
use kuzzle::{
  ClientOptions, Event, Kuzzle, Mode, Transport, TransportConfig, TransportError, TransportEvent,
  TransportFactory,
};
use serde_json::{json, Value};
use tokio::time::Instant;

/// Transport that records outgoing frames and lets tests play the server.
#[derive(Default)]
pub struct MockTransport {
  sent: Mutex<Vec<(Instant, Value)>>,
  events: Mutex<Option<TransportEvents>>,
  closed: AtomicBool,
}

impl MockTransport {
  pub fn emit(&self, event: TransportEvent) {
    if let Some(events) = self.events.lock().unwrap().as_ref() {
      let _ = events.send(event);
    }
  }

  pub fn sent(&self) -> Vec<Value> {
    self.sent.lock().unwrap().iter().map(|(_, f)| f.clone()).collect()
  }

  pub fn sent_at(&self) -> Vec<(Instant, Value)> {
    self.sent.lock().unwrap().clone()
  }

  /// Frames sent for `controller/action`.
  pub fn sent_for(&self, controller: &str, action: &str) -> Vec<Value> {
    self
      .sent()
      .into_iter()
      .filter(|f| f["controller"] == controller && f["action"] == action)
      .collect()
  }

  pub fn last_sent(&self) -> Value {
    self.sent().pop().expect("no frame sent")
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Answer `request` successfully.
  pub fn respond(&self, request: &Value, result: Value) {
    self.emit(TransportEvent::Message(json!({
      "requestId": request["requestId"],
      "controller": request["controller"],
      "action": request["action"],
      "room": request["requestId"],
      "status": 200,
      "result": result,
      "error": null,
    })));
  }

  /// Answer `request` with an error body.
  pub fn respond_error(&self, request: &Value, status: u16, message: &str) {
    self.emit(TransportEvent::Message(json!({
      "requestId": request["requestId"],
      "controller": request["controller"],
      "action": request["action"],
      "status": status,
      "result": null,
      "error": {"status": status, "message": message},
    })));
  }

  /// Push a document notification on `channel`.
  pub fn notify(&self, channel: &str, request_id: Option<&str>, result: Value) {
    self.emit(TransportEvent::Message(json!({
      "room": channel,
      "requestId": request_id,
      "type": "document",
      "controller": "document",
      "action": "create",
      "scope": "in",
      "state": "done",
      "volatile": {},
      "timestamp": 1_700_000_000_000i64,
      "result": result,
    })));
  }
}

impl Transport for MockTransport {
  fn open(&self, events: TransportEvents) -> TransportResult<()> {
    *self.events.lock().unwrap() = Some(events);
    Ok(())
  }

  fn send(&self, frame: &Value) -> TransportResult<()> {
    if self.is_closed() {
      return Err(TransportError::ConnectionClosed);
    }
    self.sent.lock().unwrap().push((Instant::now(), frame.clone()));
    Ok(())
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.events.lock().unwrap().take();
  }
}

/// Let the client event loop process everything injected so far.
pub async fn settle() {
  for _ in 0..32 {
    tokio::task::yield_now().await;
  }
}

/// A client whose transports are [`MockTransport`]s.
pub struct TestClient {
  pub client: Kuzzle,
  transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl TestClient {
  /// Build a client that waits in `Ready` until connected by hand.
  pub fn new(options: ClientOptions) -> Self {
    let transports: Arc<Mutex<Vec<Arc<MockTransport>>>> = Arc::default();
    let created = transports.clone();
    let factory: TransportFactory = Arc::new(move |_config: &TransportConfig| {
      let transport = Arc::new(MockTransport::default());
      created.lock().unwrap().push(transport.clone());
      transport as Arc<dyn Transport>
    });
    let client = Kuzzle::with_transport("localhost", options.with_connect(Mode::Manual), factory)
      .expect("client");
    Self { client, transports }
  }

  /// Build a client and complete its first connection.
  pub async fn connected(options: ClientOptions) -> Self {
    let tc = Self::new(options);
    tc.connect().await;
    tc
  }

  pub async fn connect(&self) {
    self.client.connect().expect("connect");
    self.event(TransportEvent::Connected).await;
  }

  /// The transport opened by the last `connect()`.
  pub fn transport(&self) -> Arc<MockTransport> {
    self.transports.lock().unwrap().last().cloned().expect("no transport opened")
  }

  pub fn transport_count(&self) -> usize {
    self.transports.lock().unwrap().len()
  }

  pub async fn event(&self, event: TransportEvent) {
    self.transport().emit(event);
    settle().await;
  }

  /// Drop the connection and bring it back at transport level.
  pub async fn bounce(&self) {
    self.event(TransportEvent::Disconnected("reset".to_string())).await;
    self.event(TransportEvent::Reconnected).await;
  }

  /// Record every payload emitted for `event`.
  pub fn record(&self, event: Event) -> Arc<Mutex<Vec<Value>>> {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let s = seen.clone();
    self
      .client
      .add_listener(event, move |payload| s.lock().unwrap().push(payload.clone()))
      .expect("listener");
    seen
  }
}

/// Shared sink for values produced by callbacks.
pub fn sink<T>() -> Arc<Mutex<Vec<T>>> {
  Arc::new(Mutex::new(Vec::new()))
}
