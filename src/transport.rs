//! Transport abstraction for the persistent socket connection.
//!
//! The client never touches sockets directly: it opens a [`Transport`],
//! sends JSON frames through it, and consumes [`TransportEvent`]s from a
//! single channel. This keeps every lifecycle callback on one event loop and
//! lets tests substitute a scripted transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  /// Connection could not be started.
  #[error("connection failed: {0}")]
  ConnectionFailed(String),

  /// The transport is closed or was never opened.
  #[error("connection closed")]
  ConnectionClosed,

  /// Send failed.
  #[error("send failed: {0}")]
  SendFailed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Socket lifecycle and inbound traffic, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
  /// First successful connection.
  Connected,
  /// The initial connection attempt failed.
  ConnectError(String),
  /// An established connection dropped.
  Disconnected(String),
  /// Connection re-established after a drop.
  Reconnected,
  /// Inbound JSON message.
  Message(Value),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Settings handed to a transport when the client connects
#[derive(Debug, Clone)]
pub struct TransportConfig {
  pub host: String,
  pub port: u16,
  pub auto_reconnect: bool,
  pub reconnection_delay: Duration,
}

impl TransportConfig {
  pub fn url(&self) -> String {
    format!("ws://{}:{}", self.host, self.port)
  }
}

/// A persistent bidirectional connection.
pub trait Transport: Send + Sync {
  /// Start connecting. Lifecycle is reported through `events`.
  fn open(&self, events: TransportEvents) -> TransportResult<()>;

  /// Send one JSON frame.
  fn send(&self, frame: &Value) -> TransportResult<()>;

  /// Close the connection. No further events are reported.
  fn close(&self);
}

/// Builds a fresh transport for every `connect()`.
pub type TransportFactory = Arc<dyn Fn(&TransportConfig) -> Arc<dyn Transport> + Send + Sync>;

/// Factory producing [`WebSocketTransport`]s.
pub fn websocket_factory() -> TransportFactory {
  Arc::new(|config: &TransportConfig| Arc::new(WebSocketTransport::new(config.clone())) as Arc<dyn Transport>)
}

/// WebSocket transport implementation using tokio-tungstenite.
pub struct WebSocketTransport {
  config: TransportConfig,
  outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
  task: Mutex<Option<JoinHandle<()>>>,
  closed: Arc<AtomicBool>,
}

impl WebSocketTransport {
  pub fn new(config: TransportConfig) -> Self {
    Self {
      config,
      outbound: Mutex::new(None),
      task: Mutex::new(None),
      closed: Arc::new(AtomicBool::new(false)),
    }
  }
}

impl Transport for WebSocketTransport {
  fn open(&self, events: TransportEvents) -> TransportResult<()> {
    let handle = tokio::runtime::Handle::try_current()
      .map_err(|e| TransportError::ConnectionFailed(format!("no tokio runtime: {}", e)))?;

    let (tx, rx) = mpsc::unbounded_channel();
    *self.outbound.lock() = Some(tx);
    self.closed.store(false, Ordering::SeqCst);

    let task = handle.spawn(run_connection(
      self.config.clone(),
      rx,
      events,
      self.closed.clone(),
    ));
    if let Some(previous) = self.task.lock().replace(task) {
      previous.abort();
    }
    Ok(())
  }

  fn send(&self, frame: &Value) -> TransportResult<()> {
    let outbound = self.outbound.lock();
    let tx = outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
    tx.send(frame.to_string())
      .map_err(|e| TransportError::SendFailed(e.to_string()))
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.outbound.lock().take();
    if let Some(task) = self.task.lock().take() {
      task.abort();
    }
  }
}

impl Drop for WebSocketTransport {
  fn drop(&mut self) {
    self.close();
  }
}

/// Connection task: connect, pump frames both ways, reconnect on drop.
async fn run_connection(
  config: TransportConfig,
  mut outbound: mpsc::UnboundedReceiver<String>,
  events: TransportEvents,
  closed: Arc<AtomicBool>,
) {
  let url = config.url();
  let mut connected_once = false;

  loop {
    if closed.load(Ordering::SeqCst) {
      return;
    }

    match tokio_tungstenite::connect_async(url.as_str()).await {
      Ok((ws_stream, _)) => {
        info!("WebSocket connected to {}", url);
        let event = if connected_once {
          TransportEvent::Reconnected
        } else {
          TransportEvent::Connected
        };
        connected_once = true;
        if events.send(event).is_err() {
          return;
        }

        let (mut sink, mut stream) = ws_stream.split();
        let reason = loop {
          tokio::select! {
            frame = outbound.recv() => match frame {
              Some(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                  break format!("send failed: {}", e);
                }
              }
              None => {
                let _ = sink.close().await;
                return;
              }
            },
            msg = stream.next() => match msg {
              Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<Value>(text.as_str()) {
                  Ok(value) => {
                    if events.send(TransportEvent::Message(value)).is_err() {
                      return;
                    }
                  }
                  Err(e) => warn!("Dropping malformed frame: {}", e),
                }
              }
              Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
              Some(Ok(_)) => continue,
              Some(Err(e)) => break e.to_string(),
            },
          }
        };

        if closed.load(Ordering::SeqCst) {
          return;
        }
        warn!("WebSocket connection lost: {}", reason);
        if events.send(TransportEvent::Disconnected(reason)).is_err() {
          return;
        }
      }
      Err(e) => {
        if connected_once {
          debug!("Reconnection attempt to {} failed: {}", url, e);
        } else {
          warn!("Connection to {} failed: {}", url, e);
          if events.send(TransportEvent::ConnectError(e.to_string())).is_err() {
            return;
          }
        }
      }
    }

    if !config.auto_reconnect {
      return;
    }
    tokio::time::sleep(config.reconnection_delay).await;
  }
}
