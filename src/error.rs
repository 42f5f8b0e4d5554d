//! Error types for the Kuzzle client SDK.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Status code carried by the synthetic error of a discarded request.
pub const DISCARDED_STATUS: u16 = 400;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("This Kuzzle object has been invalidated. Did you try to access it after a disconnect call?")]
  Invalidated,

  #[error("Invalid offline queue request: {0}")]
  InvalidQueueEntry(String),

  #[error("Cannot perform this operation on an inactive room")]
  InactiveRoom,

  #[error("Connection error: {0}")]
  Connection(String),

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Server error: {0}")]
  Server(ResponseError),

  #[error("Channel closed")]
  ChannelClosed,
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<crate::transport::TransportError> for Error {
  fn from(e: crate::transport::TransportError) -> Self {
    Self::Transport(e.to_string())
  }
}

impl From<ResponseError> for Error {
  fn from(e: ResponseError) -> Self {
    Self::Server(e)
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error body delivered to the error path of a query callback.
///
/// Server errors are passed through verbatim: fields other than `status`
/// and `message` are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
  #[serde(default)]
  pub status: u16,
  #[serde(default)]
  pub message: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ResponseError {
  pub fn new(status: u16, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
      extra: Map::new(),
    }
  }

  /// Synthetic error handed back when a request cannot be sent or queued.
  pub fn discarded(payload: &Value) -> Self {
    Self::new(
      DISCARDED_STATUS,
      format!(
        "Unable to execute request: not connected to a Kuzzle server.\nDiscarded request: {}",
        payload
      ),
    )
  }

  /// Parse the `error` member of a response envelope.
  ///
  /// Anything that is not an object is wrapped as the message of a
  /// status-less error.
  pub fn from_value(value: &Value) -> Self {
    match serde_json::from_value::<ResponseError>(value.clone()) {
      Ok(err) => err,
      Err(_) => Self::new(0, value.to_string()),
    }
  }

  pub fn is_token_expired(&self) -> bool {
    self.message == "Token expired"
  }
}

impl fmt::Display for ResponseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} (status: {})", self.message, self.status)
  }
}
