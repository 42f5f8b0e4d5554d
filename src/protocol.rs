//! Wire envelope types and protocol constants for Kuzzle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ResponseError, Result};

/// SDK version stamped into the `volatile` bag of every request
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key under which the SDK version is stamped
pub const SDK_VERSION_KEY: &str = "sdkVersion";

/// Default Kuzzle websocket port
pub const DEFAULT_PORT: u16 = 7512;

/// How long a transmitted request id is remembered for self-notification suppression
pub const REQUEST_HISTORY_WINDOW: Duration = Duration::from_secs(10);

/// Minimum gap between two emissions of the same event type
pub const EVENT_THROTTLE: Duration = Duration::from_millis(200);

/// Window during which a second subscription renewal is ignored
pub const RENEWAL_DELAY: Duration = Duration::from_millis(500);

/// Poll interval while an unsubscribe waits for pending subscriptions to settle
pub const UNSUBSCRIBE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub const AUTH_CONTROLLER: &str = "auth";
pub const REALTIME_CONTROLLER: &str = "realtime";
pub const CHECK_TOKEN_ACTION: &str = "checkToken";
pub const LOGIN_ACTION: &str = "login";
pub const LOGOUT_ACTION: &str = "logout";

/// Description of the remote operation targeted by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
  pub controller: String,
  pub action: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub index: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub collection: Option<String>,
}

impl Routing {
  pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
    Self {
      controller: controller.into(),
      action: action.into(),
      index: None,
      collection: None,
    }
  }

  pub fn with_index(mut self, index: impl Into<String>) -> Self {
    self.index = Some(index.into());
    self
  }

  pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
    self.collection = Some(collection.into());
    self
  }

  /// The token-check route never carries the stored JWT.
  pub fn is_token_check(&self) -> bool {
    is_token_check(Some(&self.controller), Some(&self.action))
  }

  pub fn validate(&self) -> Result<()> {
    if self.controller.is_empty() {
      return Err(Error::InvalidArgument("query: controller required".to_string()));
    }
    if self.action.is_empty() {
      return Err(Error::InvalidArgument("query: action required".to_string()));
    }
    Ok(())
  }
}

/// Response envelope received for a transmitted request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  #[serde(rename = "requestId", default)]
  pub request_id: Option<String>,
  #[serde(default)]
  pub controller: Option<String>,
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub room: Option<String>,
  #[serde(default)]
  pub result: Value,
  #[serde(default)]
  pub error: Option<Value>,
}

impl Response {
  pub fn parse(value: &Value) -> Result<Self> {
    Ok(serde_json::from_value(value.clone())?)
  }

  /// The error body, if the server reported one.
  pub fn error(&self) -> Option<ResponseError> {
    match &self.error {
      None | Some(Value::Null) => None,
      Some(err) => Some(ResponseError::from_value(err)),
    }
  }
}

/// Outcome of a token check
#[derive(Debug, Clone, PartialEq)]
pub struct TokenValidity {
  pub valid: bool,
  /// Why the token is invalid, when it is
  pub state: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl TokenValidity {
  /// Build from the `result` member of an `auth/checkToken` response.
  pub fn from_result(result: &Value) -> Self {
    let valid = result.get("valid").and_then(Value::as_bool).unwrap_or(false);
    Self {
      valid,
      state: str_field(result, "state").map(str::to_string),
      expires_at: result
        .get("expiresAt")
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis),
    }
  }
}

/// Copy `headers` into `payload`, keeping values the payload already has.
pub fn add_headers(payload: &mut Map<String, Value>, headers: &Map<String, Value>) {
  for (key, value) in headers {
    if !payload.contains_key(key) {
      payload.insert(key.clone(), value.clone());
    }
  }
}

pub(crate) fn is_token_check(controller: Option<&str>, action: Option<&str>) -> bool {
  controller == Some(AUTH_CONTROLLER) && action == Some(CHECK_TOKEN_ACTION)
}

/// Read a string member of a JSON object, if present.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
  value.get(key).and_then(Value::as_str)
}
