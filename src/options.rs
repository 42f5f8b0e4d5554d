//! Client configuration and per-request option bags.

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::protocol::DEFAULT_PORT;

/// Whether a behavior triggers automatically or is left to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
  #[default]
  Auto,
  Manual,
}

/// Client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
  pub port: u16,
  pub auto_queue: bool,
  pub auto_reconnect: bool,
  pub auto_replay: bool,
  pub auto_resubscribe: bool,
  /// Maximum number of queued requests, 0 disables the bound
  pub queue_max_size: usize,
  /// Maximum age of a queued request, zero disables the bound
  pub queue_ttl: Duration,
  pub replay_interval: Duration,
  pub reconnection_delay: Duration,
  /// `Auto` connects as soon as the client is built
  pub connect: Mode,
  /// `Auto` turns on queueing, reconnection, replay and resubscription
  pub offline_mode: Mode,
  pub default_index: Option<String>,
  pub headers: Map<String, Value>,
  pub volatile: Map<String, Value>,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      port: DEFAULT_PORT,
      auto_queue: false,
      auto_reconnect: true,
      auto_replay: false,
      auto_resubscribe: true,
      queue_max_size: 500,
      queue_ttl: Duration::from_millis(120_000),
      replay_interval: Duration::from_millis(10),
      reconnection_delay: Duration::from_millis(1000),
      connect: Mode::Auto,
      offline_mode: Mode::Manual,
      default_index: None,
      headers: Map::new(),
      volatile: Map::new(),
    }
  }
}

impl ClientOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  pub fn with_auto_queue(mut self, enabled: bool) -> Self {
    self.auto_queue = enabled;
    self
  }

  pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
    self.auto_reconnect = enabled;
    self
  }

  pub fn with_auto_replay(mut self, enabled: bool) -> Self {
    self.auto_replay = enabled;
    self
  }

  pub fn with_auto_resubscribe(mut self, enabled: bool) -> Self {
    self.auto_resubscribe = enabled;
    self
  }

  pub fn with_queue_max_size(mut self, max: usize) -> Self {
    self.queue_max_size = max;
    self
  }

  pub fn with_queue_ttl(mut self, ttl: Duration) -> Self {
    self.queue_ttl = ttl;
    self
  }

  pub fn with_replay_interval(mut self, interval: Duration) -> Self {
    self.replay_interval = interval;
    self
  }

  pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
    self.reconnection_delay = delay;
    self
  }

  pub fn with_connect(mut self, mode: Mode) -> Self {
    self.connect = mode;
    self
  }

  pub fn with_offline_mode(mut self, mode: Mode) -> Self {
    self.offline_mode = mode;
    self
  }

  pub fn with_default_index(mut self, index: impl Into<String>) -> Self {
    self.default_index = Some(index.into());
    self
  }

  pub fn with_headers(mut self, headers: Map<String, Value>) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_volatile(mut self, volatile: Map<String, Value>) -> Self {
    self.volatile = volatile;
    self
  }

  /// Resolve `offline_mode`: in `Auto` every offline behavior is forced on.
  pub(crate) fn resolved(mut self) -> Self {
    if self.offline_mode == Mode::Auto {
      self.auto_queue = true;
      self.auto_reconnect = true;
      self.auto_replay = true;
      self.auto_resubscribe = true;
    }
    self
  }
}

/// Per-request options.
///
/// A snapshot taken by reference on every call: the dispatcher never
/// mutates it.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  pub queuable: bool,
  pub volatile: Option<Map<String, Value>>,
  pub refresh: Option<String>,
  pub from: Option<u64>,
  pub size: Option<u64>,
  pub scroll: Option<String>,
  pub scroll_id: Option<String>,
  pub retry_on_conflict: Option<u32>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      queuable: true,
      volatile: None,
      refresh: None,
      from: None,
      size: None,
      scroll: None,
      scroll_id: None,
      retry_on_conflict: None,
    }
  }
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Options for requests that must never be queued
  pub fn not_queuable() -> Self {
    Self::default().with_queuable(false)
  }

  pub fn with_queuable(mut self, queuable: bool) -> Self {
    self.queuable = queuable;
    self
  }

  pub fn with_volatile(mut self, volatile: Map<String, Value>) -> Self {
    self.volatile = Some(volatile);
    self
  }

  pub fn with_refresh(mut self, refresh: impl Into<String>) -> Self {
    self.refresh = Some(refresh.into());
    self
  }

  pub fn with_from(mut self, from: u64) -> Self {
    self.from = Some(from);
    self
  }

  pub fn with_size(mut self, size: u64) -> Self {
    self.size = Some(size);
    self
  }

  pub fn with_scroll(mut self, scroll: impl Into<String>) -> Self {
    self.scroll = Some(scroll.into());
    self
  }

  pub fn with_scroll_id(mut self, scroll_id: impl Into<String>) -> Self {
    self.scroll_id = Some(scroll_id.into());
    self
  }

  pub fn with_retry_on_conflict(mut self, retries: u32) -> Self {
    self.retry_on_conflict = Some(retries);
    self
  }

  /// Stamp the pagination/refresh fields that are set onto a payload.
  pub(crate) fn apply(&self, payload: &mut Map<String, Value>) {
    if let Some(refresh) = &self.refresh {
      payload.insert("refresh".to_string(), Value::from(refresh.clone()));
    }
    if let Some(from) = self.from {
      payload.insert("from".to_string(), Value::from(from));
    }
    if let Some(size) = self.size {
      payload.insert("size".to_string(), Value::from(size));
    }
    if let Some(scroll) = &self.scroll {
      payload.insert("scroll".to_string(), Value::from(scroll.clone()));
    }
    if let Some(scroll_id) = &self.scroll_id {
      payload.insert("scrollId".to_string(), Value::from(scroll_id.clone()));
    }
    if let Some(retries) = self.retry_on_conflict {
      payload.insert("retryOnConflict".to_string(), Value::from(retries));
    }
  }
}

macro_rules! lowercase_enum {
  ($name:ident { $($variant:ident => $text:literal),+ $(,)? }, default = $default:ident) => {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum $name {
      $(
        #[doc = $text]
        $variant,
      )+
    }

    impl Default for $name {
      fn default() -> Self {
        Self::$default
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
          $(Self::$variant => $text,)+
        };
        write!(f, "{}", text)
      }
    }
  };
}

lowercase_enum!(Scope { In => "in", Out => "out", All => "all", None => "none" }, default = All);
lowercase_enum!(State { Pending => "pending", Done => "done", All => "all" }, default = Done);
lowercase_enum!(Users { In => "in", Out => "out", All => "all", None => "none" }, default = None);

/// Options of a real-time subscription
#[derive(Debug, Clone)]
pub struct RoomOptions {
  /// Forward notifications triggered by this client's own requests
  pub subscribe_to_self: bool,
  pub volatile: Map<String, Value>,
  pub scope: Scope,
  pub state: State,
  pub users: Users,
}

impl Default for RoomOptions {
  fn default() -> Self {
    Self {
      subscribe_to_self: true,
      volatile: Map::new(),
      scope: Scope::default(),
      state: State::default(),
      users: Users::default(),
    }
  }
}

impl RoomOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_subscribe_to_self(mut self, enabled: bool) -> Self {
    self.subscribe_to_self = enabled;
    self
  }

  pub fn with_volatile(mut self, volatile: Map<String, Value>) -> Self {
    self.volatile = volatile;
    self
  }

  pub fn with_scope(mut self, scope: Scope) -> Self {
    self.scope = scope;
    self
  }

  pub fn with_state(mut self, state: State) -> Self {
    self.state = state;
    self
  }

  pub fn with_users(mut self, users: Users) -> Self {
    self.users = users;
    self
  }
}
