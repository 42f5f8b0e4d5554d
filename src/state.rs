//! Connection state machine.

use std::fmt;

/// Lifecycle state of a client's single physical connection.
///
/// `Disconnected` is terminal: a client that reached it must be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Initializing,
  Connecting,
  Connected,
  Offline,
  Error,
  Disconnected,
  Ready,
}

impl ConnectionState {
  /// Whether `connect()` may start a new connection from this state.
  ///
  /// Only the mid-flight states (`Connecting`, `Connected`) block it.
  pub fn can_connect(self) -> bool {
    matches!(
      self,
      Self::Initializing | Self::Ready | Self::Disconnected | Self::Error | Self::Offline
    )
  }

  /// Requests issued in these states are queued even without `queuable`.
  pub fn is_starting(self) -> bool {
    matches!(self, Self::Initializing | Self::Connecting)
  }

  pub fn is_connected(self) -> bool {
    self == Self::Connected
  }

  pub fn is_terminal(self) -> bool {
    self == Self::Disconnected
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Initializing => "initializing",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Offline => "offline",
      Self::Error => "error",
      Self::Disconnected => "disconnected",
      Self::Ready => "ready",
    };
    write!(f, "{}", name)
  }
}
