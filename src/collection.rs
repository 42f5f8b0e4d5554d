//! Handle on one data collection.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::client::{Kuzzle, WeakKuzzle};
use crate::correlator::QueryCallback;
use crate::error::{Error, Result};
use crate::options::{QueryOptions, RoomOptions};
use crate::protocol::{Routing, REALTIME_CONTROLLER};
use crate::room::{Notification, NotificationListener, Room, SubscribeCallback};

/// A collection inside an index. Obtained from [`Kuzzle::collection`].
#[derive(Clone)]
pub struct Collection {
  client: WeakKuzzle,
  index: String,
  name: String,
}

impl Collection {
  pub(crate) fn new(client: &Kuzzle, index: String, name: String) -> Self {
    Self {
      client: client.downgrade(),
      index,
      name,
    }
  }

  pub fn index(&self) -> &str {
    &self.index
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn client(&self) -> Result<Kuzzle> {
    let client = self.client.upgrade().ok_or(Error::Invalidated)?;
    client.is_valid()?;
    Ok(client)
  }

  /// Routing of `controller/action` targeting this collection.
  pub fn query_args(&self, controller: &str, action: &str) -> Routing {
    Routing::new(controller, action)
      .with_index(self.index.clone())
      .with_collection(self.name.clone())
  }

  /// Send a request scoped to this collection.
  pub fn query(
    &self,
    controller: &str,
    action: &str,
    payload: Value,
    options: &QueryOptions,
    callback: Option<QueryCallback>,
  ) -> Result<()> {
    self
      .client()?
      .query(&self.query_args(controller, action), payload, options, callback)
  }

  /// A room on this collection, not yet subscribed.
  pub fn room(&self, options: RoomOptions) -> Result<Room> {
    Room::new(&self.client()?, self.index.clone(), self.name.clone(), options)
  }

  /// Subscribe to changes matching `filters`.
  pub fn subscribe<F>(
    &self,
    filters: Value,
    options: RoomOptions,
    listener: F,
    on_subscribed: Option<SubscribeCallback>,
  ) -> Result<Room>
  where
    F: Fn(&Notification) + Send + Sync + 'static,
  {
    let room = self.room(options)?;
    let listener: NotificationListener = Arc::new(listener);
    room.renew(Some(filters), listener, on_subscribed)?;
    Ok(room)
  }

  /// Send a volatile message to the subscribers of this collection.
  pub fn publish_message(
    &self,
    message: Value,
    options: &QueryOptions,
    callback: Option<QueryCallback>,
  ) -> Result<()> {
    self.query(
      REALTIME_CONTROLLER,
      "publish",
      json!({ "body": message }),
      options,
      callback,
    )
  }
}
