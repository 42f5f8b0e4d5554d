//! Kuzzle Rust Client SDK
//!
//! A real-time client for Kuzzle over a persistent websocket connection.
//! Requests are correlated with their responses by id, buffered in an
//! offline queue while the connection is down, and real-time subscriptions
//! are renewed automatically after a reconnection.
//!
//! # Example
//!
//! ```no_run
//! use kuzzle::{ClientOptions, Event, Kuzzle, QueryOptions, RoomOptions, Routing};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> kuzzle::Result<()> {
//!     let client = Kuzzle::new("localhost", ClientOptions::new().with_connect(kuzzle::Mode::Manual))?;
//!     client.add_listener(Event::Disconnected, |_| println!("connection lost"))?;
//!     client.connect_async().await?;
//!
//!     // Create a document
//!     let response = client.query_async(
//!         &Routing::new("document", "create").with_index("shop").with_collection("orders"),
//!         json!({ "body": { "item": "book", "quantity": 1 } }),
//!         &QueryOptions::new(),
//!     ).await?;
//!     println!("Created: {}", response["result"]);
//!
//!     // Watch new orders
//!     let orders = client.collection("orders", Some("shop"))?;
//!     orders.subscribe(
//!         json!({ "equals": { "item": "book" } }),
//!         RoomOptions::new(),
//!         |notification| println!("Change: {:?}", notification.result),
//!         None,
//!     )?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod collection;
mod correlator;
mod error;
mod events;
mod options;
pub mod protocol;
mod queue;
mod room;
mod state;
pub mod transport;

pub use client::{ConnectCallback, Kuzzle, TimeCallback, TokenCallback};
pub use collection::Collection;
pub use correlator::{QueryCallback, QueryResult, RequestCorrelator, RequestHistory};
pub use error::{Error, ResponseError, Result, DISCARDED_STATUS};
pub use events::{Event, EventBus, EventListener, ListenerId};
pub use options::{ClientOptions, Mode, QueryOptions, RoomOptions, Scope, State, Users};
pub use protocol::{Response, Routing, TokenValidity, SDK_VERSION};
pub use queue::{OfflineQueue, OfflineQueueLoader, QueueFilter, QueuedRequest};
pub use room::{
  CountCallback, Notification, NotificationListener, Room, SubscribeCallback, SubscriptionPhase,
  SubscriptionRegistry,
};
pub use state::ConnectionState;
pub use transport::{Transport, TransportConfig, TransportError, TransportEvent, TransportFactory};
