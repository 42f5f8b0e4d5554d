//! Basic example demonstrating Kuzzle Rust SDK usage.

use std::time::Duration;

use kuzzle::{ClientOptions, Event, Kuzzle, Mode, QueryOptions, RoomOptions, Routing};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> kuzzle::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  // Queue requests while the connection is down and replay them on reconnection
  let options = ClientOptions::new()
    .with_connect(Mode::Manual)
    .with_offline_mode(Mode::Auto)
    .with_default_index("shop");
  let client = Kuzzle::new("localhost", options)?;

  client.add_listener(Event::Disconnected, |_| println!("Connection lost"))?;
  client.add_listener(Event::Reconnected, |_| println!("Connection back"))?;
  client.add_listener(Event::OfflineQueuePush, |payload| {
    println!("Queued: {}", payload["query"]["requestId"])
  })?;

  client.connect_async().await?;
  println!("Connected to {}:{}", client.host(), client.port());

  // Subscribe to new orders (in a real app, keep the room around to unsubscribe)
  let orders = client.collection("orders", None)?;
  let room = orders.subscribe(
    json!({ "equals": { "item": "book" } }),
    RoomOptions::new().with_subscribe_to_self(true),
    |notification| {
      println!(
        "Notification: {} {}",
        notification.action.as_deref().unwrap_or("?"),
        notification.result
      )
    },
    None,
  )?;

  // Create a document, which our own subscription is told about
  let response = client
    .query_async(
      &orders.query_args("document", "create"),
      json!({ "body": { "item": "book", "quantity": 1 } }),
      &QueryOptions::new().with_refresh("wait_for"),
    )
    .await?;
  println!("Created document: {}", response["result"]["_id"]);

  // Server time
  let now = client
    .query_async(&Routing::new("server", "now"), json!({}), &QueryOptions::new())
    .await?;
  println!("Server time: {}", now["result"]["now"]);

  println!("\nListening for changes for 30 seconds...");
  tokio::time::sleep(Duration::from_secs(30)).await;

  room.unsubscribe()?;
  client.disconnect();
  Ok(())
}
