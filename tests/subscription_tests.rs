//! Real-time subscription tests: room lifecycle, routing and renewal.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{settle, sink, TestClient};
use kuzzle::{
  ClientOptions, Collection, Error, Event, Notification, QueryOptions, Room, RoomOptions, Routing,
  Scope, SubscriptionPhase, TransportEvent,
};
use serde_json::{json, Value};

fn orders(tc: &TestClient) -> Collection {
  tc.client.collection("orders", Some("shop")).unwrap()
}

fn subscribe(
  collection: &Collection,
  filters: Value,
  options: RoomOptions,
) -> (Room, Arc<Mutex<Vec<Notification>>>) {
  let seen: Arc<Mutex<Vec<Notification>>> = sink();
  let s = seen.clone();
  let room = collection
    .subscribe(filters, options, move |n| s.lock().unwrap().push(n.clone()), None)
    .unwrap();
  (room, seen)
}

/// Acknowledge the most recent subscribe request.
async fn ack(tc: &TestClient, room_id: &str, channel: &str) {
  let frame = tc
    .transport()
    .sent_for("realtime", "subscribe")
    .pop()
    .expect("no subscribe sent");
  tc.transport()
    .respond(&frame, json!({"roomId": room_id, "channel": channel}));
  settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_request_shape() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let options = RoomOptions::new().with_scope(Scope::In);
  let (room, _) = subscribe(&orders(&tc), json!({"equals": {"item": "book"}}), options);

  assert_eq!(room.phase(), SubscriptionPhase::Subscribing);
  assert_eq!(tc.client.pending_subscriptions(), 1);

  let frame = tc.transport().last_sent();
  assert_eq!(frame["controller"], "realtime");
  assert_eq!(frame["action"], "subscribe");
  assert_eq!(frame["index"], "shop");
  assert_eq!(frame["collection"], "orders");
  assert_eq!(frame["body"], json!({"equals": {"item": "book"}}));
  assert_eq!(frame["scope"], "in");
  assert_eq!(frame["state"], "done");
  assert_eq!(frame["users"], "none");
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_subscription_receives_notifications() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, seen) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  assert_eq!(room.phase(), SubscriptionPhase::Active);
  assert_eq!(room.room_id().as_deref(), Some("room-1"));
  assert_eq!(room.channel().as_deref(), Some("chan-1"));
  assert_eq!(tc.client.pending_subscriptions(), 0);
  assert_eq!(tc.client.rooms("room-1").len(), 1);

  tc.transport().notify("chan-1", None, json!({"_id": "doc-1"}));
  tc.transport().notify("other-channel", None, json!({"_id": "doc-2"}));
  settle().await;

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].result["_id"], "doc-1");
  assert_eq!(seen[0].timestamp_utc().unwrap().timestamp(), 1_700_000_000);
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_callback_reports_outcome() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let outcomes = sink();
  let o = outcomes.clone();
  let room = orders(&tc)
    .subscribe(
      json!({}),
      RoomOptions::new(),
      |_| {},
      Some(Arc::new(move |res: Result<Room, kuzzle::ResponseError>| {
        o.lock().unwrap().push(res.map(|room| room.room_id()))
      })),
    )
    .unwrap();
  ack(&tc, "room-1", "chan-1").await;

  assert_eq!(room.phase(), SubscriptionPhase::Active);
  let outcomes = outcomes.lock().unwrap();
  assert_eq!(outcomes[0].as_ref().unwrap().as_deref(), Some("room-1"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscription_never_notifies() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let outcomes = sink();
  let o = outcomes.clone();
  let seen = sink::<()>();
  let s = seen.clone();
  let room = orders(&tc)
    .subscribe(
      json!({"bad": true}),
      RoomOptions::new(),
      move |_| s.lock().unwrap().push(()),
      Some(Arc::new(move |res: Result<Room, kuzzle::ResponseError>| {
        o.lock().unwrap().push(res.is_err())
      })),
    )
    .unwrap();

  let frame = tc.transport().last_sent();
  tc.transport().respond_error(&frame, 400, "invalid filters");
  settle().await;

  assert_eq!(*outcomes.lock().unwrap(), vec![true]);
  assert_eq!(room.phase(), SubscriptionPhase::Unsubscribed);
  assert_eq!(tc.client.pending_subscriptions(), 0);
  assert!(room.room_id().is_none());
  assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_renew_twice_sends_one_subscribe() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  room.renew(None, Arc::new(|_| {}), None).unwrap();
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);

  ack(&tc, "room-1", "chan-1").await;
  room.renew(None, Arc::new(|_| {}), None).unwrap();
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renew_after_debounce_window_resubscribes() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, _) = subscribe(&orders(&tc), json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tokio::time::sleep(Duration::from_millis(600)).await;
  room
    .renew(Some(json!({"a": 2})), Arc::new(|_| {}), None)
    .unwrap();

  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert_eq!(unsubscribes[0]["body"]["roomId"], "room-1");
  let subscribes = tc.transport().sent_for("realtime", "subscribe");
  assert_eq!(subscribes.len(), 2);
  assert_eq!(subscribes[1]["body"], json!({"a": 2}));
  assert_eq!(room.filters(), json!({"a": 2}));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_renews_active_subscriptions_once() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let collection = orders(&tc);
  let (first, _) = subscribe(&collection, json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;
  let (second, _) = subscribe(&collection, json!({"b": 1}), RoomOptions::new());
  ack(&tc, "room-2", "chan-2").await;
  tokio::time::sleep(Duration::from_millis(600)).await;

  tc.event(TransportEvent::Disconnected("reset".to_string())).await;
  assert_eq!(first.phase(), SubscriptionPhase::Pending);
  assert_eq!(second.phase(), SubscriptionPhase::Pending);

  tc.event(TransportEvent::Reconnected).await;
  let subscribes = tc.transport().sent_for("realtime", "subscribe");
  assert_eq!(subscribes.len(), 4);
  let renewed: Vec<&Value> = subscribes[2..].iter().map(|f| &f["body"]).collect();
  assert!(renewed.contains(&&json!({"a": 1})));
  assert!(renewed.contains(&&json!({"b": 1})));

  for frame in &subscribes[2..] {
    let (room_id, channel) = if frame["body"] == json!({"a": 1}) {
      ("room-1", "chan-1")
    } else {
      ("room-2", "chan-2")
    };
    tc.transport()
      .respond(frame, json!({"roomId": room_id, "channel": channel}));
  }
  settle().await;
  tokio::time::sleep(Duration::from_millis(300)).await;

  assert_eq!(first.phase(), SubscriptionPhase::Active);
  assert_eq!(second.phase(), SubscriptionPhase::Active);
  assert!(tc.transport().sent_for("realtime", "unsubscribe").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_without_auto_resubscribe_keeps_rooms() {
  let tc = TestClient::connected(ClientOptions::new().with_auto_resubscribe(false)).await;
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;
  tokio::time::sleep(Duration::from_millis(600)).await;

  tc.bounce().await;
  assert_eq!(room.phase(), SubscriptionPhase::Active);
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_made_offline_starts_on_connect() {
  let tc = TestClient::new(ClientOptions::new());
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  assert_eq!(room.phase(), SubscriptionPhase::Pending);
  assert_eq!(tc.client.pending_subscriptions(), 1);

  tc.connect().await;
  assert_eq!(room.phase(), SubscriptionPhase::Subscribing);
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_own_notifications_suppressed_without_subscribe_to_self() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (_, seen) = subscribe(
    &orders(&tc),
    json!({}),
    RoomOptions::new().with_subscribe_to_self(false),
  );
  ack(&tc, "room-1", "chan-1").await;

  tc.client
    .query(
      &Routing::new("document", "create"),
      json!({"requestId": "mine"}),
      &QueryOptions::new(),
      None,
    )
    .unwrap();
  tc.transport().notify("chan-1", Some("mine"), json!({"_id": "doc-1"}));
  tc.transport().notify("chan-1", Some("theirs"), json!({"_id": "doc-2"}));
  settle().await;

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].result["_id"], "doc-2");
  assert!(!tc.client.request_history().contains("mine"));
}

#[tokio::test(start_paused = true)]
async fn test_own_notifications_forwarded_with_subscribe_to_self() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (_, seen) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tc.client
    .query(
      &Routing::new("document", "create"),
      json!({"requestId": "mine"}),
      &QueryOptions::new(),
      None,
    )
    .unwrap();
  tc.transport().notify("chan-1", Some("mine"), json!({"_id": "doc-1"}));
  settle().await;
  assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_own_notification_after_history_window_is_forwarded() {
  // Known edge case: once the history entry is purged, a late echo of our
  // own request is indistinguishable from a foreign one.
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (_, seen) = subscribe(
    &orders(&tc),
    json!({}),
    RoomOptions::new().with_subscribe_to_self(false),
  );
  ack(&tc, "room-1", "chan-1").await;

  let create = |id: &str| {
    tc.client
      .query(
        &Routing::new("document", "create"),
        json!({"requestId": id}),
        &QueryOptions::new(),
        None,
      )
      .unwrap();
  };
  create("mine");
  tokio::time::sleep(Duration::from_secs(11)).await;
  create("later");

  tc.transport().notify("chan-1", Some("mine"), json!({"_id": "doc-1"}));
  settle().await;
  assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rooms_sharing_a_server_room() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let collection = orders(&tc);
  let (first, first_seen) = subscribe(&collection, json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;
  let (second, second_seen) = subscribe(&collection, json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  assert_ne!(first.id(), second.id());
  assert_eq!(tc.client.rooms("room-1").len(), 2);

  tc.transport().notify("chan-1", None, json!({"_id": "doc-1"}));
  settle().await;
  assert_eq!(first_seen.lock().unwrap().len(), 1);
  assert_eq!(second_seen.lock().unwrap().len(), 1);

  first.unsubscribe().unwrap();
  assert!(tc.transport().sent_for("realtime", "unsubscribe").is_empty());
  assert_eq!(tc.client.rooms("room-1").len(), 1);

  second.unsubscribe().unwrap();
  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert_eq!(unsubscribes[0]["body"]["roomId"], "room-1");
  assert_eq!(second.phase(), SubscriptionPhase::Unsubscribed);

  tc.transport().notify("chan-1", None, json!({"_id": "doc-2"}));
  settle().await;
  assert_eq!(second_seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_waits_for_pending_subscriptions() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let collection = orders(&tc);
  let (first, _) = subscribe(&collection, json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;
  let (_second, _) = subscribe(&collection, json!({"b": 1}), RoomOptions::new());

  first.unsubscribe().unwrap();
  tokio::time::sleep(Duration::from_millis(250)).await;
  assert!(tc.transport().sent_for("realtime", "unsubscribe").is_empty());

  ack(&tc, "room-2", "chan-2").await;
  tokio::time::sleep(Duration::from_millis(150)).await;
  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert_eq!(unsubscribes[0]["body"]["roomId"], "room-1");
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_during_subscription_is_deferred() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  room.unsubscribe().unwrap();
  assert!(tc.transport().sent_for("realtime", "unsubscribe").is_empty());

  ack(&tc, "room-1", "chan-1").await;
  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert_eq!(room.phase(), SubscriptionPhase::Unsubscribed);
}

#[tokio::test(start_paused = true)]
async fn test_count_subscribers() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let collection = orders(&tc);

  let idle = collection.room(RoomOptions::new()).unwrap();
  assert!(matches!(idle.count(Box::new(|_| {})), Err(Error::InactiveRoom)));

  let (room, _) = subscribe(&collection, json!({}), RoomOptions::new());
  let counts = sink();
  let c = counts.clone();
  room
    .count(Box::new(move |res| c.lock().unwrap().push(res)))
    .unwrap();
  assert!(tc.transport().sent_for("realtime", "count").is_empty());

  ack(&tc, "room-1", "chan-1").await;
  let frame = tc.transport().sent_for("realtime", "count").pop().unwrap();
  assert_eq!(frame["body"]["roomId"], "room-1");
  tc.transport().respond(&frame, json!({"count": 3}));
  settle().await;
  assert_eq!(*counts.lock().unwrap().first().unwrap().as_ref().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_token_expired_notification() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  tc.client.set_jwt_token("token-1");
  let expired = tc.record(Event::TokenExpired);
  let (_, seen) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tc.event(TransportEvent::Message(json!({
    "room": "chan-1",
    "type": "TokenExpired",
    "message": "Authentication Token Expired",
  })))
  .await;

  assert!(tc.client.jwt_token().is_none());
  assert_eq!(expired.lock().unwrap().len(), 1);
  assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unset_jwt_token_unsubscribes_rooms() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  tc.client.set_jwt_token("token-1");
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tc.client.unset_jwt_token();
  assert!(tc.client.jwt_token().is_none());
  assert_eq!(room.phase(), SubscriptionPhase::Unsubscribed);
  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert!(unsubscribes[0].get("jwt").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_invalidates_rooms() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tc.client.disconnect();
  assert_eq!(tc.client.pending_subscriptions(), 0);
  assert!(tc.client.rooms("room-1").is_empty());
  assert!(matches!(room.unsubscribe(), Err(Error::Invalidated)));
}

#[tokio::test(start_paused = true)]
async fn test_publish_message() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  orders(&tc)
    .publish_message(json!({"hello": "world"}), &QueryOptions::new(), None)
    .unwrap();

  let frame = tc.transport().last_sent();
  assert_eq!(frame["controller"], "realtime");
  assert_eq!(frame["action"], "publish");
  assert_eq!(frame["body"]["hello"], "world");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_right_after_subscribing_renews() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let collection = orders(&tc);
  let (room, seen) = subscribe(&collection, json!({"a": 1}), RoomOptions::new());
  ack(&tc, "room-1", "chan-1").await;

  tokio::time::sleep(Duration::from_millis(100)).await;
  tc.bounce().await;
  assert_eq!(room.phase(), SubscriptionPhase::Subscribing);
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 2);

  ack(&tc, "room-1", "chan-1").await;
  assert_eq!(room.phase(), SubscriptionPhase::Active);
  assert_eq!(tc.client.pending_subscriptions(), 0);

  tc.transport().notify("chan-1", None, json!({"_id": "doc-1"}));
  settle().await;
  assert_eq!(seen.lock().unwrap().len(), 1);

  let (other, _) = subscribe(&collection, json!({"b": 1}), RoomOptions::new());
  ack(&tc, "room-2", "chan-2").await;
  other.unsubscribe().unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;

  let unsubscribes = tc.transport().sent_for("realtime", "unsubscribe");
  assert_eq!(unsubscribes.len(), 1);
  assert_eq!(unsubscribes[0]["body"]["roomId"], "room-2");
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_while_subscribing_renews() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, _) = subscribe(&orders(&tc), json!({}), RoomOptions::new());

  tc.bounce().await;
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 2);
  ack(&tc, "room-1", "chan-1").await;
  assert_eq!(room.phase(), SubscriptionPhase::Active);
  assert_eq!(tc.client.pending_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_renew_during_subscription_keeps_new_listener() {
  let tc = TestClient::connected(ClientOptions::new()).await;
  let (room, first) = subscribe(&orders(&tc), json!({}), RoomOptions::new());

  let second: Arc<Mutex<Vec<Notification>>> = sink();
  let s = second.clone();
  room
    .renew(None, Arc::new(move |n| s.lock().unwrap().push(n.clone())), None)
    .unwrap();
  ack(&tc, "room-1", "chan-1").await;
  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);

  tc.transport().notify("chan-1", None, json!({"_id": "doc-1"}));
  settle().await;
  assert!(first.lock().unwrap().is_empty());
  assert_eq!(second.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_renewals_send_one_subscribe() {
  let tc = TestClient::new(ClientOptions::new());
  tc.client.connect().unwrap();
  tc.transport().emit(TransportEvent::Connected);
  for _ in 0..500 {
    if tc.client.is_connected() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(2)).await;
  }
  assert!(tc.client.is_connected());

  let room = orders(&tc).room(RoomOptions::new()).unwrap();
  let barrier = std::sync::Barrier::new(8);
  std::thread::scope(|scope| {
    for _ in 0..8 {
      scope.spawn(|| {
        barrier.wait();
        room
          .renew(Some(json!({"a": 1})), Arc::new(|_| {}), None)
          .unwrap();
      });
    }
  });

  assert_eq!(tc.transport().sent_for("realtime", "subscribe").len(), 1);
  assert_eq!(room.phase(), SubscriptionPhase::Subscribing);
}
