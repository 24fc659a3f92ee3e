mod common;

use common::{Recorder, World};
use extension_messaging::host::{Host, HostContext, MessageSender, Responder, Target};
use extension_messaging::{
    BusConfig, BusError, EventBus, HostError, ListenerId, LocalRuntime, Messaging, Reply,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn every_listener_runs_once_with_the_same_payload_and_sender() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    let seen: Recorder<(u8, Value, MessageSender)> = Recorder::default();
    for n in 0..3u8 {
        let seen = seen.clone();
        bus.on("ping", move |payload, sender| {
            seen.push((n, payload.clone(), sender.clone()));
        })
        .unwrap();
    }

    popup.messaging.bus().emit("ping", json!({"n": 1})).await.unwrap();

    let items = seen.items();
    assert_eq!(items.len(), 3);
    assert_eq!(
        items.iter().map(|(n, _, _)| *n).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    for (_, payload, sender) in &items {
        assert_eq!(payload, &json!({"n": 1}));
        assert_eq!(sender, &popup.host.sender());
    }
}

#[tokio::test]
async fn once_listener_fires_for_the_first_emission_only() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();

    let seen: Recorder<Value> = Recorder::default();
    let log = seen.clone();
    background
        .messaging
        .bus()
        .once("tick", move |payload, _| log.push(payload.clone()))
        .unwrap();

    for n in 0..3 {
        popup.messaging.bus().emit("tick", json!(n)).await.unwrap();
    }

    assert_eq!(seen.items(), vec![json!(0)]);
    assert_eq!(background.messaging.bus().listener_count("tick"), 0);
}

#[tokio::test]
async fn off_removes_exactly_that_listener() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    let seen: Recorder<&'static str> = Recorder::default();
    let (a, b) = (seen.clone(), seen.clone());
    let first = bus.on("foo", move |_, _| a.push("first")).unwrap();
    bus.on("foo", move |_, _| b.push("second")).unwrap();

    assert!(bus.off("foo", first));
    assert!(!bus.off("foo", first), "second off is a no-op");
    assert!(!bus.off("unknown", first));

    popup.messaging.bus().emit("foo", json!(null)).await.unwrap();
    assert_eq!(seen.items(), vec!["second"]);
}

#[tokio::test]
async fn zero_listeners_resolve_to_null() {
    let world = World::new();
    let _background = world.background();
    let popup = world.page();

    let answer = popup.messaging.bus().emit("nobody", json!(1)).await.unwrap();
    assert_eq!(answer, Value::Null);
}

#[tokio::test]
async fn single_value_is_unwrapped() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    bus.on("get", |_, _| Reply::later(async { json!({"v": 1}) }))
        .unwrap();
    bus.on("get", |_, _| {}).unwrap();

    let answer = popup.messaging.bus().emit("get", json!(null)).await.unwrap();
    assert_eq!(answer, json!({"v": 1}));
}

#[tokio::test]
async fn several_values_come_back_in_registration_order() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    let wire: Recorder<Value> = Recorder::default();
    let log = wire.clone();
    background
        .host
        .add_message_listener(Arc::new(move |message: Value, _: MessageSender, responder: Responder| {
            log.push(message);
            drop(responder);
        }));

    bus.on("foo", |_, _| json!("baz")).unwrap();
    bus.on("foo", |_, _| json!("fez")).unwrap();

    let answer = popup.messaging.bus().emit("foo", json!("bar")).await.unwrap();
    assert_eq!(answer, json!(["baz", "fez"]));
    assert_eq!(
        wire.items(),
        vec![json!({"event": "test-ns/foo", "payload": "bar"})]
    );
}

#[tokio::test]
async fn slow_pending_reply_keeps_its_position() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    bus.on("order", |_, _| {
        Reply::later(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            json!("slow")
        })
    })
    .unwrap();
    bus.on("order", |_, _| json!("fast")).unwrap();

    let answer = popup.messaging.bus().emit("order", json!(null)).await.unwrap();
    assert_eq!(answer, json!(["slow", "fast"]));
}

#[tokio::test]
async fn failed_listener_counts_as_no_response() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    bus.on("job", |_, _| {
        Reply::try_later(async { Err::<Value, _>("boom") })
    })
    .unwrap();
    bus.on("job", |_, _| json!("ok")).unwrap();

    let answer = popup.messaging.bus().emit("job", json!(null)).await.unwrap();
    assert_eq!(answer, json!("ok"));
}

#[tokio::test]
async fn once_awaitable_resolves_with_the_payload() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();

    let next = background.messaging.bus().once_awaitable("ready").unwrap();
    let answer = popup
        .messaging
        .bus()
        .emit("ready", json!({"tab": 3}))
        .await
        .unwrap();

    assert_eq!(answer, Value::Null, "awaitable listener does not reply");
    assert_eq!(next.await.unwrap(), json!({"tab": 3}));
}

#[tokio::test]
async fn once_awaitable_fails_when_cleared() {
    let world = World::new();
    let background = world.background();
    let bus = background.messaging.bus();

    let next = bus.once_awaitable("never").unwrap();
    bus.clear("never");
    assert!(matches!(next.await, Err(BusError::Closed)));
}

#[tokio::test]
async fn foreign_messages_are_left_alone() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();

    let seen: Recorder<Value> = Recorder::default();
    let log = seen.clone();
    background
        .messaging
        .bus()
        .on("foo", move |payload, _| log.push(payload.clone()))
        .unwrap();

    for message in [
        json!({"event": "other-ns/foo", "payload": 1}),
        json!({"event": "foo", "payload": 1}),
        json!({"hello": "world"}),
    ] {
        let res = popup.host.send_message(Target::Runtime, message).await;
        assert!(matches!(res, Err(HostError::NoResponse)), "{res:?}");
    }
    assert_eq!(seen.len(), 0);
}

#[tokio::test]
async fn targeted_emit_reaches_only_that_tab() {
    let world = World::new();
    let background = world.background();
    let tab5 = world.content(5);
    let tab6 = world.content(6);

    tab5.messaging.bus().on("where", |_, _| json!(5)).unwrap();
    tab6.messaging.bus().on("where", |_, _| json!(6)).unwrap();

    let bus = background.messaging.bus();
    assert_eq!(bus.emit_to(6, "where", json!(null)).await.unwrap(), json!(6));
    assert_eq!(bus.emit_to(5, "where", json!(null)).await.unwrap(), json!(5));

    let missing = bus.emit_to(99, "where", json!(null)).await;
    assert!(matches!(
        missing,
        Err(BusError::Delivery(HostError::NoReceiver))
    ));
}

#[tokio::test]
async fn broadcast_does_not_reach_content_scripts() {
    let world = World::new();
    let background = world.background();
    let content = world.content(1);

    content.messaging.bus().on("foo", |_, _| json!("content")).unwrap();

    let res = background.messaging.bus().emit("foo", json!(null)).await;
    assert!(matches!(res, Err(BusError::Delivery(HostError::NoReceiver))));
}

#[tokio::test]
async fn empty_event_names_are_rejected() {
    let world = World::new();
    let background = world.background();
    let bus = background.messaging.bus();

    assert!(matches!(
        bus.on("", |_, _| {}),
        Err(BusError::InvalidArgument(_))
    ));
    assert!(matches!(
        bus.emit("", json!(null)).await,
        Err(BusError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn clear_drops_every_listener_for_the_event() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    bus.on("foo", |_, _| json!(1)).unwrap();
    bus.on("foo", |_, _| json!(2)).unwrap();
    bus.on("bar", |_, _| json!(3)).unwrap();
    bus.clear("foo");

    let emitter = popup.messaging.bus();
    assert_eq!(emitter.emit("foo", json!(null)).await.unwrap(), Value::Null);
    assert_eq!(emitter.emit("bar", json!(null)).await.unwrap(), json!(3));
}

#[tokio::test]
async fn dropped_bus_stops_answering() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();

    background.messaging.bus().on("foo", |_, _| json!(1)).unwrap();
    drop(background.messaging);

    let res = popup.messaging.bus().emit("foo", json!(null)).await;
    assert!(matches!(res, Err(BusError::Delivery(HostError::NoResponse))));
}

#[tokio::test]
async fn oversized_payload_is_a_delivery_error() {
    let world = World::new();
    let _background = world.background();
    let popup = world.page();

    let small = LocalRuntime::with_limit("tiny", 64);
    let _bg = small.attach(HostContext::Background);
    let sender = EventBus::new(small.attach(HostContext::Page), &world.config);

    let res = sender.emit("big", json!("x".repeat(200))).await;
    assert!(matches!(res, Err(BusError::Delivery(HostError::Transfer(_)))));

    // The default limit is far above this.
    assert!(popup.messaging.bus().emit("big", json!("x".repeat(200))).await.is_ok());
}

#[tokio::test]
async fn configured_limit_applies_on_a_default_runtime() {
    let world = World::new();
    let config =
        BusConfig::from_toml_str("namespace = \"small\"\n[limits]\nmax_message_bytes = 64").unwrap();
    let background =
        Messaging::new(world.runtime.attach(HostContext::Background), config.clone()).unwrap();
    let popup = Messaging::new(world.runtime.attach(HostContext::Page), config).unwrap();
    background.bus().on("big", |_, _| json!("ok")).unwrap();

    let res = popup.bus().emit("big", json!("x".repeat(500))).await;
    assert!(matches!(res, Err(BusError::Delivery(HostError::Transfer(_)))));
    assert_eq!(popup.bus().emit("big", json!("x")).await.unwrap(), json!("ok"));
}

#[tokio::test]
async fn off_during_dispatch_stops_later_listeners() {
    let world = World::new();
    let background = world.background();
    let popup = world.page();
    let bus = background.messaging.bus();

    let later: Arc<Mutex<Option<ListenerId>>> = Arc::default();
    let (slot, handle) = (later.clone(), bus.clone());
    bus.on("foo", move |_, _| {
        if let Some(id) = slot.lock().unwrap().take() {
            assert!(handle.off("foo", id));
        }
        json!("first")
    })
    .unwrap();
    let seen: Recorder<()> = Recorder::default();
    let log = seen.clone();
    let second = bus
        .on("foo", move |_, _| {
            log.push(());
            json!("second")
        })
        .unwrap();
    *later.lock().unwrap() = Some(second);

    let emitter = popup.messaging.bus();
    assert_eq!(emitter.emit("foo", json!(null)).await.unwrap(), json!("first"));
    assert_eq!(emitter.emit("foo", json!(null)).await.unwrap(), json!("first"));
    assert_eq!(seen.len(), 0);
}
