mod common;

use common::Recorder;
use extension_messaging::host::{Host, HostContext, MessageSender, Port, Responder, Target};
use extension_messaging::{BusConfig, HostError, LocalRuntime};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn answer_with(host: &dyn Host, value: Value) {
    host.add_message_listener(Arc::new(
        move |_: Value, _: MessageSender, responder: Responder| responder.respond(value.clone()),
    ));
}

#[tokio::test]
async fn first_response_wins() {
    let runtime = LocalRuntime::new("ext");
    let background = runtime.attach(HostContext::Background);
    let options = runtime.attach(HostContext::Page);
    let popup = runtime.attach(HostContext::Page);

    answer_with(&*background, json!("background"));
    answer_with(&*options, json!("options"));

    let answer = popup.send_message(Target::Runtime, json!(1)).await.unwrap();
    assert_eq!(answer, json!("background"));
}

#[tokio::test]
async fn sender_never_receives_its_own_message() {
    let runtime = LocalRuntime::new("ext");
    let popup = runtime.attach(HostContext::Page);
    answer_with(&*popup, json!("me"));

    let res = popup.send_message(Target::Runtime, json!(1)).await;
    assert!(matches!(res, Err(HostError::NoReceiver)));
}

#[tokio::test]
async fn late_response_still_arrives() {
    let runtime = LocalRuntime::new("ext");
    let background = runtime.attach(HostContext::Background);
    let popup = runtime.attach(HostContext::Page);

    let parked: Arc<Mutex<Option<Responder>>> = Arc::default();
    let slot = parked.clone();
    background.add_message_listener(Arc::new(
        move |_: Value, _: MessageSender, responder: Responder| {
            *slot.lock().unwrap() = Some(responder);
        },
    ));

    let pending = popup.send_message(Target::Runtime, json!(null));
    let responder = parked.lock().unwrap().take().unwrap();
    responder.respond(json!("later"));
    assert_eq!(pending.await.unwrap(), json!("later"));
}

#[test]
fn content_script_sender_metadata() {
    let runtime = LocalRuntime::new("ext");
    let content = runtime.attach(HostContext::ContentScript { tab_id: 3 });
    let sender = content.sender();
    assert_eq!(sender.id.as_deref(), Some("ext"));
    assert_eq!(sender.tab, Some(3));
    assert_eq!(sender.frame_id, Some(0));
    assert_eq!(sender.url, None);
}

#[test]
fn ports_buffer_until_handlers_are_set() {
    let runtime = LocalRuntime::new("ext");
    let background = runtime.attach(HostContext::Background);
    let content = runtime.attach(HostContext::ContentScript { tab_id: 1 });

    let accepted: Arc<Mutex<Option<Arc<dyn Port>>>> = Arc::default();
    let slot = accepted.clone();
    background.add_connect_listener(Arc::new(move |port: Arc<dyn Port>| {
        *slot.lock().unwrap() = Some(port);
    }));

    let port = content.connect("ns/status").unwrap();
    port.post_message(json!(1)).unwrap();
    port.post_message(json!(2)).unwrap();

    let remote = accepted.lock().unwrap().take().expect("accepted");
    assert_eq!(remote.name(), "ns/status");
    assert_eq!(remote.sender().and_then(|s| s.tab), Some(1));

    let seen: Recorder<Value> = Recorder::default();
    let log = seen.clone();
    remote.set_handlers(
        Arc::new(move |message: Value| log.push(message)),
        Arc::new(|_: Option<String>| {}),
    );
    port.post_message(json!(3)).unwrap();

    assert_eq!(seen.items(), vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn closing_a_context_disconnects_its_ports() {
    let runtime = LocalRuntime::new("ext");
    let background = runtime.attach(HostContext::Background);
    let devtools = runtime.attach(HostContext::DevTools { inspected_tab_id: 1 });

    background.add_connect_listener(Arc::new(|_: Arc<dyn Port>| {}));
    let port = devtools.connect("ns/panel").unwrap();

    let causes: Recorder<Option<String>> = Recorder::default();
    let log = causes.clone();
    port.set_handlers(
        Arc::new(|_: Value| {}),
        Arc::new(move |cause: Option<String>| log.push(cause)),
    );

    assert_eq!(runtime.context_count(), 2);
    background.close();
    background.close();

    assert!(!background.is_open());
    assert_eq!(runtime.context_count(), 1);
    assert_eq!(causes.items(), vec![None]);
    assert!(matches!(
        port.post_message(json!(null)),
        Err(HostError::PortClosed)
    ));
}

#[test]
fn connect_prefers_the_background_context() {
    let runtime = LocalRuntime::new("ext");
    let options = runtime.attach(HostContext::Page);
    let background = runtime.attach(HostContext::Background);
    let content = runtime.attach(HostContext::ContentScript { tab_id: 1 });

    let hits: Recorder<&'static str> = Recorder::default();
    for (host, label) in [(&options, "options"), (&background, "background")] {
        let log = hits.clone();
        host.add_connect_listener(Arc::new(move |_: Arc<dyn Port>| log.push(label)));
    }

    let port = content.connect("ns/x").unwrap();
    assert_eq!(hits.items(), vec!["background"]);
    assert_eq!(
        port.sender().and_then(|s| s.url),
        Some("chrome-extension://ext/background.html".to_string())
    );
}

#[tokio::test]
async fn runtime_from_config_enforces_the_limit() {
    let config = BusConfig::from_toml_str("namespace = \"ns\"\n[limits]\nmax_message_bytes = 32").unwrap();
    let runtime = LocalRuntime::from_config("ext", &config);
    let background = runtime.attach(HostContext::Background);
    let popup = runtime.attach(HostContext::Page);
    answer_with(&*background, json!("ok"));

    let res = popup.send_message(Target::Runtime, json!("x".repeat(100))).await;
    assert!(matches!(res, Err(HostError::Transfer(_))));
    assert_eq!(
        popup.send_message(Target::Runtime, json!(1)).await.unwrap(),
        json!("ok")
    );
}
