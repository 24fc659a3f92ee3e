//! Request/response event bus over one-shot messages.
//!
//! Every envelope the bus sends is named `"<namespace>/<event>"`; inbound
//! messages without that prefix belong to someone else and are left for other
//! listeners on the same host channel.
//!
//! ```
//! use extension_messaging::{BusConfig, EventBus, LocalRuntime};
//! use extension_messaging::host::HostContext;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runtime = LocalRuntime::new("demo");
//! let background = EventBus::new(runtime.attach(HostContext::Background), &BusConfig::default());
//! let popup = EventBus::new(runtime.attach(HostContext::Page), &BusConfig::default());
//!
//! background.on("foo", |_, _| json!("baz")).unwrap();
//! background.on("foo", |_, _| json!("fez")).unwrap();
//!
//! let answer = popup.emit("foo", json!("bar")).await.unwrap();
//! assert_eq!(answer, json!(["baz", "fez"]));
//! # }
//! ```

use crate::config::BusConfig;
use crate::envelope::{ensure_fits, Envelope};
use crate::error::{BusError, BusResult, HostError};
use crate::host::{Host, MessageSender, Responder, TabId, Target};
use crate::listeners::{aggregate, lock, ListenerId, ListenerSet, OnceFuture};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// What a bus listener contributes to the response of one emission.
pub enum Reply {
    /// No value; the listener is not counted in the aggregate.
    Silent,
    Ready(Value),
    /// Value produced later. A failed future counts as [`Reply::Silent`].
    Pending(BoxFuture<'static, BusResult<Option<Value>>>),
}

impl Reply {
    pub fn later<F>(fut: F) -> Self
    where
        F: Future<Output = Value> + Send + 'static,
    {
        Reply::Pending(fut.map(|value| Ok(Some(value))).boxed())
    }

    pub fn try_later<F, E>(fut: F) -> Self
    where
        F: Future<Output = Result<Value, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Reply::Pending(
            fut.map(|res| {
                res.map(Some)
                    .map_err(|e| BusError::Listener(e.to_string()))
            })
            .boxed(),
        )
    }

    fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending(_))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Ready(value)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Silent
    }
}

impl From<Option<Value>> for Reply {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Reply::Silent, Reply::Ready)
    }
}

type BusListener = dyn Fn(&Value, &MessageSender) -> Reply + Send + Sync;

/// Process-wide pub/sub over the host's one-shot messaging.
///
/// Cloning is cheap; clones share one listener table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    host: Arc<dyn Host>,
    namespace: String,
    max_message_bytes: usize,
    listeners: Mutex<ListenerSet<BusListener>>,
}

impl EventBus {
    /// Create a bus and hook it into `host`'s inbound messages.
    ///
    /// The host only keeps a weak reference: once every clone of the bus is
    /// dropped, inbound messages are declined again.
    pub fn new(host: Arc<dyn Host>, config: &BusConfig) -> Self {
        let inner = Arc::new(BusInner {
            host,
            namespace: config.namespace.clone(),
            max_message_bytes: config.limits.max_message_bytes,
            listeners: Mutex::new(ListenerSet::default()),
        });
        let weak = Arc::downgrade(&inner);
        inner
            .host
            .add_message_listener(Arc::new(move |message: Value, sender, responder| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(message, sender, responder);
                }
            }));
        Self { inner }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Register `listener` for `event`. Its return value becomes part of the
    /// response to the emitter (see [`Reply`]).
    pub fn on<F, R>(&self, event: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.register(event, listener, false)
    }

    /// Like [`EventBus::on`], but the registration is dropped after the first call.
    pub fn once<F, R>(&self, event: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.register(event, listener, true)
    }

    /// Future resolving with the payload of the next `event`.
    pub fn once_awaitable(&self, event: &str) -> BusResult<OnceFuture> {
        let (fut, slot) = OnceFuture::pair();
        self.once(event, move |payload, _| slot.fill(payload))?;
        Ok(fut)
    }

    /// Remove one registration. Returns whether it was present.
    ///
    /// Takes effect at once, including for an emission whose earlier
    /// listeners are running right now.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        lock(&self.inner.listeners).remove(event, id)
    }

    /// Drop every listener registered for `event`.
    pub fn clear(&self, event: &str) {
        lock(&self.inner.listeners).clear(event);
    }

    pub(crate) fn clear_all(&self) {
        lock(&self.inner.listeners).clear_all();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners).count(event)
    }

    /// Broadcast `event` to every extension context.
    ///
    /// The message is sent before this returns; the future only waits for the
    /// aggregated response.
    pub fn emit(&self, event: &str, payload: Value) -> BoxFuture<'static, BusResult<Value>> {
        self.send(Target::Runtime, event, payload)
    }

    /// Send `event` to the content scripts of one tab.
    pub fn emit_to(
        &self,
        tab: TabId,
        event: &str,
        payload: Value,
    ) -> BoxFuture<'static, BusResult<Value>> {
        self.send(Target::Tab(tab), event, payload)
    }

    fn register<F, R>(&self, event: &str, listener: F, once: bool) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        if event.is_empty() {
            return Err(BusError::InvalidArgument("event name must not be empty"));
        }
        let callback: Arc<BusListener> =
            Arc::new(move |payload: &Value, sender: &MessageSender| -> Reply {
                listener(payload, sender).into()
            });
        Ok(lock(&self.inner.listeners).add(event, callback, once))
    }

    fn send(
        &self,
        target: Target,
        event: &str,
        payload: Value,
    ) -> BoxFuture<'static, BusResult<Value>> {
        if event.is_empty() {
            return future::ready(Err(BusError::InvalidArgument(
                "event name must not be empty",
            )))
            .boxed();
        }
        let envelope = Envelope::namespaced(&self.inner.namespace, event, payload);
        log::trace!("bus emit {} -> {:?}", envelope.event, target);
        let message = envelope.into_value();
        if let Err(e) = ensure_fits(&message, self.inner.max_message_bytes) {
            return future::ready(Err(BusError::Delivery(HostError::Transfer(e)))).boxed();
        }
        self.inner
            .host
            .send_message(target, message)
            .map(|res| res.map_err(BusError::from))
            .boxed()
    }
}

impl BusInner {
    fn dispatch(&self, message: Value, sender: MessageSender, responder: Responder) {
        let Some(envelope) = Envelope::from_value(message) else {
            return;
        };
        let Some(event) = envelope.strip_namespace(&self.namespace) else {
            return;
        };
        let slots = lock(&self.listeners).take_for_dispatch(event);
        log::trace!("bus dispatch {event} to {} listener(s)", slots.len());

        // Skip listeners removed by an earlier one in this same dispatch.
        let replies: Vec<Reply> = slots
            .iter()
            .filter(|slot| lock(&self.listeners).still_registered(event, slot))
            .map(|slot| (slot.callback)(&envelope.payload, &sender))
            .collect();

        if !replies.iter().any(Reply::is_pending) {
            responder.respond(aggregate(ready_values(replies)));
            return;
        }

        let event = event.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let value = settle(&event, replies).await;
                    responder.respond(value);
                });
            }
            Err(_) => {
                log::error!("bus dispatch {event}: no tokio runtime, pending replies dropped");
                responder.respond(aggregate(ready_values(replies)));
            }
        }
    }
}

fn ready_values(replies: Vec<Reply>) -> Vec<Value> {
    replies
        .into_iter()
        .filter_map(|reply| match reply {
            Reply::Ready(value) => Some(value),
            _ => None,
        })
        .collect()
}

/// Await every reply independently, keeping listener order in the result.
async fn settle(event: &str, replies: Vec<Reply>) -> Value {
    let pending = replies.into_iter().map(|reply| match reply {
        Reply::Silent => future::ready(Ok(None)).boxed(),
        Reply::Ready(value) => future::ready(Ok(Some(value))).boxed(),
        Reply::Pending(fut) => fut,
    });
    let values = future::join_all(pending)
        .await
        .into_iter()
        .filter_map(|res| match res {
            Ok(value) => value,
            Err(e) => {
                log::warn!("listener for {event} failed: {e}");
                None
            }
        })
        .collect();
    aggregate(values)
}
