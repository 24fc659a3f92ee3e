//! Event channel over one long-lived port.
//!
//! Same `on`/`once`/`off`/`emit` shape as the bus, but fire-and-forget: there
//! is no response path over a port. The transport's teardown shows up as the
//! reserved `disconnect` event, delivered at most once per channel.

use crate::envelope::{ensure_fits, Envelope, MAX_MESSAGE_SIZE};
use crate::error::{BusError, BusResult, HostError};
use crate::host::{MessageSender, Port};
use crate::listeners::{lock, ListenerId, ListenerSet, OnceFuture};
use crate::registry::RegistryShared;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Reserved event synthesized when the connection goes away.
pub const DISCONNECT: &str = "disconnect";

pub(crate) type ChannelListener = dyn Fn(&Value, &MessageSender) + Send + Sync;

/// Listener table for port-backed endpoints (channels and tunnels).
#[derive(Default)]
pub(crate) struct Listeners(Mutex<ListenerSet<ChannelListener>>);

impl Listeners {
    pub(crate) fn register<F>(&self, event: &str, listener: F, once: bool) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) + Send + Sync + 'static,
    {
        if event.is_empty() {
            return Err(BusError::InvalidArgument("event name must not be empty"));
        }
        Ok(lock(&self.0).add(event, Arc::new(listener), once))
    }

    pub(crate) fn awaitable(&self, event: &str) -> BusResult<OnceFuture> {
        let (fut, slot) = OnceFuture::pair();
        self.register(event, move |payload, _| slot.fill(payload), true)?;
        Ok(fut)
    }

    pub(crate) fn off(&self, event: &str, id: ListenerId) -> bool {
        lock(&self.0).remove(event, id)
    }

    pub(crate) fn dispatch(&self, event: &str, payload: &Value, sender: &MessageSender) {
        let slots = lock(&self.0).take_for_dispatch(event);
        for slot in slots {
            // An earlier listener may have called `off` on this one.
            if lock(&self.0).still_registered(event, &slot) {
                (slot.callback)(payload, sender);
            }
        }
    }

    pub(crate) fn clear_all(&self) {
        lock(&self.0).clear_all();
    }
}

/// Checks shared by every port-backed `emit`.
pub(crate) fn check_emit(event: &str) -> BusResult<()> {
    if event.is_empty() {
        return Err(BusError::InvalidArgument("event name must not be empty"));
    }
    if event == DISCONNECT {
        return Err(BusError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Handle to one connection. Clones share the port and the listener table.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    port: Arc<dyn Port>,
    sender: MessageSender,
    max_message_bytes: usize,
    listeners: Listeners,
    closed: AtomicBool,
    registry: Option<Weak<RegistryShared>>,
}

impl Channel {
    /// Wrap `port`. Nothing is delivered until [`Channel::attach`] runs, so
    /// callers can register listeners first.
    pub(crate) fn new(
        name: impl Into<String>,
        port: Arc<dyn Port>,
        max_message_bytes: usize,
        registry: Option<Weak<RegistryShared>>,
    ) -> Self {
        let sender = port.sender().unwrap_or_default();
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                port,
                sender,
                max_message_bytes,
                listeners: Listeners::default(),
                closed: AtomicBool::new(false),
                registry,
            }),
        }
    }

    /// Wrap a port that did not come from a registry and start receiving.
    /// Outbound messages are capped at [`MAX_MESSAGE_SIZE`].
    pub fn from_port(name: impl Into<String>, port: Arc<dyn Port>) -> Self {
        let channel = Self::new(name, port, MAX_MESSAGE_SIZE, None);
        channel.attach();
        channel
    }

    /// Hook the port's callbacks up to this channel. The host drops them once
    /// the port disconnects.
    pub(crate) fn attach(&self) {
        let on_message = self.inner.clone();
        let on_disconnect = self.inner.clone();
        self.inner.port.set_handlers(
            Arc::new(move |message: Value| on_message.receive(message)),
            Arc::new(move |cause: Option<String>| {
                on_disconnect.close(cause.map(Value::String))
            }),
        );
    }

    /// Logical name, without the namespace prefix.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Metadata about the other end of the connection.
    pub fn sender(&self) -> &MessageSender {
        &self.inner.sender
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn on<F>(&self, event: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) + Send + Sync + 'static,
    {
        self.inner.listeners.register(event, listener, false)
    }

    pub fn once<F>(&self, event: &str, listener: F) -> BusResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender) + Send + Sync + 'static,
    {
        self.inner.listeners.register(event, listener, true)
    }

    pub fn once_awaitable(&self, event: &str) -> BusResult<OnceFuture> {
        self.inner.listeners.awaitable(event)
    }

    /// Remove one registration, effective for the message being dispatched.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(event, id)
    }

    /// Post `{event, payload}` to the other end.
    ///
    /// `disconnect` is reserved and never reaches the port.
    pub fn emit(&self, event: &str, payload: Value) -> BusResult<()> {
        check_emit(event)?;
        if !self.is_connected() {
            return Err(BusError::Disconnected(self.inner.name.clone()));
        }
        log::trace!("channel {} emit {event}", self.inner.name);
        let message = Envelope::new(event, payload).into_value();
        ensure_fits(&message, self.inner.max_message_bytes).map_err(HostError::Transfer)?;
        self.inner.port.post_message(message)?;
        Ok(())
    }

    /// Close the connection. Idempotent: only the first call delivers the local
    /// `disconnect` event and drops the registry's queued handlers for this name.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.port.disconnect();
        if let Some(registry) = self.inner.registry.as_ref().and_then(Weak::upgrade) {
            registry.forget(&self.inner.name);
        }
        self.inner.finish(Value::Null);
    }

    /// Whether both handles point at the same connection.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ChannelInner {
    fn receive(&self, message: Value) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(envelope) = Envelope::from_value(message) else {
            log::warn!("channel {}: dropping malformed message", self.name);
            return;
        };
        if envelope.event == DISCONNECT {
            log::warn!("channel {}: peer sent reserved event, dropped", self.name);
            return;
        }
        self.listeners
            .dispatch(&envelope.event, &envelope.payload, &self.sender);
    }

    /// Remote end went away (or the host failed the port).
    fn close(&self, cause: Option<Value>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("channel {} disconnected", self.name);
        self.finish(cause.unwrap_or(Value::Null));
    }

    /// Deliver `disconnect` once, then release every listener.
    fn finish(&self, payload: Value) {
        self.listeners.dispatch(DISCONNECT, &payload, &self.sender);
        self.listeners.clear_all();
    }
}
