//! In-memory host: one simulated extension with any number of contexts.
//!
//! A [`LocalRuntime`] plays the browser; [`LocalRuntime::attach`] adds a
//! context (background, content script, devtools page, popup) and returns
//! its [`LocalHost`]. Routing follows the extension runtime:
//!
//! - `Target::Runtime` messages reach every extension page except the sender,
//!   never content scripts. `Target::Tab(id)` reaches content scripts in `id`.
//!   The first response wins.
//! - `connect` reaches the background context when it listens, otherwise the
//!   first other extension page that does.
//!
//! Delivery is synchronous and no runtime lock is held while a listener runs,
//! so listeners may send or connect again from inside a callback. Every
//! message is copied by serializing it, so payloads over the configured
//! limit fail the same way they would in a browser.

use crate::config::BusConfig;
use crate::envelope::{transfer, MAX_MESSAGE_SIZE};
use crate::error::{HostError, HostResult};
use crate::host::{
    ConnectListener, Host, HostContext, MessageListener, MessageSender, Port,
    PortDisconnectHandler, PortMessageHandler, Responder, Target,
};
use crate::listeners::lock;
use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

type ContextId = u64;

/// Simulated browser profile running one extension.
#[derive(Clone)]
pub struct LocalRuntime {
    shared: Arc<RuntimeShared>,
}

struct RuntimeShared {
    extension_id: String,
    max_message_bytes: usize,
    state: Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    next_context: ContextId,
    contexts: BTreeMap<ContextId, ContextEntry>,
}

struct ContextEntry {
    context: HostContext,
    message_listeners: Vec<MessageListener>,
    connect_listeners: Vec<ConnectListener>,
    ports: Vec<(Weak<PortPair>, usize)>,
}

impl LocalRuntime {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self::with_limit(extension_id, MAX_MESSAGE_SIZE)
    }

    /// Runtime rejecting messages whose JSON exceeds `max_message_bytes`.
    pub fn with_limit(extension_id: impl Into<String>, max_message_bytes: usize) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                extension_id: extension_id.into(),
                max_message_bytes,
                state: Mutex::new(RuntimeState::default()),
            }),
        }
    }

    /// Runtime enforcing `config.limits.max_message_bytes`.
    pub fn from_config(extension_id: impl Into<String>, config: &BusConfig) -> Self {
        Self::with_limit(extension_id, config.limits.max_message_bytes)
    }

    pub fn extension_id(&self) -> &str {
        &self.shared.extension_id
    }

    /// Start a new execution context.
    pub fn attach(&self, context: HostContext) -> Arc<LocalHost> {
        let mut state = lock(&self.shared.state);
        state.next_context += 1;
        let id = state.next_context;
        state.contexts.insert(
            id,
            ContextEntry {
                context,
                message_listeners: Vec::new(),
                connect_listeners: Vec::new(),
                ports: Vec::new(),
            },
        );
        log::trace!("local runtime: context {id} attached as {context:?}");
        Arc::new(LocalHost {
            runtime: self.shared.clone(),
            id,
            context,
        })
    }

    /// Contexts currently alive.
    pub fn context_count(&self) -> usize {
        lock(&self.shared.state).contexts.len()
    }
}

/// One context of a [`LocalRuntime`].
pub struct LocalHost {
    runtime: Arc<RuntimeShared>,
    id: ContextId,
    context: HostContext,
}

impl LocalHost {
    /// Metadata receivers see for traffic from this context.
    pub fn sender(&self) -> MessageSender {
        self.runtime.sender_for(self.context)
    }

    /// Tear the context down, as when a tab or devtools window closes: its
    /// listeners go away and the remote end of every port it holds sees a
    /// disconnect.
    pub fn close(&self) {
        let entry = lock(&self.runtime.state).contexts.remove(&self.id);
        let Some(entry) = entry else {
            return;
        };
        log::trace!("local runtime: context {} closed", self.id);
        for (pair, side) in entry.ports {
            if let Some(pair) = pair.upgrade() {
                pair.close_from(side, None);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.runtime.state).contexts.contains_key(&self.id)
    }

    fn with_entry(&self, f: impl FnOnce(&mut ContextEntry)) {
        match lock(&self.runtime.state).contexts.get_mut(&self.id) {
            Some(entry) => f(entry),
            None => log::warn!("local runtime: context {} is closed", self.id),
        }
    }
}

impl RuntimeShared {
    fn sender_for(&self, context: HostContext) -> MessageSender {
        let page = |file: &str| Some(format!("chrome-extension://{}/{file}", self.extension_id));
        let (url, tab, frame_id) = match context {
            HostContext::Background => (page("background.html"), None, None),
            HostContext::DevTools { .. } => (page("devtools.html"), None, None),
            HostContext::Page => (page("popup.html"), None, None),
            HostContext::ContentScript { tab_id } => (None, Some(tab_id), Some(0)),
        };
        MessageSender {
            id: Some(self.extension_id.clone()),
            url,
            tab,
            frame_id,
        }
    }
}

fn reaches(target: Target, context: HostContext) -> bool {
    match target {
        Target::Runtime => !matches!(context, HostContext::ContentScript { .. }),
        Target::Tab(tab) => context.tab_id() == Some(tab),
    }
}

impl Host for LocalHost {
    fn context(&self) -> HostContext {
        self.context
    }

    fn send_message(&self, target: Target, message: Value) -> BoxFuture<'static, HostResult<Value>> {
        let limit = self.runtime.max_message_bytes;
        let message = match transfer(&message, limit) {
            Ok(message) => message,
            Err(e) => return future::ready(Err(HostError::Transfer(e))).boxed(),
        };
        let receivers: Vec<MessageListener> = lock(&self.runtime.state)
            .contexts
            .iter()
            .filter(|(id, entry)| **id != self.id && reaches(target, entry.context))
            .flat_map(|(_, entry)| entry.message_listeners.iter().cloned())
            .collect();
        if receivers.is_empty() {
            return future::ready(Err(HostError::NoReceiver)).boxed();
        }

        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(PendingReply {
            tx: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(receivers.len()),
            limit,
        });
        let sender = self.sender();
        for listener in receivers {
            let guard = ReplyGuard(reply.clone());
            listener(
                message.clone(),
                sender.clone(),
                Responder::new(move |value| guard.answer(value)),
            );
        }
        rx.map(|res| res.unwrap_or(Err(HostError::NoResponse))).boxed()
    }

    fn add_message_listener(&self, listener: MessageListener) {
        self.with_entry(|entry| entry.message_listeners.push(listener));
    }

    fn connect(&self, name: &str) -> HostResult<Arc<dyn Port>> {
        let pair = Arc::new(PortPair::new(self.runtime.max_message_bytes));
        let remote = {
            let mut state = lock(&self.runtime.state);
            let me = self.id;
            let mut listening: Vec<(ContextId, HostContext, Vec<ConnectListener>)> = state
                .contexts
                .iter()
                .filter(|(id, entry)| {
                    **id != me
                        && !matches!(entry.context, HostContext::ContentScript { .. })
                        && !entry.connect_listeners.is_empty()
                })
                .map(|(id, entry)| (*id, entry.context, entry.connect_listeners.clone()))
                .collect();
            let index = listening
                .iter()
                .position(|(_, context, _)| context.is_background())
                .unwrap_or(0);
            let chosen = (index < listening.len()).then(|| listening.swap_remove(index));

            let mut track = |id: ContextId, side: usize| {
                if let Some(entry) = state.contexts.get_mut(&id) {
                    entry.ports.retain(|(pair, _)| pair.strong_count() > 0);
                    entry.ports.push((Arc::downgrade(&pair), side));
                }
            };
            track(me, 0);
            if let Some((id, _, _)) = &chosen {
                track(*id, 1);
            }
            chosen
        };

        let local_end = |sender: Option<MessageSender>| -> Arc<dyn Port> {
            Arc::new(LocalPort {
                pair: pair.clone(),
                side: 0,
                name: name.to_string(),
                sender,
            })
        };
        let Some((remote_id, remote_context, listeners)) = remote else {
            log::debug!("local runtime: nobody accepts port {name}");
            pair.close_from(1, Some(HostError::NoReceiver.to_string()));
            return Ok(local_end(None));
        };
        log::trace!("local runtime: port {name} from {} to {remote_id}", self.id);

        let accepted: Arc<dyn Port> = Arc::new(LocalPort {
            pair: pair.clone(),
            side: 1,
            name: name.to_string(),
            sender: Some(self.sender()),
        });
        for listener in listeners {
            listener(accepted.clone());
        }
        Ok(local_end(Some(self.runtime.sender_for(remote_context))))
    }

    fn add_connect_listener(&self, listener: ConnectListener) {
        self.with_entry(|entry| entry.connect_listeners.push(listener));
    }
}

/// First answer wins; when every responder is gone unanswered, the sender
/// gets `NoResponse`.
struct PendingReply {
    tx: Mutex<Option<oneshot::Sender<HostResult<Value>>>>,
    outstanding: AtomicUsize,
    limit: usize,
}

struct ReplyGuard(Arc<PendingReply>);

impl ReplyGuard {
    fn answer(self, value: Value) {
        if let Some(tx) = lock(&self.0.tx).take() {
            let _ = tx.send(transfer(&value, self.0.limit).map_err(HostError::Transfer));
        }
    }
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(tx) = lock(&self.0.tx).take() {
                let _ = tx.send(Err(HostError::NoResponse));
            }
        }
    }
}

#[derive(Default)]
struct EndState {
    on_message: Option<PortMessageHandler>,
    on_disconnect: Option<PortDisconnectHandler>,
    backlog: VecDeque<Value>,
    /// Remote disconnect that arrived before handlers were set.
    remote_closed: Option<Option<String>>,
}

struct PortPair {
    ends: [Mutex<EndState>; 2],
    open: AtomicBool,
    limit: usize,
}

impl PortPair {
    fn new(limit: usize) -> Self {
        Self {
            ends: [Mutex::default(), Mutex::default()],
            open: AtomicBool::new(true),
            limit,
        }
    }

    fn post(&self, from: usize, message: Value) -> HostResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(HostError::PortClosed);
        }
        let message = transfer(&message, self.limit)?;
        let handler = {
            let mut end = lock(&self.ends[1 - from]);
            match end.on_message.clone() {
                Some(handler) => handler,
                None => {
                    end.backlog.push_back(message);
                    return Ok(());
                }
            }
        };
        handler(message);
        Ok(())
    }

    /// Close the pair on behalf of `from`; only the other end is notified.
    /// Both ends drop their handlers.
    fn close_from(&self, from: usize, cause: Option<String>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let own = std::mem::take(&mut *lock(&self.ends[from]));
        let (handler, stale) = {
            let mut end = lock(&self.ends[1 - from]);
            let stale = end.on_message.take();
            let handler = end.on_disconnect.take();
            if handler.is_none() {
                end.remote_closed = Some(cause.clone());
            }
            (handler, stale)
        };
        drop(own);
        drop(stale);
        if let Some(handler) = handler {
            handler(cause);
        }
    }
}

struct LocalPort {
    pair: Arc<PortPair>,
    side: usize,
    name: String,
    sender: Option<MessageSender>,
}

impl Port for LocalPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> Option<MessageSender> {
        self.sender.clone()
    }

    fn post_message(&self, message: Value) -> HostResult<()> {
        self.pair.post(self.side, message)
    }

    fn set_handlers(&self, on_message: PortMessageHandler, on_disconnect: PortDisconnectHandler) {
        let (backlog, remote_closed) = {
            let mut end = lock(&self.pair.ends[self.side]);
            let backlog = std::mem::take(&mut end.backlog);
            let remote_closed = end.remote_closed.take();
            if self.pair.open.load(Ordering::Acquire) {
                end.on_message = Some(on_message.clone());
                end.on_disconnect = Some(on_disconnect.clone());
            }
            (backlog, remote_closed)
        };
        for message in backlog {
            on_message(message);
        }
        if let Some(cause) = remote_closed {
            on_disconnect(cause);
        }
    }

    fn disconnect(&self) {
        self.pair.close_from(self.side, None);
    }
}
