//! Host substrate contract.
//!
//! Everything in this crate sits on two primitives a browser extension runtime
//! provides: one-shot messages with an optional single response, and
//! long-lived named ports. A [`Host`] is one execution context's view of them.
//! Failures come back through [`HostResult`] in the same call that caused
//! them, instead of a shared "last error" slot.

use crate::error::HostResult;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

pub type TabId = i64;

/// Metadata the host attaches to inbound traffic.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSender {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
}

/// Which kind of extension context a [`Host`] runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostContext {
    /// The long-running background page / service worker.
    Background,
    ContentScript { tab_id: TabId },
    /// A devtools page inspecting `inspected_tab_id`.
    DevTools { inspected_tab_id: TabId },
    /// Popup, options and other extension pages.
    Page,
}

impl HostContext {
    pub fn is_background(&self) -> bool {
        matches!(self, HostContext::Background)
    }

    pub fn inspected_tab_id(&self) -> Option<TabId> {
        match self {
            HostContext::DevTools { inspected_tab_id } => Some(*inspected_tab_id),
            _ => None,
        }
    }

    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            HostContext::ContentScript { tab_id } => Some(*tab_id),
            _ => None,
        }
    }
}

/// Addressing for one-shot messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every extension context except content scripts and the sender.
    Runtime,
    /// Content scripts running in one tab.
    Tab(TabId),
}

/// Single-use reply handle for an inbound one-shot message.
///
/// Dropping it without calling [`Responder::respond`] declines the message so
/// another receiver may answer.
pub struct Responder {
    reply: Option<Box<dyn FnOnce(Value) + Send>>,
}

impl Responder {
    pub fn new(reply: impl FnOnce(Value) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(reply)),
        }
    }

    /// Responder backed by a oneshot channel; handy for hosts and tests.
    pub fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self::new(move |value| {
            let _ = tx.send(value);
        });
        (responder, rx)
    }

    pub fn respond(mut self, value: Value) {
        if let Some(reply) = self.reply.take() {
            reply(value);
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

pub type MessageListener = Arc<dyn Fn(Value, MessageSender, Responder) + Send + Sync>;
pub type ConnectListener = Arc<dyn Fn(Arc<dyn Port>) + Send + Sync>;
pub type PortMessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Receives the disconnect cause when the host reports one.
pub type PortDisconnectHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// One execution context's access to the extension messaging primitives.
pub trait Host: Send + Sync {
    fn context(&self) -> HostContext;

    /// Send a one-shot message; resolves with the first response.
    fn send_message(&self, target: Target, message: Value) -> BoxFuture<'static, HostResult<Value>>;

    fn add_message_listener(&self, listener: MessageListener);

    /// Open a named long-lived port.
    fn connect(&self, name: &str) -> HostResult<Arc<dyn Port>>;

    /// Called for every inbound port opened after registration.
    fn add_connect_listener(&self, listener: ConnectListener);
}

/// One end of a long-lived connection.
///
/// Messages or a remote disconnect arriving before [`Port::set_handlers`] are
/// buffered and replayed once handlers are set. Calling [`Port::disconnect`]
/// notifies the remote end only.
pub trait Port: Send + Sync {
    fn name(&self) -> &str;

    /// Who opened (or accepted) the other end.
    fn sender(&self) -> Option<MessageSender>;

    fn post_message(&self, message: Value) -> HostResult<()>;

    fn set_handlers(&self, on_message: PortMessageHandler, on_disconnect: PortDisconnectHandler);

    fn disconnect(&self);
}

impl std::fmt::Debug for dyn Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("name", &self.name()).finish()
    }
}
