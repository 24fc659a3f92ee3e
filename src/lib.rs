//! # extension_messaging
//!
//! Structured messaging for **browser extensions**, layered on the two
//! primitives every extension runtime gives you:
//!
//! - **one-shot messages** (`runtime.sendMessage` / `tabs.sendMessage`) with a
//!   single optional response, and
//! - **long-lived ports** (`runtime.connect`) that report disconnects.
//!
//! On top of them this crate provides:
//!
//! - [`EventBus`]: `on` / `once` / `off` / `emit` with namespaced envelopes
//!   and response aggregation across every listener that answered.
//! - [`Channel`]: the same surface scoped to one port, plus a synthetic
//!   `disconnect` event.
//! - [`ChannelRegistry`]: opens channels by name, or queues handlers in the
//!   background context until peers connect.
//! - [`Tunnel`] / [`TunnelBroker`]: devtools page <-> content script relay
//!   through the background context, paired by tab.
//!
//! ---
//!
//! ## The envelope
//!
//! Every unit on the wire is `{ "event": <string>, "payload": <any> }`. Bus
//! events are sent as `"<namespace>/<event>"` so unrelated traffic on the same
//! host channel (other libraries, plain `sendMessage` calls) is ignored. Ports
//! carry the namespace in their name instead.
//!
//! ### Response aggregation
//!
//! An emission resolves with:
//! - `null` when no listener produced a value,
//! - the value itself when exactly one did,
//! - an array, in listener registration order, when several did.
//!
//! ```
//! use extension_messaging::{BusConfig, Messaging, LocalRuntime, Reply};
//! use extension_messaging::host::HostContext;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), extension_messaging::BusError> {
//! let runtime = LocalRuntime::new("abcdefghijklmnop");
//! let background = Messaging::new(runtime.attach(HostContext::Background), BusConfig::default())?;
//! let popup = Messaging::new(runtime.attach(HostContext::Page), BusConfig::default())?;
//!
//! background.bus().on("sum", |payload, _| {
//!     let total: i64 = payload.as_array().into_iter().flatten().filter_map(|n| n.as_i64()).sum();
//!     json!(total)
//! })?;
//! background.bus().on("sum", |_, _| Reply::later(async { json!("checked") }))?;
//!
//! let answer = popup.bus().emit("sum", json!([1, 2, 3])).await?;
//! assert_eq!(answer, json!([6, "checked"]));
//! # Ok(())
//! # }
//! ```
//!
//! ---
//!
//! ## Channels
//!
//! ```
//! use extension_messaging::{BusConfig, Messaging, LocalRuntime};
//! use extension_messaging::host::HostContext;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), extension_messaging::BusError> {
//! let runtime = LocalRuntime::new("abcdefghijklmnop");
//! let background = Messaging::new(runtime.attach(HostContext::Background), BusConfig::default())?;
//! let content = Messaging::new(runtime.attach(HostContext::ContentScript { tab_id: 7 }), BusConfig::default())?;
//!
//! // Background: runs for every content script that connects.
//! background.channels().connect("status", |channel| {
//!     let reply = channel.clone();
//!     let _ = channel.on("hello", move |_, sender| {
//!         let _ = reply.emit("welcome", json!({ "tab": sender.tab }));
//!     });
//! })?;
//!
//! let channel = content.channels().connect("status", |_| {})?.expect("content scripts initiate");
//! let welcome = channel.once_awaitable("welcome")?;
//! channel.emit("hello", json!(null))?;
//! assert_eq!(welcome.await?, json!({ "tab": 7 }));
//! # Ok(())
//! # }
//! ```
//!
//! ---
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade (`debug` for routing decisions,
//! `warn` for dropped traffic and failed listeners). Pick any logger
//! implementation; the test suite uses `env_logger`.
//!
//! ## Configuration
//!
//! [`BusConfig`] defaults come from an embedded `defaults.toml`.
//! [`BusConfig::load`] honours `EXTENSION_MESSAGING_CONFIG` (a TOML file) and
//! `EXTENSION_MESSAGING_NAMESPACE`.

pub mod bus;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod host;
pub mod listeners;
#[cfg(feature = "local-host")]
pub mod local;
pub mod registry;
pub mod tunnel;

use std::sync::Arc;

#[doc(inline)]
pub use bus::{EventBus, Reply};
#[doc(inline)]
pub use channel::{Channel, DISCONNECT};
#[doc(inline)]
pub use config::BusConfig;
#[doc(inline)]
pub use envelope::Envelope;
#[doc(inline)]
pub use error::{BusError, BusResult, HostError, HostResult};
#[doc(inline)]
pub use listeners::{ListenerId, OnceFuture};
#[cfg(feature = "local-host")]
#[doc(inline)]
pub use local::{LocalHost, LocalRuntime};
#[doc(inline)]
pub use registry::ChannelRegistry;
#[doc(inline)]
pub use tunnel::{Role, Tunnel, TunnelBroker};

use host::{Host, HostContext};

/// What [`Messaging::tunnel`] gives back for the current context.
pub enum TunnelEndpoint {
    /// Background context: routes between peers.
    Broker(TunnelBroker),
    Peer(Tunnel),
}

/// Messaging state for one extension context: a bus and a channel registry
/// sharing one host and one config.
///
/// Host listeners only hold weak references, so dropping every clone of this
/// object detaches it from the host.
#[derive(Clone)]
pub struct Messaging {
    config: BusConfig,
    bus: EventBus,
    channels: ChannelRegistry,
}

impl Messaging {
    pub fn new(host: Arc<dyn Host>, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        let bus = EventBus::new(host.clone(), &config);
        let channels = ChannelRegistry::new(host, &config);
        log::debug!(
            "messaging ready in {:?} (namespace={})",
            channels.host().context(),
            config.namespace
        );
        Ok(Self {
            config,
            bus,
            channels,
        })
    }

    /// [`Messaging::new`] with [`BusConfig::load`].
    pub fn from_env(host: Arc<dyn Host>) -> BusResult<Self> {
        Self::new(host, BusConfig::load()?)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn context(&self) -> HostContext {
        self.channels.host().context()
    }

    /// Broker in the background context, peer everywhere else.
    pub fn tunnel(&self, name: &str) -> BusResult<TunnelEndpoint> {
        if self.context().is_background() {
            TunnelBroker::serve(&self.channels, name).map(TunnelEndpoint::Broker)
        } else {
            Tunnel::connect(&self.channels, name).map(TunnelEndpoint::Peer)
        }
    }

    /// Drop every bus listener and every queued channel handler, and release
    /// served tunnel names. Open channels stay open.
    pub fn shutdown(&self) {
        self.bus.clear_all();
        self.channels.clear();
        log::debug!("messaging shut down (namespace={})", self.config.namespace);
    }
}
