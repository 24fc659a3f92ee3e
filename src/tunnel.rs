//! Tunnels: events relayed between a devtools page and the content scripts of
//! the tab it inspects, through a broker in the background context.
//!
//! Each peer opens `tunnel/<name>/<role>` and sends one `init` envelope. The
//! initiator (devtools side) names the tab it wants in the payload; the
//! target (content side) sends nothing and the broker uses the tab the
//! connection came from. Application events travel as
//! `{event: "event", payload: {event, payload}}` and the broker forwards them
//! to the peer registered under the same tab in the other role. Nobody there
//! means the event is dropped.

use crate::channel::{check_emit, Channel, Listeners, DISCONNECT};
use crate::config::TunnelConfig;
use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use crate::host::{HostContext, MessageSender, TabId};
use crate::listeners::{lock, ListenerId, OnceFuture};
use crate::registry::ChannelRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const INIT: &str = "init";
const RELAY: &str = "event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Devtools side; picks the tab to talk to.
    Initiator,
    /// Content side; identified by the tab it runs in.
    Target,
}

impl Role {
    pub fn counterpart(self) -> Self {
        match self {
            Role::Initiator => Role::Target,
            Role::Target => Role::Initiator,
        }
    }

    /// Role segment of the channel name, from config.
    pub fn wire_name(self, config: &TunnelConfig) -> &str {
        match self {
            Role::Initiator => &config.initiator_role,
            Role::Target => &config.target_role,
        }
    }

    /// Role a context plays, or `None` for the background context.
    pub fn for_context(context: HostContext) -> Option<Self> {
        match context {
            HostContext::Background => None,
            HostContext::DevTools { .. } => Some(Role::Initiator),
            _ => Some(Role::Target),
        }
    }
}

/// `tunnel/<name>/<role>`, before the registry adds its namespace.
pub fn channel_name(config: &TunnelConfig, name: &str, role: Role) -> String {
    format!("{}/{}/{}", config.prefix, name, role.wire_name(config))
}

#[derive(Default)]
struct PeerTable {
    initiators: HashMap<TabId, Channel>,
    targets: HashMap<TabId, Channel>,
}

impl PeerTable {
    fn role(&mut self, role: Role) -> &mut HashMap<TabId, Channel> {
        match role {
            Role::Initiator => &mut self.initiators,
            Role::Target => &mut self.targets,
        }
    }
}

/// Background-side router for one tunnel name. Never handles application
/// events itself.
#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    name: String,
    peers: Mutex<PeerTable>,
}

impl TunnelBroker {
    /// Start routing tunnel `name`. Only valid in the background context, and
    /// only once per name and registry: a second call fails with
    /// [`BusError::AlreadyServed`] until [`crate::Messaging::shutdown`].
    pub fn serve(registry: &ChannelRegistry, name: &str) -> BusResult<Self> {
        if !registry.host().context().is_background() {
            return Err(BusError::WrongContext(
                "tunnel broker runs in the background context",
            ));
        }
        if name.is_empty() {
            return Err(BusError::InvalidArgument("tunnel name must not be empty"));
        }
        if !registry.claim_tunnel(name) {
            return Err(BusError::AlreadyServed(name.to_string()));
        }
        let inner = Arc::new(BrokerInner {
            name: name.to_string(),
            peers: Mutex::new(PeerTable::default()),
        });
        for role in [Role::Initiator, Role::Target] {
            let broker = inner.clone();
            let port_name = channel_name(&registry.config().tunnel, name, role);
            registry.connect(&port_name, move |channel| broker.adopt(role, channel))?;
        }
        log::debug!("tunnel broker {name} serving");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Live channel registered for `tab` in `role`.
    pub fn peer(&self, role: Role, tab: TabId) -> Option<Channel> {
        lock(&self.inner.peers).role(role).get(&tab).cloned()
    }

    pub fn peer_count(&self, role: Role) -> usize {
        lock(&self.inner.peers).role(role).len()
    }
}

impl BrokerInner {
    /// New connection: wait for its `init` before routing anything.
    fn adopt(self: &Arc<Self>, role: Role, channel: Channel) {
        let broker = Arc::downgrade(self);
        let handle = channel.clone();
        let registered = channel.once(INIT, move |payload, sender| {
            if let Some(broker) = broker.upgrade() {
                broker.register(role, &handle, payload, sender);
            }
        });
        if let Err(e) = registered {
            log::warn!("tunnel {}: cannot wait for init: {e}", self.name);
        }
    }

    fn register(self: &Arc<Self>, role: Role, channel: &Channel, payload: &Value, sender: &MessageSender) {
        let identity = match role {
            Role::Initiator => payload.as_i64(),
            Role::Target => sender.tab,
        };
        let Some(tab) = identity else {
            log::warn!("tunnel {}: {role:?} init without a tab identity, ignored", self.name);
            return;
        };

        let previous = lock(&self.peers).role(role).insert(tab, channel.clone());
        if previous.is_some_and(|previous| !previous.ptr_eq(channel)) {
            log::debug!("tunnel {}: {role:?} peer for tab {tab} superseded", self.name);
        }
        log::debug!("tunnel {}: {role:?} peer registered for tab {tab}", self.name);

        let broker = Arc::downgrade(self);
        let relayed = channel.on(RELAY, move |payload, _| {
            if let Some(broker) = broker.upgrade() {
                broker.relay(role, tab, payload);
            }
        });
        let broker = Arc::downgrade(self);
        let handle = channel.clone();
        let watched = channel.on(DISCONNECT, move |_, _| {
            if let Some(broker) = broker.upgrade() {
                broker.forget(role, tab, &handle);
            }
        });
        if let Err(e) = relayed.and(watched) {
            log::warn!("tunnel {}: cannot route tab {tab}: {e}", self.name);
        }
    }

    fn relay(&self, from: Role, tab: TabId, payload: &Value) {
        let counterpart = lock(&self.peers).role(from.counterpart()).get(&tab).cloned();
        let Some(counterpart) = counterpart else {
            log::trace!("tunnel {}: no {:?} peer for tab {tab}, dropped", self.name, from.counterpart());
            return;
        };
        if let Err(e) = counterpart.emit(RELAY, payload.clone()) {
            log::debug!("tunnel {}: relay to tab {tab} failed: {e}", self.name);
        }
    }

    /// Remove the entry unless a newer `init` already replaced it.
    fn forget(&self, role: Role, tab: TabId, channel: &Channel) {
        let mut peers = lock(&self.peers);
        let table = peers.role(role);
        if table.get(&tab).is_some_and(|current| current.ptr_eq(channel)) {
            table.remove(&tab);
            log::debug!("tunnel {}: {role:?} peer for tab {tab} gone", self.name);
        }
    }
}

/// Application-side end of a tunnel.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    name: String,
    role: Role,
    channel: Channel,
    listeners: Arc<Listeners>,
}

impl Tunnel {
    /// Join tunnel `name` from a devtools page or a content script.
    ///
    /// Devtools pages pair with the tab they inspect; every other context
    /// joins as a target identified by its own tab. Fails with
    /// [`BusError::WrongContext`] in the background context, which runs the
    /// broker instead.
    pub fn connect(registry: &ChannelRegistry, name: &str) -> BusResult<Self> {
        let context = registry.host().context();
        let role = Role::for_context(context).ok_or(BusError::WrongContext(
            "the background context brokers tunnels; use TunnelBroker::serve",
        ))?;
        let init = match context.inspected_tab_id() {
            Some(tab) => Value::from(tab),
            None => Value::Null,
        };
        Self::join(registry, name, role, init)
    }

    /// Join as the initiator for an explicit tab, e.g. from a popup.
    ///
    /// The initiator's identity is always a [`TabId`]: the broker pairs it with
    /// the target running in that tab. Other identity payloads are not
    /// supported, and an `init` without an integer tab is ignored.
    pub fn connect_to(registry: &ChannelRegistry, name: &str, tab: TabId) -> BusResult<Self> {
        if registry.host().context().is_background() {
            return Err(BusError::WrongContext(
                "the background context brokers tunnels; use TunnelBroker::serve",
            ));
        }
        Self::join(registry, name, Role::Initiator, Value::from(tab))
    }

    fn join(registry: &ChannelRegistry, name: &str, role: Role, init: Value) -> BusResult<Self> {
        if name.is_empty() {
            return Err(BusError::InvalidArgument("tunnel name must not be empty"));
        }
        let listeners = Arc::new(Listeners::default());
        let wiring = listeners.clone();
        let channel = registry
            .connect(
                &channel_name(&registry.config().tunnel, name, role),
                move |channel| wire(&channel, &wiring),
            )?
            .ok_or(BusError::WrongContext("tunnel channel was queued, not opened"))?;
        channel.emit(INIT, init)?;
        log::debug!("tunnel {name} joined as {role:?}");

        Ok(Self {
            inner: Arc::new(TunnelInner {
                name: name.to_string(),
                role,
                channel,
                listeners,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Underlying channel to the broker.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
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

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(event, id)
    }

    /// Send `event` to the matched peer, if any, through the broker.
    pub fn emit(&self, event: &str, payload: Value) -> BusResult<()> {
        check_emit(event)?;
        self.inner
            .channel
            .emit(RELAY, Envelope::new(event, payload).into_value())
    }

    pub fn disconnect(&self) {
        self.inner.channel.disconnect();
    }
}

/// Unwrap relayed envelopes into the tunnel's own listeners.
fn wire(channel: &Channel, listeners: &Arc<Listeners>) {
    let relayed = listeners.clone();
    let closed = listeners.clone();
    let wired = channel
        .on(RELAY, move |payload, sender| {
            match Envelope::from_value(payload.clone()) {
                Some(inner) if inner.event != DISCONNECT => {
                    relayed.dispatch(&inner.event, &inner.payload, sender)
                }
                _ => log::warn!("tunnel: dropping malformed relayed event"),
            }
        })
        .and_then(|_| {
            channel.on(DISCONNECT, move |payload, sender| {
                closed.dispatch(DISCONNECT, payload, sender);
                closed.clear_all();
            })
        });
    if let Err(e) = wired {
        log::warn!("tunnel channel {}: {e}", channel.name());
    }
}
