//! Channel registry: opens named channels and accepts inbound ones.
//!
//! Content scripts, devtools pages and popups initiate connections. The
//! background context cannot know when a peer will appear, so it queues
//! handlers per name and runs all of them for every connection that arrives
//! under that name.

use crate::channel::Channel;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::host::{Host, Port};
use crate::listeners::lock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub type ChannelHandler = Arc<dyn Fn(Channel) + Send + Sync>;

#[derive(Clone)]
pub struct ChannelRegistry {
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    host: Arc<dyn Host>,
    config: BusConfig,
    prefix: String,
    pending: Mutex<HashMap<String, Vec<ChannelHandler>>>,
    /// Tunnel names a broker already serves through this registry.
    brokered: Mutex<HashSet<String>>,
}

impl ChannelRegistry {
    /// Create a registry and start accepting inbound ports whose name carries
    /// this namespace. The host keeps only a weak reference.
    pub fn new(host: Arc<dyn Host>, config: &BusConfig) -> Self {
        let shared = Arc::new(RegistryShared {
            host,
            prefix: config.prefix(),
            config: config.clone(),
            pending: Mutex::new(HashMap::new()),
            brokered: Mutex::new(HashSet::new()),
        });
        let weak = Arc::downgrade(&shared);
        shared
            .host
            .add_connect_listener(Arc::new(move |port: Arc<dyn Port>| {
                if let Some(shared) = weak.upgrade() {
                    shared.accept(port);
                }
            }));
        Self { shared }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.shared.host
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Get a channel for `name`.
    ///
    /// Outside the background context the port is opened right away,
    /// `handler` runs with the channel before any message is delivered, and
    /// the channel is returned. In the background context `handler` is queued
    /// and `None` is returned; it will run for each inbound connection named
    /// `name`.
    pub fn connect<F>(&self, name: &str, handler: F) -> BusResult<Option<Channel>>
    where
        F: Fn(Channel) + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(BusError::InvalidArgument("channel name must not be empty"));
        }
        if self.shared.host.context().is_background() {
            log::debug!("queueing handler for channel {name}");
            lock(&self.shared.pending)
                .entry(name.to_string())
                .or_default()
                .push(Arc::new(handler));
            return Ok(None);
        }

        let port = self
            .shared
            .host
            .connect(&format!("{}{name}", self.shared.prefix))?;
        let channel = Channel::new(
            name,
            port,
            self.shared.config.limits.max_message_bytes,
            Some(Arc::downgrade(&self.shared)),
        );
        handler(channel.clone());
        channel.attach();
        Ok(Some(channel))
    }

    /// Drop every queued handler for the channel's name and close it.
    pub fn disconnect(&self, channel: &Channel) {
        self.shared.forget(channel.name());
        channel.disconnect();
    }

    /// Number of handlers queued under `name`.
    pub fn pending(&self, name: &str) -> usize {
        lock(&self.shared.pending).get(name).map_or(0, Vec::len)
    }

    /// Record that a broker serves tunnel `name`; false if one already does.
    pub(crate) fn claim_tunnel(&self, name: &str) -> bool {
        lock(&self.shared.brokered).insert(name.to_string())
    }

    pub(crate) fn clear(&self) {
        lock(&self.shared.pending).clear();
        lock(&self.shared.brokered).clear();
    }
}

impl RegistryShared {
    fn accept(self: &Arc<Self>, port: Arc<dyn Port>) {
        let Some(name) = port
            .name()
            .strip_prefix(&self.prefix)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
        else {
            log::trace!("ignoring inbound port {}", port.name());
            return;
        };

        let handlers = lock(&self.pending).get(&name).cloned().unwrap_or_default();
        if handlers.is_empty() {
            log::debug!("inbound channel {name} has no queued handler");
        }
        let channel = Channel::new(
            name,
            port,
            self.config.limits.max_message_bytes,
            Some(Arc::downgrade(self)),
        );
        for handler in handlers {
            handler(channel.clone());
        }
        channel.attach();
    }

    pub(crate) fn forget(&self, name: &str) {
        if lock(&self.pending).remove(name).is_some() {
            log::debug!("dropped queued handlers for channel {name}");
        }
    }
}
