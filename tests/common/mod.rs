#![allow(dead_code)]

use extension_messaging::host::{HostContext, TabId};
use extension_messaging::{BusConfig, LocalHost, LocalRuntime, Messaging};
use std::sync::{Arc, Mutex};
use std::{collections::HashMap, env};

/// Env guard that restores previous env vars on drop.
pub struct EnvGuard {
    old: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn set(vars: &[(&str, String)]) -> Self {
        let mut old = HashMap::new();
        for (k, v) in vars {
            old.insert((*k).to_string(), env::var(k).ok());
            env::set_var(k, v);
        }
        Self { old }
    }

    /// Remove `vars` for the guard's lifetime.
    pub fn unset(vars: &[&str]) -> Self {
        let mut old = HashMap::new();
        for k in vars {
            old.insert((*k).to_string(), env::var(k).ok());
            env::remove_var(k);
        }
        Self { old }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, prev) in self.old.drain() {
            match prev {
                Some(v) => env::set_var(k, v),
                None => env::remove_var(k),
            }
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One context of the simulated extension plus its messaging service.
pub struct Ctx {
    pub host: Arc<LocalHost>,
    pub messaging: Messaging,
}

impl Ctx {
    pub fn close(&self) {
        self.host.close();
    }
}

/// Simulated extension: spawn contexts with their own `Messaging`.
pub struct World {
    pub runtime: LocalRuntime,
    pub config: BusConfig,
}

impl World {
    pub fn new() -> Self {
        init_logging();
        Self {
            runtime: LocalRuntime::new("testextensionid"),
            config: BusConfig::with_namespace("test-ns"),
        }
    }

    pub fn ctx(&self, context: HostContext) -> Ctx {
        let host = self.runtime.attach(context);
        let messaging = Messaging::new(host.clone(), self.config.clone()).expect("valid config");
        Ctx { host, messaging }
    }

    pub fn background(&self) -> Ctx {
        self.ctx(HostContext::Background)
    }

    pub fn page(&self) -> Ctx {
        self.ctx(HostContext::Page)
    }

    pub fn content(&self, tab_id: TabId) -> Ctx {
        self.ctx(HostContext::ContentScript { tab_id })
    }

    pub fn devtools(&self, inspected_tab_id: TabId) -> Ctx {
        self.ctx(HostContext::DevTools { inspected_tab_id })
    }
}

/// Shared log of what listeners saw.
#[derive(Clone)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, item: T) {
        self.seen.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
