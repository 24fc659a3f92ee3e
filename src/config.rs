//! Messaging configuration.
//!
//! The crate ships an embedded `defaults.toml`. Callers either use
//! [`BusConfig::default`], parse their own TOML, or call [`BusConfig::load`] to
//! apply the environment overrides on top of the defaults.

use crate::error::{BusError, BusResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

/// Points at a TOML file replacing the embedded defaults.
pub const CONFIG_ENV: &str = "EXTENSION_MESSAGING_CONFIG";
/// Overrides only the namespace.
pub const NAMESPACE_ENV: &str = "EXTENSION_MESSAGING_NAMESPACE";

const DEFAULTS_TOML: &str = include_str!("defaults.toml");

static DEFAULTS: Lazy<BusConfig> = Lazy::new(|| {
    // The embedded file is covered by tests; fall back to code values anyway.
    toml::from_str(DEFAULTS_TOML).unwrap_or_else(|e| {
        log::error!("embedded defaults.toml is invalid: {e}");
        BusConfig::builtin()
    })
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub namespace: String,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub prefix: String,
    pub initiator_role: String,
    pub target_role: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_message_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            prefix: "tunnel".to_string(),
            initiator_role: "devtools".to_string(),
            target_role: "contents".to_string(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: crate::envelope::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        DEFAULTS.clone()
    }
}

impl BusConfig {
    fn builtin() -> Self {
        Self {
            namespace: "extension-messaging".to_string(),
            tunnel: TunnelConfig::default(),
            limits: Limits::default(),
        }
    }

    /// Same defaults with a different namespace.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> BusResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Defaults, replaced by `EXTENSION_MESSAGING_CONFIG` when set, then
    /// `EXTENSION_MESSAGING_NAMESPACE` applied on top.
    pub fn load() -> BusResult<Self> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Ok(namespace) = env::var(NAMESPACE_ENV) {
            config.namespace = namespace;
        }
        config.validate()?;
        log::debug!("messaging config loaded (namespace={})", config.namespace);
        Ok(config)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(BusError::Config(format!(
                "namespace must be non-empty and contain no '/': {:?}",
                self.namespace
            )));
        }
        let tunnel = &self.tunnel;
        if tunnel.prefix.is_empty()
            || tunnel.initiator_role.is_empty()
            || tunnel.target_role.is_empty()
        {
            return Err(BusError::Config("tunnel names must be non-empty".into()));
        }
        if tunnel.initiator_role == tunnel.target_role {
            return Err(BusError::Config(
                "tunnel roles must have distinct names".into(),
            ));
        }
        if self.limits.max_message_bytes == 0 {
            return Err(BusError::Config("max_message_bytes must be > 0".into()));
        }
        Ok(())
    }

    /// `"<namespace>/"`, the prefix every event and port name carries.
    pub fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }
}
