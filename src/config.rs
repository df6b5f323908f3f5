//! Lock keeper configuration.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::bus::MatchRule;
use crate::lock::{InhibitMode, InhibitRequest, InhibitTarget};

/// Configuration file name inside the `sleeplock` config directory.
const CONFIG_FILE: &str = "sleeplock.json";

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must not contain quotes: {value:?}")]
    Quoted { field: &'static str, value: String },

    #[error("inhibit mode must be delay, {0} locks never see the sleep notification")]
    IncompatibleMode(InhibitMode),
}

/// Lock keeper configuration.
#[derive(Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub inhibit: InhibitRequest,

    /// Method call timeout in milliseconds, unbounded if absent.
    pub call_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            inhibit: InhibitRequest {
                what: "sleep".into(),
                who: "sleeplock".into(),
                why: "Releasing resources before sleep".into(),
                mode: InhibitMode::Delay,
            },
            call_timeout_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location.
    ///
    /// A missing file at the default location yields the built-in defaults,
    /// while an explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if !required && err.kind() == ErrorKind::NotFound => {
                return Ok(Self::default());
            },
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Ensure all names are usable on the bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("bus.service", &self.bus.service),
            ("bus.path", &self.bus.path),
            ("bus.manager_interface", &self.bus.manager_interface),
            ("bus.inhibit_method", &self.bus.inhibit_method),
            ("bus.signal_interface", &self.bus.signal_interface),
            ("bus.signal_member", &self.bus.signal_member),
            ("inhibit.what", &self.inhibit.what),
            ("inhibit.who", &self.inhibit.who),
            ("inhibit.why", &self.inhibit.why),
        ];

        for (field, value) in fields {
            if value.is_empty() {
                return Err(ConfigError::Empty { field });
            }

            // Names are embedded in a quoted match rule.
            if value.contains('\'') {
                return Err(ConfigError::Quoted { field, value: value.clone() });
            }
        }

        match &self.bus.signal_sender {
            Some(sender) if sender.is_empty() => {
                return Err(ConfigError::Empty { field: "bus.signal_sender" });
            },
            Some(sender) if sender.contains('\'') => {
                let value = sender.clone();
                return Err(ConfigError::Quoted { field: "bus.signal_sender", value });
            },
            _ => (),
        }

        match self.inhibit.mode {
            InhibitMode::Delay => Ok(()),
            mode => Err(ConfigError::IncompatibleMode(mode)),
        }
    }

    /// Method call timeout.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Remote manager wire contract.
#[derive(Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub service: String,
    pub path: String,
    pub manager_interface: String,
    pub inhibit_method: String,
    pub signal_interface: String,
    pub signal_member: String,

    /// Only accept sleep notifications from this bus name.
    pub signal_sender: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service: "org.freedesktop.login1".into(),
            path: "/org/freedesktop/login1".into(),
            manager_interface: "org.freedesktop.login1.Manager".into(),
            inhibit_method: "Inhibit".into(),
            signal_interface: "org.freedesktop.login1.Manager".into(),
            signal_member: "PrepareForSleep".into(),
            signal_sender: None,
        }
    }
}

impl BusConfig {
    /// Method used to take inhibitor locks.
    pub fn inhibit_target(&self) -> InhibitTarget {
        InhibitTarget {
            service: self.service.clone(),
            path: self.path.clone(),
            interface: self.manager_interface.clone(),
            method: self.inhibit_method.clone(),
        }
    }

    /// Subscription for sleep notifications.
    pub fn match_rule(&self) -> MatchRule {
        MatchRule {
            sender: self.signal_sender.clone(),
            path: self.path.clone(),
            interface: self.signal_interface.clone(),
            member: self.signal_member.clone(),
        }
    }
}

/// Default configuration file location.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sleeplock").join(CONFIG_FILE))
}
