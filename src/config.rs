//! Tunables of the attach sequence.
//!
//! [`AttachConfig`] can be embedded in an application's own configuration (it implements
//! `Deserialize` with every field defaulted) or built from `VMATTACH_*` environment variables
//! with [`AttachConfig::from_env`].

use std::{ffi::OsString, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{error::AttachError, protocol::ProtocolVariant};

/// How the wire variant of a listener is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolSelection {
    /// Use the legacy frame whenever the request fits in it, probe the listener otherwise.
    #[default]
    Auto,
    /// Always use the legacy frame.
    Legacy,
    /// Always use the extended frame.
    Extended,
}

impl ProtocolSelection {
    /// The variant imposed by this selection, if any.
    pub fn forced(self) -> Option<ProtocolVariant> {
        match self {
            ProtocolSelection::Auto => None,
            ProtocolSelection::Legacy => Some(ProtocolVariant::Legacy),
            ProtocolSelection::Extended => Some(ProtocolVariant::Extended),
        }
    }
}

impl FromStr for ProtocolSelection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProtocolSelection::Auto),
            "legacy" | "1" => Ok(ProtocolSelection::Legacy),
            "extended" | "2" => Ok(ProtocolSelection::Extended),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttachConfig {
    /// Number of times the listener socket is looked for after the target was signalled.
    pub poll_attempts: u32,
    /// Delay between two looks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Bound on a single socket connection attempt, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Temporary directory of the target as seen by the caller. Bypasses the locator's own
    /// resolution when set.
    pub tmp_dir: Option<PathBuf>,
    pub protocol: ProtocolSelection,
    /// Switch to the target owner's effective uid/gid when running as root.
    pub impersonate_target: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 300,
            poll_interval_ms: 20,
            connect_timeout_ms: 2000,
            tmp_dir: None,
            protocol: ProtocolSelection::Auto,
            impersonate_target: true,
        }
    }
}

impl AttachConfig {
    /// Default configuration overlaid with the `VMATTACH_*` environment variables.
    pub fn from_env() -> Result<Self, AttachError> {
        Self::from_vars(std::env::vars_os())
    }

    fn from_vars(
        vars: impl IntoIterator<Item = (OsString, OsString)>,
    ) -> Result<Self, AttachError> {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(key) = key.to_str() else {
                continue;
            };
            match key {
                "VMATTACH_POLL_ATTEMPTS" => {
                    config.poll_attempts = parse_var("VMATTACH_POLL_ATTEMPTS", &value)?
                }
                "VMATTACH_POLL_INTERVAL_MS" => {
                    config.poll_interval_ms = parse_var("VMATTACH_POLL_INTERVAL_MS", &value)?
                }
                "VMATTACH_CONNECT_TIMEOUT_MS" => {
                    config.connect_timeout_ms = parse_var("VMATTACH_CONNECT_TIMEOUT_MS", &value)?
                }
                "VMATTACH_TMP_PATH" => {
                    if !value.is_empty() {
                        config.tmp_dir = Some(PathBuf::from(value));
                    }
                }
                "VMATTACH_PROTOCOL" => {
                    config.protocol = parse_var("VMATTACH_PROTOCOL", &value)?
                }
                "VMATTACH_IMPERSONATE" => {
                    config.impersonate_target = parse_var("VMATTACH_IMPERSONATE", &value)?
                }
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Upper bound of the time spent waiting for a listener to appear.
    pub fn poll_ceiling(&self) -> Duration {
        self.poll_interval().saturating_mul(self.poll_attempts)
    }
}

fn parse_var<T: FromStr>(key: &'static str, value: &OsString) -> Result<T, AttachError> {
    value
        .to_str()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| AttachError::InvalidConfig {
            key,
            value: value.to_string_lossy().into_owned(),
        })
}
