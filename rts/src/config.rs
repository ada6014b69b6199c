//! Block and connection configuration with JSON persistence.

use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-connection limits and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Idle-send timeout in seconds. Negative disables timeout checks.
    pub connection_timeout: f64,
    /// Seconds to wait for any traffic after a keepalive probe.
    pub keepalive_grace: f64,
    /// Longest accepted line in bytes.
    pub max_line: usize,
    /// Largest binary frame in bytes.
    pub data_frame: usize,
    /// Consecutive protocol errors tolerated before the connection breaks.
    pub max_protocol_errors: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 300.0,
            keepalive_grace: 60.0,
            max_line: 64 * 1024,
            data_frame: 64 * 1024,
            max_protocol_errors: 10,
        }
    }
}

impl ConnectionConfig {
    /// Idle-send timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.connection_timeout >= 0.0)
            .then(|| Duration::try_from_secs_f64(self.connection_timeout).ok())
            .flatten()
    }

    /// Keepalive grace period.
    pub fn grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.keepalive_grace).unwrap_or_default()
    }
}

/// A named peer device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DeviceConfig {
    /// `host:port` of the device.
    pub address: Option<String>,
    /// Devices whose BOP bits gate commands to this one.
    pub blocked_by: Vec<String>,
    /// Central node used to relay authorization requests.
    pub central: bool,
}

impl DeviceConfig {
    /// Creates an entry reachable at `address`.
    pub fn at(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Adds blocking devices.
    #[must_use]
    pub fn blocked_by<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(names.into_iter().map(Into::into));
        self
    }

    /// Marks the device as the central node.
    #[must_use]
    pub const fn central(mut self) -> Self {
        self.central = true;
        self
    }

    /// The address when it is a literal `ip:port`; host names need a
    /// [`lookup`].
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.as_deref()?.parse().ok()
    }
}

/// Resolves `host:port`, blocking on the system resolver.
pub(crate) fn lookup(address: &str) -> Option<SocketAddr> {
    address.to_socket_addrs().ok()?.next()
}

/// Configuration of a [`Block`](crate::Block).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BlockConfig {
    /// Name announced in messages.
    pub name: String,
    /// Address to accept connections on.
    pub listen: Option<String>,
    /// Accepted connections must authorize before sending commands.
    pub authorize: bool,
    /// Upper bound of one readiness wait, in milliseconds.
    pub poll_interval_ms: u64,
    /// Limits applied to every connection.
    pub connection: ConnectionConfig,
    /// Known devices by name.
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            name: "rts".to_owned(),
            listen: None,
            authorize: false,
            poll_interval_ms: 100,
            connection: ConnectionConfig::default(),
            devices: BTreeMap::new(),
        }
    }
}

impl BlockConfig {
    /// Creates a default configuration with `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Writes the configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        Ok(serde_json::to_writer_pretty(file, self)?)
    }

    /// Readiness wait bound.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
