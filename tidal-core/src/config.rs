//! Transport Configuration
//!
//! Socket options applied when an endpoint creates its OS socket, plus the
//! sizing parameters of the [`BufferPool`](crate::BufferPool).
//!
//! All structs deserialize with `#[serde(default)]`, so a JSON file only needs
//! to name the values it overrides:
//!
//! ```json
//! { "connection": { "no_delay": false }, "pool": { "items_per_page": 16 } }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

/// Slots carved out of each buffer page.
pub const DEFAULT_ITEMS_PER_PAGE: usize = 48;

/// Byte size of one slot; large enough for a maximal IPv4 datagram payload.
pub const DEFAULT_BUFFER_SIZE: usize = u16::MAX as usize;

/// Pages idle for longer than this are evicted by the sweep.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Cadence of the background idle sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Connection-attempt timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 5;

/// Backlog used by [`Listener::listen`](crate::Listener::listen).
pub const DEFAULT_BACKLOG: u32 = 5;

/// IP protection level requested for a socket.
///
/// Only platforms with a per-socket protection-level control honour values
/// other than [`ProtectionLevel::Unrestricted`]; elsewhere the value is kept
/// for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    #[default]
    Unrestricted,
    EdgeRestricted,
    Restricted,
    Unspecified,
}

/// Options applied to sockets created by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Refuse to share the local address with other sockets.
    pub exclusive_address_use: bool,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Request TCP timestamps where the platform exposes a per-socket control.
    pub use_timestamps: bool,
    /// Upper bound for a connect attempt and for unacknowledged data, in seconds.
    pub connection_timeout_secs: u32,
    pub protection_level: ProtectionLevel,
    /// Reject sends until the protocol layer calls
    /// [`Connection::mark_authenticated`](crate::Connection::mark_authenticated).
    pub require_authentication: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            exclusive_address_use: true,
            no_delay: true,
            use_timestamps: true,
            connection_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            protection_level: ProtectionLevel::Unrestricted,
            require_authentication: false,
        }
    }
}

impl ConnectionOptions {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connection_timeout_secs))
    }
}

/// Options applied to the listening socket and to every accepted socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    pub exclusive_address_use: bool,
    pub no_delay: bool,
    pub use_timestamps: bool,
    pub protection_level: ProtectionLevel,
    pub backlog: u32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            exclusive_address_use: true,
            no_delay: true,
            use_timestamps: true,
            protection_level: ProtectionLevel::Unrestricted,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Sizing and eviction parameters for a [`BufferPool`](crate::BufferPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of slots per page.
    pub items_per_page: usize,
    /// Byte size of every slot.
    pub buffer_size: usize,
    /// Minimum idle time before an unleased page may be evicted.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    /// How often the background sweep runs. `None` disables the sweeper;
    /// [`BufferPool::sweep_idle`](crate::BufferPool::sweep_idle) still works.
    #[serde(with = "option_duration_millis")]
    pub sweep_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.items_per_page == 0 {
            return Err(TransportError::InvalidPoolConfig(
                "items_per_page must be > 0",
            ));
        }
        if self.buffer_size == 0 {
            return Err(TransportError::InvalidPoolConfig("buffer_size must be > 0"));
        }
        if self.items_per_page.checked_mul(self.buffer_size).is_none() {
            return Err(TransportError::InvalidPoolConfig(
                "items_per_page * buffer_size overflows",
            ));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(TransportError::InvalidPoolConfig(
                "sweep_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Aggregate configuration, as loaded by the `tidal` binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connection: ConnectionOptions,
    pub listener: ListenerOptions,
    pub pool: PoolConfig,
}

impl TransportConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: TransportConfig =
            serde_json::from_str(text).context("invalid transport configuration")?;
        config.pool.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        debug!(?path, "Loading transport configuration");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("failed to load {}", path.display()))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
