//! Quota manager configuration.
//!
//! `QuotaConfig` controls where storage lives, which storage clients are
//! registered with the manager, and how corruption and test pauses are handled.
//! It provides defaults via [`Default`] and a fluent, validating
//! [`QuotaConfig::builder()`].
//!
//! # Examples
//!
//! ```rust
//! use gosub_quota::quota::{ClientType, QuotaConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = QuotaConfig::builder()
//!     .storage_root("/var/lib/gosub/storage")
//!     .enabled_clients([ClientType::IndexedDb, ClientType::SimpleDb])
//!     .channel_capacity(64)
//!     .build()?;
//! assert!(!cfg.is_enabled(ClientType::Cache));
//! # Ok(()) }
//! ```
//!
//! # Fields (summary)
//! - `storage_root`: absolute directory holding all persistence type directories.
//! - `enabled_clients`: client types known to the manager (at least one).
//! - `self_heal_clients`: client types whose corrupt directories are recreated from empty
//!   instead of failing the open.
//! - `channel_capacity`: capacity of the command channel (default: 128).
//! - `opener_pause`: artificial delay inside every directory opener, used to make
//!   open/clear races deterministic in tests.
//! - `metadata`: backend for the persisted storage metadata.
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::types::ClientType;
use crate::quota::DEFAULT_CHANNEL_CAPACITY;

/// Where persisted storage metadata is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackend {
    /// Nothing survives a restart of the manager.
    InMemory,
    /// `storage.sqlite` in the storage root.
    #[cfg(feature = "sqlite_metadata")]
    Sqlite,
}

impl Default for MetadataBackend {
    #[cfg(feature = "sqlite_metadata")]
    fn default() -> Self {
        MetadataBackend::Sqlite
    }

    #[cfg(not(feature = "sqlite_metadata"))]
    fn default() -> Self {
        MetadataBackend::InMemory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub storage_root: PathBuf,
    pub enabled_clients: BTreeSet<ClientType>,
    pub self_heal_clients: BTreeSet<ClientType>,
    pub channel_capacity: usize,
    #[serde(with = "millis")]
    pub opener_pause: Option<Duration>,
    pub metadata: MetadataBackend,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            storage_root: std::env::temp_dir().join("gosub-storage"),
            enabled_clients: ClientType::ALL.into_iter().collect(),
            self_heal_clients: [ClientType::IndexedDb, ClientType::LocalStorage, ClientType::SimpleDb]
                .into_iter()
                .collect(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            opener_pause: None,
            metadata: MetadataBackend::default(),
        }
    }
}

impl QuotaConfig {
    pub fn builder() -> QuotaConfigBuilder {
        QuotaConfigBuilder::default()
    }

    pub fn is_enabled(&self, client: ClientType) -> bool {
        self.enabled_clients.contains(&client)
    }

    pub fn self_heals(&self, client: ClientType) -> bool {
        self.self_heal_clients.contains(&client)
    }

    /// Loads a JSON configuration file; missing fields take their default value.
    pub fn from_json_file(path: &Path) -> QuotaResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| QuotaError::io(path, e))?;
        let config: QuotaConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        validate(&config)?;
        Ok(config)
    }
}

/// Fluent builder for [`QuotaConfig`].
#[derive(Debug, Clone, Default)]
pub struct QuotaConfigBuilder {
    inner: QuotaConfig,
}

impl QuotaConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut QuotaConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn storage_root(self, root: impl Into<PathBuf>) -> Self { self.map(|c| c.storage_root = root.into()) }
    pub fn enabled_clients(self, clients: impl IntoIterator<Item = ClientType>) -> Self {
        self.map(|c| c.enabled_clients = clients.into_iter().collect())
    }
    pub fn self_heal_clients(self, clients: impl IntoIterator<Item = ClientType>) -> Self {
        self.map(|c| c.self_heal_clients = clients.into_iter().collect())
    }
    pub fn channel_capacity(self, n: usize) -> Self { self.map(|c| c.channel_capacity = n) }
    pub fn opener_pause(self, pause: Duration) -> Self { self.map(|c| c.opener_pause = Some(pause)) }
    pub fn metadata(self, backend: MetadataBackend) -> Self { self.map(|c| c.metadata = backend) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut QuotaConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<QuotaConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoClients,
    ZeroChannelCapacity,
    RelativeStorageRoot(PathBuf),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoClients => write!(f, "at least one client type must be enabled"),
            ConfigError::ZeroChannelCapacity => write!(f, "channel_capacity must be at least 1"),
            ConfigError::RelativeStorageRoot(p) =>
                write!(f, "storage_root {} must be an absolute path", p.display()),
            ConfigError::Parse(msg) => write!(f, "cannot parse configuration: {msg}"),
        }
    }
}
impl std::error::Error for ConfigError {}

pub(crate) fn validate(c: &QuotaConfig) -> Result<(), ConfigError> {
    if c.enabled_clients.is_empty() {
        return Err(ConfigError::NoClients);
    }
    if c.channel_capacity == 0 {
        return Err(ConfigError::ZeroChannelCapacity);
    }
    if !c.storage_root.is_absolute() {
        return Err(ConfigError::RelativeStorageRoot(c.storage_root.clone()));
    }
    Ok(())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
