use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::quota::errors::QuotaError;

/// Durability / eviction class of a piece of storage. Each one has its own root directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceType {
    Persistent,
    Default,
    Temporary,
}

impl PersistenceType {
    pub const ALL: [PersistenceType; 3] = [
        PersistenceType::Persistent,
        PersistenceType::Default,
        PersistenceType::Temporary,
    ];

    /// Name of the directory below the storage root holding this persistence type.
    pub fn directory_name(&self) -> &'static str {
        match self {
            PersistenceType::Persistent => "permanent",
            PersistenceType::Default => "default",
            PersistenceType::Temporary => "temporary",
        }
    }

    pub fn from_directory_name(name: &str) -> Option<Self> {
        PersistenceType::ALL.into_iter().find(|p| p.directory_name() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceType::Persistent => "persistent",
            PersistenceType::Default => "default",
            PersistenceType::Temporary => "temporary",
        }
    }
}

impl Display for PersistenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PersistenceType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PersistenceType::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| QuotaError::InvalidPrincipal(format!("unknown persistence type: {s}")))
    }
}

/// Storage client owning a sub-tree of an origin directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClientType {
    #[serde(rename = "idb")]
    IndexedDb,
    #[serde(rename = "cache")]
    Cache,
    #[serde(rename = "ls")]
    LocalStorage,
    #[serde(rename = "sdb")]
    SimpleDb,
}

impl ClientType {
    pub const ALL: [ClientType; 4] = [
        ClientType::IndexedDb,
        ClientType::Cache,
        ClientType::LocalStorage,
        ClientType::SimpleDb,
    ];

    /// Short name, also used as the client's directory name inside an origin directory.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::IndexedDb => "idb",
            ClientType::Cache => "cache",
            ClientType::LocalStorage => "ls",
            ClientType::SimpleDb => "sdb",
        }
    }
}

impl Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClientType::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| QuotaError::UnknownClient(s.to_string()))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn conflicts_with(&self, other: LockMode) -> bool {
        matches!(self, LockMode::Exclusive) || matches!(other, LockMode::Exclusive)
    }
}
