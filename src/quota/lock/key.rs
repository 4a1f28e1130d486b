use std::fmt::Display;

use crate::quota::principal::{OriginAttributesPattern, OriginMetadata, Principal};
use crate::quota::types::{ClientType, PersistenceType};

/// Set of origins a lock (or a clear) applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginScope {
    Origin(OriginMetadata),
    BaseDomain(String),
    Pattern(OriginAttributesPattern),
    All,
}

impl OriginScope {
    pub fn matches(&self, origin: &OriginMetadata) -> bool {
        match self {
            OriginScope::Origin(m) => m.origin == origin.origin,
            OriginScope::BaseDomain(domain) => origin.belongs_to_site(domain),
            OriginScope::Pattern(pattern) => pattern.matches(origin),
            OriginScope::All => true,
        }
    }

    /// Two scopes overlap if some origin may belong to both. Scopes without a
    /// concrete origin on either side are assumed to overlap.
    pub fn overlaps(&self, other: &OriginScope) -> bool {
        match (self, other) {
            (OriginScope::Origin(m), scope) | (scope, OriginScope::Origin(m)) => scope.matches(m),
            (OriginScope::BaseDomain(a), OriginScope::BaseDomain(b)) => a == b,
            _ => true,
        }
    }
}

/// What a directory lock covers. `None` for persistence or client means "all of them".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryLockKey {
    pub persistence: Option<PersistenceType>,
    pub origin: OriginScope,
    pub client: Option<ClientType>,
}

impl DirectoryLockKey {
    /// Key of a single client directory.
    pub fn client(principal: &Principal, persistence: PersistenceType, client: ClientType) -> Self {
        Self {
            persistence: Some(persistence),
            origin: OriginScope::Origin(principal.metadata()),
            client: Some(client),
        }
    }

    /// Key covering every client of an origin in every persistence type.
    pub fn origin(principal: &Principal) -> Self {
        Self {
            persistence: None,
            origin: OriginScope::Origin(principal.metadata()),
            client: None,
        }
    }

    pub fn everything() -> Self {
        Self {
            persistence: None,
            origin: OriginScope::All,
            client: None,
        }
    }

    pub fn overlaps(&self, other: &DirectoryLockKey) -> bool {
        let persistence = match (self.persistence, other.persistence) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let client = match (self.client, other.client) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        persistence && client && self.origin.overlaps(&other.origin)
    }

    /// True if the directory identified by the arguments falls under this key.
    pub fn covers(&self, persistence: PersistenceType, origin: &OriginMetadata, client: Option<ClientType>) -> bool {
        self.persistence.map_or(true, |p| p == persistence)
            && self.origin.matches(origin)
            && match (self.client, client) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// The single origin this key is about, if any.
    pub fn origin_metadata(&self) -> Option<&OriginMetadata> {
        match &self.origin {
            OriginScope::Origin(m) => Some(m),
            _ => None,
        }
    }
}

impl Display for DirectoryLockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let persistence = self.persistence.map_or("*", |p| p.as_str());
        let client = self.client.map_or("*", |c| c.as_str());
        match &self.origin {
            OriginScope::Origin(m) => write!(f, "{persistence}/{}/{client}", m.origin),
            OriginScope::BaseDomain(d) => write!(f, "{persistence}/site:{d}/{client}"),
            OriginScope::Pattern(p) => write!(f, "{persistence}/pattern:{p:?}/{client}"),
            OriginScope::All => write!(f, "{persistence}/*/{client}"),
        }
    }
}
