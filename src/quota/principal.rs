//! Storage principals.
//!
//! A [`Principal`] is the security identity that scopes a unit of storage: the
//! tuple origin of a URL (`scheme://host:port`) plus [`OriginAttributes`] such as
//! the partition key. Principals serialize to a single origin string; the
//! attributes that differ from their defaults are appended after a `^`:
//!
//! ```text
//! https://example.com
//! https://example.com^partitionKey=https://top.test&userContextId=2
//! ```
//!
//! The registrable domain ("base domain") of a principal is used for bulk
//! clearing of a whole site.
use std::fmt::Display;

use url::{Host, Origin, Url};

use crate::quota::errors::{QuotaError, QuotaResult};

/// Partitioning key: the top-level site a third-party storage is keyed under.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum PartitionKey {
    #[default]
    None,
    TopLevel(Origin),
}

impl PartitionKey {
    pub fn from_url(s: &str) -> QuotaResult<Self> {
        if s.is_empty() {
            return Ok(PartitionKey::None);
        }
        let url = Url::parse(s).map_err(|e| QuotaError::InvalidPrincipal(format!("{s}: {e}")))?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(QuotaError::InvalidPrincipal(format!("opaque partition key: {s}")));
        }
        Ok(PartitionKey::TopLevel(origin))
    }

    fn serialize(&self) -> Option<String> {
        match self {
            PartitionKey::None => None,
            PartitionKey::TopLevel(o) => Some(o.ascii_serialization()),
        }
    }

    /// Base domain of the top-level site, if the key is set.
    pub fn base_domain(&self) -> Option<String> {
        match self {
            PartitionKey::None => None,
            PartitionKey::TopLevel(o) => origin_base_domain(o),
        }
    }
}

/// Attributes that further isolate storage of the same tuple origin.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct OriginAttributes {
    /// Container ("contextual identity") id, 0 for the default container.
    pub user_context_id: u32,
    /// Non-zero for private browsing storage.
    pub private_browsing_id: u32,
    pub partition_key: PartitionKey,
}

impl OriginAttributes {
    /// Serializes the non-default attributes in alphabetical order, without the leading `^`.
    pub fn suffix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(pk) = self.partition_key.serialize() {
            parts.push(format!("partitionKey={pk}"));
        }
        if self.private_browsing_id != 0 {
            parts.push(format!("privateBrowsingId={}", self.private_browsing_id));
        }
        if self.user_context_id != 0 {
            parts.push(format!("userContextId={}", self.user_context_id));
        }
        parts.join("&")
    }

    pub fn parse_suffix(suffix: &str) -> QuotaResult<Self> {
        let mut attrs = OriginAttributes::default();
        for pair in suffix.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| QuotaError::InvalidPrincipal(format!("bad attribute: {pair}")))?;
            let bad_number = |_| QuotaError::InvalidPrincipal(format!("bad {name} value: {value}"));
            match name {
                "userContextId" => attrs.user_context_id = value.parse().map_err(bad_number)?,
                "privateBrowsingId" => attrs.private_browsing_id = value.parse().map_err(bad_number)?,
                "partitionKey" => attrs.partition_key = PartitionKey::from_url(value)?,
                _ => return Err(QuotaError::InvalidPrincipal(format!("unknown attribute: {name}"))),
            }
        }
        Ok(attrs)
    }
}

/// Pattern over [`OriginAttributes`]; unset fields match anything.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct OriginAttributesPattern {
    pub user_context_id: Option<u32>,
    pub private_browsing_id: Option<u32>,
    /// Matches origins partitioned under this top-level base domain.
    pub partition_base_domain: Option<String>,
}

impl OriginAttributesPattern {
    pub fn matches(&self, metadata: &OriginMetadata) -> bool {
        let attrs = &metadata.attributes;
        if self.user_context_id.is_some_and(|id| id != attrs.user_context_id) {
            return false;
        }
        if self.private_browsing_id.is_some_and(|id| id != attrs.private_browsing_id) {
            return false;
        }
        match &self.partition_base_domain {
            Some(domain) => metadata.partition_base_domain.as_deref() == Some(domain.as_str()),
            None => true,
        }
    }
}

/// Identity of a storage origin. Immutable once constructed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Principal {
    origin: Origin,
    attributes: OriginAttributes,
}

impl Principal {
    /// Creates a principal for the tuple origin of `url` with default attributes.
    pub fn from_url(url: &str) -> QuotaResult<Self> {
        let parsed = Url::parse(url).map_err(|e| QuotaError::InvalidPrincipal(format!("{url}: {e}")))?;
        let origin = parsed.origin();
        if !origin.is_tuple() {
            return Err(QuotaError::InvalidPrincipal(format!("opaque origin: {url}")));
        }
        Ok(Self {
            origin,
            attributes: OriginAttributes::default(),
        })
    }

    /// Parses a serialized origin string (`https://a.test^userContextId=1`).
    pub fn from_origin_string(origin: &str) -> QuotaResult<Self> {
        let (base, suffix) = origin.split_once('^').unwrap_or((origin, ""));
        let principal = Principal::from_url(base)?;
        Ok(principal.with_attributes(OriginAttributes::parse_suffix(suffix)?))
    }

    pub fn with_attributes(mut self, attributes: OriginAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_partition_key(mut self, partition_key: PartitionKey) -> Self {
        self.attributes.partition_key = partition_key;
        self
    }

    pub fn with_user_context_id(mut self, id: u32) -> Self {
        self.attributes.user_context_id = id;
        self
    }

    pub fn attributes(&self) -> &OriginAttributes {
        &self.attributes
    }

    /// Full origin string, including the attribute suffix.
    pub fn origin(&self) -> String {
        let suffix = self.attributes.suffix();
        if suffix.is_empty() {
            self.origin.ascii_serialization()
        } else {
            format!("{}^{}", self.origin.ascii_serialization(), suffix)
        }
    }

    /// Registrable domain (eTLD+1) of the host.
    pub fn base_domain(&self) -> String {
        origin_base_domain(&self.origin).unwrap_or_else(|| self.origin.ascii_serialization())
    }

    pub fn metadata(&self) -> OriginMetadata {
        OriginMetadata {
            origin: self.origin(),
            base_domain: self.base_domain(),
            partition_base_domain: self.attributes.partition_key.base_domain(),
            attributes: self.attributes.clone(),
        }
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.origin())
    }
}

/// Precomputed, cheaply comparable description of a principal used by lock keys and the registry.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct OriginMetadata {
    pub origin: String,
    pub base_domain: String,
    pub partition_base_domain: Option<String>,
    pub attributes: OriginAttributes,
}

impl OriginMetadata {
    /// True if this origin belongs to `domain`, either directly or through its partition key.
    pub fn belongs_to_site(&self, domain: &str) -> bool {
        self.base_domain == domain || self.partition_base_domain.as_deref() == Some(domain)
    }
}

fn origin_base_domain(origin: &Origin) -> Option<String> {
    match origin {
        Origin::Opaque(_) => None,
        Origin::Tuple(_, Host::Domain(domain), _) => Some(base_domain_of(domain)),
        Origin::Tuple(_, host, _) => Some(host.to_string()),
    }
}

/// Registrable domain (eTLD+1) of `host` according to the Public Suffix List.
///
/// Hosts that are themselves a public suffix, or have no registrable part like
/// `localhost`, are their own base domain.
pub fn base_domain_of(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = psl::domain_str(&host).map(str::to_owned);
    domain.unwrap_or(host)
}
