//! Quota manager.
//!
//! Arbitrates access to the on-disk storage directories of web origins. Storage
//! clients (IndexedDB, Cache, LocalStorage, SimpleDB) open their per-origin
//! directory through a [`QuotaHandle`]; administrative clears and resets take
//! exclusive directory locks, invalidate whatever overlaps and delete the data
//! once every holder let go.
//!
//! ```no_run
//! use gosub_quota::quota::{ClientType, PersistenceType, Principal, QuotaConfig, QuotaManager};
//! # async fn demo() -> gosub_quota::quota::QuotaResult<()> {
//! let config = QuotaConfig::builder().storage_root("/var/lib/gosub/storage").build()?;
//! let (quota, _join) = QuotaManager::new(config)?.start();
//!
//! let principal = Principal::from_url("https://example.com")?;
//! let dir = quota
//!     .open_for_principal(&principal, ClientType::SimpleDb, PersistenceType::Default)
//!     .await?;
//! println!("storing in {}", dir.path().display());
//! drop(dir);
//!
//! quota.clear_storages_for_principal(&principal, None, None).await?;
//! # Ok(()) }
//! ```

/// Default capacity of the command and event channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

pub mod clear;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod handle;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod opener;
pub mod origin;
pub mod principal;
pub mod types;

#[cfg(test)]
mod scenarios;

pub use clear::{ClearId, ClearScope, ClearState, ClearSummary};
pub use client::{ClientDirectoryParticipant, ClientRegistry, InitOptions};
pub use config::{ConfigError, MetadataBackend, QuotaConfig, QuotaConfigBuilder};
pub use errors::{QuotaError, QuotaResult};
pub use events::QuotaEvent;
pub use handle::{ClientDirectory, QuotaHandle, QuotaRequest};
pub use layout::StorageLayout;
pub use lock::{Checkpoint, DirectoryLock, DirectoryLockKey, LockId, OriginScope};
pub use manager::QuotaManager;
pub use metadata::{InMemoryMetadataStore, MetadataStore, OriginRecord, StorageRecord};
pub use origin::{ClientUsage, OriginUsage};
pub use principal::{OriginAttributes, OriginAttributesPattern, OriginMetadata, PartitionKey, Principal};
pub use types::{ClientType, LockMode, PersistenceType};
