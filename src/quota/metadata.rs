//! Persisted storage metadata.
//!
//! The metadata store remembers whether storage was initialized, the storage
//! format version in use (the "current" storage record) and one row per
//! `(persistence type, origin)` with its persisted flag and last access time.
//!
//! Two backends are provided:
//! - [`InMemoryMetadataStore`]: nothing survives the process, used by tests and
//!   private browsing setups.
//! - [`SqliteMetadataStore`]: `storage.sqlite` in the storage root, accessed
//!   through an `r2d2` pool.
//!
//! Both implement [`MetadataStore`]. Storage initialization calls
//! [`ensure_storage_record`], which also repairs a store claiming storage was
//! initialized while holding no storage record.
use anyhow::Result;
use log::{info, warn};

use crate::quota::layout::now_secs;
use crate::quota::types::PersistenceType;

/// In-memory metadata store implementation.
pub mod in_memory;
/// SQLite-backed metadata store implementation.
#[cfg(feature = "sqlite_metadata")]
pub mod sqlite;

pub use in_memory::InMemoryMetadataStore;
#[cfg(feature = "sqlite_metadata")]
pub use sqlite::SqliteMetadataStore;

/// Persistence type whose origin row carries the persisted flag of an origin.
pub const PERSISTED_FLAG_PERSISTENCE: PersistenceType = PersistenceType::Default;

/// Version of the on-disk layout written by this crate.
pub const STORAGE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRecord {
    pub version: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRecord {
    pub persistence: PersistenceType,
    pub origin: String,
    pub persisted: bool,
    pub last_access: u64,
}

/// How [`ensure_storage_record`] found the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRecordState {
    /// No previous storage; a fresh record was written.
    Created,
    /// A consistent record was already present.
    Existing,
    /// The store claimed initialized storage but had no record; flags were reset and
    /// a fresh record was written.
    Recovered,
}

pub trait MetadataStore: Send + Sync {
    /// Returns the storage flag that says storage has been set up before.
    fn initialized_flag(&self) -> Result<bool>;

    fn set_initialized_flag(&self, initialized: bool) -> Result<()>;

    /// Returns the current storage record, if any.
    fn storage_record(&self) -> Result<Option<StorageRecord>>;

    /// Replaces the current storage record.
    fn set_storage_record(&self, record: StorageRecord) -> Result<()>;

    fn origins(&self) -> Result<Vec<OriginRecord>>;

    fn origin(&self, persistence: PersistenceType, origin: &str) -> Result<Option<OriginRecord>>;

    /// Inserts or replaces the record of `(record.persistence, record.origin)`.
    fn upsert_origin(&self, record: &OriginRecord) -> Result<()>;

    /// Removes the record; removing a missing record is not an error.
    fn remove_origin(&self, persistence: PersistenceType, origin: &str) -> Result<()>;
}

/// Makes sure the store holds a current storage record.
pub fn ensure_storage_record(store: &dyn MetadataStore) -> Result<StorageRecordState> {
    let flag = store.initialized_flag()?;
    let record = store.storage_record()?;

    let state = match (flag, record) {
        (true, Some(record)) => {
            if record.version != STORAGE_VERSION {
                info!("upgrading storage record from version {} to {STORAGE_VERSION}", record.version);
                store.set_storage_record(StorageRecord { version: STORAGE_VERSION, ..record })?;
            }
            return Ok(StorageRecordState::Existing);
        }
        (false, Some(_)) => {
            warn!("storage record present but initialized flag missing, restoring flag");
            store.set_initialized_flag(true)?;
            return Ok(StorageRecordState::Existing);
        }
        (true, None) => {
            warn!("metadata claims initialized storage but has no storage record, resetting");
            store.set_initialized_flag(false)?;
            StorageRecordState::Recovered
        }
        (false, None) => StorageRecordState::Created,
    };

    store.set_storage_record(StorageRecord {
        version: STORAGE_VERSION,
        created_at: now_secs(),
    })?;
    store.set_initialized_flag(true)?;
    Ok(state)
}
