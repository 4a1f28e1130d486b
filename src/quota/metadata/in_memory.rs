use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};

use crate::quota::metadata::{MetadataStore, OriginRecord, StorageRecord};
use crate::quota::types::PersistenceType;

#[derive(Default)]
struct Inner {
    initialized: bool,
    record: Option<StorageRecord>,
    origins: HashMap<(PersistenceType, String), OriginRecord>,
}

/// In-memory metadata (no persistence). Used when the manager runs without a storage database.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| anyhow!("metadata lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| anyhow!("metadata lock poisoned"))
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn initialized_flag(&self) -> Result<bool> {
        Ok(self.read()?.initialized)
    }

    fn set_initialized_flag(&self, initialized: bool) -> Result<()> {
        self.write()?.initialized = initialized;
        Ok(())
    }

    fn storage_record(&self) -> Result<Option<StorageRecord>> {
        Ok(self.read()?.record)
    }

    fn set_storage_record(&self, record: StorageRecord) -> Result<()> {
        self.write()?.record = Some(record);
        Ok(())
    }

    fn origins(&self) -> Result<Vec<OriginRecord>> {
        let mut v: Vec<OriginRecord> = self.read()?.origins.values().cloned().collect();
        v.sort_by(|a, b| (a.persistence, &a.origin).cmp(&(b.persistence, &b.origin)));
        Ok(v)
    }

    fn origin(&self, persistence: PersistenceType, origin: &str) -> Result<Option<OriginRecord>> {
        Ok(self.read()?.origins.get(&(persistence, origin.to_string())).cloned())
    }

    fn upsert_origin(&self, record: &OriginRecord) -> Result<()> {
        self.write()?
            .origins
            .insert((record.persistence, record.origin.clone()), record.clone());
        Ok(())
    }

    fn remove_origin(&self, persistence: PersistenceType, origin: &str) -> Result<()> {
        self.write()?.origins.remove(&(persistence, origin.to_string()));
        Ok(())
    }
}
