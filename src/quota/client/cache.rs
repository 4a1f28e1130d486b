use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::quota::client::{ClientDirectoryParticipant, InitOptions};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::layout::StorageLayout;
use crate::quota::lock::Checkpoint;
use crate::quota::types::ClientType;

pub const MARKER_FILE: &str = "caches.json";
pub const MORGUE_DIR: &str = "morgue";

/// Contents of the marker database: the named caches of the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub caches: BTreeSet<String>,
}

/// Cache API participant: a marker database plus a `morgue/` directory of response bodies.
#[derive(Debug, Default)]
pub struct CacheClient;

impl CacheClient {
    pub fn new() -> Self {
        Self
    }

    pub fn read_index(dir: &Path) -> QuotaResult<Option<CacheIndex>> {
        let path = dir.join(MARKER_FILE);
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| QuotaError::Corrupt {
                client: ClientType::Cache,
                path,
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QuotaError::io(&path, e)),
        }
    }

    pub fn write_index(dir: &Path, index: &CacheIndex) -> QuotaResult<()> {
        let path = dir.join(MARKER_FILE);
        let raw = serde_json::to_vec(index)
            .map_err(|e| QuotaError::Internal(format!("cannot serialize cache index: {e}")))?;
        fs::write(&path, raw).map_err(|e| QuotaError::io(&path, e))
    }
}

impl ClientDirectoryParticipant for CacheClient {
    fn client_type(&self) -> ClientType {
        ClientType::Cache
    }

    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()> {
        let morgue = dir.join(MORGUE_DIR);
        fs::create_dir_all(&morgue).map_err(|e| QuotaError::io(&morgue, e))?;
        checkpoint.check()?;

        match Self::read_index(dir) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Self::write_index(dir, &CacheIndex::default()),
            Err(e) if options.validate => Err(e),
            Err(e) => {
                warn!("ignoring unreadable cache index: {e}");
                Self::write_index(dir, &CacheIndex::default())
            }
        }
    }

    fn delete_on_disk(&self, dir: &Path, layout: &StorageLayout) -> QuotaResult<bool> {
        // Bodies before the index.
        let morgue = dir.join(MORGUE_DIR);
        if morgue.exists() {
            layout.remove_dir(&morgue)?;
        }
        layout.remove_dir(dir)
    }
}
