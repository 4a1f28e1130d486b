use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::quota::client::{ClientDirectoryParticipant, InitOptions};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::layout::StorageLayout;
use crate::quota::lock::Checkpoint;
use crate::quota::types::ClientType;

pub const DATA_FILE: &str = "data.json";
/// Cached size of the data file, read without parsing the data.
pub const USAGE_FILE: &str = "usage";

type Items = BTreeMap<String, String>;

/// LocalStorage participant.
///
/// Initialization preloads the origin's items into memory, so the first
/// `getItem` after an open never touches the disk. The preloaded items live
/// while the directory is open and are dropped when its last handle closes,
/// when initialization is aborted, the directory is deleted or the manager is reset.
#[derive(Default)]
pub struct LocalStorageClient {
    preloaded: Mutex<HashMap<PathBuf, Items>>,
}

impl LocalStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items preloaded from `dir` by the last successful initialization.
    pub fn preloaded(&self, dir: &Path) -> Option<Items> {
        self.preloaded.lock().ok()?.get(dir).cloned()
    }

    /// Writes the items of an origin, refreshing the usage file and the preloaded copy.
    pub fn write_items(&self, dir: &Path, items: &Items) -> QuotaResult<()> {
        let path = dir.join(DATA_FILE);
        let raw = serde_json::to_vec(items)
            .map_err(|e| QuotaError::Internal(format!("cannot serialize items: {e}")))?;
        fs::write(&path, &raw).map_err(|e| QuotaError::io(&path, e))?;
        write_usage(dir, raw.len() as u64)?;

        let mut preloaded = self
            .preloaded
            .lock()
            .map_err(|_| QuotaError::Internal("LocalStorage preload cache poisoned".into()))?;
        if let Some(cached) = preloaded.get_mut(dir) {
            cached.clone_from(items);
        }
        Ok(())
    }

    fn read_items(dir: &Path) -> QuotaResult<Option<(Items, u64)>> {
        let path = dir.join(DATA_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QuotaError::io(&path, e)),
        };
        let items = serde_json::from_slice(&raw).map_err(|e| QuotaError::Corrupt {
            client: ClientType::LocalStorage,
            path,
            reason: e.to_string(),
        })?;
        Ok(Some((items, raw.len() as u64)))
    }

    fn forget(&self, dir: &Path) -> bool {
        match self.preloaded.lock() {
            Ok(mut preloaded) => preloaded.remove(dir).is_some(),
            Err(_) => false,
        }
    }
}

fn read_usage(dir: &Path) -> Option<u64> {
    fs::read_to_string(dir.join(USAGE_FILE)).ok()?.trim().parse().ok()
}

fn write_usage(dir: &Path, usage: u64) -> QuotaResult<()> {
    let path = dir.join(USAGE_FILE);
    fs::write(&path, usage.to_string()).map_err(|e| QuotaError::io(&path, e))
}

impl ClientDirectoryParticipant for LocalStorageClient {
    fn client_type(&self) -> ClientType {
        ClientType::LocalStorage
    }

    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()> {
        let (items, size) = match Self::read_items(dir) {
            Ok(Some(found)) => found,
            Ok(None) => (Items::new(), 0),
            Err(e) if options.validate => return Err(e),
            Err(e) => {
                warn!("dropping unreadable LocalStorage data: {e}");
                (Items::new(), 0)
            }
        };
        checkpoint.check()?;

        if read_usage(dir) != Some(size) {
            debug!("rewriting LocalStorage usage file in {}", dir.display());
            write_usage(dir, size)?;
        }
        checkpoint.check()?;

        self.preloaded
            .lock()
            .map_err(|_| QuotaError::Internal("LocalStorage preload cache poisoned".into()))?
            .insert(dir.to_path_buf(), items);
        Ok(())
    }

    fn abort_initialization(&self, dir: &Path) {
        self.forget(dir);
    }

    fn directory_closed(&self, dir: &Path) -> bool {
        self.forget(dir)
    }

    fn reset(&self) {
        if let Ok(mut preloaded) = self.preloaded.lock() {
            preloaded.clear();
        }
    }

    fn delete_on_disk(&self, dir: &Path, layout: &StorageLayout) -> QuotaResult<bool> {
        self.forget(dir);
        layout.remove_dir(dir)
    }

    fn usage(&self, dir: &Path) -> QuotaResult<u64> {
        if !dir.exists() {
            return Ok(0);
        }
        match read_usage(dir) {
            Some(usage) => Ok(usage),
            None => Ok(Self::read_items(dir)?.map_or(0, |(_, size)| size)),
        }
    }
}
