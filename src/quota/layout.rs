//! On-disk storage layout.
//!
//! ```text
//! <root>/
//!   storage.sqlite                  persisted storage metadata (sqlite backend)
//!   to-be-removed/                  directories renamed away before deletion
//!   permanent|default|temporary/
//!     <escaped origin>/
//!       .metadata                   JSON: origin string and persistence type
//!       idb/ cache/ ls/ sdb/        one directory per storage client
//! ```
//!
//! Origin directory names are the origin string with every byte outside
//! `[A-Za-z0-9._-]` written as `%XX`, which makes the mapping reversible. The
//! `.metadata` file is authoritative; the name is only used to restore a
//! missing or unreadable metadata file.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::principal::{OriginMetadata, Principal};
use crate::quota::types::{ClientType, PersistenceType};

pub const METADATA_FILE: &str = ".metadata";
pub const TO_BE_REMOVED_DIR: &str = "to-be-removed";

#[derive(Debug, Serialize, Deserialize)]
struct OriginDirMetadata {
    origin: String,
    persistence: PersistenceType,
    created_at: u64,
}

/// An origin directory found while scanning the storage root.
#[derive(Debug, Clone)]
pub struct OriginDirectory {
    pub persistence: PersistenceType,
    pub metadata: OriginMetadata,
    pub path: PathBuf,
    pub clients: Vec<ClientType>,
}

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn persistence_dir(&self, persistence: PersistenceType) -> PathBuf {
        self.root.join(persistence.directory_name())
    }

    pub fn origin_dir(&self, persistence: PersistenceType, origin: &str) -> PathBuf {
        self.persistence_dir(persistence).join(escape_origin(origin))
    }

    pub fn client_dir(&self, persistence: PersistenceType, origin: &str, client: ClientType) -> PathBuf {
        self.origin_dir(persistence, origin).join(client.as_str())
    }

    /// Creates the root and the persistence type directories.
    pub fn ensure_root(&self) -> QuotaResult<()> {
        for persistence in PersistenceType::ALL {
            let dir = self.persistence_dir(persistence);
            fs::create_dir_all(&dir).map_err(|e| QuotaError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Creates the origin directory and its metadata file if missing.
    /// Returns true if the directory was created by this call.
    pub fn ensure_origin_dir(&self, persistence: PersistenceType, origin: &OriginMetadata) -> QuotaResult<bool> {
        let dir = self.origin_dir(persistence, &origin.origin);
        let created = !dir.exists();
        fs::create_dir_all(&dir).map_err(|e| QuotaError::io(&dir, e))?;
        if created || !dir.join(METADATA_FILE).is_file() {
            write_origin_metadata(&dir, persistence, &origin.origin)?;
        }
        Ok(created)
    }

    /// Enumerates every origin directory below the persistence type directories.
    ///
    /// Entries that cannot be mapped back to an origin are skipped with a warning.
    pub fn scan(&self) -> QuotaResult<Vec<OriginDirectory>> {
        let mut found = Vec::new();

        for persistence in PersistenceType::ALL {
            let dir = self.persistence_dir(persistence);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(QuotaError::io(&dir, e)),
            };

            for entry in entries {
                let entry = entry.map_err(|e| QuotaError::io(&dir, e))?;
                let path = entry.path();
                if !path.is_dir() {
                    warn!("unexpected file in storage directory: {}", path.display());
                    continue;
                }
                let Some(metadata) = read_origin_metadata(&path, persistence) else {
                    warn!("cannot determine origin of {}, skipping", path.display());
                    continue;
                };
                let clients = list_clients(&path)?;
                found.push(OriginDirectory {
                    persistence,
                    metadata,
                    path,
                    clients,
                });
            }
        }

        Ok(found)
    }

    /// Removes a directory by renaming it into `to-be-removed` first, so it
    /// disappears from its origin at once, then deleting it.
    ///
    /// Removing a missing directory succeeds and returns false.
    pub fn remove_dir(&self, path: &Path) -> QuotaResult<bool> {
        if !path.exists() {
            return Ok(false);
        }

        let trash = self.root.join(TO_BE_REMOVED_DIR);
        fs::create_dir_all(&trash).map_err(|e| QuotaError::io(&trash, e))?;
        let target = trash.join(Uuid::new_v4().to_string());

        match fs::rename(path, &target) {
            Ok(()) => match fs::remove_dir_all(&target) {
                // A concurrent purge of `to-be-removed` already took it.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                result => result.map_err(|e| QuotaError::io(&target, e))?,
            },
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                debug!("rename of {} failed ({e}), deleting in place", path.display());
                fs::remove_dir_all(path).map_err(|e| QuotaError::io(path, e))?;
            }
        }
        Ok(true)
    }

    /// Deletes leftovers of removals interrupted by a crash.
    pub fn purge_to_be_removed(&self) {
        let trash = self.root.join(TO_BE_REMOVED_DIR);
        if trash.exists() {
            if let Err(e) = fs::remove_dir_all(&trash) {
                warn!("cannot purge {}: {e}", trash.display());
            }
        }
    }

    /// Removes an origin directory once it no longer holds any client directory.
    pub fn remove_origin_dir_if_empty(&self, persistence: PersistenceType, origin: &str) -> QuotaResult<()> {
        let dir = self.origin_dir(persistence, origin);
        if !dir.exists() {
            return Ok(());
        }
        if list_clients(&dir)?.is_empty() {
            self.remove_dir(&dir)?;
        }
        Ok(())
    }
}

fn write_origin_metadata(dir: &Path, persistence: PersistenceType, origin: &str) -> QuotaResult<()> {
    let path = dir.join(METADATA_FILE);
    let metadata = OriginDirMetadata {
        origin: origin.to_string(),
        persistence,
        created_at: now_secs(),
    };
    let contents = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| QuotaError::Internal(format!("cannot serialize origin metadata: {e}")))?;
    fs::write(&path, contents).map_err(|e| QuotaError::io(&path, e))
}

fn read_origin_metadata(dir: &Path, persistence: PersistenceType) -> Option<OriginMetadata> {
    let from_file = fs::read(dir.join(METADATA_FILE))
        .ok()
        .and_then(|raw| serde_json::from_slice::<OriginDirMetadata>(&raw).ok())
        .and_then(|m| Principal::from_origin_string(&m.origin).ok());
    if let Some(principal) = from_file {
        return Some(principal.metadata());
    }

    // Restore the metadata file from the directory name.
    let name = dir.file_name()?.to_str()?;
    let origin = unescape_origin(name)?;
    let principal = Principal::from_origin_string(&origin).ok()?;
    if let Err(e) = write_origin_metadata(dir, persistence, &origin) {
        warn!("cannot restore metadata of {}: {e}", dir.display());
    }
    Some(principal.metadata())
}

fn list_clients(origin_dir: &Path) -> QuotaResult<Vec<ClientType>> {
    let entries = fs::read_dir(origin_dir).map_err(|e| QuotaError::io(origin_dir, e))?;
    let mut clients = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| QuotaError::io(origin_dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == METADATA_FILE {
            continue;
        }
        match name.parse::<ClientType>() {
            Ok(client) if entry.path().is_dir() => clients.push(client),
            _ => warn!("unknown entry {name} in {}", origin_dir.display()),
        }
    }
    clients.sort();
    Ok(clients)
}

/// Total size in bytes of all files below `path`; a missing path has size 0.
pub fn directory_size(path: &Path) -> QuotaResult<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(QuotaError::io(path, e)),
    };
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0;
    for entry in fs::read_dir(path).map_err(|e| QuotaError::io(path, e))? {
        let entry = entry.map_err(|e| QuotaError::io(path, e))?;
        total += directory_size(&entry.path())?;
    }
    Ok(total)
}

pub fn escape_origin(origin: &str) -> String {
    let mut out = String::with_capacity(origin.len());
    for b in origin.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn unescape_origin(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(s: &str) -> OriginMetadata {
        Principal::from_origin_string(s).unwrap().metadata()
    }

    #[test]
    fn escaping_is_reversible_and_filesystem_safe() {
        let origin = "https://a.example:8443^partitionKey=https://top.test&userContextId=2";
        let escaped = escape_origin(origin);
        assert!(!escaped.contains('/') && !escaped.contains(':') && !escaped.contains('^'));
        assert_eq!(unescape_origin(&escaped).as_deref(), Some(origin));
        assert_eq!(escape_origin("https://a.test"), "https%3A%2F%2Fa.test");
        assert_eq!(unescape_origin("bad%2"), None);
    }

    #[test]
    fn scan_finds_origins_and_clients() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_root().unwrap();

        let a = principal("https://a.test");
        assert!(layout.ensure_origin_dir(PersistenceType::Default, &a).unwrap());
        assert!(!layout.ensure_origin_dir(PersistenceType::Default, &a).unwrap());
        fs::create_dir_all(layout.client_dir(PersistenceType::Default, &a.origin, ClientType::SimpleDb)).unwrap();
        fs::create_dir_all(layout.client_dir(PersistenceType::Default, &a.origin, ClientType::IndexedDb)).unwrap();

        let found = layout.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.origin, "https://a.test");
        assert_eq!(found[0].persistence, PersistenceType::Default);
        assert_eq!(found[0].clients, vec![ClientType::IndexedDb, ClientType::SimpleDb]);
    }

    #[test]
    fn scan_restores_missing_metadata_from_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let origin_dir = layout.origin_dir(PersistenceType::Temporary, "https://b.test^userContextId=4");
        fs::create_dir_all(&origin_dir).unwrap();

        let found = layout.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.attributes.user_context_id, 4);
        assert!(origin_dir.join(METADATA_FILE).is_file());
    }

    #[test]
    fn remove_dir_is_idempotent_and_leaves_no_trash() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let target = layout.client_dir(PersistenceType::Default, "https://a.test", ClientType::SimpleDb);
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("data.sdb"), b"hello").unwrap();

        assert!(layout.remove_dir(&target).unwrap());
        assert!(!target.exists());
        assert!(!layout.remove_dir(&target).unwrap());

        let trash: Vec<_> = fs::read_dir(dir.path().join(TO_BE_REMOVED_DIR)).unwrap().collect();
        assert!(trash.is_empty());
    }

    #[test]
    fn directory_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("a/b/two"), [0u8; 32]).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 42);
        assert_eq!(directory_size(&dir.path().join("missing")).unwrap(), 0);
    }
}
