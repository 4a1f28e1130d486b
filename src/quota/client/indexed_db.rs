use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::quota::client::{ClientDirectoryParticipant, InitOptions};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::lock::Checkpoint;
use crate::quota::types::ClientType;

pub const SCHEMA_FILE: &str = "schema.json";
pub const FILES_DIR: &str = "files";

/// Current version of the IndexedDB directory schema.
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDbSchema {
    pub version: u32,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub next_file_id: u64,
}

impl IndexedDbSchema {
    fn current() -> Self {
        Self {
            version: SCHEMA_VERSION,
            databases: Vec::new(),
            next_file_id: 1,
        }
    }
}

/// IndexedDB participant. Keeps a `schema.json` describing the directory
/// format and a `files/` directory for blobs.
#[derive(Debug, Default)]
pub struct IndexedDbClient;

impl IndexedDbClient {
    pub fn new() -> Self {
        Self
    }

    pub fn read_schema(dir: &Path) -> QuotaResult<Option<IndexedDbSchema>> {
        let path = dir.join(SCHEMA_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QuotaError::io(&path, e)),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| QuotaError::Corrupt {
            client: ClientType::IndexedDb,
            path,
            reason: format!("unreadable schema: {e}"),
        })
    }

    pub fn write_schema(dir: &Path, schema: &IndexedDbSchema) -> QuotaResult<()> {
        let path = dir.join(SCHEMA_FILE);
        let raw = serde_json::to_vec_pretty(schema)
            .map_err(|e| QuotaError::Internal(format!("cannot serialize schema: {e}")))?;
        fs::write(&path, raw).map_err(|e| QuotaError::io(&path, e))
    }

    fn upgrade_step(schema: &mut IndexedDbSchema) {
        // 1 -> 2 only added the blob directory, which initialize always creates.
        if schema.version == 2 {
            schema.next_file_id = schema.next_file_id.max(1);
        }
        schema.version += 1;
    }
}

impl ClientDirectoryParticipant for IndexedDbClient {
    fn client_type(&self) -> ClientType {
        ClientType::IndexedDb
    }

    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()> {
        let files = dir.join(FILES_DIR);
        fs::create_dir_all(&files).map_err(|e| QuotaError::io(&files, e))?;
        checkpoint.check()?;

        let mut schema = match Self::read_schema(dir)? {
            Some(schema) => schema,
            None if options.fresh || !options.validate => {
                let schema = IndexedDbSchema::current();
                Self::write_schema(dir, &schema)?;
                return Ok(());
            }
            None => {
                return Err(QuotaError::Corrupt {
                    client: ClientType::IndexedDb,
                    path: dir.join(SCHEMA_FILE),
                    reason: "missing schema".into(),
                })
            }
        };

        if options.validate && (schema.version == 0 || schema.version > SCHEMA_VERSION) {
            return Err(QuotaError::Corrupt {
                client: ClientType::IndexedDb,
                path: dir.join(SCHEMA_FILE),
                reason: format!("unsupported schema version {}", schema.version),
            });
        }

        if options.upgrade && schema.version < SCHEMA_VERSION {
            info!("upgrading IndexedDB directory {} from version {}", dir.display(), schema.version);
            while schema.version < SCHEMA_VERSION {
                checkpoint.check()?;
                Self::upgrade_step(&mut schema);
                debug!("IndexedDB directory {} now at version {}", dir.display(), schema.version);
            }
            Self::write_schema(dir, &schema)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_directory_gets_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let client = IndexedDbClient::new();
        let options = InitOptions { fresh: true, ..Default::default() };

        client.initialize(dir.path(), options, &Checkpoint::never()).unwrap();

        let schema = IndexedDbClient::read_schema(dir.path()).unwrap().unwrap();
        assert_eq!(schema, IndexedDbSchema::current());
        assert!(dir.path().join(FILES_DIR).is_dir());
    }

    #[test]
    fn old_schema_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        IndexedDbClient::write_schema(
            dir.path(),
            &IndexedDbSchema { version: 1, databases: vec!["notes".into()], next_file_id: 0 },
        )
        .unwrap();

        IndexedDbClient::new()
            .initialize(dir.path(), InitOptions::default(), &Checkpoint::never())
            .unwrap();

        let schema = IndexedDbClient::read_schema(dir.path()).unwrap().unwrap();
        assert_eq!(schema.version, SCHEMA_VERSION);
        assert_eq!(schema.databases, vec!["notes".to_string()]);
        assert_eq!(schema.next_file_id, 1);
    }

    #[test]
    fn garbage_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SCHEMA_FILE), b"{not json").unwrap();

        let err = IndexedDbClient::new()
            .initialize(dir.path(), InitOptions::default(), &Checkpoint::never())
            .unwrap_err();
        assert!(matches!(err, QuotaError::Corrupt { client: ClientType::IndexedDb, .. }));
    }

    #[test]
    fn newer_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        IndexedDbClient::write_schema(
            dir.path(),
            &IndexedDbSchema { version: SCHEMA_VERSION + 1, databases: vec![], next_file_id: 1 },
        )
        .unwrap();

        let err = IndexedDbClient::new()
            .initialize(dir.path(), InitOptions::default(), &Checkpoint::never())
            .unwrap_err();
        assert!(matches!(err, QuotaError::Corrupt { .. }));
    }
}
