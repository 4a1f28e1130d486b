use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;

use crate::quota::client::{ClientDirectoryParticipant, InitOptions};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::lock::Checkpoint;
use crate::quota::types::ClientType;

pub const EXTENSION: &str = "sdb";

/// SimpleDB participant: one plain file per named database.
#[derive(Debug, Default)]
pub struct SimpleDbClient;

impl SimpleDbClient {
    pub fn new() -> Self {
        Self
    }
}

impl ClientDirectoryParticipant for SimpleDbClient {
    fn client_type(&self) -> ClientType {
        ClientType::SimpleDb
    }

    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()> {
        if options.fresh || !options.validate {
            return Ok(());
        }

        let entries = fs::read_dir(dir).map_err(|e| QuotaError::io(dir, e))?;
        for entry in entries {
            checkpoint.check()?;
            let entry = entry.map_err(|e| QuotaError::io(dir, e))?;
            let path = entry.path();
            let is_db = path.extension().is_some_and(|ext| ext == EXTENSION);
            if path.is_dir() {
                return Err(QuotaError::Corrupt {
                    client: ClientType::SimpleDb,
                    path,
                    reason: "unexpected directory".into(),
                });
            }
            if !is_db {
                warn!("ignoring stray file {} in SimpleDB directory", path.display());
            }
        }
        Ok(())
    }
}

/// A named SimpleDB database inside an opened client directory.
///
/// ```no_run
/// # use gosub_quota::quota::client::SimpleDb;
/// # fn demo(dir: &std::path::Path) -> gosub_quota::quota::QuotaResult<()> {
/// let db = SimpleDb::open(dir, "settings")?;
/// db.write(b"hello")?;
/// assert_eq!(db.read()?, b"hello");
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct SimpleDb {
    path: PathBuf,
}

impl SimpleDb {
    pub fn open(dir: &Path, name: &str) -> QuotaResult<Self> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'));
        if !valid {
            return Err(QuotaError::Internal(format!("invalid SimpleDB name: {name:?}")));
        }
        Ok(Self {
            path: dir.join(format!("{name}.{EXTENSION}")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contents of the database; an absent database reads as empty.
    pub fn read(&self) -> QuotaResult<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(QuotaError::io(&self.path, e)),
        }
    }

    pub fn write(&self, data: &[u8]) -> QuotaResult<()> {
        fs::write(&self.path, data).map_err(|e| QuotaError::io(&self.path, e))
    }

    pub fn remove(&self) -> QuotaResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QuotaError::io(&self.path, e)),
        }
    }
}
