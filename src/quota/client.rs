//! Storage client participants.
//!
//! Every storage API that keeps data below an origin directory (IndexedDB,
//! Cache, LocalStorage, SimpleDB) plugs into the quota manager through
//! [`ClientDirectoryParticipant`]. The manager never looks inside a client
//! directory itself; it asks the participant to initialize, measure, abort or
//! delete it.
//!
//! All participant methods are synchronous. Methods touching the disk are
//! called from blocking worker tasks; [`directory_closed`] and [`reset`] come
//! from the manager task and must only drop in-memory state.
//!
//! [`directory_closed`]: ClientDirectoryParticipant::directory_closed
//! [`reset`]: ClientDirectoryParticipant::reset
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::quota::config::QuotaConfig;
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::layout::{directory_size, StorageLayout};
use crate::quota::lock::Checkpoint;
use crate::quota::types::ClientType;

/// Cache API storage.
pub mod cache;
/// IndexedDB storage.
pub mod indexed_db;
/// LocalStorage storage.
pub mod local_storage;
/// SimpleDB storage.
pub mod simple_db;

pub use cache::CacheClient;
pub use indexed_db::IndexedDbClient;
pub use local_storage::LocalStorageClient;
pub use simple_db::{SimpleDb, SimpleDbClient};

/// What an initialization run is asked to do with a client directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    /// The directory was created by this run (it held no data before).
    pub fresh: bool,
    /// Check existing content and report [`QuotaError::Corrupt`] when it is unusable.
    pub validate: bool,
    /// Bring older on-disk formats up to date.
    pub upgrade: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            fresh: false,
            validate: true,
            upgrade: true,
        }
    }
}

/// Contract between the quota manager and a storage client.
pub trait ClientDirectoryParticipant: Send + Sync {
    fn client_type(&self) -> ClientType;

    /// Prepares `dir` (which exists) for use. Implementations call
    /// `checkpoint.check()` between steps so a clear can interrupt them.
    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()>;

    /// Discards any in-memory state left behind by an interrupted [`initialize`](Self::initialize).
    fn abort_initialization(&self, _dir: &Path) {}

    /// The last open handle to `dir` was closed. Returns true if state built by
    /// [`initialize`](Self::initialize) was dropped, so the next open has to run it again.
    fn directory_closed(&self, _dir: &Path) -> bool {
        false
    }

    /// Drops all in-memory state; the manager was reset or is shutting down.
    fn reset(&self) {}

    /// Deletes the client directory. Returns false if there was nothing to delete.
    fn delete_on_disk(&self, dir: &Path, layout: &StorageLayout) -> QuotaResult<bool> {
        layout.remove_dir(dir)
    }

    /// Bytes used by the client directory.
    fn usage(&self, dir: &Path) -> QuotaResult<u64> {
        directory_size(dir)
    }
}

/// The participants of the enabled client types.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: BTreeMap<ClientType, Arc<dyn ClientDirectoryParticipant>>,
}

impl ClientRegistry {
    pub fn empty() -> Self {
        Self { clients: BTreeMap::new() }
    }

    /// Registers the built-in participant of every enabled client type.
    pub fn from_config(config: &QuotaConfig) -> Self {
        let mut registry = Self::empty();
        for client in config.enabled_clients.iter().copied() {
            let participant: Arc<dyn ClientDirectoryParticipant> = match client {
                ClientType::IndexedDb => Arc::new(IndexedDbClient::new()),
                ClientType::Cache => Arc::new(CacheClient::new()),
                ClientType::LocalStorage => Arc::new(LocalStorageClient::new()),
                ClientType::SimpleDb => Arc::new(SimpleDbClient::new()),
            };
            registry.register(participant);
        }
        registry
    }

    /// Adds or replaces the participant for its client type.
    pub fn register(&mut self, participant: Arc<dyn ClientDirectoryParticipant>) {
        self.clients.insert(participant.client_type(), participant);
    }

    pub fn get(&self, client: ClientType) -> QuotaResult<Arc<dyn ClientDirectoryParticipant>> {
        self.clients
            .get(&client)
            .cloned()
            .ok_or(QuotaError::ClientDisabled(client))
    }

    pub fn contains(&self, client: ClientType) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn client_types(&self) -> impl Iterator<Item = ClientType> + '_ {
        self.clients.keys().copied()
    }

    /// Usage of a client directory, measured by its participant if registered.
    pub fn usage(&self, client: ClientType, dir: &Path) -> QuotaResult<u64> {
        match self.clients.get(&client) {
            Some(p) => p.usage(dir),
            None => directory_size(dir),
        }
    }

    /// Tells the participant that the last handle to `dir` closed.
    pub fn directory_closed(&self, client: ClientType, dir: &Path) -> bool {
        self.clients.get(&client).is_some_and(|p| p.directory_closed(dir))
    }

    pub fn reset(&self) {
        for participant in self.clients.values() {
            participant.reset();
        }
    }

    /// Deletes a client directory, through its participant if registered.
    pub fn delete(&self, client: ClientType, dir: &Path, layout: &StorageLayout) -> QuotaResult<bool> {
        match self.clients.get(&client) {
            Some(p) => p.delete_on_disk(dir, layout),
            None => layout.remove_dir(dir),
        }
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.clients.keys()).finish()
    }
}
