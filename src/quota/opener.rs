//! Interruptible client directory initialization.
//!
//! A [`ClientDirectoryOpener`] runs while its open holds a shared lock on the
//! client directory. It checks the lock at every I/O boundary and gives up with
//! [`QuotaError::Aborted`] as soon as a clear invalidates it, removing whatever
//! it created on the way.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::broadcast;

use crate::quota::client::{ClientDirectoryParticipant, InitOptions};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::events::QuotaEvent;
use crate::quota::layout::{now_secs, StorageLayout};
use crate::quota::lock::{Checkpoint, DirectoryLock};
use crate::quota::metadata::{MetadataStore, OriginRecord};
use crate::quota::principal::OriginMetadata;
use crate::quota::types::{ClientType, PersistenceType};

pub type OpenId = u64;

/// What an opener has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenWork {
    /// Create the directory if needed, then let the participant validate and upgrade it.
    Initialize { create_if_missing: bool, validate: bool, upgrade: bool },
    /// The directory was initialized by an earlier open; only the lock is checked.
    AlreadyInitialized,
}

impl OpenWork {
    pub fn full() -> Self {
        OpenWork::Initialize {
            create_if_missing: true,
            validate: true,
            upgrade: true,
        }
    }
}

/// Result of a successful opener run.
#[derive(Debug, Clone)]
pub struct Opened {
    pub path: PathBuf,
    /// Usage measured by a full initialization; `None` on the fast path.
    pub usage: Option<u64>,
}

/// Everything the blocking part of an opener needs.
#[derive(Clone)]
struct Target {
    origin: OriginMetadata,
    persistence: PersistenceType,
    client: ClientType,
    layout: StorageLayout,
    participant: Arc<dyn ClientDirectoryParticipant>,
    store: Arc<dyn MetadataStore>,
    self_heal: bool,
}

#[derive(Default)]
struct Progress {
    origin_created: bool,
    client_created: bool,
}

pub struct ClientDirectoryOpener {
    target: Target,
    pause: Option<Duration>,
    events: broadcast::Sender<QuotaEvent>,
}

impl ClientDirectoryOpener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        origin: OriginMetadata,
        persistence: PersistenceType,
        client: ClientType,
        layout: StorageLayout,
        participant: Arc<dyn ClientDirectoryParticipant>,
        store: Arc<dyn MetadataStore>,
        self_heal: bool,
        events: broadcast::Sender<QuotaEvent>,
    ) -> Self {
        Self {
            target: Target {
                origin,
                persistence,
                client,
                layout,
                participant,
                store,
                self_heal,
            },
            pause: None,
            events,
        }
    }

    /// Delays every full initialization by `pause`, still honoring invalidation.
    pub fn with_pause(mut self, pause: Option<Duration>) -> Self {
        self.pause = pause;
        self
    }

    /// Runs the opener. The lock is always handed back so the manager decides when it goes.
    pub async fn run(self, lock: DirectoryLock, work: OpenWork) -> (DirectoryLock, QuotaResult<Opened>) {
        let result = self.run_inner(&lock, work).await;
        if let Err(e) = &result {
            debug!(
                "opening {}/{}/{} failed: {e}",
                self.target.persistence, self.target.origin.origin, self.target.client
            );
        }
        (lock, result)
    }

    async fn run_inner(&self, lock: &DirectoryLock, work: OpenWork) -> QuotaResult<Opened> {
        let target = &self.target;
        let path = target.layout.client_dir(target.persistence, &target.origin.origin, target.client);

        let options = match work {
            OpenWork::AlreadyInitialized => {
                lock.checkpoint()?;
                return Ok(Opened { path, usage: None });
            }
            OpenWork::Initialize { create_if_missing, validate, upgrade } => {
                if !create_if_missing && !path.is_dir() {
                    return Err(QuotaError::io(&path, std::io::ErrorKind::NotFound.into()));
                }
                InitOptions { fresh: false, validate, upgrade }
            }
        };

        let _ = self.events.send(QuotaEvent::ClientDirectoryOpeningStarted {
            origin: target.origin.origin.clone(),
            persistence: target.persistence,
            client: target.client,
        });
        lock.checkpoint()?;

        if let Some(pause) = self.pause {
            trace!("opener pausing for {pause:?}");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = lock.invalidated() => return Err(QuotaError::Aborted),
            }
        }
        lock.checkpoint()?;

        let checkpoint = lock.checkpoint_handle();
        let target = target.clone();
        let usage = tokio::task::spawn_blocking(move || initialize_blocking(&target, options, &checkpoint))
            .await
            .map_err(|e| QuotaError::Internal(format!("opener task failed: {e}")))??;

        lock.checkpoint()?;
        Ok(Opened { path, usage: Some(usage) })
    }
}

fn initialize_blocking(target: &Target, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<u64> {
    let mut progress = Progress::default();
    let result = initialize_steps(target, options, checkpoint, &mut progress);
    if result.is_err() {
        cleanup(target, &progress);
    }
    result
}

fn initialize_steps(
    target: &Target,
    options: InitOptions,
    checkpoint: &Checkpoint,
    progress: &mut Progress,
) -> QuotaResult<u64> {
    let layout = &target.layout;
    let origin = &target.origin.origin;

    progress.origin_created = layout.ensure_origin_dir(target.persistence, &target.origin)?;
    checkpoint.check()?;

    let dir = layout.client_dir(target.persistence, origin, target.client);
    progress.client_created = !dir.exists();
    std::fs::create_dir_all(&dir).map_err(|e| QuotaError::io(&dir, e))?;
    checkpoint.check()?;

    let options = InitOptions { fresh: progress.client_created, ..options };
    match target.participant.initialize(&dir, options, checkpoint) {
        Ok(()) => {}
        Err(QuotaError::Corrupt { reason, path, .. }) if target.self_heal => {
            warn!("{} data of {origin} is corrupt ({reason} in {}), recreating", target.client, path.display());
            target.participant.abort_initialization(&dir);
            layout.remove_dir(&dir)?;
            std::fs::create_dir_all(&dir).map_err(|e| QuotaError::io(&dir, e))?;
            progress.client_created = true;
            checkpoint.check()?;
            target
                .participant
                .initialize(&dir, InitOptions { fresh: true, ..options }, checkpoint)?;
        }
        Err(e) => return Err(e),
    }
    checkpoint.check()?;

    let usage = target.participant.usage(&dir)?;
    checkpoint.check()?;

    let store = &target.store;
    let persisted = store
        .origin(target.persistence, origin)
        .map_err(QuotaError::Metadata)?
        .is_some_and(|r| r.persisted);
    store
        .upsert_origin(&OriginRecord {
            persistence: target.persistence,
            origin: origin.clone(),
            persisted,
            last_access: now_secs(),
        })
        .map_err(QuotaError::Metadata)?;

    Ok(usage)
}

/// Best effort removal of what an interrupted run created.
fn cleanup(target: &Target, progress: &Progress) {
    let layout = &target.layout;
    let origin = &target.origin.origin;
    let dir = layout.client_dir(target.persistence, origin, target.client);

    target.participant.abort_initialization(&dir);
    if progress.client_created {
        if let Err(e) = layout.remove_dir(&dir) {
            warn!("cannot remove partially initialized {}: {e}", dir.display());
        }
    }
    if progress.origin_created {
        if let Err(e) = layout.remove_origin_dir_if_empty(target.persistence, origin) {
            warn!("cannot remove origin directory of {origin}: {e}");
        }
    }
}
