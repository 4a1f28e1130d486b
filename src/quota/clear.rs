//! Clear requests.
//!
//! A clear moves through
//! `ClearRequested -> AbortingActiveLocks -> WaitingForRelease -> Deleting -> Idle`:
//! it invalidates every lock overlapping its scope, queues its own exclusive
//! lock behind them, deletes the directories once that lock is granted, and
//! finishes after the registry was updated. Clear locks cannot be invalidated
//! by other clears, so overlapping clears run one after the other and each one
//! resolves on its own.
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::quota::client::ClientRegistry;
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::events::QuotaEvent;
use crate::quota::layout::StorageLayout;
use crate::quota::lock::{DirectoryLockKey, OriginScope};
use crate::quota::metadata::MetadataStore;
use crate::quota::principal::{OriginAttributesPattern, Principal};
use crate::quota::types::{ClientType, PersistenceType};

pub type ClearId = u64;

/// What a clear targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    Everything,
    ByPrincipal {
        principal: Principal,
        persistence: Option<PersistenceType>,
    },
    ByBaseDomain(String),
    ByClientType {
        principal: Principal,
        client: ClientType,
        persistence: Option<PersistenceType>,
    },
    ByPattern(OriginAttributesPattern),
}

impl ClearScope {
    pub fn lock_key(&self) -> DirectoryLockKey {
        match self {
            ClearScope::Everything => DirectoryLockKey::everything(),
            ClearScope::ByPrincipal { principal, persistence } => DirectoryLockKey {
                persistence: *persistence,
                ..DirectoryLockKey::origin(principal)
            },
            ClearScope::ByBaseDomain(domain) => DirectoryLockKey {
                persistence: None,
                origin: OriginScope::BaseDomain(domain.clone()),
                client: None,
            },
            ClearScope::ByClientType { principal, client, persistence } => DirectoryLockKey {
                persistence: *persistence,
                origin: OriginScope::Origin(principal.metadata()),
                client: Some(*client),
            },
            ClearScope::ByPattern(pattern) => DirectoryLockKey {
                persistence: None,
                origin: OriginScope::Pattern(pattern.clone()),
                client: None,
            },
        }
    }
}

impl Display for ClearScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lock_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearState {
    Idle,
    ClearRequested,
    AbortingActiveLocks,
    WaitingForRelease,
    Deleting,
}

/// Outcome of a finished clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearSummary {
    /// Origins that had data removed, sorted.
    pub origins: Vec<String>,
    /// Number of client or origin directories removed.
    pub directories_removed: usize,
}

/// What the exclusive lock of a request is used for once granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearKind {
    Clear,
    /// Drop all in-memory state; on-disk data stays.
    Reset,
    /// Like reset, then stop the manager.
    Shutdown,
}

pub(crate) enum ClearReply {
    Summary(oneshot::Sender<QuotaResult<ClearSummary>>),
    Done(oneshot::Sender<QuotaResult<()>>),
}

pub(crate) struct ClearRequest {
    pub id: ClearId,
    pub scope: ClearScope,
    pub key: DirectoryLockKey,
    pub kind: ClearKind,
    pub cancel: CancellationToken,
    state: ClearState,
    reply: Option<ClearReply>,
}

impl ClearRequest {
    pub fn new(id: ClearId, scope: ClearScope, kind: ClearKind, cancel: CancellationToken, reply: ClearReply) -> Self {
        let key = scope.lock_key();
        Self {
            id,
            scope,
            key,
            kind,
            cancel,
            state: ClearState::Idle,
            reply: Some(reply),
        }
    }

    pub fn state(&self) -> ClearState {
        self.state
    }

    pub fn advance(&mut self, state: ClearState, events: &broadcast::Sender<QuotaEvent>) {
        debug!("clear {} ({}): {:?} -> {state:?}", self.id, self.scope, self.state);
        self.state = state;
        let _ = events.send(QuotaEvent::ClearStateChanged { id: self.id, state });
    }

    /// Resolves the caller's request. Later calls are ignored.
    pub fn finish(&mut self, result: QuotaResult<ClearSummary>) {
        match self.reply.take() {
            Some(ClearReply::Summary(tx)) => {
                let _ = tx.send(result);
            }
            Some(ClearReply::Done(tx)) => {
                let _ = tx.send(result.map(|_| ()));
            }
            None => {}
        }
    }
}

/// Removes everything covered by `key` from disk. Runs on a blocking worker.
pub(crate) fn delete_scope(
    key: &DirectoryLockKey,
    layout: &StorageLayout,
    clients: &ClientRegistry,
    store: Option<&Arc<dyn MetadataStore>>,
) -> QuotaResult<ClearSummary> {
    let mut origins = BTreeSet::new();
    let mut removed = 0;

    for dir in layout.scan()? {
        if !key.covers(dir.persistence, &dir.metadata, None) {
            continue;
        }
        let origin = &dir.metadata.origin;

        match key.client {
            Some(client) => {
                let client_dir = dir.path.join(client.as_str());
                if clients.delete(client, &client_dir, layout)? {
                    removed += 1;
                    origins.insert(origin.clone());
                }
                layout.remove_origin_dir_if_empty(dir.persistence, origin)?;
            }
            None => {
                for client in &dir.clients {
                    clients.delete(*client, &dir.path.join(client.as_str()), layout)?;
                }
                if layout.remove_dir(&dir.path)? {
                    removed += 1;
                    origins.insert(origin.clone());
                }
                if let Some(store) = store {
                    store
                        .remove_origin(dir.persistence, origin)
                        .map_err(QuotaError::Metadata)?;
                }
            }
        }
    }

    if key.client.is_none() {
        if let Some(store) = store {
            // Rows without a directory, e.g. persisted origins that never stored data.
            for record in store.origins().map_err(QuotaError::Metadata)? {
                let Ok(principal) = Principal::from_origin_string(&record.origin) else { continue };
                if key.covers(record.persistence, &principal.metadata(), None) {
                    store
                        .remove_origin(record.persistence, &record.origin)
                        .map_err(QuotaError::Metadata)?;
                }
            }
        }
    }

    info!("cleared {key}: {removed} director(ies) of {} origin(s)", origins.len());
    Ok(ClearSummary {
        origins: origins.into_iter().collect(),
        directories_removed: removed,
    })
}
