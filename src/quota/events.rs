use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::quota::clear::{ClearId, ClearScope, ClearState, ClearSummary};
use crate::quota::errors::QuotaResult;
use crate::quota::handle::ClientDirectory;
use crate::quota::origin::OriginUsage;
use crate::quota::principal::Principal;
use crate::quota::types::{ClientType, PersistenceType};

/// Commands sent from a [`QuotaHandle`](crate::quota::QuotaHandle) to the manager task.
pub enum QuotaCommand {
    InitStorage {
        reply: oneshot::Sender<QuotaResult<()>>,
    },
    Open {
        principal: Principal,
        client: ClientType,
        persistence: PersistenceType,
        reply: oneshot::Sender<QuotaResult<ClientDirectory>>,
    },
    Clear {
        scope: ClearScope,
        cancel: CancellationToken,
        reply: oneshot::Sender<QuotaResult<ClearSummary>>,
    },
    Reset {
        cancel: CancellationToken,
        reply: oneshot::Sender<QuotaResult<()>>,
    },
    Usage {
        principal: Principal,
        reply: oneshot::Sender<QuotaResult<OriginUsage>>,
    },
    ListOrigins {
        reply: oneshot::Sender<QuotaResult<Vec<OriginUsage>>>,
    },
    Persist {
        principal: Principal,
        reply: oneshot::Sender<QuotaResult<()>>,
    },
    Persisted {
        principal: Principal,
        reply: oneshot::Sender<QuotaResult<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<QuotaResult<()>>,
    },
}

impl std::fmt::Debug for QuotaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaCommand::InitStorage { .. } => write!(f, "InitStorage"),
            QuotaCommand::Open { principal, client, persistence, .. } => {
                write!(f, "Open({persistence}/{principal}/{client})")
            }
            QuotaCommand::Clear { scope, .. } => write!(f, "Clear({scope})"),
            QuotaCommand::Reset { .. } => write!(f, "Reset"),
            QuotaCommand::Usage { principal, .. } => write!(f, "Usage({principal})"),
            QuotaCommand::ListOrigins { .. } => write!(f, "ListOrigins"),
            QuotaCommand::Persist { principal, .. } => write!(f, "Persist({principal})"),
            QuotaCommand::Persisted { principal, .. } => write!(f, "Persisted({principal})"),
            QuotaCommand::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

/// Notifications published by the manager. Subscribe with
/// [`QuotaHandle::subscribe`](crate::quota::QuotaHandle::subscribe); only
/// receivers alive when an event is sent get it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
    /// Storage was (re)initialized from disk.
    StorageInitialized {
        origins: usize,
        /// Inconsistent metadata was found and reset.
        recovered: bool,
    },
    /// A full directory initialization started; the opener can now be interrupted.
    ClientDirectoryOpeningStarted {
        origin: String,
        persistence: PersistenceType,
        client: ClientType,
    },
    ClientDirectoryOpened {
        origin: String,
        persistence: PersistenceType,
        client: ClientType,
    },
    ClientDirectoryOpenAborted {
        origin: String,
        persistence: PersistenceType,
        client: ClientType,
    },
    ClearStateChanged {
        id: ClearId,
        state: ClearState,
    },
    OriginCleared {
        origin: String,
    },
    ClearFinished {
        id: ClearId,
        summary: ClearSummary,
    },
    /// In-memory state was dropped by a reset or shutdown. A reset follows it
    /// with `StorageInitialized` once storage was scanned again.
    ManagerReset,
    ManagerStopped,
}
