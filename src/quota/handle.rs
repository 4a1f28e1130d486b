use std::future::{Future, IntoFuture};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::quota::clear::{ClearScope, ClearSummary};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::events::{QuotaCommand, QuotaEvent};
use crate::quota::lock::DirectoryLock;
use crate::quota::origin::OriginUsage;
use crate::quota::principal::{OriginAttributesPattern, Principal};
use crate::quota::types::{ClientType, PersistenceType};

/// Cloneable handle to a running [`QuotaManager`](crate::quota::QuotaManager).
#[derive(Clone)]
pub struct QuotaHandle {
    cmd_tx: mpsc::Sender<QuotaCommand>,
    event_tx: broadcast::Sender<QuotaEvent>,
}

impl std::fmt::Debug for QuotaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaHandle")
            .field("cmd_tx", &self.cmd_tx)
            .field("subscribers", &self.event_tx.receiver_count())
            .finish()
    }
}

impl QuotaHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<QuotaCommand>, event_tx: broadcast::Sender<QuotaEvent>) -> Self {
        Self { cmd_tx, event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.event_tx.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<QuotaResult<T>>) -> QuotaCommand) -> QuotaResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| QuotaError::NotRunning)?;
        rx.await.map_err(|_| QuotaError::ChannelClosed)?
    }

    /// Queues the command right away while the command channel has room, so
    /// such requests are processed in the order they were made. With a full
    /// channel the command is queued when the request is first awaited.
    fn request<T: Send + 'static>(
        &self,
        make: impl FnOnce(oneshot::Sender<QuotaResult<T>>, CancellationToken) -> QuotaCommand,
    ) -> QuotaRequest<T> {
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let cmd = make(tx, cancel.clone());

        let deferred = match self.cmd_tx.try_send(cmd) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(cmd)) => Ok(Some((self.cmd_tx.clone(), cmd))),
            Err(TrySendError::Closed(_)) => Err(QuotaError::NotRunning),
        };

        let fut = async move {
            if let Some((cmd_tx, cmd)) = deferred? {
                cmd_tx.send(cmd).await.map_err(|_| QuotaError::NotRunning)?;
            }
            rx.await.map_err(|_| QuotaError::ChannelClosed)?
        };
        QuotaRequest { cancel, fut: fut.boxed() }
    }

    /// Initializes storage explicitly. Every other operation does it on demand.
    pub async fn init_storage(&self) -> QuotaResult<()> {
        self.call(|reply| QuotaCommand::InitStorage { reply }).await
    }

    /// Opens the client directory of `principal`, initializing it if needed.
    ///
    /// Resolves with [`QuotaError::Aborted`] if a clear or reset targeting the
    /// directory is processed before the open completes.
    pub async fn open_for_principal(
        &self,
        principal: &Principal,
        client: ClientType,
        persistence: PersistenceType,
    ) -> QuotaResult<ClientDirectory> {
        let principal = principal.clone();
        self.call(|reply| QuotaCommand::Open { principal, client, persistence, reply }).await
    }

    pub fn clear_storages_for_principal(
        &self,
        principal: &Principal,
        persistence: Option<PersistenceType>,
        client: Option<ClientType>,
    ) -> QuotaRequest<ClearSummary> {
        let principal = principal.clone();
        let scope = match client {
            Some(client) => ClearScope::ByClientType { principal, client, persistence },
            None => ClearScope::ByPrincipal { principal, persistence },
        };
        self.clear_scope(scope)
    }

    /// Clears one client's data of `principal`, leaving the other clients alone.
    pub fn clear_storages_for_client(
        &self,
        principal: &Principal,
        client: ClientType,
        persistence: Option<PersistenceType>,
    ) -> QuotaRequest<ClearSummary> {
        self.clear_scope(ClearScope::ByClientType {
            principal: principal.clone(),
            client,
            persistence,
        })
    }

    pub fn clear_storages_for_origin_attributes_pattern(
        &self,
        pattern: OriginAttributesPattern,
    ) -> QuotaRequest<ClearSummary> {
        self.clear_scope(ClearScope::ByPattern(pattern))
    }

    /// Clears every origin of the site, including origins partitioned under it.
    pub fn clear_base_domain(&self, domain: &str) -> QuotaRequest<ClearSummary> {
        self.clear_scope(ClearScope::ByBaseDomain(domain.trim_end_matches('.').to_ascii_lowercase()))
    }

    pub fn clear(&self) -> QuotaRequest<ClearSummary> {
        self.clear_scope(ClearScope::Everything)
    }

    pub fn clear_scope(&self, scope: ClearScope) -> QuotaRequest<ClearSummary> {
        self.request(|reply, cancel| QuotaCommand::Clear { scope, cancel, reply })
    }

    /// Aborts all opens, waits for every lock and drops the in-memory state.
    /// Data on disk is kept; storage initializes again on next use.
    pub fn reset(&self) -> QuotaRequest<()> {
        self.request(|reply, cancel| QuotaCommand::Reset { cancel, reply })
    }

    pub async fn usage_for_principal(&self, principal: &Principal) -> QuotaResult<OriginUsage> {
        let principal = principal.clone();
        self.call(|reply| QuotaCommand::Usage { principal, reply }).await
    }

    pub async fn list_origins(&self) -> QuotaResult<Vec<OriginUsage>> {
        self.call(|reply| QuotaCommand::ListOrigins { reply }).await
    }

    /// Marks the origin's storage as persisted.
    pub async fn persist(&self, principal: &Principal) -> QuotaResult<()> {
        let principal = principal.clone();
        self.call(|reply| QuotaCommand::Persist { principal, reply }).await
    }

    pub async fn persisted(&self, principal: &Principal) -> QuotaResult<bool> {
        let principal = principal.clone();
        self.call(|reply| QuotaCommand::Persisted { principal, reply }).await
    }

    /// Stops the manager once every lock is released.
    pub async fn shutdown(&self) -> QuotaResult<()> {
        self.call(|reply| QuotaCommand::Shutdown { reply }).await
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = QuotaResult<T>> + Send + 'static>>;

/// An administrative request (clear or reset) sent to the manager.
///
/// It is queued when created unless the command channel is full, in which case
/// it is queued when first awaited.
///
/// Await it to learn when it finished. [`cancel`](Self::cancel) aborts the
/// request as long as it has not started deleting.
pub struct QuotaRequest<T> {
    cancel: CancellationToken,
    fut: BoxFuture<T>,
}

impl<T> QuotaRequest<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request, usable after the request was moved elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn finished(self) -> QuotaResult<T> {
        self.fut.await
    }
}

impl<T> IntoFuture for QuotaRequest<T> {
    type Output = QuotaResult<T>;
    type IntoFuture = BoxFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.fut
    }
}

impl<T> std::fmt::Debug for QuotaRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaRequest")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// An opened client directory. Holds a shared lock on it until dropped.
///
/// Storage clients must watch [`invalidated`](Self::invalidated) and drop the
/// handle promptly once it fires: a clear of the directory waits for that.
#[derive(Debug)]
pub struct ClientDirectory {
    lock: DirectoryLock,
    principal: Principal,
    persistence: PersistenceType,
    client: ClientType,
    path: PathBuf,
    usage: u64,
}

impl ClientDirectory {
    pub(crate) fn new(
        lock: DirectoryLock,
        principal: Principal,
        persistence: PersistenceType,
        client: ClientType,
        path: PathBuf,
        usage: u64,
    ) -> Self {
        Self {
            lock,
            principal,
            persistence,
            client,
            path,
            usage,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn persistence(&self) -> PersistenceType {
        self.persistence
    }

    pub fn client(&self) -> ClientType {
        self.client
    }

    /// Usage of the directory in bytes when it was opened.
    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn is_invalidated(&self) -> bool {
        self.lock.is_invalidated()
    }

    pub fn invalidated(&self) -> WaitForCancellationFuture<'_> {
        self.lock.invalidated()
    }

    pub fn checkpoint(&self) -> QuotaResult<()> {
        self.lock.checkpoint()
    }

    /// Closes the directory. Equivalent to dropping the handle.
    pub fn close(self) {}
}
