use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::quota::clear::{delete_scope, ClearId, ClearKind, ClearReply, ClearRequest, ClearScope, ClearState, ClearSummary};
use crate::quota::client::{ClientDirectoryParticipant, ClientRegistry};
use crate::quota::config::{validate, MetadataBackend, QuotaConfig};
use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::events::{QuotaCommand, QuotaEvent};
use crate::quota::handle::{ClientDirectory, QuotaHandle};
use crate::quota::layout::{now_secs, OriginDirectory, StorageLayout};
use crate::quota::lock::{DirectoryLock, DirectoryLockKey, LockId, LockTable};
use crate::quota::metadata::{
    ensure_storage_record, InMemoryMetadataStore, MetadataStore, OriginRecord, StorageRecordState,
    PERSISTED_FLAG_PERSISTENCE,
};
use crate::quota::opener::{ClientDirectoryOpener, OpenId, OpenWork, Opened};
use crate::quota::origin::{ClientUsage, OriginRegistry, OriginUsage};
use crate::quota::principal::{OriginMetadata, Principal};
use crate::quota::types::{ClientType, LockMode, PersistenceType};

/// Messages from tasks spawned by the manager back to the manager task.
enum Internal {
    OpenLockAcquired {
        open_id: OpenId,
        result: QuotaResult<DirectoryLock>,
    },
    OpenerFinished {
        open_id: OpenId,
        lock: DirectoryLock,
        result: QuotaResult<Opened>,
    },
    ClearLockAcquired {
        clear_id: ClearId,
        result: QuotaResult<DirectoryLock>,
    },
    ClearDeleted {
        clear_id: ClearId,
        lock: DirectoryLock,
        result: QuotaResult<ClearSummary>,
    },
    UsageScanned {
        origin: OriginMetadata,
        lock: DirectoryLock,
        result: QuotaResult<Vec<ClientUsage>>,
        reply: oneshot::Sender<QuotaResult<OriginUsage>>,
    },
    Persisted {
        origin: OriginMetadata,
        lock: DirectoryLock,
        result: QuotaResult<u64>,
        reply: oneshot::Sender<QuotaResult<()>>,
    },
    Reinitialized {
        clear_id: ClearId,
        lock: DirectoryLock,
        result: QuotaResult<InitReport>,
    },
}

/// An open between its command and its reply.
struct OpenRequest {
    principal: Principal,
    origin: OriginMetadata,
    persistence: PersistenceType,
    client: ClientType,
    reply: oneshot::Sender<QuotaResult<ClientDirectory>>,
    /// Lock of an open queued behind the heavy opener of its directory.
    parked: Option<DirectoryLock>,
}

/// Origin reference held by a lock, dropped when the lock is released.
struct LockRef {
    origin: OriginMetadata,
    slot: Option<(PersistenceType, ClientType)>,
    handed_out: bool,
}

/// Result of the blocking part of storage initialization.
struct InitReport {
    store: Arc<dyn MetadataStore>,
    state: StorageRecordState,
    origins: Vec<(OriginDirectory, Vec<(ClientType, u64)>)>,
    records: Vec<OriginRecord>,
}

/// The quota manager.
///
/// Owns the lock table, the origin registry and every clear request, and is
/// driven by [`run`](Self::run) on a single task. Everything else talks to it
/// through a [`QuotaHandle`].
pub struct QuotaManager {
    config: Arc<QuotaConfig>,
    layout: StorageLayout,
    clients: ClientRegistry,
    store: Option<Arc<dyn MetadataStore>>,
    locks: LockTable,
    origins: OriginRegistry,
    lock_refs: HashMap<LockId, LockRef>,
    opens: HashMap<OpenId, OpenRequest>,
    clears: BTreeMap<ClearId, ClearRequest>,
    next_open_id: OpenId,
    next_clear_id: ClearId,
    initialized: bool,
    stopping: bool,
    cmd_tx: mpsc::Sender<QuotaCommand>,
    cmd_rx: mpsc::Receiver<QuotaCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    release_rx: mpsc::UnboundedReceiver<LockId>,
    event_tx: broadcast::Sender<QuotaEvent>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> QuotaResult<Self> {
        validate(&config)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let (event_tx, _first_rx) = broadcast::channel(config.channel_capacity);

        Ok(Self {
            layout: StorageLayout::new(&config.storage_root),
            clients: ClientRegistry::from_config(&config),
            config: Arc::new(config),
            store: None,
            locks: LockTable::new(release_tx),
            origins: OriginRegistry::new(),
            lock_refs: HashMap::new(),
            opens: HashMap::new(),
            clears: BTreeMap::new(),
            next_open_id: 1,
            next_clear_id: 1,
            initialized: false,
            stopping: false,
            cmd_tx,
            cmd_rx,
            internal_tx,
            internal_rx,
            release_rx,
            event_tx,
        })
    }

    /// Uses `store` for storage metadata instead of the configured backend.
    pub fn with_metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces (or adds) the participant of a client type.
    pub fn with_participant(mut self, participant: Arc<dyn ClientDirectoryParticipant>) -> Self {
        self.clients.register(participant);
        self
    }

    pub fn handle(&self) -> QuotaHandle {
        QuotaHandle::new(self.cmd_tx.clone(), self.event_tx.clone())
    }

    /// Spawns the manager loop and returns a handle to it.
    pub fn start(self) -> (QuotaHandle, JoinHandle<()>) {
        let handle = self.handle();
        let join_handle = tokio::spawn(self.run());
        (handle, join_handle)
    }

    /// Runs the manager until shutdown or until every handle is gone.
    pub async fn run(mut self) {
        info!("quota manager started for {}", self.layout.root().display());
        // Only handles may keep the command channel open.
        let (closed_tx, _) = mpsc::channel(1);
        self.cmd_tx = closed_tx;

        loop {
            tokio::select! {
                biased;

                Some(id) = self.release_rx.recv() => self.on_lock_released(id),

                Some(msg) = self.internal_rx.recv() => self.on_internal(msg),

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("all quota handles dropped");
                        break;
                    };
                    debug!("quota command: {cmd:?}");
                    self.on_command(cmd).await;
                }
            }

            if self.stopping {
                break;
            }
        }

        let _ = self.event_tx.send(QuotaEvent::ManagerStopped);
        info!("quota manager stopped");
    }

    async fn on_command(&mut self, cmd: QuotaCommand) {
        match cmd {
            QuotaCommand::InitStorage { reply } => {
                let _ = reply.send(self.ensure_initialized().await);
            }
            QuotaCommand::Open { principal, client, persistence, reply } => {
                if let Err(e) = self.ensure_initialized().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.start_open(principal, client, persistence, reply);
            }
            QuotaCommand::Clear { scope, cancel, reply } => {
                if let Err(e) = self.ensure_initialized().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.start_clear(scope, ClearKind::Clear, cancel, ClearReply::Summary(reply));
            }
            QuotaCommand::Reset { cancel, reply } => {
                if let Err(e) = self.ensure_initialized().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.start_clear(ClearScope::Everything, ClearKind::Reset, cancel, ClearReply::Done(reply));
            }
            QuotaCommand::Shutdown { reply } => {
                self.start_clear(
                    ClearScope::Everything,
                    ClearKind::Shutdown,
                    CancellationToken::new(),
                    ClearReply::Done(reply),
                );
            }
            QuotaCommand::Usage { principal, reply } => {
                if let Err(e) = self.ensure_initialized().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.start_usage(principal, reply);
            }
            QuotaCommand::ListOrigins { reply } => {
                let result = self.ensure_initialized().await.map(|()| self.origins.snapshot());
                let _ = reply.send(result);
            }
            QuotaCommand::Persist { principal, reply } => {
                if let Err(e) = self.ensure_initialized().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.start_persist(principal, reply);
            }
            QuotaCommand::Persisted { principal, reply } => {
                let result = self.ensure_initialized().await.map(|()| {
                    self.origins
                        .get(&principal.origin())
                        .is_some_and(|info| info.persisted())
                });
                let _ = reply.send(result);
            }
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::OpenLockAcquired { open_id, result } => self.on_open_lock(open_id, result),
            Internal::OpenerFinished { open_id, lock, result } => self.on_opener_finished(open_id, lock, result),
            Internal::ClearLockAcquired { clear_id, result } => self.on_clear_lock(clear_id, result),
            Internal::ClearDeleted { clear_id, lock, result } => self.on_clear_deleted(clear_id, lock, result),
            Internal::UsageScanned { origin, lock, result, reply } => {
                let result = if lock.is_invalidated() { Err(QuotaError::Aborted) } else { result };
                let result = result.map(|usage| {
                    let info = self.origins.ensure(&origin);
                    info.reset_usage();
                    for u in usage {
                        info.set_usage(u.persistence, u.client, u.bytes);
                    }
                    info.snapshot()
                });
                let _ = reply.send(result);
            }
            Internal::Persisted { origin, lock, result, reply } => {
                let result = result.map(|last_access| {
                    let info = self.origins.ensure(&origin);
                    info.set_persisted(true);
                    info.touch(last_access);
                });
                drop(lock);
                let _ = reply.send(result);
            }
            Internal::Reinitialized { clear_id, lock, result } => self.on_reinitialized(clear_id, lock, result),
        }
    }

    fn on_lock_released(&mut self, id: LockId) {
        self.locks.release(id);
        let Some(lock_ref) = self.lock_refs.remove(&id) else {
            return;
        };
        let origin = &lock_ref.origin.origin;
        if let (true, Some((persistence, client))) = (lock_ref.handed_out, lock_ref.slot) {
            if let Some(info) = self.origins.get_mut(origin) {
                let slot = info.slot_mut(persistence, client);
                slot.open_handles = slot.open_handles.saturating_sub(1);
                if slot.open_handles == 0 {
                    let dir = self.layout.client_dir(persistence, origin, client);
                    if self.clients.directory_closed(client, &dir) {
                        debug!("{client} dropped the state of {}, next open initializes again", dir.display());
                        slot.initialized = false;
                    }
                }
            }
        }
        self.origins.drop_lock_ref(origin);
    }

    // Storage initialization

    async fn ensure_initialized(&mut self) -> QuotaResult<()> {
        if self.initialized {
            return Ok(());
        }

        let report = self.initialization().await?;
        self.apply_init_report(report);
        Ok(())
    }

    /// Scans the storage root and reconciles it with the metadata store.
    fn initialization(&self) -> impl Future<Output = QuotaResult<InitReport>> + Send + 'static {
        let layout = self.layout.clone();
        let clients = self.clients.clone();
        let store = self.store.clone();
        let backend = self.config.metadata;
        async move {
            tokio::task::spawn_blocking(move || initialize_storage(&layout, &clients, store, backend))
                .await
                .map_err(|e| QuotaError::Internal(format!("storage initialization task failed: {e}")))?
                .inspect_err(|e| error!("storage initialization failed: {e}"))
        }
    }

    fn apply_init_report(&mut self, report: InitReport) {
        self.store = Some(report.store);
        for (dir, usage) in report.origins {
            let info = self.origins.ensure(&dir.metadata);
            for (client, bytes) in usage {
                info.set_usage(dir.persistence, client, bytes);
            }
        }
        for record in report.records {
            let Ok(principal) = Principal::from_origin_string(&record.origin) else {
                warn!("ignoring metadata of unparsable origin {}", record.origin);
                continue;
            };
            if record.persisted && record.persistence == PERSISTED_FLAG_PERSISTENCE {
                self.origins.ensure(&principal.metadata()).set_persisted(true);
            }
            if let Some(info) = self.origins.get_mut(&record.origin) {
                info.touch(record.last_access);
            }
        }

        self.initialized = true;
        let recovered = report.state == StorageRecordState::Recovered;
        info!("storage initialized with {} origin(s){}", self.origins.len(), if recovered { " after recovery" } else { "" });
        let _ = self.event_tx.send(QuotaEvent::StorageInitialized {
            origins: self.origins.len(),
            recovered,
        });
    }

    fn store(&self) -> QuotaResult<Arc<dyn MetadataStore>> {
        self.store
            .clone()
            .ok_or_else(|| QuotaError::Internal("storage is not initialized".into()))
    }

    fn track_lock(&mut self, id: LockId, origin: &OriginMetadata, slot: Option<(PersistenceType, ClientType)>) {
        self.origins.add_lock_ref(origin);
        self.lock_refs.insert(
            id,
            LockRef {
                origin: origin.clone(),
                slot,
                handed_out: false,
            },
        );
    }

    // Opening client directories

    fn start_open(
        &mut self,
        principal: Principal,
        client: ClientType,
        persistence: PersistenceType,
        reply: oneshot::Sender<QuotaResult<ClientDirectory>>,
    ) {
        if !self.clients.contains(client) {
            let _ = reply.send(Err(QuotaError::ClientDisabled(client)));
            return;
        }

        let open_id = self.next_open_id;
        self.next_open_id += 1;

        let origin = principal.metadata();
        let key = DirectoryLockKey::client(&principal, persistence, client);
        let pending = self.locks.acquire(key, LockMode::Shared, true);
        self.track_lock(pending.id(), &origin, Some((persistence, client)));

        self.opens.insert(
            open_id,
            OpenRequest {
                principal,
                origin,
                persistence,
                client,
                reply,
                parked: None,
            },
        );

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pending.acquired().await;
            let _ = tx.send(Internal::OpenLockAcquired { open_id, result });
        });
    }

    fn on_open_lock(&mut self, open_id: OpenId, result: QuotaResult<DirectoryLock>) {
        let lock = match result {
            Ok(lock) if !lock.is_invalidated() => lock,
            Ok(_) => return self.fail_open(open_id, QuotaError::Aborted),
            Err(e) => return self.fail_open(open_id, e),
        };
        let Some(req) = self.opens.get_mut(&open_id) else {
            return;
        };

        let info = self.origins.ensure(&req.origin);
        let slot = info.slot_mut(req.persistence, req.client);
        if slot.initialized {
            self.spawn_opener(open_id, lock, OpenWork::AlreadyInitialized);
        } else if slot.opening.is_some() {
            debug!("open {open_id} waits for the opener of {}/{}/{}", req.persistence, req.origin.origin, req.client);
            slot.waiters.push_back(open_id);
            req.parked = Some(lock);
        } else {
            slot.opening = Some(open_id);
            self.spawn_opener(open_id, lock, OpenWork::full());
        }
    }

    fn spawn_opener(&mut self, open_id: OpenId, lock: DirectoryLock, work: OpenWork) {
        let Some(req) = self.opens.get(&open_id) else {
            return;
        };
        let participant = match self.clients.get(req.client) {
            Ok(p) => p,
            Err(e) => return self.finish_open(open_id, lock, Err(e)),
        };
        let store = match self.store() {
            Ok(s) => s,
            Err(e) => return self.finish_open(open_id, lock, Err(e)),
        };

        let opener = ClientDirectoryOpener::new(
            req.origin.clone(),
            req.persistence,
            req.client,
            self.layout.clone(),
            participant,
            store,
            self.config.self_heals(req.client),
            self.event_tx.clone(),
        )
        .with_pause(self.config.opener_pause);

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let (lock, result) = opener.run(lock, work).await;
            let _ = tx.send(Internal::OpenerFinished { open_id, lock, result });
        });
    }

    fn on_opener_finished(&mut self, open_id: OpenId, lock: DirectoryLock, result: QuotaResult<Opened>) {
        // A clear processed before this point wins, whatever the opener found.
        let result = if lock.is_invalidated() { Err(QuotaError::Aborted) } else { result };
        self.finish_open(open_id, lock, result);
    }

    fn finish_open(&mut self, open_id: OpenId, lock: DirectoryLock, result: QuotaResult<Opened>) {
        let Some(req) = self.opens.remove(&open_id) else {
            return;
        };
        let (persistence, client) = (req.persistence, req.client);

        let info = self.origins.ensure(&req.origin);
        let slot = info.slot_mut(persistence, client);
        let heavy = slot.opening == Some(open_id);
        if heavy {
            slot.opening = None;
        }

        match result {
            Ok(opened) => {
                slot.initialized = true;
                slot.open_handles += 1;
                if let Some(usage) = opened.usage {
                    slot.usage = Some(usage);
                }
                let usage = slot.usage.unwrap_or_default();
                info.touch(now_secs());
                if let Some(lock_ref) = self.lock_refs.get_mut(&lock.id()) {
                    lock_ref.handed_out = true;
                }

                let _ = self.event_tx.send(QuotaEvent::ClientDirectoryOpened {
                    origin: req.origin.origin.clone(),
                    persistence,
                    client,
                });
                let dir = ClientDirectory::new(lock, req.principal, persistence, client, opened.path, usage);
                // An unwanted handle is dropped here and releases its lock.
                let _ = req.reply.send(Ok(dir));
            }
            Err(e) => {
                if heavy {
                    slot.initialized = false;
                }
                if e.is_abort() {
                    let _ = self.event_tx.send(QuotaEvent::ClientDirectoryOpenAborted {
                        origin: req.origin.origin.clone(),
                        persistence,
                        client,
                    });
                }
                drop(lock);
                let _ = req.reply.send(Err(e));
            }
        }

        if heavy {
            self.resume_waiters(&req.origin.origin, persistence, client);
        }
        self.origins.evict_if_unused(&req.origin.origin);
    }

    /// Hands the directory to the opens that queued behind a finished heavy opener.
    fn resume_waiters(&mut self, origin: &str, persistence: PersistenceType, client: ClientType) {
        loop {
            let Some(info) = self.origins.get_mut(origin) else {
                return;
            };
            let slot = info.slot_mut(persistence, client);
            let initialized = slot.initialized;
            let Some(next) = slot.waiters.pop_front() else {
                return;
            };

            let Some(lock) = self.opens.get_mut(&next).and_then(|r| r.parked.take()) else {
                continue;
            };
            if lock.is_invalidated() {
                drop(lock);
                self.fail_open(next, QuotaError::Aborted);
                continue;
            }

            if initialized {
                self.spawn_opener(next, lock, OpenWork::AlreadyInitialized);
            } else {
                if let Some(info) = self.origins.get_mut(origin) {
                    info.slot_mut(persistence, client).opening = Some(next);
                }
                self.spawn_opener(next, lock, OpenWork::full());
                return;
            }
        }
    }

    fn fail_open(&mut self, open_id: OpenId, error: QuotaError) {
        let Some(req) = self.opens.remove(&open_id) else {
            return;
        };
        if error.is_abort() {
            let _ = self.event_tx.send(QuotaEvent::ClientDirectoryOpenAborted {
                origin: req.origin.origin.clone(),
                persistence: req.persistence,
                client: req.client,
            });
        }
        if let Some(info) = self.origins.get_mut(&req.origin.origin) {
            info.slot_mut(req.persistence, req.client).waiters.retain(|id| *id != open_id);
        }
        let _ = req.reply.send(Err(error));
    }

    /// Fails queued opens whose lock a clear just invalidated.
    fn abort_parked_opens(&mut self) {
        let invalidated: Vec<OpenId> = self
            .opens
            .iter()
            .filter(|(_, r)| r.parked.as_ref().is_some_and(DirectoryLock::is_invalidated))
            .map(|(id, _)| *id)
            .collect();
        for open_id in invalidated {
            self.fail_open(open_id, QuotaError::Aborted);
        }
    }

    // Clearing

    fn start_clear(&mut self, scope: ClearScope, kind: ClearKind, cancel: CancellationToken, reply: ClearReply) {
        let id = self.next_clear_id;
        self.next_clear_id += 1;

        let mut request = ClearRequest::new(id, scope, kind, cancel.clone(), reply);
        info!("{kind:?} {id} requested for {}", request.scope);
        request.advance(ClearState::ClearRequested, &self.event_tx);
        if cancel.is_cancelled() {
            request.advance(ClearState::Idle, &self.event_tx);
            request.finish(Err(QuotaError::Aborted));
            return;
        }

        request.advance(ClearState::AbortingActiveLocks, &self.event_tx);
        let invalidated = self.locks.invalidate(&request.key);
        self.abort_parked_opens();
        debug!("clear {id} invalidated {invalidated} lock(s)");

        let pending = self.locks.acquire(request.key.clone(), LockMode::Exclusive, false);
        request.advance(ClearState::WaitingForRelease, &self.event_tx);
        self.clears.insert(id, request);

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = pending.acquired() => result,
                _ = cancel.cancelled() => Err(QuotaError::Aborted),
            };
            let _ = tx.send(Internal::ClearLockAcquired { clear_id: id, result });
        });
    }

    fn on_clear_lock(&mut self, clear_id: ClearId, result: QuotaResult<DirectoryLock>) {
        let Some(mut request) = self.clears.remove(&clear_id) else {
            return;
        };
        debug!("clear {clear_id} lock resolved while {:?}", request.state());
        let lock = match result {
            Ok(lock) if !request.cancel.is_cancelled() => lock,
            Ok(_) => {
                info!("clear {clear_id} cancelled");
                request.advance(ClearState::Idle, &self.event_tx);
                return request.finish(Err(QuotaError::Aborted));
            }
            Err(e) => {
                info!("clear {clear_id} did not get its lock: {e}");
                request.advance(ClearState::Idle, &self.event_tx);
                return request.finish(Err(e));
            }
        };

        let kind = request.kind;
        match kind {
            ClearKind::Clear => {
                request.advance(ClearState::Deleting, &self.event_tx);
                let key = request.key.clone();
                let layout = self.layout.clone();
                let clients = self.clients.clone();
                let store = self.store.clone();
                self.clears.insert(clear_id, request);

                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || delete_scope(&key, &layout, &clients, store.as_ref()))
                        .await
                        .unwrap_or_else(|e| Err(QuotaError::Internal(format!("delete task failed: {e}"))));
                    let _ = tx.send(Internal::ClearDeleted { clear_id, lock, result });
                });
            }
            ClearKind::Reset => {
                // Nothing else runs under the reset's lock, so storage is
                // initialized again before any queued operation touches disk.
                self.clients.reset();
                let _ = self.event_tx.send(QuotaEvent::ManagerReset);
                self.clears.insert(clear_id, request);

                let init = self.initialization();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = init.await;
                    let _ = tx.send(Internal::Reinitialized { clear_id, lock, result });
                });
            }
            ClearKind::Shutdown => {
                self.origins.clear();
                self.clients.reset();
                self.initialized = false;
                self.stopping = true;
                let _ = self.event_tx.send(QuotaEvent::ManagerReset);
                drop(lock);
                request.advance(ClearState::Idle, &self.event_tx);
                request.finish(Ok(ClearSummary::default()));
            }
        }
    }

    fn on_reinitialized(&mut self, clear_id: ClearId, lock: DirectoryLock, result: QuotaResult<InitReport>) {
        let Some(mut request) = self.clears.remove(&clear_id) else {
            return;
        };

        // On failure the registry keeps describing the untouched disk state.
        let result = result.map(|report| {
            self.origins.clear();
            for lock_ref in self.lock_refs.values() {
                self.origins.add_lock_ref(&lock_ref.origin);
            }
            self.apply_init_report(report);
            ClearSummary::default()
        });
        drop(lock);

        request.advance(ClearState::Idle, &self.event_tx);
        if let Err(e) = &result {
            error!("reset {clear_id} failed: {e}");
        }
        request.finish(result);
    }

    fn on_clear_deleted(&mut self, clear_id: ClearId, lock: DirectoryLock, result: QuotaResult<ClearSummary>) {
        let Some(mut request) = self.clears.remove(&clear_id) else {
            return;
        };

        // The registry is updated even after a failed deletion, the next open revalidates.
        let forgotten = self.origins.clear_matching(&request.key);
        let result = result.map(|summary| {
            let cleared: HashSet<&String> = summary.origins.iter().chain(forgotten.iter()).collect();
            let mut cleared: Vec<&String> = cleared.into_iter().collect();
            cleared.sort();
            for origin in cleared {
                let _ = self.event_tx.send(QuotaEvent::OriginCleared { origin: origin.clone() });
            }
            summary
        });
        drop(lock);

        request.advance(ClearState::Idle, &self.event_tx);
        match &result {
            Ok(summary) => {
                let _ = self.event_tx.send(QuotaEvent::ClearFinished {
                    id: clear_id,
                    summary: summary.clone(),
                });
            }
            Err(e) => error!("clear {clear_id} of {} failed: {e}", request.scope),
        }
        request.finish(result);
    }

    // Usage and persistence

    fn start_usage(&mut self, principal: Principal, reply: oneshot::Sender<QuotaResult<OriginUsage>>) {
        let origin = principal.metadata();
        let pending = self.locks.acquire(DirectoryLockKey::origin(&principal), LockMode::Shared, true);
        self.track_lock(pending.id(), &origin, None);

        let layout = self.layout.clone();
        let clients = self.clients.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let lock = match pending.acquired().await {
                Ok(lock) => lock,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };
            let name = origin.origin.clone();
            let result = tokio::task::spawn_blocking(move || scan_usage(&layout, &clients, &name))
                .await
                .unwrap_or_else(|e| Err(QuotaError::Internal(format!("usage task failed: {e}"))));
            let _ = tx.send(Internal::UsageScanned { origin, lock, result, reply });
        });
    }

    /// Writes the persisted flag under a shared origin lock, so it orders
    /// against clears queued before or after it.
    fn start_persist(&mut self, principal: Principal, reply: oneshot::Sender<QuotaResult<()>>) {
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let origin = principal.metadata();
        // Not invalidatable: a clear arriving later waits for the write and then removes it.
        let pending = self.locks.acquire(DirectoryLockKey::origin(&principal), LockMode::Shared, false);
        self.track_lock(pending.id(), &origin, None);

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let lock = match pending.acquired().await {
                Ok(lock) => lock,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };
            let record = OriginRecord {
                persistence: PERSISTED_FLAG_PERSISTENCE,
                origin: origin.origin.clone(),
                persisted: true,
                last_access: now_secs(),
            };
            let result = tokio::task::spawn_blocking(move || {
                store
                    .upsert_origin(&record)
                    .map(|()| record.last_access)
                    .map_err(QuotaError::Metadata)
            })
            .await
            .unwrap_or_else(|e| Err(QuotaError::Internal(format!("persist task failed: {e}"))));
            let _ = tx.send(Internal::Persisted { origin, lock, result, reply });
        });
    }
}

#[cfg_attr(not(feature = "sqlite_metadata"), allow(unused_variables))]
fn open_store(backend: MetadataBackend, layout: &StorageLayout) -> QuotaResult<Arc<dyn MetadataStore>> {
    match backend {
        MetadataBackend::InMemory => Ok(Arc::new(InMemoryMetadataStore::new())),
        #[cfg(feature = "sqlite_metadata")]
        MetadataBackend::Sqlite => {
            use crate::quota::metadata::sqlite::{SqliteMetadataStore, DATABASE_FILE};
            let store = SqliteMetadataStore::new(&layout.root().join(DATABASE_FILE)).map_err(QuotaError::Metadata)?;
            Ok(Arc::new(store))
        }
    }
}

fn initialize_storage(
    layout: &StorageLayout,
    clients: &ClientRegistry,
    store: Option<Arc<dyn MetadataStore>>,
    backend: MetadataBackend,
) -> QuotaResult<InitReport> {
    layout.ensure_root()?;
    layout.purge_to_be_removed();

    let store = match store {
        Some(store) => store,
        None => open_store(backend, layout)?,
    };
    let state = ensure_storage_record(&*store).map_err(QuotaError::Metadata)?;

    let mut origins = Vec::new();
    let mut found = HashSet::new();
    for dir in layout.scan()? {
        let mut usage = Vec::with_capacity(dir.clients.len());
        for client in &dir.clients {
            usage.push((*client, clients.usage(*client, &dir.path.join(client.as_str()))?));
        }

        let origin = dir.metadata.origin.clone();
        if store.origin(dir.persistence, &origin).map_err(QuotaError::Metadata)?.is_none() {
            debug!("restoring metadata row of {}/{origin}", dir.persistence);
            store
                .upsert_origin(&OriginRecord {
                    persistence: dir.persistence,
                    origin: origin.clone(),
                    persisted: false,
                    last_access: now_secs(),
                })
                .map_err(QuotaError::Metadata)?;
        }
        found.insert((dir.persistence, origin));
        origins.push((dir, usage));
    }

    let mut records = Vec::new();
    for record in store.origins().map_err(QuotaError::Metadata)? {
        if !record.persisted && !found.contains(&(record.persistence, record.origin.clone())) {
            debug!("dropping metadata row of vanished origin {}", record.origin);
            store
                .remove_origin(record.persistence, &record.origin)
                .map_err(QuotaError::Metadata)?;
            continue;
        }
        records.push(record);
    }

    Ok(InitReport { store, state, origins, records })
}

fn scan_usage(layout: &StorageLayout, clients: &ClientRegistry, origin: &str) -> QuotaResult<Vec<ClientUsage>> {
    let mut usage = Vec::new();
    for persistence in PersistenceType::ALL {
        for client in ClientType::ALL {
            let dir = layout.client_dir(persistence, origin, client);
            if dir.is_dir() {
                usage.push(ClientUsage {
                    persistence,
                    client,
                    bytes: clients.usage(client, &dir)?,
                });
            }
        }
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::client::SimpleDb;
    use std::time::Duration;

    fn config(root: &std::path::Path) -> QuotaConfig {
        QuotaConfig::builder()
            .storage_root(root)
            .metadata(MetadataBackend::InMemory)
            .build()
            .unwrap()
    }

    fn principal(url: &str) -> Principal {
        Principal::from_url(url).unwrap()
    }

    #[tokio::test]
    async fn open_creates_and_tracks_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (quota, _join) = QuotaManager::new(config(dir.path())).unwrap().start();
        let p = principal("https://a.test");

        let handle = quota
            .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
            .await
            .unwrap();
        assert!(handle.path().is_dir());
        SimpleDb::open(handle.path(), "db").unwrap().write(b"abc").unwrap();
        drop(handle);

        let usage = quota.usage_for_principal(&p).await.unwrap();
        assert_eq!(usage.of(PersistenceType::Default, ClientType::SimpleDb), Some(3));

        let origins = quota.list_origins().await.unwrap();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].origin, "https://a.test");
    }

    #[tokio::test]
    async fn disabled_client_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = QuotaConfig::builder()
            .storage_root(dir.path())
            .metadata(MetadataBackend::InMemory)
            .enabled_clients([ClientType::IndexedDb])
            .build()
            .unwrap();
        let (quota, _join) = QuotaManager::new(cfg).unwrap().start();

        let err = quota
            .open_for_principal(&principal("https://a.test"), ClientType::LocalStorage, PersistenceType::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ClientDisabled(ClientType::LocalStorage)));
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_heavy_opener() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.opener_pause = Some(Duration::from_millis(50));
        let (quota, _join) = QuotaManager::new(cfg).unwrap().start();
        let mut events = quota.subscribe();
        let p = principal("https://a.test");

        let (a, b) = tokio::join!(
            quota.open_for_principal(&p, ClientType::IndexedDb, PersistenceType::Default),
            quota.open_for_principal(&p, ClientType::IndexedDb, PersistenceType::Default),
        );
        assert!(a.is_ok() && b.is_ok());

        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QuotaEvent::ClientDirectoryOpeningStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn persist_is_remembered_until_origin_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (quota, _join) = QuotaManager::new(config(dir.path())).unwrap().start();
        let p = principal("https://a.test");

        assert!(!quota.persisted(&p).await.unwrap());
        quota.persist(&p).await.unwrap();
        assert!(quota.persisted(&p).await.unwrap());

        quota.reset().await.unwrap();
        assert!(quota.persisted(&p).await.unwrap());

        quota.clear_storages_for_principal(&p, None, None).await.unwrap();
        assert!(!quota.persisted(&p).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (quota, join) = QuotaManager::new(config(dir.path())).unwrap().start();
        quota.init_storage().await.unwrap();

        quota.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(matches!(quota.list_origins().await, Err(QuotaError::NotRunning)));
    }
}
