//! End-to-end tests driving a running manager through its handle.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::quota::client::{IndexedDbClient, LocalStorageClient, SimpleDb};
use crate::quota::layout::StorageLayout;
use crate::quota::metadata::{InMemoryMetadataStore, MetadataStore};
use crate::quota::{
    Checkpoint, ClearState, ClientDirectoryParticipant, ClientType, InitOptions, MetadataBackend, PersistenceType,
    Principal, QuotaConfig, QuotaError, QuotaEvent, QuotaHandle, QuotaManager, QuotaResult,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(root: &Path) -> QuotaConfig {
    QuotaConfig::builder()
        .storage_root(root)
        .metadata(MetadataBackend::InMemory)
        .build()
        .unwrap()
}

fn start(config: QuotaConfig) -> QuotaHandle {
    start_manager(QuotaManager::new(config).unwrap())
}

fn start_manager(manager: QuotaManager) -> QuotaHandle {
    init_logger();
    let (quota, _join) = manager.start();
    quota
}

fn principal(url: &str) -> Principal {
    Principal::from_url(url).unwrap()
}

async fn wait_for(events: &mut broadcast::Receiver<QuotaEvent>, wanted: impl Fn(&QuotaEvent) -> bool) -> QuotaEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

async fn write_simple_db(quota: &QuotaHandle, p: &Principal, persistence: PersistenceType, data: &[u8]) {
    let dir = quota
        .open_for_principal(p, ClientType::SimpleDb, persistence)
        .await
        .unwrap();
    SimpleDb::open(dir.path(), "data").unwrap().write(data).unwrap();
}

async fn read_simple_db(quota: &QuotaHandle, p: &Principal, persistence: PersistenceType) -> Vec<u8> {
    let dir = quota
        .open_for_principal(p, ClientType::SimpleDb, persistence)
        .await
        .unwrap();
    SimpleDb::open(dir.path(), "data").unwrap().read().unwrap()
}

/// IndexedDB participant whose initialization of one directory blocks until signalled.
struct GatedIndexedDb {
    inner: IndexedDbClient,
    gated_dir: PathBuf,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl ClientDirectoryParticipant for GatedIndexedDb {
    fn client_type(&self) -> ClientType {
        ClientType::IndexedDb
    }

    fn initialize(&self, dir: &Path, options: InitOptions, checkpoint: &Checkpoint) -> QuotaResult<()> {
        if dir == self.gated_dir {
            let _ = self.gate.lock().unwrap().recv_timeout(WAIT);
        }
        self.inner.initialize(dir, options, checkpoint)
    }
}

#[tokio::test]
async fn clear_aborts_an_open_in_progress() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(
        QuotaConfig::builder()
            .storage_root(root.path())
            .metadata(MetadataBackend::InMemory)
            .opener_pause(Duration::from_secs(2))
            .build()
            .unwrap(),
    );
    let mut events = quota.subscribe();
    let p = principal("https://slow.test");

    let open = tokio::spawn({
        let quota = quota.clone();
        let p = p.clone();
        async move { quota.open_for_principal(&p, ClientType::IndexedDb, PersistenceType::Default).await }
    });
    wait_for(&mut events, |e| matches!(e, QuotaEvent::ClientDirectoryOpeningStarted { .. })).await;

    let summary = timeout(WAIT, quota.clear_storages_for_principal(&p, None, None))
        .await
        .unwrap()
        .unwrap();
    assert!(summary.origins.is_empty());

    let opened = open.await.unwrap();
    assert!(matches!(opened, Err(QuotaError::Aborted)));
    let layout = StorageLayout::new(root.path());
    assert!(!layout.client_dir(PersistenceType::Default, &p.origin(), ClientType::IndexedDb).exists());
}

#[tokio::test]
async fn clear_of_one_origin_leaves_others_alone() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let a = principal("https://a.test");
    let b = principal("https://b.test");

    let held_b = quota
        .open_for_principal(&b, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();
    SimpleDb::open(held_b.path(), "data").unwrap().write(b"bbb").unwrap();

    let clear_b = quota.clear_storages_for_principal(&b, None, None);

    // Opens of another origin go through while the clear waits for `held_b`.
    let dir_a = timeout(WAIT, quota.open_for_principal(&a, ClientType::SimpleDb, PersistenceType::Default))
        .await
        .unwrap()
        .unwrap();
    assert!(!dir_a.is_invalidated());

    timeout(WAIT, held_b.invalidated()).await.unwrap();
    assert!(!dir_a.is_invalidated());
    drop(held_b);

    let summary = timeout(WAIT, clear_b).await.unwrap().unwrap();
    assert_eq!(summary.origins, vec![b.origin()]);
    assert!(!dir_a.is_invalidated());
    assert!(dir_a.path().is_dir());
}

#[tokio::test]
async fn client_scoped_clear_keeps_other_persistence_types_and_clients() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");

    for persistence in PersistenceType::ALL {
        write_simple_db(&quota, &p, persistence, persistence.as_str().as_bytes()).await;
    }
    drop(
        quota
            .open_for_principal(&p, ClientType::IndexedDb, PersistenceType::Default)
            .await
            .unwrap(),
    );

    let summary = quota
        .clear_storages_for_client(&p, ClientType::SimpleDb, Some(PersistenceType::Default))
        .await
        .unwrap();
    assert_eq!(summary.origins, vec![p.origin()]);
    assert_eq!(summary.directories_removed, 1);

    assert!(read_simple_db(&quota, &p, PersistenceType::Default).await.is_empty());
    assert_eq!(read_simple_db(&quota, &p, PersistenceType::Temporary).await, b"temporary");
    assert_eq!(read_simple_db(&quota, &p, PersistenceType::Persistent).await, b"persistent");

    let usage = quota.usage_for_principal(&p).await.unwrap();
    assert!(usage.of(PersistenceType::Default, ClientType::IndexedDb).is_some());
}

#[tokio::test]
async fn clearing_twice_is_harmless() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");
    write_simple_db(&quota, &p, PersistenceType::Default, b"abc").await;

    let first = quota.clear_storages_for_principal(&p, None, None).await.unwrap();
    assert_eq!(first.origins, vec![p.origin()]);

    let second = quota.clear_storages_for_principal(&p, None, None).await.unwrap();
    assert!(second.origins.is_empty());
    assert_eq!(second.directories_removed, 0);
    assert!(quota.list_origins().await.unwrap().is_empty());
}

#[tokio::test]
async fn inconsistent_metadata_is_recovered_on_init() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryMetadataStore::new());
    store.set_initialized_flag(true).unwrap();

    init_logger();
    let (quota, _join) = QuotaManager::new(config(root.path()))
        .unwrap()
        .with_metadata_store(store.clone())
        .start();
    let mut events = quota.subscribe();

    quota.init_storage().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, QuotaEvent::StorageInitialized { .. })).await;
    assert_eq!(event, QuotaEvent::StorageInitialized { origins: 0, recovered: true });
    assert!(store.storage_record().unwrap().is_some());

    let p = principal("https://a.test");
    write_simple_db(&quota, &p, PersistenceType::Default, b"ok").await;
    assert_eq!(read_simple_db(&quota, &p, PersistenceType::Default).await, b"ok");
}

#[tokio::test]
async fn open_queued_after_clear_waits_for_it() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let mut events = quota.subscribe();
    let p = principal("https://a.test");

    let held = quota
        .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();
    SimpleDb::open(held.path(), "data").unwrap().write(b"old").unwrap();

    let clear = quota.clear_storages_for_principal(&p, None, None);
    let reopen = tokio::spawn({
        let quota = quota.clone();
        let p = p.clone();
        async move { read_simple_db(&quota, &p, PersistenceType::Default).await }
    });

    timeout(WAIT, held.invalidated()).await.unwrap();
    drop(held);

    timeout(WAIT, clear).await.unwrap().unwrap();
    assert!(timeout(WAIT, reopen).await.unwrap().unwrap().is_empty());

    // The queued open is only granted after the clear finished.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            QuotaEvent::ClearFinished { .. } => order.push("clear"),
            QuotaEvent::ClientDirectoryOpened { .. } => order.push("open"),
            _ => {}
        }
    }
    assert_eq!(order, vec!["open", "clear", "open"]);
}

#[tokio::test]
async fn overlapping_clears_all_finish() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let a = principal("https://a.test");
    let b = principal("https://b.test");
    write_simple_db(&quota, &a, PersistenceType::Default, b"a").await;
    write_simple_db(&quota, &b, PersistenceType::Temporary, b"b").await;

    let by_origin = quota.clear_storages_for_principal(&a, None, None);
    let everything = quota.clear();
    let by_client = quota.clear_storages_for_client(&b, ClientType::SimpleDb, None);

    let (by_origin, everything, by_client) =
        tokio::join!(by_origin.finished(), everything.finished(), by_client.finished());
    assert_eq!(by_origin.unwrap().origins, vec![a.origin()]);
    assert_eq!(everything.unwrap().origins, vec![b.origin()]);
    assert!(by_client.unwrap().origins.is_empty());
    assert!(quota.list_origins().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_clear_keeps_data() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");

    let held = quota
        .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();
    SimpleDb::open(held.path(), "data").unwrap().write(b"keep").unwrap();

    let clear = quota.clear_storages_for_principal(&p, None, None);
    timeout(WAIT, held.invalidated()).await.unwrap();
    clear.cancel();
    assert!(matches!(timeout(WAIT, clear).await.unwrap(), Err(QuotaError::Aborted)));

    drop(held);
    assert_eq!(read_simple_db(&quota, &p, PersistenceType::Default).await, b"keep");
}

#[tokio::test]
async fn reset_invalidates_handles_and_keeps_disk_data() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let mut events = quota.subscribe();
    let p = principal("https://a.test");

    let held = quota
        .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();
    SimpleDb::open(held.path(), "data").unwrap().write(b"data").unwrap();

    let reset = quota.reset();
    timeout(WAIT, held.invalidated()).await.unwrap();
    assert!(matches!(held.checkpoint(), Err(QuotaError::Aborted)));
    drop(held);
    timeout(WAIT, reset).await.unwrap().unwrap();
    wait_for(&mut events, |e| *e == QuotaEvent::ManagerReset).await;

    let origins = quota.list_origins().await.unwrap();
    assert_eq!(origins.len(), 1);
    assert_eq!(origins[0].of(PersistenceType::Default, ClientType::SimpleDb), Some(4));
    assert_eq!(read_simple_db(&quota, &p, PersistenceType::Default).await, b"data");
}

#[tokio::test]
async fn base_domain_clear_covers_partitioned_origins() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let site = principal("https://www.example.com");
    let embedded = Principal::from_origin_string("https://cdn.test^partitionKey=https://example.com").unwrap();
    let other = principal("https://other.test");
    for p in [&site, &embedded, &other] {
        write_simple_db(&quota, p, PersistenceType::Default, b"x").await;
    }

    let summary = quota.clear_base_domain("Example.com").await.unwrap();
    assert_eq!(summary.origins, vec![embedded.origin(), site.origin()]);

    let left: Vec<String> = quota.list_origins().await.unwrap().into_iter().map(|o| o.origin).collect();
    assert_eq!(left, vec![other.origin()]);
}

#[cfg(feature = "sqlite_metadata")]
#[tokio::test]
async fn persisted_flag_survives_restart() {
    let root = tempfile::tempdir().unwrap();
    let cfg = QuotaConfig::builder()
        .storage_root(root.path())
        .metadata(MetadataBackend::Sqlite)
        .build()
        .unwrap();
    let p = principal("https://a.test");

    init_logger();
    let (quota, join) = QuotaManager::new(cfg.clone()).unwrap().start();
    write_simple_db(&quota, &p, PersistenceType::Persistent, b"kept").await;
    quota.persist(&p).await.unwrap();
    quota.shutdown().await.unwrap();
    join.await.unwrap();

    let quota = start(cfg);
    assert!(quota.persisted(&p).await.unwrap());
    let usage = quota.usage_for_principal(&p).await.unwrap();
    assert_eq!(usage.of(PersistenceType::Persistent, ClientType::SimpleDb), Some(4));
    assert!(usage.persisted);
}

#[tokio::test]
async fn slow_initialization_of_one_origin_does_not_hold_up_another() {
    let root = tempfile::tempdir().unwrap();
    let slow = principal("https://slow.test");
    let fast = principal("https://fast.test");
    let (gate_tx, gate_rx) = mpsc::channel();
    let gated = GatedIndexedDb {
        inner: IndexedDbClient::new(),
        gated_dir: StorageLayout::new(root.path()).client_dir(PersistenceType::Default, &slow.origin(), ClientType::IndexedDb),
        gate: Mutex::new(gate_rx),
    };
    let quota = start_manager(
        QuotaManager::new(config(root.path()))
            .unwrap()
            .with_participant(Arc::new(gated)),
    );
    let mut events = quota.subscribe();

    let slow_open = {
        let quota = quota.clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            quota
                .open_for_principal(&slow, ClientType::IndexedDb, PersistenceType::Default)
                .await
        })
    };
    let slow_origin = slow.origin();
    wait_for(&mut events, |e| {
        matches!(e, QuotaEvent::ClientDirectoryOpeningStarted { origin, .. } if *origin == slow_origin)
    })
    .await;

    let fast_dir = timeout(WAIT, quota.open_for_principal(&fast, ClientType::IndexedDb, PersistenceType::Default))
        .await
        .unwrap()
        .unwrap();
    assert!(fast_dir.path().is_dir());
    assert!(!slow_open.is_finished());

    gate_tx.send(()).unwrap();
    let slow_dir = timeout(WAIT, slow_open).await.unwrap().unwrap().unwrap();
    assert!(slow_dir.path().is_dir());
}

#[tokio::test]
async fn base_domain_clear_keeps_sites_sharing_a_public_suffix_apart() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let shop = principal("https://shop.example.co.kr");
    let bank = principal("https://bank.other.co.kr");
    for p in [&shop, &bank] {
        write_simple_db(&quota, p, PersistenceType::Default, b"x").await;
    }

    let summary = quota.clear_base_domain("co.kr").await.unwrap();
    assert!(summary.origins.is_empty());
    assert_eq!(quota.list_origins().await.unwrap().len(), 2);

    let summary = quota.clear_base_domain("example.co.kr").await.unwrap();
    assert_eq!(summary.origins, vec![shop.origin()]);
    let left: Vec<String> = quota.list_origins().await.unwrap().into_iter().map(|o| o.origin).collect();
    assert_eq!(left, vec![bank.origin()]);
    assert_eq!(read_simple_db(&quota, &bank, PersistenceType::Default).await, b"x");
}

#[tokio::test]
async fn persisted_flag_goes_with_the_default_persistence_row() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");
    quota.persist(&p).await.unwrap();

    quota
        .clear_storages_for_principal(&p, Some(PersistenceType::Temporary), None)
        .await
        .unwrap();
    assert!(quota.persisted(&p).await.unwrap());

    quota
        .clear_storages_for_principal(&p, Some(PersistenceType::Default), None)
        .await
        .unwrap();
    assert!(!quota.persisted(&p).await.unwrap());

    // The metadata store agrees with memory once storage is scanned again.
    quota.reset().await.unwrap();
    assert!(!quota.persisted(&p).await.unwrap());
}

#[tokio::test]
async fn persist_requested_after_a_clear_outlives_it() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");
    let held = quota
        .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();

    let clear = quota.clear_storages_for_principal(&p, None, None);
    let persist = {
        let quota = quota.clone();
        let p = p.clone();
        tokio::spawn(async move { quota.persist(&p).await })
    };

    timeout(WAIT, held.invalidated()).await.unwrap();
    drop(held);
    timeout(WAIT, clear).await.unwrap().unwrap();
    timeout(WAIT, persist).await.unwrap().unwrap().unwrap();

    assert!(quota.persisted(&p).await.unwrap());
    quota.reset().await.unwrap();
    assert!(quota.persisted(&p).await.unwrap());
}

#[tokio::test]
async fn reset_scans_storage_before_a_queued_clear_deletes() {
    let root = tempfile::tempdir().unwrap();
    let quota = start(config(root.path()));
    let p = principal("https://a.test");
    write_simple_db(&quota, &p, PersistenceType::Default, b"data").await;
    let held = quota
        .open_for_principal(&p, ClientType::SimpleDb, PersistenceType::Default)
        .await
        .unwrap();
    let mut events = quota.subscribe();

    let reset = quota.reset();
    let clear = quota.clear();
    timeout(WAIT, held.invalidated()).await.unwrap();
    drop(held);
    timeout(WAIT, reset).await.unwrap().unwrap();
    let summary = timeout(WAIT, clear).await.unwrap().unwrap();
    assert_eq!(summary.origins, vec![p.origin()]);

    let mut seen = Vec::new();
    loop {
        let event = wait_for(&mut events, |_| true).await;
        let finished = matches!(event, QuotaEvent::ClearFinished { .. });
        seen.push(event);
        if finished {
            break;
        }
    }
    let position = |wanted: &dyn Fn(&QuotaEvent) -> bool| seen.iter().position(|e| wanted(e)).unwrap();
    let reset_at = position(&|e: &QuotaEvent| *e == QuotaEvent::ManagerReset);
    let initialized_at = position(&|e: &QuotaEvent| matches!(e, QuotaEvent::StorageInitialized { origins: 1, .. }));
    let deleting_at = position(&|e: &QuotaEvent| matches!(e, QuotaEvent::ClearStateChanged { state: ClearState::Deleting, .. }));
    assert!(reset_at < initialized_at);
    assert!(initialized_at < deleting_at);

    assert!(quota.list_origins().await.unwrap().is_empty());
    assert!(StorageLayout::new(root.path()).scan().unwrap().is_empty());
}

#[tokio::test]
async fn local_storage_preload_lives_while_the_directory_is_open() {
    let root = tempfile::tempdir().unwrap();
    let local_storage = Arc::new(LocalStorageClient::new());
    let quota = start_manager(
        QuotaManager::new(config(root.path()))
            .unwrap()
            .with_participant(local_storage.clone()),
    );
    let p = principal("https://a.test");

    let first = quota
        .open_for_principal(&p, ClientType::LocalStorage, PersistenceType::Default)
        .await
        .unwrap();
    let second = quota
        .open_for_principal(&p, ClientType::LocalStorage, PersistenceType::Default)
        .await
        .unwrap();
    let path = first.path().to_path_buf();
    assert_eq!(local_storage.preloaded(&path), Some(BTreeMap::new()));

    let items = BTreeMap::from([("theme".to_string(), "dark".to_string())]);
    local_storage.write_items(&path, &items).unwrap();
    assert_eq!(local_storage.preloaded(&path), Some(items.clone()));

    // Releases are handled before the next command, so a round trip orders them.
    drop(first);
    quota.list_origins().await.unwrap();
    assert!(local_storage.preloaded(&path).is_some());

    drop(second);
    quota.list_origins().await.unwrap();
    assert_eq!(local_storage.preloaded(&path), None);

    let reopened = quota
        .open_for_principal(&p, ClientType::LocalStorage, PersistenceType::Default)
        .await
        .unwrap();
    assert_eq!(local_storage.preloaded(reopened.path()), Some(items));
}
