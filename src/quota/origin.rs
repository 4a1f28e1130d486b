//! Origin bookkeeping.
//!
//! The [`OriginRegistry`] holds one [`OriginInfo`] per origin the manager knows
//! about, either because its directory was found when storage was initialized
//! or because something tried to open it. It is owned by the manager task and
//! never shared.
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::quota::lock::DirectoryLockKey;
use crate::quota::metadata::PERSISTED_FLAG_PERSISTENCE;
use crate::quota::opener::OpenId;
use crate::quota::principal::OriginMetadata;
use crate::quota::types::{ClientType, PersistenceType};

/// State of one `(persistence type, client type)` directory of an origin.
#[derive(Debug, Default)]
pub struct ClientSlot {
    /// The directory was initialized and may be opened without running an opener.
    pub initialized: bool,
    /// Open whose heavy opener is running for this directory.
    pub opening: Option<OpenId>,
    /// Opens holding a lock that wait for `opening` to finish.
    pub waiters: VecDeque<OpenId>,
    /// Client directory handles currently handed out.
    pub open_handles: usize,
    /// Last measured usage in bytes, if measured.
    pub usage: Option<u64>,
}

impl ClientSlot {
    fn is_idle(&self) -> bool {
        self.opening.is_none() && self.waiters.is_empty() && self.open_handles == 0
    }
}

#[derive(Debug)]
pub struct OriginInfo {
    metadata: OriginMetadata,
    slots: BTreeMap<(PersistenceType, ClientType), ClientSlot>,
    lock_refs: usize,
    persisted: bool,
    last_access: u64,
}

impl OriginInfo {
    pub fn new(metadata: OriginMetadata) -> Self {
        Self {
            metadata,
            slots: BTreeMap::new(),
            lock_refs: 0,
            persisted: false,
            last_access: 0,
        }
    }

    pub fn metadata(&self) -> &OriginMetadata {
        &self.metadata
    }

    pub fn slot(&self, persistence: PersistenceType, client: ClientType) -> Option<&ClientSlot> {
        self.slots.get(&(persistence, client))
    }

    pub fn slot_mut(&mut self, persistence: PersistenceType, client: ClientType) -> &mut ClientSlot {
        self.slots.entry((persistence, client)).or_default()
    }

    pub fn is_opening(&self, persistence: PersistenceType, client: ClientType) -> bool {
        self.slot(persistence, client).is_some_and(|s| s.opening.is_some())
    }

    /// Client directories that are handed out or being opened.
    pub fn active_clients(&self) -> Vec<(PersistenceType, ClientType)> {
        self.slots
            .iter()
            .filter(|(_, s)| !s.is_idle())
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn set_usage(&mut self, persistence: PersistenceType, client: ClientType, usage: u64) {
        self.slot_mut(persistence, client).usage = Some(usage);
    }

    /// Forgets every measured usage, e.g. before a fresh measurement.
    pub fn reset_usage(&mut self) {
        for slot in self.slots.values_mut() {
            slot.usage = None;
        }
    }

    pub fn usage(&self) -> u64 {
        self.slots.values().filter_map(|s| s.usage).sum()
    }

    pub fn lock_refs(&self) -> usize {
        self.lock_refs
    }

    pub fn persisted(&self) -> bool {
        self.persisted
    }

    pub fn set_persisted(&mut self, persisted: bool) {
        self.persisted = persisted;
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn touch(&mut self, now: u64) {
        self.last_access = self.last_access.max(now);
    }

    /// Nothing references the origin and nothing about it is tracked anymore.
    pub fn is_unused(&self) -> bool {
        self.lock_refs == 0
            && !self.persisted
            && self.slots.values().all(|s| s.is_idle() && s.usage.is_none() && !s.initialized)
    }

    pub fn snapshot(&self) -> OriginUsage {
        OriginUsage {
            origin: self.metadata.origin.clone(),
            base_domain: self.metadata.base_domain.clone(),
            persisted: self.persisted,
            last_access: self.last_access,
            clients: self
                .slots
                .iter()
                .filter_map(|(&(persistence, client), slot)| {
                    slot.usage.map(|bytes| ClientUsage { persistence, client, bytes })
                })
                .collect(),
        }
    }

    /// Forgets the directories covered by `key`. Returns true if any were tracked.
    fn forget(&mut self, key: &DirectoryLockKey) -> bool {
        let before = self.slots.len();
        let metadata = &self.metadata;
        self.slots
            .retain(|&(persistence, client), _| !key.covers(persistence, metadata, Some(client)));

        // The persisted flag lives on the default persistence row, which an
        // origin-wide clear covering that persistence type removes.
        let mut changed = self.slots.len() != before;
        let drops_flag_row = key.client.is_none()
            && key.persistence.map_or(true, |p| p == PERSISTED_FLAG_PERSISTENCE);
        if drops_flag_row && self.persisted {
            self.persisted = false;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUsage {
    pub persistence: PersistenceType,
    pub client: ClientType,
    pub bytes: u64,
}

/// Usage report of one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginUsage {
    pub origin: String,
    pub base_domain: String,
    pub persisted: bool,
    pub last_access: u64,
    pub clients: Vec<ClientUsage>,
}

impl OriginUsage {
    pub fn total(&self) -> u64 {
        self.clients.iter().map(|c| c.bytes).sum()
    }

    pub fn of(&self, persistence: PersistenceType, client: ClientType) -> Option<u64> {
        self.clients
            .iter()
            .find(|c| c.persistence == persistence && c.client == client)
            .map(|c| c.bytes)
    }
}

#[derive(Debug, Default)]
pub struct OriginRegistry {
    origins: HashMap<String, OriginInfo>,
}

impl OriginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &str) -> Option<&OriginInfo> {
        self.origins.get(origin)
    }

    pub fn get_mut(&mut self, origin: &str) -> Option<&mut OriginInfo> {
        self.origins.get_mut(origin)
    }

    pub fn ensure(&mut self, metadata: &OriginMetadata) -> &mut OriginInfo {
        self.origins
            .entry(metadata.origin.clone())
            .or_insert_with(|| OriginInfo::new(metadata.clone()))
    }

    pub fn add_lock_ref(&mut self, metadata: &OriginMetadata) {
        self.ensure(metadata).lock_refs += 1;
    }

    /// Drops one lock reference and evicts the origin if it became unused.
    pub fn drop_lock_ref(&mut self, origin: &str) {
        if let Some(info) = self.origins.get_mut(origin) {
            info.lock_refs = info.lock_refs.saturating_sub(1);
        }
        self.evict_if_unused(origin);
    }

    pub fn evict_if_unused(&mut self, origin: &str) -> bool {
        if self.origins.get(origin).is_some_and(OriginInfo::is_unused) {
            self.origins.remove(origin);
            return true;
        }
        false
    }

    /// Forgets everything covered by `key` and returns the affected origins, sorted.
    pub fn clear_matching(&mut self, key: &DirectoryLockKey) -> Vec<String> {
        let mut cleared: Vec<String> = self
            .origins
            .iter_mut()
            .filter(|(_, info)| key.origin.matches(&info.metadata))
            .filter_map(|(origin, info)| info.forget(key).then(|| origin.clone()))
            .collect();
        cleared.sort();

        let matching: Vec<String> = self
            .origins
            .iter()
            .filter(|(_, info)| key.origin.matches(&info.metadata))
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in matching {
            self.evict_if_unused(&origin);
        }
        cleared
    }

    pub fn snapshot(&self) -> Vec<OriginUsage> {
        let mut all: Vec<OriginUsage> = self.origins.values().map(OriginInfo::snapshot).collect();
        all.sort_by(|a, b| a.origin.cmp(&b.origin));
        all
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OriginInfo> {
        self.origins.values_mut()
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn clear(&mut self) {
        self.origins.clear();
    }
}
