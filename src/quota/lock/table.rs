use std::collections::BTreeMap;

use log::{debug, trace};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::lock::{DirectoryLockKey, LockId, LockReleaser, PendingLock};
use crate::quota::types::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Pending,
    Acquired,
    /// Acquired, but a clear wants the holder to unwind and release.
    Invalidated,
    Released,
}

struct LockEntry {
    key: DirectoryLockKey,
    mode: LockMode,
    state: LockState,
    invalidatable: bool,
    token: CancellationToken,
    waiter: Option<oneshot::Sender<QuotaResult<()>>>,
}

/// Arbitrates directory locks.
///
/// A lock is granted once no earlier lock (pending or held) with an overlapping
/// key conflicts with it. Entries are kept in id order, so waiters on a key are
/// served strictly first come, first served.
pub struct LockTable {
    next_id: LockId,
    entries: BTreeMap<LockId, LockEntry>,
    releaser: LockReleaser,
}

impl LockTable {
    pub fn new(releaser: LockReleaser) -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            releaser,
        }
    }

    /// Requests a lock. Never blocks; the returned handle resolves once granted.
    ///
    /// Locks that are not `invalidatable` (the ones clears take for themselves) are
    /// skipped by [`invalidate`](Self::invalidate) and simply queue.
    pub fn acquire(&mut self, key: DirectoryLockKey, mode: LockMode, invalidatable: bool) -> PendingLock {
        let id = self.next_id;
        self.next_id += 1;

        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let (state, waiter) = if self.is_blocked(id, &key, mode) {
            debug!("lock {id} on {key} ({mode:?}) queued");
            (LockState::Pending, Some(tx))
        } else {
            trace!("lock {id} on {key} ({mode:?}) granted immediately");
            let _ = tx.send(Ok(()));
            (LockState::Acquired, None)
        };

        self.entries.insert(
            id,
            LockEntry {
                key: key.clone(),
                mode,
                state,
                invalidatable,
                token: token.clone(),
                waiter,
            },
        );

        PendingLock::new(id, key, mode, token, rx, self.releaser.clone())
    }

    /// Removes a lock, pending or held, and grants whatever it was blocking.
    /// Returns false if the lock was already gone.
    pub fn release(&mut self, id: LockId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        trace!("lock {id} on {} released (was {:?})", entry.key, entry.state);
        self.promote();
        true
    }

    /// Invalidates every invalidatable lock overlapping `key`. Pending locks fail with
    /// [`QuotaError::Aborted`] and leave the table; held locks have their token
    /// cancelled and stay until their holder releases them.
    ///
    /// Returns the number of locks invalidated.
    pub fn invalidate(&mut self, key: &DirectoryLockKey) -> usize {
        let mut failed = Vec::new();
        let mut count = 0;

        for (id, entry) in self.entries.iter_mut() {
            if !entry.invalidatable || !entry.key.overlaps(key) {
                continue;
            }
            match entry.state {
                LockState::Pending => failed.push(*id),
                LockState::Acquired => entry.state = LockState::Invalidated,
                LockState::Invalidated | LockState::Released => continue,
            }
            entry.token.cancel();
            count += 1;
        }

        for id in failed {
            if let Some(mut entry) = self.entries.remove(&id) {
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Err(QuotaError::Aborted));
                }
            }
        }

        if count > 0 {
            debug!("invalidated {count} lock(s) overlapping {key}");
            self.promote();
        }
        count
    }

    /// Invalidates every invalidatable lock in the table.
    pub fn invalidate_all(&mut self) -> usize {
        self.invalidate(&DirectoryLockKey::everything())
    }

    pub fn state(&self, id: LockId) -> LockState {
        self.entries.get(&id).map_or(LockState::Released, |e| e.state)
    }

    pub fn key(&self, id: LockId) -> Option<&DirectoryLockKey> {
        self.entries.get(&id).map(|e| &e.key)
    }

    /// True if any lock (held or pending) overlaps `key`.
    pub fn has_overlapping(&self, key: &DirectoryLockKey) -> bool {
        self.entries.values().any(|e| e.key.overlaps(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_blocked(&self, id: LockId, key: &DirectoryLockKey, mode: LockMode) -> bool {
        self.entries
            .range(..id)
            .any(|(_, e)| e.mode.conflicts_with(mode) && e.key.overlaps(key))
    }

    fn promote(&mut self) {
        let pending: Vec<LockId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == LockState::Pending)
            .map(|(id, _)| *id)
            .collect();

        for id in pending {
            let (key, mode) = match self.entries.get(&id) {
                Some(e) => (e.key.clone(), e.mode),
                None => continue,
            };
            if self.is_blocked(id, &key, mode) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = LockState::Acquired;
                if let Some(waiter) = entry.waiter.take() {
                    // A dropped receiver means the handle is gone and its release is on the way.
                    let _ = waiter.send(Ok(()));
                }
                debug!("lock {id} on {key} ({mode:?}) granted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::lock::LockId;
    use crate::quota::principal::Principal;
    use crate::quota::types::{ClientType, PersistenceType};
    use futures::FutureExt;
    use tokio::sync::mpsc;

    fn table() -> (LockTable, mpsc::UnboundedReceiver<LockId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LockTable::new(tx), rx)
    }

    fn key(origin: &str, client: ClientType) -> DirectoryLockKey {
        DirectoryLockKey::client(&Principal::from_url(origin).unwrap(), PersistenceType::Default, client)
    }

    /// Drains release notifications the way the manager loop does.
    fn pump(table: &mut LockTable, rx: &mut mpsc::UnboundedReceiver<LockId>) {
        while let Ok(id) = rx.try_recv() {
            table.release(id);
        }
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let (mut t, _rx) = table();
        let k = key("https://a.test", ClientType::IndexedDb);

        let a = t.acquire(k.clone(), LockMode::Shared, true);
        let b = t.acquire(k.clone(), LockMode::Shared, true);
        assert_eq!(t.state(a.id()), LockState::Acquired);
        assert_eq!(t.state(b.id()), LockState::Acquired);

        let a = a.acquired().await.unwrap();
        let b = b.acquired().await.unwrap();
        assert!(!a.is_invalidated() && !b.is_invalidated());
    }

    #[tokio::test]
    async fn exclusive_waits_for_shared_and_later_shared_waits_for_exclusive() {
        let (mut t, mut rx) = table();
        let k = key("https://a.test", ClientType::IndexedDb);

        let shared = t.acquire(k.clone(), LockMode::Shared, true).acquired().await.unwrap();
        let exclusive = t.acquire(k.clone(), LockMode::Exclusive, false);
        let late_shared = t.acquire(k.clone(), LockMode::Shared, true);

        assert_eq!(t.state(exclusive.id()), LockState::Pending);
        assert_eq!(t.state(late_shared.id()), LockState::Pending);

        drop(shared);
        pump(&mut t, &mut rx);
        assert_eq!(t.state(exclusive.id()), LockState::Acquired);
        assert_eq!(t.state(late_shared.id()), LockState::Pending);

        let exclusive = exclusive.acquired().await.unwrap();
        drop(exclusive);
        pump(&mut t, &mut rx);
        assert_eq!(t.state(late_shared.id()), LockState::Acquired);
    }

    #[tokio::test]
    async fn exclusive_waiters_are_granted_in_request_order() {
        let (mut t, mut rx) = table();
        let k = key("https://a.test", ClientType::SimpleDb);

        let holder = t.acquire(k.clone(), LockMode::Exclusive, true).acquired().await.unwrap();
        let a = t.acquire(k.clone(), LockMode::Exclusive, true);
        let b = t.acquire(k.clone(), LockMode::Exclusive, true);
        let c = t.acquire(k.clone(), LockMode::Exclusive, true);
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
        assert!(a_id < b_id && b_id < c_id);

        drop(holder);
        pump(&mut t, &mut rx);
        assert_eq!(t.state(a_id), LockState::Acquired);
        assert_eq!(t.state(b_id), LockState::Pending);
        assert_eq!(t.state(c_id), LockState::Pending);

        drop(a.acquired().await.unwrap());
        pump(&mut t, &mut rx);
        assert_eq!(t.state(b_id), LockState::Acquired);
        assert_eq!(t.state(c_id), LockState::Pending);

        drop(b.acquired().await.unwrap());
        pump(&mut t, &mut rx);
        assert_eq!(t.state(c_id), LockState::Acquired);
        assert!(c.acquired().now_or_never().is_some());
    }

    #[tokio::test]
    async fn unrelated_keys_never_block() {
        let (mut t, _rx) = table();
        let _a = t.acquire(key("https://a.test", ClientType::IndexedDb), LockMode::Exclusive, true);
        let b = t.acquire(key("https://b.test", ClientType::IndexedDb), LockMode::Exclusive, true);
        let c = t.acquire(key("https://a.test", ClientType::Cache), LockMode::Exclusive, true);
        assert_eq!(t.state(b.id()), LockState::Acquired);
        assert_eq!(t.state(c.id()), LockState::Acquired);
    }

    #[tokio::test]
    async fn invalidation_fails_pending_and_signals_held_locks() {
        let (mut t, mut rx) = table();
        let k = key("https://a.test", ClientType::IndexedDb);

        let blocker = t.acquire(k.clone(), LockMode::Exclusive, false).acquired().await.unwrap();
        let held_elsewhere = t
            .acquire(key("https://a.test", ClientType::Cache), LockMode::Shared, true)
            .acquired()
            .await
            .unwrap();
        let pending = t.acquire(k.clone(), LockMode::Shared, true);
        let pending_id = pending.id();

        let n = t.invalidate(&DirectoryLockKey::origin(&Principal::from_url("https://a.test").unwrap()));
        assert_eq!(n, 2);

        assert!(matches!(pending.acquired().await, Err(QuotaError::Aborted)));
        assert_eq!(t.state(pending_id), LockState::Released);
        assert!(held_elsewhere.is_invalidated());
        assert!(held_elsewhere.checkpoint().is_err());
        assert_eq!(t.state(held_elsewhere.id()), LockState::Invalidated);

        // Non-invalidatable locks are untouched.
        assert!(!blocker.is_invalidated());

        // Invalidated locks stay until their holder lets go.
        let held_id = held_elsewhere.id();
        drop(held_elsewhere);
        pump(&mut t, &mut rx);
        assert_eq!(t.state(held_id), LockState::Released);
    }

    #[tokio::test]
    async fn dropping_a_pending_handle_unblocks_followers() {
        let (mut t, mut rx) = table();
        let k = key("https://a.test", ClientType::IndexedDb);

        let holder = t.acquire(k.clone(), LockMode::Shared, true).acquired().await.unwrap();
        let abandoned = t.acquire(k.clone(), LockMode::Exclusive, false);
        let follower = t.acquire(k.clone(), LockMode::Shared, true);
        assert_eq!(t.state(follower.id()), LockState::Pending);

        drop(abandoned);
        pump(&mut t, &mut rx);
        assert_eq!(t.state(follower.id()), LockState::Acquired);
        drop(holder);
    }
}
