//! Directory locks.
//!
//! A [`DirectoryLock`] is an in-memory lease on one or more storage directories,
//! identified by a [`DirectoryLockKey`]. Locks are handed out by the
//! [`LockTable`], which lives inside the quota manager task. Callers receive a
//! [`PendingLock`] immediately and await [`PendingLock::acquired`] to learn
//! whether the lock was granted or invalidated by a clear.
//!
//! Dropping either handle releases the lock: the handle sends its id back to the
//! manager over an unbounded channel, so release works from `Drop`.
//!
//! Holders of an acquired lock must watch [`DirectoryLock::invalidated`] (or poll
//! [`DirectoryLock::checkpoint`]) and drop the lock as soon as possible once it
//! fires; a clear waiting on that lock cannot make progress before.
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::quota::errors::{QuotaError, QuotaResult};
use crate::quota::types::LockMode;

/// Lock key and overlap rules.
pub mod key;
/// Lock arbitration.
pub mod table;

pub use key::{DirectoryLockKey, OriginScope};
pub use table::{LockState, LockTable};

/// Monotonically increasing lock sequence number; lower ids were requested earlier.
pub type LockId = u64;

/// Channel on which dropped lock handles report their id to the manager.
pub type LockReleaser = mpsc::UnboundedSender<LockId>;

struct ReleaseGuard {
    id: LockId,
    releaser: LockReleaser,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // The manager may already be gone; nothing left to release then.
        let _ = self.releaser.send(self.id);
    }
}

/// A requested lock that has not been granted yet.
pub struct PendingLock {
    guard: ReleaseGuard,
    key: DirectoryLockKey,
    mode: LockMode,
    token: CancellationToken,
    rx: oneshot::Receiver<QuotaResult<()>>,
}

impl PendingLock {
    pub(crate) fn new(
        id: LockId,
        key: DirectoryLockKey,
        mode: LockMode,
        token: CancellationToken,
        rx: oneshot::Receiver<QuotaResult<()>>,
        releaser: LockReleaser,
    ) -> Self {
        Self {
            guard: ReleaseGuard { id, releaser },
            key,
            mode,
            token,
            rx,
        }
    }

    pub fn id(&self) -> LockId {
        self.guard.id
    }

    pub fn key(&self) -> &DirectoryLockKey {
        &self.key
    }

    /// Waits until the lock is granted. Fails with [`QuotaError::Aborted`] when the
    /// lock is invalidated while still pending.
    pub async fn acquired(self) -> QuotaResult<DirectoryLock> {
        let PendingLock { guard, key, mode, token, rx } = self;
        match rx.await {
            Ok(Ok(())) => Ok(DirectoryLock { guard, key, mode, token }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QuotaError::ChannelClosed),
        }
    }
}

impl std::fmt::Debug for PendingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLock")
            .field("id", &self.guard.id)
            .field("key", &self.key.to_string())
            .field("mode", &self.mode)
            .finish()
    }
}

/// A granted lock. Released when dropped.
pub struct DirectoryLock {
    guard: ReleaseGuard,
    key: DirectoryLockKey,
    mode: LockMode,
    token: CancellationToken,
}

impl DirectoryLock {
    pub fn id(&self) -> LockId {
        self.guard.id
    }

    pub fn key(&self) -> &DirectoryLockKey {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_invalidated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a clear, reset or shutdown has invalidated this lock.
    pub fn invalidated(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Safe point for long running work: errors out if the lock was invalidated.
    pub fn checkpoint(&self) -> QuotaResult<()> {
        if self.token.is_cancelled() {
            Err(QuotaError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Detached view of the invalidation flag for work running off the manager task.
    pub fn checkpoint_handle(&self) -> Checkpoint {
        Checkpoint(self.token.clone())
    }

    /// Releases the lock. Equivalent to dropping it.
    pub fn release(self) {}
}

/// Invalidation flag of a lock, usable from blocking I/O code.
#[derive(Clone, Debug)]
pub struct Checkpoint(CancellationToken);

impl Checkpoint {
    /// A checkpoint that never fires.
    pub fn never() -> Self {
        Checkpoint(CancellationToken::new())
    }

    pub fn check(&self) -> QuotaResult<()> {
        if self.0.is_cancelled() {
            Err(QuotaError::Aborted)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

impl std::fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLock")
            .field("id", &self.guard.id)
            .field("key", &self.key.to_string())
            .field("mode", &self.mode)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
