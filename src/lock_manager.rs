//! Block-granularity shared/exclusive locking. The lock table keeps one
//! integer per locked block (-1 = exclusive, n ≥ 1 = n shared holders)
//! and parks waiters on a condition variable with a hard deadline. The
//! concurrency manager wraps the table with a per-transaction ledger
//! enforcing two-phase locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StorageError};
use crate::store::BlockId;

/// How long a lock acquisition waits before timing out. There is no
/// deadlock detection; this bound is the backstop, so long-running
/// transactions risk timeouts.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(10);

/// What the lock table currently knows about one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Exclusive,
    Shared(i32),
    Unlocked,
}

pub struct LockTable {
    locks: Mutex<HashMap<BlockId, i32>>,
    released: Condvar,
    max_wait: Duration,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::with_max_wait(MAX_LOCK_WAIT)
    }

    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            max_wait,
        }
    }

    fn value_of(locks: &HashMap<BlockId, i32>, blk: &BlockId) -> i32 {
        locks.get(blk).copied().unwrap_or(0)
    }

    fn has_x_lock(locks: &HashMap<BlockId, i32>, blk: &BlockId) -> bool {
        Self::value_of(locks, blk) < 0
    }

    /// Anything besides "unlocked" or "exactly one shared holder" blocks
    /// an exclusive request; the single-shared case is the upgrade slot.
    fn has_other_locks(locks: &HashMap<BlockId, i32>, blk: &BlockId) -> bool {
        let value = Self::value_of(locks, blk);
        value != 0 && value != 1
    }

    /// Acquires a shared lock, waiting out any exclusive holder.
    pub fn s_lock(&self, blk: &BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        let deadline = Instant::now() + self.max_wait;
        while Self::has_x_lock(&locks, blk) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout(blk.clone()));
            }
            self.released.wait_for(&mut locks, deadline - now);
        }
        let value = Self::value_of(&locks, blk);
        locks.insert(blk.clone(), value.max(0) + 1);
        Ok(())
    }

    /// Acquires an exclusive lock. The caller is expected to already
    /// hold the single shared lock being upgraded; the concurrency
    /// manager enforces that discipline.
    pub fn x_lock(&self, blk: &BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        let deadline = Instant::now() + self.max_wait;
        while Self::has_other_locks(&locks, blk) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout(blk.clone()));
            }
            self.released.wait_for(&mut locks, deadline - now);
        }
        locks.insert(blk.clone(), -1);
        Ok(())
    }

    /// Releases one hold on the block, waking waiters when it becomes
    /// free.
    pub fn unlock(&self, blk: &BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        let value = Self::value_of(&locks, blk);
        if value == 0 {
            return Err(StorageError::LockNotHeld(blk.clone()));
        }
        if value > 1 {
            locks.insert(blk.clone(), value - 1);
        } else {
            locks.remove(blk);
        }
        // An exclusive waiter can proceed once a single shared holder
        // remains (the upgrade slot), so every release wakes waiters;
        // they revalidate under the lock.
        self.released.notify_all();
        Ok(())
    }

    pub fn info(&self, blk: &BlockId) -> LockStatus {
        let locks = self.locks.lock();
        match Self::value_of(&locks, blk) {
            v if v < 0 => LockStatus::Exclusive,
            0 => LockStatus::Unlocked,
            v => LockStatus::Shared(v),
        }
    }
}

/// The kind of lock a transaction holds on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Per-transaction lock ledger. Locks accumulate until [`release`] at
/// transaction end; re-locking is idempotent and a shared lock upgrades
/// in place to exclusive, never the other way around.
///
/// [`release`]: ConcurrencyManager::release
pub struct ConcurrencyManager {
    table: Arc<LockTable>,
    held: Mutex<HashMap<BlockId, LockKind>>,
}

impl ConcurrencyManager {
    pub fn new(table: Arc<LockTable>) -> Self {
        Self {
            table,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a shared lock unless this transaction already holds any
    /// lock on the block.
    pub fn s_lock(&self, blk: &BlockId) -> Result<()> {
        let mut held = self.held.lock();
        if held.contains_key(blk) {
            return Ok(());
        }
        self.table.s_lock(blk)?;
        held.insert(blk.clone(), LockKind::Shared);
        Ok(())
    }

    /// Takes an exclusive lock, upgrading from this transaction's own
    /// shared hold when present.
    pub fn x_lock(&self, blk: &BlockId) -> Result<()> {
        let mut held = self.held.lock();
        if held.get(blk) == Some(&LockKind::Exclusive) {
            return Ok(());
        }
        if !held.contains_key(blk) {
            self.table.s_lock(blk)?;
            held.insert(blk.clone(), LockKind::Shared);
        }
        self.table.x_lock(blk)?;
        held.insert(blk.clone(), LockKind::Exclusive);
        Ok(())
    }

    /// Releases every lock in the ledger. Individual unlock failures are
    /// collected and reported as one aggregate; the ledger is cleared
    /// regardless.
    pub fn release(&self) -> Result<()> {
        let mut held = self.held.lock();
        let mut errors = Vec::new();
        for (blk, _) in held.drain() {
            if let Err(e) = self.table.unlock(&blk) {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(StorageError::Aggregate(errors)),
        }
    }

    pub fn lock_kind(&self, blk: &BlockId) -> Option<LockKind> {
        self.held.lock().get(blk).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn blk() -> BlockId {
        BlockId::new("f", 0)
    }

    #[test]
    fn shared_locks_compose() {
        let table = LockTable::new();
        let b = blk();
        table.s_lock(&b).unwrap();
        table.s_lock(&b).unwrap();
        table.s_lock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Shared(3));
        table.unlock(&b).unwrap();
        table.unlock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Shared(1));
        table.unlock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Unlocked);
    }

    #[test]
    fn x_lock_excludes_readers() {
        let table = Arc::new(LockTable::with_max_wait(Duration::from_millis(200)));
        let b = blk();
        table.x_lock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Exclusive);

        let t = {
            let table = Arc::clone(&table);
            let b = b.clone();
            thread::spawn(move || table.s_lock(&b))
        };
        assert!(matches!(
            t.join().unwrap(),
            Err(StorageError::LockTimeout(_))
        ));
    }

    #[test]
    fn x_lock_waits_for_other_shared_holders() {
        let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(5)));
        let b = blk();
        table.s_lock(&b).unwrap();
        table.s_lock(&b).unwrap();

        let writer = {
            let table = Arc::clone(&table);
            let b = b.clone();
            thread::spawn(move || {
                // two shared holders: an exclusive request must wait
                table.x_lock(&b)
            })
        };
        thread::sleep(Duration::from_millis(100));
        table.unlock(&b).unwrap();
        // one shared holder remains: that is the upgrade slot, so the
        // writer may now proceed
        writer.join().unwrap().unwrap();
        assert_eq!(table.info(&b), LockStatus::Exclusive);
    }

    #[test]
    fn unlock_of_unlocked_block_is_an_error() {
        let table = LockTable::new();
        assert!(matches!(
            table.unlock(&blk()),
            Err(StorageError::LockNotHeld(_))
        ));
    }

    #[test]
    fn ledger_makes_relocking_idempotent() {
        let table = Arc::new(LockTable::new());
        let cm = ConcurrencyManager::new(Arc::clone(&table));
        let b = blk();

        cm.s_lock(&b).unwrap();
        cm.s_lock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Shared(1));
        assert_eq!(cm.lock_kind(&b), Some(LockKind::Shared));

        cm.x_lock(&b).unwrap();
        cm.x_lock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Exclusive);
        assert_eq!(cm.lock_kind(&b), Some(LockKind::Exclusive));

        cm.release().unwrap();
        assert_eq!(table.info(&b), LockStatus::Unlocked);
        assert_eq!(cm.lock_kind(&b), None);
    }

    #[test]
    fn x_lock_after_own_s_lock_upgrades() {
        let table = Arc::new(LockTable::new());
        let cm = ConcurrencyManager::new(Arc::clone(&table));
        let b = blk();
        cm.s_lock(&b).unwrap();
        cm.x_lock(&b).unwrap();
        assert_eq!(table.info(&b), LockStatus::Exclusive);
        cm.release().unwrap();
    }

    #[test]
    fn release_never_downgrades_mid_transaction() {
        let table = Arc::new(LockTable::new());
        let cm = ConcurrencyManager::new(Arc::clone(&table));
        let a = BlockId::new("f", 1);
        let b = BlockId::new("f", 2);
        cm.s_lock(&a).unwrap();
        cm.x_lock(&b).unwrap();
        // both stay held until release
        assert_eq!(table.info(&a), LockStatus::Shared(1));
        assert_eq!(table.info(&b), LockStatus::Exclusive);
        cm.release().unwrap();
        assert_eq!(table.info(&a), LockStatus::Unlocked);
        assert_eq!(table.info(&b), LockStatus::Unlocked);
    }
}
