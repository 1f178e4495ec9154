//! The transaction facade. Coordinates pinning (through a
//! transaction-local buffer list), block locking, logging, recovery, and
//! cell updates. One value per transaction; many transactions may run
//! concurrently, each on its own thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::buffer_pool::{BufferHandle, BufferPool};
use crate::cell::{Cell, CellValue};
use crate::error::{Result, StorageError};
use crate::lock_manager::{ConcurrencyManager, LockTable};
use crate::recovery::RecoveryManager;
use crate::store::{BlockId, BlockStore};
use crate::wal::WalManager;

/// Sentinel block number standing in for a file's end, used to serialize
/// size checks against appends.
pub const END_OF_FILE: u32 = u32::MAX;

static NEXT_TX_NUM: AtomicI64 = AtomicI64::new(0);

fn next_tx_number() -> i64 {
    NEXT_TX_NUM.fetch_add(1, Ordering::SeqCst) + 1
}

/// The blocks this transaction has pinned. Pinning is idempotent: a
/// block pinned twice holds a single pool pin until unpinned.
struct BufferList {
    pool: Arc<BufferPool>,
    pinned: Mutex<HashMap<BlockId, BufferHandle>>,
}

impl BufferList {
    fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            pinned: Mutex::new(HashMap::new()),
        }
    }

    fn pin(&self, blk: &BlockId) -> Result<()> {
        let mut pinned = self.pinned.lock();
        if pinned.contains_key(blk) {
            return Ok(());
        }
        let handle = self.pool.pin(blk)?;
        pinned.insert(blk.clone(), handle);
        Ok(())
    }

    fn unpin(&self, blk: &BlockId) -> Result<()> {
        if let Some(handle) = self.pinned.lock().remove(blk) {
            self.pool.unpin(&handle)?;
        }
        Ok(())
    }

    fn handle(&self, blk: &BlockId) -> Option<BufferHandle> {
        self.pinned.lock().get(blk).cloned()
    }

    fn unpin_all(&self) {
        for (blk, handle) in self.pinned.lock().drain() {
            if let Err(e) = self.pool.unpin(&handle) {
                warn!("unpinning {blk} at transaction end: {e}");
            }
        }
    }
}

pub struct Transaction {
    store: Arc<BlockStore>,
    pool: Arc<BufferPool>,
    recovery: RecoveryManager,
    concurrency: ConcurrencyManager,
    buffers: BufferList,
    txnum: i64,
}

impl Transaction {
    /// Starts a new transaction, assigning it the next id from the
    /// process-wide counter and logging its start record.
    pub fn new(
        store: Arc<BlockStore>,
        pool: Arc<BufferPool>,
        wal: Arc<WalManager>,
        lock_table: Arc<LockTable>,
    ) -> Result<Self> {
        let txnum = next_tx_number();
        let recovery = RecoveryManager::new(wal, Arc::clone(&pool), txnum)?;
        Ok(Self {
            store,
            buffers: BufferList::new(Arc::clone(&pool)),
            pool,
            recovery,
            concurrency: ConcurrencyManager::new(lock_table),
            txnum,
        })
    }

    pub fn txnum(&self) -> i64 {
        self.txnum
    }

    /// Pins `blk` for the duration of the transaction (or until an
    /// explicit unpin). Re-pins are free.
    pub fn pin(&self, blk: &BlockId) -> Result<()> {
        self.buffers.pin(blk)
    }

    pub fn unpin(&self, blk: &BlockId) -> Result<()> {
        self.buffers.unpin(blk)
    }

    /// The pinned buffer for `blk`, if this transaction holds one.
    pub fn buffer(&self, blk: &BlockId) -> Result<BufferHandle> {
        self.buffers
            .handle(blk)
            .ok_or_else(|| StorageError::InvalidArgument(format!("{blk} is not pinned")))
    }

    /// Looks up the cell for `key` under a shared lock.
    pub fn find_cell(&self, blk: &BlockId, key: &[u8]) -> Result<Cell> {
        self.concurrency.s_lock(blk)?;
        self.buffers.pin(blk)?;
        let handle = self.buffer(blk)?;
        let frame = handle.frame().lock();
        frame.contents().find(key).map(|(cell, _)| cell)
    }

    /// Writes `value` under `key` in `blk` under an exclusive lock. A
    /// missing key is inserted; an existing key is updated in place, so
    /// the logged old image lets rollback restore the previous value.
    /// With `ok_to_log` unset the change is applied without a log record
    /// and is invisible to rollback and recovery.
    pub fn insert_cell(
        &self,
        blk: &BlockId,
        key: &[u8],
        value: CellValue,
        ok_to_log: bool,
    ) -> Result<()> {
        self.concurrency.x_lock(blk)?;
        self.buffers.pin(blk)?;
        let handle = self.buffer(blk)?;

        {
            let mut frame = handle.frame().lock();
            match frame.contents().find(key) {
                Ok(_) => {}
                Err(StorageError::KeyNotFound) => {
                    let cell = Cell::new_kv_cell(key.to_vec());
                    match frame.contents_mut().insert(&cell) {
                        Ok(_) => {}
                        // the heap may be clogged with deleted cells
                        Err(StorageError::PageFull { .. }) => {
                            frame.contents_mut().compact()?;
                            frame.contents_mut().insert(&cell)?;
                        }
                        Err(e) => return Err(e),
                    }
                    frame.mark_modified(self.txnum, -1);
                }
                Err(e) => return Err(e),
            }
        }

        if ok_to_log {
            self.recovery.set_cell_value(handle.frame(), key, value)?;
        } else {
            let mut frame = handle.frame().lock();
            let (mut cell, slot) = frame.contents().find(key)?;
            cell.set_value(value)?;
            frame.contents_mut().replace(slot, &cell)?;
            frame.mark_modified(self.txnum, -1);
        }
        Ok(())
    }

    /// File length in blocks, serialized against appends by a shared
    /// lock on the end-of-file sentinel.
    pub fn size(&self, file_name: &str) -> Result<u32> {
        let sentinel = BlockId::new(file_name, END_OF_FILE);
        self.concurrency.s_lock(&sentinel)?;
        self.store.length(file_name)
    }

    /// Appends a fresh block under an exclusive end-of-file lock.
    pub fn append(&self, file_name: &str) -> Result<BlockId> {
        let sentinel = BlockId::new(file_name, END_OF_FILE);
        self.concurrency.x_lock(&sentinel)?;
        self.store.append(file_name)
    }

    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    pub fn available_buffers(&self) -> usize {
        self.pool.available()
    }

    /// Commits: flushes this transaction's buffers, logs and forces the
    /// commit record, then releases locks and unpins. Finalization runs
    /// even when an earlier step fails; all failures are reported
    /// together.
    pub fn commit(self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.recovery.commit() {
            errors.push(e);
        }
        self.finalize(errors)
    }

    /// Rolls back: undoes this transaction's logged updates, logs and
    /// forces the rollback record, then releases locks and unpins.
    pub fn rollback(self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.recovery.rollback(&self) {
            errors.push(e);
        }
        self.finalize(errors)
    }

    /// Restart recovery, to be called on a fresh transaction after
    /// reopening the store: undoes every unfinished transaction, writes
    /// a checkpoint, then releases and unpins.
    pub fn recover(self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.recovery.recover(&self) {
            errors.push(e);
        }
        self.finalize(errors)
    }

    fn finalize(&self, mut errors: Vec<StorageError>) -> Result<()> {
        if let Err(e) = self.concurrency.release() {
            errors.push(e);
        }
        self.buffers.unpin_all();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(StorageError::Aggregate(errors)),
        }
    }

    /// Applies the old cell image from a unified update record. A
    /// value-less old image marks a fresh insert, which is undone by
    /// deleting the cell; otherwise the old image replaces the current
    /// cell (re-inserting it if the crash left the cell missing).
    pub(crate) fn undo_cell_update(
        &self,
        blk: &BlockId,
        key: &[u8],
        old_bytes: &[u8],
    ) -> Result<()> {
        self.buffers.pin(blk)?;
        let handle = self.buffer(blk)?;
        {
            let mut frame = handle.frame().lock();
            let old_cell = Cell::from_bytes(old_bytes)?;
            match frame.contents().find(key) {
                Ok((_, slot)) => {
                    if old_cell.has_value() {
                        frame.contents_mut().replace(slot, &old_cell)?;
                    } else {
                        frame.contents_mut().delete(slot)?;
                    }
                }
                Err(StorageError::KeyNotFound) => {
                    if old_cell.has_value() {
                        match frame.contents_mut().insert(&old_cell) {
                            Ok(_) => {}
                            Err(StorageError::PageFull { .. }) => {
                                frame.contents_mut().compact()?;
                                frame.contents_mut().insert(&old_cell)?;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }
            frame.mark_modified(self.txnum, -1);
        }
        self.buffers.unpin(blk)
    }
}
