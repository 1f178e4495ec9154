//! Per-transaction recovery: emits the transaction's lifecycle records,
//! performs logged cell updates, and drives the undo scans for rollback
//! and restart.
//!
//! Commit discipline: a committing transaction's dirty buffers are
//! flushed before its commit record is appended and the log forced.
//! Because no transaction commits without its pages on disk, restart
//! recovery needs no redo pass; it only undoes what unfinished
//! transactions left behind.

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;

use crate::buffer_pool::{BufferPool, FrameRef};
use crate::cell::CellValue;
use crate::error::{Result, StorageError};
use crate::failpoint;
use crate::log_record::LogRecord;
use crate::transaction::Transaction;
use crate::wal::WalManager;

pub struct RecoveryManager {
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    txnum: i64,
}

impl RecoveryManager {
    /// Creates the manager for one transaction, writing its start record.
    pub fn new(wal: Arc<WalManager>, pool: Arc<BufferPool>, txnum: i64) -> Result<Self> {
        LogRecord::Start { txnum }.write_to_log(&wal)?;
        Ok(Self { wal, pool, txnum })
    }

    /// Flushes this transaction's dirty buffers, writes the commit
    /// record, and forces the log up to it.
    pub fn commit(&self) -> Result<()> {
        failpoint::maybe_fail("recovery.commit.before_flush")?;
        self.pool.flush_all(self.txnum)?;
        failpoint::maybe_fail("recovery.commit.before_log")?;
        let lsn = LogRecord::Commit { txnum: self.txnum }.write_to_log(&self.wal)?;
        self.wal.flush_lsn(lsn)
    }

    /// Undoes this transaction's updates, then flushes, writes the
    /// rollback record, and forces the log.
    pub fn rollback(&self, tx: &Transaction) -> Result<()> {
        self.undo_scan(tx)?;
        self.pool.flush_all(self.txnum)?;
        let lsn = LogRecord::Rollback { txnum: self.txnum }.write_to_log(&self.wal)?;
        self.wal.flush_lsn(lsn)
    }

    /// Restart recovery: undoes every unfinished transaction back to the
    /// last checkpoint, then flushes and writes a fresh checkpoint.
    pub fn recover(&self, tx: &Transaction) -> Result<()> {
        self.recovery_scan(tx)?;
        self.pool.flush_all(self.txnum)?;
        let lsn = LogRecord::Checkpoint.write_to_log(&self.wal)?;
        self.wal.flush_lsn(lsn)
    }

    /// Updates the cell for `key` in the pinned buffer, logging old and
    /// new serialized images, and returns the record's LSN.
    pub fn set_cell_value(&self, frame: &FrameRef, key: &[u8], value: CellValue) -> Result<i64> {
        let mut buffer = frame.lock();
        let blk = buffer
            .block()
            .cloned()
            .ok_or_else(|| StorageError::InvalidArgument("buffer is not bound to a block".into()))?;

        let (mut cell, slot) = buffer.contents().find(key)?;
        let old_bytes = cell.to_bytes();
        cell.set_value(value)?;
        let new_bytes = cell.to_bytes();
        buffer.contents_mut().replace(slot, &cell)?;

        let lsn = LogRecord::UnifiedUpdate {
            txnum: self.txnum,
            blk,
            key: key.to_vec(),
            old_bytes,
            new_bytes,
        }
        .write_to_log(&self.wal)?;
        buffer.mark_modified(self.txnum, lsn);
        Ok(lsn)
    }

    /// Walks the log newest-first, undoing this transaction's records
    /// until its start record. Broken records are logged and skipped so
    /// one bad record cannot halt rollback of the rest.
    fn undo_scan(&self, tx: &Transaction) -> Result<()> {
        for item in self.wal.iterator()? {
            let bytes = item?;
            let record = match LogRecord::from_bytes(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!("rollback of tx {}: skipping unreadable record: {e}", self.txnum);
                    continue;
                }
            };
            if record.tx_number() != self.txnum {
                continue;
            }
            if matches!(record, LogRecord::Start { .. }) {
                return Ok(());
            }
            if let Err(e) = record.undo(tx) {
                warn!("rollback of tx {}: undo failed, skipping: {e}", self.txnum);
            }
        }
        Ok(())
    }

    /// Walks the log newest-first down to the last checkpoint, undoing
    /// every record of a transaction not seen to commit or roll back.
    fn recovery_scan(&self, tx: &Transaction) -> Result<()> {
        let mut finished: HashSet<i64> = HashSet::new();
        for item in self.wal.iterator()? {
            let bytes = item?;
            let record = match LogRecord::from_bytes(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!("recovery: skipping unreadable record: {e}");
                    continue;
                }
            };
            match record {
                LogRecord::Checkpoint => return Ok(()),
                LogRecord::Commit { txnum } | LogRecord::Rollback { txnum } => {
                    finished.insert(txnum);
                }
                _ => {
                    if !finished.contains(&record.tx_number()) {
                        if let Err(e) = record.undo(tx) {
                            warn!(
                                "recovery: undo failed for tx {}, skipping: {e}",
                                record.tx_number()
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn txnum(&self) -> i64 {
        self.txnum
    }
}
