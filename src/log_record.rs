//! Log records as a tagged sum with a single parse function. Every
//! variant implements the uniform undo contract; only the unified update
//! record actually does work there.
//!
//! Payload encoding (big-endian): op-code (4). Start/Commit/Rollback add
//! the transaction number (8). Checkpoint has no payload. UnifiedUpdate
//! adds txn (8), file-name length (4) + bytes, block number (4), key
//! length (4) + bytes, old length (4) + bytes, new length (4) + bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StorageError};
use crate::store::BlockId;
use crate::transaction::Transaction;
use crate::wal::WalManager;

pub const CHECKPOINT: i32 = 0;
pub const START: i32 = 1;
pub const COMMIT: i32 = 2;
pub const ROLLBACK: i32 = 3;
pub const UNIFIED_UPDATE: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Start {
        txnum: i64,
    },
    Commit {
        txnum: i64,
    },
    Rollback {
        txnum: i64,
    },
    Checkpoint,
    /// The sole data-modifying record: old and new serialized cell
    /// images for one key of one block.
    UnifiedUpdate {
        txnum: i64,
        blk: BlockId,
        key: Vec<u8>,
        old_bytes: Vec<u8>,
        new_bytes: Vec<u8>,
    },
}

impl LogRecord {
    pub fn op(&self) -> i32 {
        match self {
            LogRecord::Start { .. } => START,
            LogRecord::Commit { .. } => COMMIT,
            LogRecord::Rollback { .. } => ROLLBACK,
            LogRecord::Checkpoint => CHECKPOINT,
            LogRecord::UnifiedUpdate { .. } => UNIFIED_UPDATE,
        }
    }

    /// The owning transaction, or -1 for checkpoints.
    pub fn tx_number(&self) -> i64 {
        match self {
            LogRecord::Start { txnum }
            | LogRecord::Commit { txnum }
            | LogRecord::Rollback { txnum }
            | LogRecord::UnifiedUpdate { txnum, .. } => *txnum,
            LogRecord::Checkpoint => -1,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.op());
        match self {
            LogRecord::Start { txnum }
            | LogRecord::Commit { txnum }
            | LogRecord::Rollback { txnum } => {
                buf.put_i64(*txnum);
            }
            LogRecord::Checkpoint => {}
            LogRecord::UnifiedUpdate {
                txnum,
                blk,
                key,
                old_bytes,
                new_bytes,
            } => {
                buf.put_i64(*txnum);
                let file_name = blk.file_name().as_bytes();
                buf.put_u32(file_name.len() as u32);
                buf.put_slice(file_name);
                buf.put_u32(blk.number());
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
                buf.put_u32(old_bytes.len() as u32);
                buf.put_slice(old_bytes);
                buf.put_u32(new_bytes.len() as u32);
                buf.put_slice(new_bytes);
            }
        }
        buf.to_vec()
    }

    /// Parses a record, dispatching on the op-code.
    pub fn from_bytes(data: &[u8]) -> Result<LogRecord> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(StorageError::MalformedRecord("truncated op-code".into()));
        }
        let op = buf.get_i32();
        match op {
            CHECKPOINT => Ok(LogRecord::Checkpoint),
            START | COMMIT | ROLLBACK => {
                if buf.remaining() < 8 {
                    return Err(StorageError::MalformedRecord(
                        "truncated transaction number".into(),
                    ));
                }
                let txnum = buf.get_i64();
                Ok(match op {
                    START => LogRecord::Start { txnum },
                    COMMIT => LogRecord::Commit { txnum },
                    _ => LogRecord::Rollback { txnum },
                })
            }
            UNIFIED_UPDATE => {
                if buf.remaining() < 8 {
                    return Err(StorageError::MalformedRecord(
                        "truncated transaction number".into(),
                    ));
                }
                let txnum = buf.get_i64();
                let file_name_bytes = take_prefixed(&mut buf, "file name")?;
                let file_name = String::from_utf8(file_name_bytes).map_err(|e| {
                    StorageError::MalformedRecord(format!("file name is not utf-8: {e}"))
                })?;
                if buf.remaining() < 4 {
                    return Err(StorageError::MalformedRecord(
                        "truncated block number".into(),
                    ));
                }
                let block_number = buf.get_u32();
                let key = take_prefixed(&mut buf, "key")?;
                let old_bytes = take_prefixed(&mut buf, "old value")?;
                let new_bytes = take_prefixed(&mut buf, "new value")?;
                Ok(LogRecord::UnifiedUpdate {
                    txnum,
                    blk: BlockId::new(file_name, block_number),
                    key,
                    old_bytes,
                    new_bytes,
                })
            }
            other => Err(StorageError::MalformedRecord(format!(
                "unknown op-code {other}"
            ))),
        }
    }

    /// Appends this record to the log and returns its LSN.
    pub fn write_to_log(&self, wal: &WalManager) -> Result<i64> {
        wal.append(&self.to_bytes()).map(|(lsn, _key)| lsn)
    }

    /// Reverses this record's effect against `tx`. Only unified updates
    /// carry undo work; everything else is a no-op.
    pub fn undo(&self, tx: &Transaction) -> Result<()> {
        match self {
            LogRecord::UnifiedUpdate {
                blk,
                key,
                old_bytes,
                ..
            } => tx.undo_cell_update(blk, key, old_bytes),
            _ => Ok(()),
        }
    }
}

fn take_prefixed(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(StorageError::MalformedRecord(format!(
            "truncated {what} length"
        )));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(StorageError::MalformedRecord(format!("truncated {what}")));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}
