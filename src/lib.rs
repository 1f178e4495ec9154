//! # Granite Storage Engine
//! The storage and transaction kernel of a single-node relational
//! database: durable block-oriented storage, an in-memory buffer pool
//! with pluggable replacement, a write-ahead log, block-level two-phase
//! locking, and undo-only restart recovery.
//!
//! The pieces are tied together by the pin/flush/LSN discipline: a
//! transaction pins buffers while it works, every logged change stamps
//! its buffer with the record's LSN, and commit flushes the
//! transaction's dirty buffers before forcing the commit record to disk.

/// The buffer pool and its frames.
pub mod buffer_pool;
/// Cells, the records stored in slotted pages.
pub mod cell;
/// Store configuration.
pub mod config;
/// The crate-wide error type.
pub mod error;
/// Fault injection for tests.
pub mod failpoint;
/// Block-level locking.
pub mod lock_manager;
/// Log records and their undo behavior.
pub mod log_record;
/// Typed page accessors.
pub mod page;
/// Per-transaction recovery.
pub mod recovery;
/// Frame replacement policies.
pub mod replacement;
/// The slotted page layout.
pub mod slotted;
/// Fixed-size block i/o.
pub mod store;
/// The transaction facade.
pub mod transaction;
/// The write-ahead log.
pub mod wal;

use std::sync::Arc;

pub use buffer_pool::{Buffer, BufferHandle, BufferPool};
pub use cell::{Cell, CellValue};
pub use config::StoreConfig;
pub use error::{Result, StorageError};
pub use lock_manager::{ConcurrencyManager, LockKind, LockStatus, LockTable};
pub use log_record::LogRecord;
pub use page::Page;
pub use recovery::RecoveryManager;
pub use replacement::PolicyKind;
pub use slotted::SlottedPage;
pub use store::{BlockId, BlockStore};
pub use transaction::{Transaction, END_OF_FILE};
pub use wal::WalManager;

/// An open store: block store, buffer pool, write-ahead log, and lock
/// table, assembled from a [`StoreConfig`]. Transactions are begun here
/// and share these components.
pub struct Db {
    store: Arc<BlockStore>,
    pool: Arc<BufferPool>,
    wal: Arc<WalManager>,
    lock_table: Arc<LockTable>,
}

impl Db {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(BlockStore::open(&config.directory, config.block_size)?);
        let wal = Arc::new(WalManager::new(Arc::clone(&store), &config.log_file)?);
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&store),
            config.pool_size,
            config.replacement_policy,
        ));
        Ok(Self {
            store,
            pool,
            wal,
            lock_table: Arc::new(LockTable::new()),
        })
    }

    /// Starts a new transaction against this store.
    pub fn begin(&self) -> Result<Transaction> {
        Transaction::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            Arc::clone(&self.wal),
            Arc::clone(&self.lock_table),
        )
    }

    /// Runs restart recovery on a fresh transaction. Call once after
    /// reopening a store that may not have shut down cleanly.
    pub fn recover(&self) -> Result<()> {
        self.begin()?.recover()
    }

    /// Flushes the log and closes the store's file handles. Dirty pages
    /// of transactions that never committed are deliberately not
    /// written.
    pub fn close(&self) -> Result<()> {
        self.wal.flush()?;
        self.store.close();
        Ok(())
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.lock_table
    }

    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    pub fn available_buffers(&self) -> usize {
        self.pool.available()
    }
}
