//! The write-ahead log: an append-only file of slotted pages. Each log
//! record is the value of one key-value cell whose key is the ASCII
//! prefix `log_` followed by the record's LSN as 8 big-endian bytes, so
//! slot order within a block is LSN order and a reverse walk of the slot
//! directories yields records newest-first.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::cell::{Cell, CellValue};
use crate::error::{Result, StorageError};
use crate::slotted::SlottedPage;
use crate::store::{BlockId, BlockStore};

const LOG_KEY_PREFIX: &[u8] = b"log_";

/// Builds the cell key for a given LSN.
fn log_key(lsn: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOG_KEY_PREFIX.len() + 8);
    key.extend_from_slice(LOG_KEY_PREFIX);
    key.extend_from_slice(&(lsn as u64).to_be_bytes());
    key
}

/// Parses the LSN back out of a log cell key.
fn parse_log_key(key: &[u8]) -> Result<i64> {
    if key.len() != LOG_KEY_PREFIX.len() + 8 || !key.starts_with(LOG_KEY_PREFIX) {
        return Err(StorageError::MalformedRecord(
            "log cell key has the wrong shape".into(),
        ));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[LOG_KEY_PREFIX.len()..]);
    Ok(u64::from_be_bytes(buf) as i64)
}

struct WalInner {
    current_block: BlockId,
    log_page: SlottedPage,
    latest_lsn: i64,
    latest_saved_lsn: i64,
}

/// Serializes log appends, assigns monotonic LSNs, and tracks which LSNs
/// are durable.
pub struct WalManager {
    store: Arc<BlockStore>,
    log_file: String,
    inner: Mutex<WalInner>,
}

impl WalManager {
    /// Opens (or creates) the log file. An empty log gets its first
    /// block; otherwise the tail block becomes the current log page and
    /// the LSN counter resumes from the highest key on record.
    pub fn new(store: Arc<BlockStore>, log_file: &str) -> Result<Self> {
        if log_file.is_empty() {
            return Err(StorageError::InvalidArgument(
                "log file name must not be empty".to_string(),
            ));
        }
        let block_size = store.block_size();
        let log_blocks = store.length(log_file)?;

        let (current_block, log_page, latest_lsn) = if log_blocks == 0 {
            let blk = store.append(log_file)?;
            let page = SlottedPage::new(block_size);
            store.write(&blk, page.page())?;
            (blk, page, 0)
        } else {
            let blk = BlockId::new(log_file, log_blocks - 1);
            let mut page = SlottedPage::new(block_size);
            store.read(&blk, page.page())?;
            page.reload()?;
            let latest = Self::highest_lsn(&store, log_file, &blk, &page)?;
            (blk, page, latest)
        };

        Ok(Self {
            store,
            log_file: log_file.to_string(),
            inner: Mutex::new(WalInner {
                current_block,
                log_page,
                latest_lsn,
                latest_saved_lsn: latest_lsn,
            }),
        })
    }

    /// The highest LSN already on disk: the last slot of the tail block,
    /// or of the nearest earlier non-empty block.
    fn highest_lsn(
        store: &BlockStore,
        log_file: &str,
        tail: &BlockId,
        tail_page: &SlottedPage,
    ) -> Result<i64> {
        if tail_page.cell_count() > 0 {
            let cell = tail_page.get_by_slot(tail_page.cell_count() - 1)?;
            return parse_log_key(cell.key());
        }
        let mut number = tail.number();
        while number > 0 {
            number -= 1;
            let blk = BlockId::new(log_file, number);
            let mut page = SlottedPage::new(store.block_size());
            store.read(&blk, page.page())?;
            page.reload()?;
            if page.cell_count() > 0 {
                let cell = page.get_by_slot(page.cell_count() - 1)?;
                return parse_log_key(cell.key());
            }
        }
        Ok(0)
    }

    /// Appends a record, returning its LSN and the cell key it was filed
    /// under. When the current page is full the page is flushed, a new
    /// block appended, and the insert retried; a record that cannot fit
    /// in an empty block is rejected outright.
    pub fn append(&self, record: &[u8]) -> Result<(i64, Vec<u8>)> {
        if record.is_empty() {
            return Err(StorageError::InvalidArgument(
                "empty log record".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let lsn = inner.latest_lsn + 1;
        let key = log_key(lsn);
        let mut cell = Cell::new_kv_cell(key.clone());
        cell.set_value(CellValue::Bytes(record.to_vec()))?;

        match inner.log_page.insert(&cell) {
            Ok(_) => {}
            Err(StorageError::PageFull { .. }) => {
                Self::flush_inner(&self.store, &mut inner)?;
                let blk = self.store.append(&self.log_file)?;
                inner.log_page.reset(self.store.block_size());
                inner.current_block = blk;
                inner.log_page.insert(&cell).map_err(|e| match e {
                    StorageError::PageFull { .. } => {
                        StorageError::RecordTooLarge(cell.encoded_size())
                    }
                    other => other,
                })?;
            }
            Err(e) => return Err(e),
        }

        inner.latest_lsn = lsn;
        Ok((lsn, key))
    }

    /// Writes the current log page to disk unconditionally and advances
    /// the durable watermark.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::flush_inner(&self.store, &mut inner)
    }

    fn flush_inner(store: &BlockStore, inner: &mut WalInner) -> Result<()> {
        store.write(&inner.current_block, inner.log_page.page())?;
        inner.latest_saved_lsn = inner.latest_lsn;
        Ok(())
    }

    /// Ensures every record with LSN ≤ `lsn` is durable.
    pub fn flush_lsn(&self, lsn: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if lsn >= inner.latest_saved_lsn {
            Self::flush_inner(&self.store, &mut inner)?;
        }
        Ok(())
    }

    /// Fire-and-forget flush on a helper thread. The handle can be
    /// joined for the result or dropped.
    pub fn flush_async(self: &Arc<Self>) -> thread::JoinHandle<Result<()>> {
        let wal = Arc::clone(self);
        thread::spawn(move || wal.flush())
    }

    pub fn latest_lsn(&self) -> i64 {
        self.inner.lock().latest_lsn
    }

    pub fn latest_saved_lsn(&self) -> i64 {
        self.inner.lock().latest_saved_lsn
    }

    /// The block currently receiving appends.
    pub fn current_block(&self) -> BlockId {
        self.inner.lock().current_block.clone()
    }

    /// Flushes, then returns a newest-first iterator over record bytes.
    pub fn iterator(&self) -> Result<WalIterator> {
        self.flush()?;
        let start = self.current_block();
        WalIterator::new(Arc::clone(&self.store), start)
    }
}

/// Walks the log backward: each block's slot directory from the highest
/// slot down to zero, then the previous block, until block zero's slot
/// zero has been consumed.
pub struct WalIterator {
    store: Arc<BlockStore>,
    blk: BlockId,
    page: SlottedPage,
    next_slot: Option<usize>,
}

impl WalIterator {
    fn new(store: Arc<BlockStore>, start: BlockId) -> Result<Self> {
        let mut page = SlottedPage::new(store.block_size());
        store.read(&start, page.page())?;
        page.reload()?;
        let next_slot = page.cell_count().checked_sub(1);
        Ok(Self {
            store,
            blk: start,
            page,
            next_slot,
        })
    }

    fn move_to_previous_block(&mut self) -> Result<bool> {
        if self.blk.number() == 0 {
            return Ok(false);
        }
        self.blk = BlockId::new(self.blk.file_name(), self.blk.number() - 1);
        self.store.read(&self.blk, self.page.page())?;
        self.page.reload()?;
        self.next_slot = self.page.cell_count().checked_sub(1);
        Ok(true)
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.next_slot {
                Some(slot) => {
                    let cell = self.page.get_by_slot(slot)?;
                    self.next_slot = slot.checked_sub(1);
                    match cell.value() {
                        Some(CellValue::Bytes(record)) => return Ok(Some(record.clone())),
                        _ => {
                            return Err(StorageError::MalformedRecord(
                                "log cell does not hold a byte value".into(),
                            ))
                        }
                    }
                }
                None => {
                    if !self.move_to_previous_block()? {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Iterator for WalIterator {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
