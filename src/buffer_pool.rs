//! Manages the buffer pool: a fixed set of in-memory frames, each
//! wrapping one slotted page bound to a block. Frame choice is delegated
//! to a replacement policy (LRU or Clock).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StorageError};
use crate::replacement::{Policy, PolicyKind, PoolCtx};
use crate::slotted::SlottedPage;
use crate::store::{BlockId, BlockStore};

/// How long a pin waits for a frame before giving up.
pub const MAX_BUFFER_WAIT: Duration = Duration::from_millis(1000);

pub type FrameRef = Arc<Mutex<Buffer>>;

/// One pool frame: a slotted page plus the pin/dirty/LSN metadata that
/// ties it to the write-ahead log.
#[derive(Debug)]
pub struct Buffer {
    store: Arc<BlockStore>,
    contents: SlottedPage,
    blk: Option<BlockId>,
    pins: u32,
    txnum: i64,
    lsn: i64,
    dirty: bool,
    last_access: u64,
}

impl Buffer {
    fn new(store: Arc<BlockStore>) -> Self {
        let block_size = store.block_size();
        Self {
            store,
            contents: SlottedPage::new(block_size),
            blk: None,
            pins: 0,
            txnum: -1,
            lsn: -1,
            dirty: false,
            last_access: 0,
        }
    }

    pub fn contents(&self) -> &SlottedPage {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut SlottedPage {
        &mut self.contents
    }

    pub fn block(&self) -> Option<&BlockId> {
        self.blk.as_ref()
    }

    /// Records that `txnum` modified this frame. A non-negative `lsn`
    /// updates the frame's last-LSN; pass -1 for unlogged changes.
    pub fn mark_modified(&mut self, txnum: i64, lsn: i64) {
        self.txnum = txnum;
        if lsn >= 0 {
            self.lsn = lsn;
        }
        self.dirty = true;
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }

    pub fn modifying_tx(&self) -> i64 {
        self.txnum
    }

    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access
    }

    pub(crate) fn set_last_access(&mut self, counter: u64) {
        self.last_access = counter;
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    pub(crate) fn unpin(&mut self) -> Result<()> {
        if self.pins == 0 {
            return Err(StorageError::UnpinUnpinned);
        }
        self.pins -= 1;
        Ok(())
    }

    /// Writes the page back to its block when dirty.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(blk) = &self.blk {
                self.store.write(blk, self.contents.page())?;
                self.dirty = false;
                self.txnum = -1;
            }
        }
        Ok(())
    }

    /// Rebinds the frame to `blk`, flushing any dirty contents first. A
    /// block that does not exist on disk yet binds with zero-filled
    /// contents so new pages can be written through the pool.
    pub(crate) fn assign_to_block(&mut self, blk: BlockId) -> Result<()> {
        self.flush()?;
        match self.store.read(&blk, self.contents.page()) {
            Ok(()) => self.contents.reload()?,
            Err(e) if e.is_eof() => self.contents.reset(self.store.block_size()),
            Err(e) => return Err(e),
        }
        self.blk = Some(blk);
        self.pins = 0;
        self.dirty = false;
        self.txnum = -1;
        self.lsn = -1;
        Ok(())
    }
}

/// A pinned frame, addressable by pool index. Cloning the handle does
/// not pin again; the transaction's buffer list owns pin accounting.
#[derive(Clone, Debug)]
pub struct BufferHandle {
    index: usize,
    frame: FrameRef,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }
}

struct PoolState {
    frame_table: HashMap<BlockId, usize>,
    num_available: usize,
    access_counter: u64,
    policy: Policy,
}

pub struct BufferPool {
    store: Arc<BlockStore>,
    frames: Vec<FrameRef>,
    state: Mutex<PoolState>,
    available: Condvar,
    max_wait: Duration,
}

impl BufferPool {
    pub fn new(store: Arc<BlockStore>, pool_size: usize, kind: PolicyKind) -> Self {
        Self::with_max_wait(store, pool_size, kind, MAX_BUFFER_WAIT)
    }

    pub fn with_max_wait(
        store: Arc<BlockStore>,
        pool_size: usize,
        kind: PolicyKind,
        max_wait: Duration,
    ) -> Self {
        let frames = (0..pool_size)
            .map(|_| Arc::new(Mutex::new(Buffer::new(Arc::clone(&store)))))
            .collect();
        Self {
            store,
            frames,
            state: Mutex::new(PoolState {
                frame_table: HashMap::new(),
                num_available: pool_size,
                access_counter: 0,
                policy: Policy::new(kind, pool_size),
            }),
            available: Condvar::new(),
            max_wait,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Pins the frame holding `blk`, binding a frame to it if necessary.
    /// Blocks for up to the pool's wait bound when every frame is pinned,
    /// then fails with a typed timeout.
    pub fn pin(&self, blk: &BlockId) -> Result<BufferHandle> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.state.lock();
        loop {
            let PoolState {
                frame_table,
                num_available,
                access_counter,
                policy,
            } = &mut *state;
            let mut ctx = PoolCtx {
                frames: &self.frames,
                frame_table,
                num_available,
                access_counter,
            };

            if let Some(index) = policy.get(&mut ctx, blk) {
                return Ok(self.handle(index));
            }
            if *ctx.num_available > 0 {
                let index = policy.allocate(&mut ctx, blk)?;
                return Ok(self.handle(index));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::BufferWaitTimeout(self.max_wait));
            }
            // Wakeups are advisory; the loop revalidates.
            self.available.wait_for(&mut state, deadline - now);
        }
    }

    fn handle(&self, index: usize) -> BufferHandle {
        BufferHandle {
            index,
            frame: Arc::clone(&self.frames[index]),
        }
    }

    /// Releases one pin. When the frame becomes unpinned it is returned
    /// to the available set and one waiter is signalled.
    pub fn unpin(&self, handle: &BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mut frame = handle.frame.lock();
        frame.unpin()?;
        if !frame.is_pinned() {
            drop(frame);
            state.num_available += 1;
            self.available.notify_one();
        }
        Ok(())
    }

    /// Current count of unpinned frames, for observability.
    pub fn available(&self) -> usize {
        self.state.lock().num_available
    }

    /// Flushes every frame last modified by `txnum`.
    pub fn flush_all(&self, txnum: i64) -> Result<()> {
        let mut state = self.state.lock();
        let PoolState {
            frame_table,
            num_available,
            access_counter,
            policy,
        } = &mut *state;
        let mut ctx = PoolCtx {
            frames: &self.frames,
            frame_table,
            num_available,
            access_counter,
        };
        policy.flush_all(&mut ctx, txnum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool(dir: &std::path::Path, frames: usize, kind: PolicyKind) -> (Arc<BlockStore>, BufferPool) {
        let store = Arc::new(BlockStore::open(dir, 400).unwrap());
        let pool = BufferPool::new(Arc::clone(&store), frames, kind);
        (store, pool)
    }

    #[test]
    fn pin_of_new_block_binds_zero_filled_frame() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 2, PolicyKind::Lru);
        let blk = store.append("f").unwrap();
        let handle = pool.pin(&blk).unwrap();
        {
            let frame = handle.frame().lock();
            assert_eq!(frame.block(), Some(&blk));
            assert_eq!(frame.contents().cell_count(), 0);
        }
        pool.unpin(&handle).unwrap();
    }

    #[test]
    fn repeated_pin_of_same_block_hits_same_frame() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 2, PolicyKind::Lru);
        let blk = store.append("f").unwrap();

        let a = pool.pin(&blk).unwrap();
        let b = pool.pin(&blk).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(a.frame().lock().pins(), 2);

        pool.unpin(&a).unwrap();
        pool.unpin(&b).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn available_tracks_pins() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 3, PolicyKind::Lru);
        let blk = store.append("f").unwrap();
        assert_eq!(pool.available(), 3);
        let handle = pool.pin(&blk).unwrap();
        assert_eq!(pool.available(), 2);
        pool.unpin(&handle).unwrap();
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn unpin_of_unpinned_frame_is_an_error() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 1, PolicyKind::Lru);
        let blk = store.append("f").unwrap();
        let handle = pool.pin(&blk).unwrap();
        pool.unpin(&handle).unwrap();
        assert!(matches!(
            pool.unpin(&handle),
            Err(StorageError::UnpinUnpinned)
        ));
    }

    #[test]
    fn pin_times_out_when_all_frames_are_pinned() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path(), 400).unwrap());
        let pool = BufferPool::with_max_wait(
            Arc::clone(&store),
            1,
            PolicyKind::Lru,
            Duration::from_millis(150),
        );
        let blk0 = store.append("f").unwrap();
        let blk1 = store.append("f").unwrap();

        let _held = pool.pin(&blk0).unwrap();
        let started = Instant::now();
        let err = pool.pin(&blk1).unwrap_err();
        assert!(matches!(err, StorageError::BufferWaitTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn waiting_pin_succeeds_once_a_frame_frees_up() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path(), 400).unwrap());
        let pool = Arc::new(BufferPool::with_max_wait(
            Arc::clone(&store),
            1,
            PolicyKind::Lru,
            Duration::from_millis(2000),
        ));
        let blk0 = store.append("f").unwrap();
        let blk1 = store.append("f").unwrap();

        let held = pool.pin(&blk0).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.pin(&blk1).map(|h| h.index()))
        };
        std::thread::sleep(Duration::from_millis(100));
        pool.unpin(&held).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn dirty_frame_is_flushed_on_eviction() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 1, PolicyKind::Lru);
        let blk0 = store.append("f").unwrap();
        let blk1 = store.append("f").unwrap();

        let handle = pool.pin(&blk0).unwrap();
        {
            let mut frame = handle.frame().lock();
            frame.contents().page().set_int(80, 99).unwrap();
            frame.mark_modified(7, -1);
        }
        pool.unpin(&handle).unwrap();

        // rebinding the only frame evicts blk0, flushing it
        let other = pool.pin(&blk1).unwrap();
        pool.unpin(&other).unwrap();

        let back = pool.pin(&blk0).unwrap();
        assert_eq!(back.frame().lock().contents().page().get_int(80).unwrap(), 99);
        pool.unpin(&back).unwrap();
    }

    #[test]
    fn flush_all_writes_only_matching_transaction() {
        let dir = tempdir().unwrap();
        let (store, pool) = pool(dir.path(), 2, PolicyKind::Clock);
        let blk0 = store.append("f").unwrap();
        let blk1 = store.append("f").unwrap();

        let a = pool.pin(&blk0).unwrap();
        let b = pool.pin(&blk1).unwrap();
        {
            let mut frame = a.frame().lock();
            frame.contents().page().set_int(40, 1).unwrap();
            frame.mark_modified(1, -1);
        }
        {
            let mut frame = b.frame().lock();
            frame.contents().page().set_int(40, 2).unwrap();
            frame.mark_modified(2, -1);
        }

        pool.flush_all(1).unwrap();
        assert!(!a.frame().lock().is_dirty());
        assert!(b.frame().lock().is_dirty());

        pool.unpin(&a).unwrap();
        pool.unpin(&b).unwrap();
    }
}
