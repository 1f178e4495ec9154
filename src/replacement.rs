//! Pluggable frame replacement: classic LRU over an index-linked list,
//! and Clock (second chance) over a circular sweep. The pool holds one
//! policy value for its lifetime and funnels frame choice through it.

use serde::{Deserialize, Serialize};

use crate::buffer_pool::FrameRef;
use crate::error::{Result, StorageError};
use crate::store::BlockId;

/// Which replacement policy a pool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    Lru,
    Clock,
}

/// Borrowed view of the pool internals a policy operates on. Frames are
/// addressed by stable indices; the policy never owns a frame.
pub(crate) struct PoolCtx<'a> {
    pub frames: &'a [FrameRef],
    pub frame_table: &'a mut std::collections::HashMap<BlockId, usize>,
    pub num_available: &'a mut usize,
    pub access_counter: &'a mut u64,
}

pub(crate) enum Policy {
    Lru(LruList),
    Clock(ClockSweep),
}

impl Policy {
    pub fn new(kind: PolicyKind, capacity: usize) -> Self {
        match kind {
            PolicyKind::Lru => Policy::Lru(LruList::new(capacity)),
            PolicyKind::Clock => Policy::Clock(ClockSweep::new(capacity)),
        }
    }

    /// Returns the frame bound to `blk`, pinned and access-stamped, or
    /// `None` when the block is not resident.
    pub fn get(&mut self, ctx: &mut PoolCtx<'_>, blk: &BlockId) -> Option<usize> {
        let index = *ctx.frame_table.get(blk)?;
        {
            let mut frame = ctx.frames[index].lock();
            if !frame.is_pinned() {
                *ctx.num_available -= 1;
            }
            frame.pin();
            *ctx.access_counter += 1;
            frame.set_last_access(*ctx.access_counter);
        }
        self.note_hit(index);
        Some(index)
    }

    /// Binds a free or evictable frame to `blk`, pinned. The caller has
    /// already verified that an unpinned frame exists.
    pub fn allocate(&mut self, ctx: &mut PoolCtx<'_>, blk: &BlockId) -> Result<usize> {
        let index = match self.free_frame(ctx) {
            Some(index) => index,
            None => self.evict(ctx)?,
        };
        {
            let mut frame = ctx.frames[index].lock();
            if let Some(old) = frame.block() {
                ctx.frame_table.remove(&old.clone());
            }
            frame.assign_to_block(blk.clone())?;
            frame.pin();
            *ctx.access_counter += 1;
            frame.set_last_access(*ctx.access_counter);
        }
        *ctx.num_available -= 1;
        ctx.frame_table.insert(blk.clone(), index);
        self.note_assigned(index);
        Ok(index)
    }

    /// Chooses a victim among the unpinned frames, flushing it if dirty.
    pub fn evict(&mut self, ctx: &mut PoolCtx<'_>) -> Result<usize> {
        let index = match self {
            Policy::Lru(lru) => lru.evict(ctx.frames)?,
            Policy::Clock(clock) => clock.evict(ctx.frames)?,
        };
        ctx.frames[index].lock().flush()?;
        Ok(index)
    }

    /// Flushes every frame whose last modifying transaction is `txnum`.
    pub fn flush_all(&mut self, ctx: &mut PoolCtx<'_>, txnum: i64) -> Result<()> {
        for frame in ctx.frames {
            let mut frame = frame.lock();
            if frame.modifying_tx() == txnum {
                frame.flush()?;
            }
        }
        Ok(())
    }

    fn free_frame(&self, ctx: &PoolCtx<'_>) -> Option<usize> {
        ctx.frames
            .iter()
            .position(|frame| frame.lock().block().is_none())
    }

    fn note_hit(&mut self, index: usize) {
        match self {
            Policy::Lru(lru) => lru.move_to_head(index),
            Policy::Clock(clock) => clock.referenced[index] = true,
        }
    }

    fn note_assigned(&mut self, index: usize) {
        match self {
            Policy::Lru(lru) => lru.move_to_head(index),
            Policy::Clock(clock) => clock.referenced[index] = true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    in_list: bool,
}

/// Doubly linked recency list over frame indices. Head is most recently
/// used; eviction scans from the tail.
pub(crate) struct LruList {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruList {
    fn new(capacity: usize) -> Self {
        Self {
            links: vec![Link::default(); capacity],
            head: None,
            tail: None,
        }
    }

    fn unlink(&mut self, index: usize) {
        let Link { prev, next, .. } = self.links[index];
        if let Some(prev) = prev {
            self.links[prev].next = next;
        } else {
            self.head = next;
        }
        if let Some(next) = next {
            self.links[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.links[index] = Link::default();
    }

    fn move_to_head(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        if self.links[index].in_list {
            self.unlink(index);
        }
        self.links[index] = Link {
            prev: None,
            next: self.head,
            in_list: true,
        };
        if let Some(old_head) = self.head {
            self.links[old_head].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    /// Walks from the tail toward the head, skipping pinned frames, and
    /// unlinks the first unpinned one.
    fn evict(&mut self, frames: &[FrameRef]) -> Result<usize> {
        let mut current = self.tail;
        while let Some(index) = current {
            if frames[index].lock().is_pinned() {
                current = self.links[index].prev;
                continue;
            }
            self.unlink(index);
            return Ok(index);
        }
        Err(StorageError::NoUnpinnedBuffers)
    }
}

/// Second-chance sweep: a reference bit per frame and an advancing hand.
pub(crate) struct ClockSweep {
    referenced: Vec<bool>,
    hand: usize,
}

impl ClockSweep {
    fn new(capacity: usize) -> Self {
        Self {
            referenced: vec![false; capacity],
            hand: 0,
        }
    }

    /// At most two full passes: the first clears second-chance bits, the
    /// second picks the victim.
    fn evict(&mut self, frames: &[FrameRef]) -> Result<usize> {
        let capacity = frames.len();
        if capacity == 0 {
            return Err(StorageError::NoUnpinnedBuffers);
        }
        for _ in 0..capacity * 2 {
            let index = self.hand;
            self.hand = (self.hand + 1) % capacity;

            if frames[index].lock().is_pinned() {
                continue;
            }
            if self.referenced[index] {
                self.referenced[index] = false;
                continue;
            }
            return Ok(index);
        }
        Err(StorageError::NoUnpinnedBuffers)
    }
}
