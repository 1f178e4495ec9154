//! Cell-oriented page layout: a fixed 24-byte header, a slot directory
//! growing forward from the header, and a cell heap growing backward
//! from the page end. Slots are kept sorted by cell key so lookups are
//! binary searches.
//!
//! On-disk layout (all big-endian):
//!   0..4   page size
//!   4..8   header size
//!   8..12  cell count
//!   12..16 free-space pointer
//!   16..24 reserved
//!   24..   slot directory, 4-byte offsets in key order
//!   ...    cell heap packed from the page end toward the header

use std::cmp::Ordering;

use crate::cell::Cell;
use crate::error::{Result, StorageError};
use crate::page::Page;

const PAGE_SIZE_OFFSET: usize = 0;
const HEADER_SIZE_OFFSET: usize = 4;
const CELL_COUNT_OFFSET: usize = 8;
const FREE_SPACE_OFFSET: usize = 12;

/// Fixed header size, including the reserved tail.
pub const PAGE_HEADER_SIZE: usize = 24;
/// Size of one slot directory entry.
pub const SLOT_ENTRY_SIZE: usize = 4;
/// Every cell is written through the page's length-prefixed byte setter,
/// which costs four extra bytes ahead of the cell image.
const CELL_LENGTH_PREFIX: usize = 4;

#[derive(Debug)]
pub struct SlottedPage {
    page: Page,
    cell_count: usize,
    free_space: usize,
    slots: Vec<u32>,
}

impl SlottedPage {
    /// A fresh, empty slotted page of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        let mut sp = Self {
            page: Page::new(block_size),
            cell_count: 0,
            free_space: block_size,
            slots: Vec::new(),
        };
        sp.write_header();
        sp.page.clear_dirty();
        sp
    }

    /// Wraps an existing page image, parsing its header and slot
    /// directory. A zeroed image (a freshly appended block) is formatted
    /// as an empty slotted page.
    pub fn from_page(page: Page) -> Result<Self> {
        let mut sp = Self {
            cell_count: 0,
            free_space: page.size(),
            slots: Vec::new(),
            page,
        };
        sp.reload()?;
        Ok(sp)
    }

    /// Re-parses header and slot directory from the backing bytes after
    /// they have been overwritten by a block read.
    pub fn reload(&mut self) -> Result<()> {
        let size = self.page.size();
        let stored_size = self.page.get_int(PAGE_SIZE_OFFSET)? as usize;
        if stored_size != size {
            // Unformatted block: lay down a fresh header.
            self.cell_count = 0;
            self.free_space = size;
            self.slots.clear();
            self.write_header();
            self.page.clear_dirty();
            return Ok(());
        }

        let header_size = self.page.get_int(HEADER_SIZE_OFFSET)? as usize;
        let cell_count = self.page.get_int(CELL_COUNT_OFFSET)? as usize;
        let free_space = self.page.get_int(FREE_SPACE_OFFSET)? as usize;

        if header_size != PAGE_HEADER_SIZE {
            return Err(StorageError::Corrupted(format!(
                "unexpected header size {header_size}"
            )));
        }
        if free_space > size || free_space < PAGE_HEADER_SIZE {
            return Err(StorageError::Corrupted(format!(
                "free-space pointer {free_space} outside page of {size} bytes"
            )));
        }
        if PAGE_HEADER_SIZE + cell_count * SLOT_ENTRY_SIZE > free_space {
            return Err(StorageError::Corrupted(format!(
                "slot directory of {cell_count} entries overlaps the cell heap"
            )));
        }

        let mut slots = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            let offset = self
                .page
                .get_int(PAGE_HEADER_SIZE + i * SLOT_ENTRY_SIZE)? as u32;
            if (offset as usize) < free_space || offset as usize >= size {
                return Err(StorageError::Corrupted(format!(
                    "slot {i} points at {offset}, outside the cell heap"
                )));
            }
            slots.push(offset);
        }

        self.cell_count = cell_count;
        self.free_space = free_space;
        self.slots = slots;
        self.page.clear_dirty();
        Ok(())
    }

    /// Re-initializes this view over a zeroed page of `block_size` bytes.
    pub fn reset(&mut self, block_size: usize) {
        self.page = Page::new(block_size);
        self.cell_count = 0;
        self.free_space = block_size;
        self.slots.clear();
        self.write_header();
        self.page.clear_dirty();
    }

    fn write_header(&self) {
        let size = self.page.size() as i32;
        // The header region always fits; these cannot fail on a page of
        // at least PAGE_HEADER_SIZE bytes.
        let _ = self.page.set_int(PAGE_SIZE_OFFSET, size);
        let _ = self
            .page
            .set_int(HEADER_SIZE_OFFSET, PAGE_HEADER_SIZE as i32);
        let _ = self.page.set_int(CELL_COUNT_OFFSET, self.cell_count as i32);
        let _ = self.page.set_int(FREE_SPACE_OFFSET, self.free_space as i32);
    }

    fn write_slot_directory_from(&self, start: usize) -> Result<()> {
        for i in start..self.slots.len() {
            self.page.set_int(
                PAGE_HEADER_SIZE + i * SLOT_ENTRY_SIZE,
                self.slots[i] as i32,
            )?;
        }
        Ok(())
    }

    /// Binary search over the slot directory. `Ok(i)` is an exact match
    /// at slot `i`; `Err(i)` is the insertion index for a missing key.
    fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut low = 0usize;
        let mut high = self.slots.len();
        while low < high {
            let mid = (low + high) / 2;
            let cell = self.cell_at_offset(self.slots[mid])?;
            match key.cmp(cell.key()) {
                Ordering::Equal => return Ok(Ok(mid)),
                Ordering::Less => high = mid,
                Ordering::Greater => low = mid + 1,
            }
        }
        Ok(Err(low))
    }

    fn cell_at_offset(&self, offset: u32) -> Result<Cell> {
        let bytes = self.page.get_bytes(offset as usize)?;
        Cell::from_bytes(&bytes)
    }

    /// Inserts a cell in key order, returning its slot index. Fails with
    /// a typed page-full error when the heap and directory would collide,
    /// and with a duplicate-key error when the key is already present.
    pub fn insert(&mut self, cell: &Cell) -> Result<usize> {
        let cell_bytes = cell.to_bytes();
        let needed = cell_bytes.len() + CELL_LENGTH_PREFIX;
        let directory_end = PAGE_HEADER_SIZE + (self.slots.len() + 1) * SLOT_ENTRY_SIZE;

        let new_offset = match self.free_space.checked_sub(needed) {
            Some(offset) if offset >= directory_end => offset,
            _ => {
                return Err(StorageError::PageFull {
                    needed,
                    available: self.free_space.saturating_sub(directory_end),
                })
            }
        };

        let position = match self.search(cell.key())? {
            Ok(_) => return Err(StorageError::DuplicateKey),
            Err(position) => position,
        };

        self.page.set_bytes(new_offset, &cell_bytes)?;
        self.slots.insert(position, new_offset as u32);
        self.cell_count += 1;
        self.free_space = new_offset;

        self.write_header();
        self.write_slot_directory_from(position)?;
        Ok(position)
    }

    /// Binary search for a cell by key.
    pub fn find(&self, key: &[u8]) -> Result<(Cell, usize)> {
        match self.search(key)? {
            Ok(slot) => Ok((self.cell_at_offset(self.slots[slot])?, slot)),
            Err(_) => Err(StorageError::KeyNotFound),
        }
    }

    /// O(1) access through the slot directory.
    pub fn get_by_slot(&self, slot: usize) -> Result<Cell> {
        let offset = *self
            .slots
            .get(slot)
            .ok_or(StorageError::InvalidSlot(slot))?;
        self.cell_at_offset(offset)
    }

    /// Marks the referenced cell deleted and removes its slot entry. The
    /// cell bytes stay in the heap until [`SlottedPage::compact`] runs.
    pub fn delete(&mut self, slot: usize) -> Result<()> {
        let offset = *self
            .slots
            .get(slot)
            .ok_or(StorageError::InvalidSlot(slot))? as usize;

        let mut cell = self.cell_at_offset(offset as u32)?;
        cell.mark_deleted();
        self.page
            .write_at(offset + CELL_LENGTH_PREFIX, &[cell.flag_byte()])?;

        self.slots.remove(slot);
        self.cell_count -= 1;
        self.write_header();
        self.write_slot_directory_from(slot)?;
        // Clear the stale trailing directory entry.
        self.page
            .set_int(PAGE_HEADER_SIZE + self.slots.len() * SLOT_ENTRY_SIZE, 0)?;
        Ok(())
    }

    /// Replaces the cell at `slot` with `cell` (same key, new payload).
    /// Same-size images are patched in place; otherwise the old cell is
    /// deleted and the new one inserted, compacting first if the heap is
    /// too fragmented to take it.
    pub fn replace(&mut self, slot: usize, cell: &Cell) -> Result<usize> {
        let offset = *self
            .slots
            .get(slot)
            .ok_or(StorageError::InvalidSlot(slot))? as usize;
        let existing = self.page.get_bytes(offset)?;
        let image = cell.to_bytes();
        if image.len() == existing.len() {
            self.page.set_bytes(offset, &image)?;
            return Ok(slot);
        }

        self.delete(slot)?;
        match self.insert(cell) {
            Ok(new_slot) => Ok(new_slot),
            Err(StorageError::PageFull { .. }) => {
                self.compact()?;
                self.insert(cell)
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuilds the page from scratch, re-inserting every live cell in
    /// key order and dropping deleted cell bytes from the heap.
    pub fn compact(&mut self) -> Result<()> {
        let mut fresh = SlottedPage::new(self.page.size());
        for &offset in &self.slots {
            let cell = self.cell_at_offset(offset)?;
            if !cell.is_deleted() {
                fresh.insert(&cell)?;
            }
        }
        self.page = fresh.page;
        self.cell_count = fresh.cell_count;
        self.free_space = fresh.free_space;
        self.slots = fresh.slots;
        Ok(())
    }

    /// Snapshot of the slot offsets.
    pub fn all_slots(&self) -> Vec<u32> {
        self.slots.clone()
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn free_space(&self) -> usize {
        self.free_space
    }

    /// The raw page beneath this view.
    pub fn page(&self) -> &Page {
        &self.page
    }
}
