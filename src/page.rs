//! An in-memory image of one block with typed, offset-addressed
//! accessors. All multi-byte values are big-endian; byte strings are
//! length-prefixed with a 4-byte length. A single reader-writer lock
//! protects the backing bytes, so pages are safe to share across threads.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, StorageError};

#[derive(Debug)]
struct PageInner {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
pub struct Page {
    inner: RwLock<PageInner>,
}

impl Page {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: RwLock::new(PageInner {
                data: vec![0; block_size],
                dirty: false,
            }),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: RwLock::new(PageInner { data, dirty: false }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.read().data.len()
    }

    fn check_bounds(data: &[u8], offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > data.len()) {
            return Err(StorageError::OutOfBounds {
                offset,
                len,
                size: data.len(),
            });
        }
        Ok(())
    }

    /// Reads a 4-byte big-endian signed integer.
    pub fn get_int(&self, offset: usize) -> Result<i32> {
        let inner = self.inner.read();
        Self::check_bounds(&inner.data, offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&inner.data[offset..offset + 4]);
        Ok(i32::from_be_bytes(buf))
    }

    pub fn set_int(&self, offset: usize, val: i32) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_bounds(&inner.data, offset, 4)?;
        inner.data[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
        inner.dirty = true;
        Ok(())
    }

    /// Reads a single-byte boolean.
    pub fn get_bool(&self, offset: usize) -> Result<bool> {
        let inner = self.inner.read();
        Self::check_bounds(&inner.data, offset, 1)?;
        Ok(inner.data[offset] == 1)
    }

    pub fn set_bool(&self, offset: usize, val: bool) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_bounds(&inner.data, offset, 1)?;
        inner.data[offset] = val as u8;
        inner.dirty = true;
        Ok(())
    }

    /// Reads an 8-byte big-endian Unix-second timestamp.
    pub fn get_date(&self, offset: usize) -> Result<DateTime<Utc>> {
        let inner = self.inner.read();
        Self::check_bounds(&inner.data, offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&inner.data[offset..offset + 8]);
        let secs = i64::from_be_bytes(buf);
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| StorageError::InvalidArgument(format!("timestamp {secs} out of range")))
    }

    pub fn set_date(&self, offset: usize, val: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_bounds(&inner.data, offset, 8)?;
        inner.data[offset..offset + 8].copy_from_slice(&val.timestamp().to_be_bytes());
        inner.dirty = true;
        Ok(())
    }

    /// Reads a length-prefixed byte string, copying it out. Callers never
    /// receive a reference into page-owned bytes.
    pub fn get_bytes(&self, offset: usize) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        Self::check_bounds(&inner.data, offset, 4)?;
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&inner.data[offset..offset + 4]);
        let len = u32::from_be_bytes(len_buf) as usize;
        Self::check_bounds(&inner.data, offset + 4, len)?;
        Ok(inner.data[offset + 4..offset + 4 + len].to_vec())
    }

    pub fn set_bytes(&self, offset: usize, val: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_bounds(&inner.data, offset, 4 + val.len())?;
        inner.data[offset..offset + 4].copy_from_slice(&(val.len() as u32).to_be_bytes());
        inner.data[offset + 4..offset + 4 + val.len()].copy_from_slice(val);
        inner.dirty = true;
        Ok(())
    }

    pub fn get_string(&self, offset: usize) -> Result<String> {
        let bytes = self.get_bytes(offset)?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::InvalidArgument(format!("invalid utf-8 string: {e}")))
    }

    pub fn set_string(&self, offset: usize, val: &str) -> Result<()> {
        self.set_bytes(offset, val.as_bytes())
    }

    /// Snapshot copy of the page contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    pub fn clear_dirty(&self) {
        self.inner.write().dirty = false;
    }

    /// Raw write at an absolute offset, without a length prefix. Used by
    /// the slotted layer to patch bytes it already accounts for.
    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_bounds(&inner.data, offset, bytes.len())?;
        inner.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        inner.dirty = true;
        Ok(())
    }

    /// Shared access to the backing bytes, for block i/o.
    pub(crate) fn with_raw<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.read().data)
    }

    /// Exclusive access to the backing bytes, for block i/o. Does not
    /// touch the dirty flag: a freshly read page is clean.
    pub(crate) fn with_raw_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.write().data)
    }
}
