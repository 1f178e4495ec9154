//! The block store: maps (file name, block number) pairs to fixed-size
//! byte blocks on disk, owns the open-file cache, and keeps i/o counters
//! plus a bounded rolling trace of reads and writes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StorageError};

const MAX_TRACE_ENTRIES: usize = 1000;

/// Address of one fixed-size block: a file name plus a block number.
/// Equality and hashing are structural. The file name only ever changes
/// through [`BlockStore::rename`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    file_name: String,
    number: u32,
}

impl BlockId {
    pub fn new(file_name: impl Into<String>, number: u32) -> Self {
        Self {
            file_name: file_name.into(),
            number,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub(crate) fn set_file_name(&mut self, file_name: String) {
        self.file_name = file_name;
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file_name, self.number)
    }
}

/// One entry of the rolling read/write trace.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub blk: BlockId,
    pub bytes: usize,
}

/// Store-level metadata stamped on open and on file renames.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct IoStats {
    blocks_read: u64,
    blocks_written: u64,
    read_trace: VecDeque<TraceEntry>,
    write_trace: VecDeque<TraceEntry>,
}

impl IoStats {
    fn record_read(&mut self, blk: &BlockId, bytes: usize) {
        self.blocks_read += 1;
        push_trace(&mut self.read_trace, blk, bytes);
    }

    fn record_write(&mut self, blk: &BlockId, bytes: usize) {
        self.blocks_written += 1;
        push_trace(&mut self.write_trace, blk, bytes);
    }
}

fn push_trace(trace: &mut VecDeque<TraceEntry>, blk: &BlockId, bytes: usize) {
    if trace.len() >= MAX_TRACE_ENTRIES {
        trace.pop_front();
    }
    trace.push_back(TraceEntry {
        at: Utc::now(),
        blk: blk.clone(),
        bytes,
    });
}

/// Owns the database directory and performs all fixed-size block i/o.
///
/// The outer reader-writer lock gates block reads (shared) against writes,
/// appends, renames and deletes (exclusive). The open-file cache has its
/// own mutex so a cache fill never waits behind in-flight reads.
#[derive(Debug)]
pub struct BlockStore {
    directory: PathBuf,
    block_size: usize,
    is_new: bool,
    open_files: Mutex<HashMap<String, File>>,
    io_lock: RwLock<()>,
    stats: Mutex<IoStats>,
    metadata: Mutex<FileMetadata>,
}

impl BlockStore {
    /// Opens the store rooted at `directory`, creating the directory when
    /// absent (which marks the store new) and removing leftover `.tmp`
    /// files from interrupted runs.
    pub fn open(directory: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(StorageError::InvalidArgument(
                "block size must be positive".to_string(),
            ));
        }
        let directory = directory.as_ref().to_path_buf();

        let is_new = match std::fs::metadata(&directory) {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => {
                return Err(StorageError::InvalidArgument(format!(
                    "path {} exists and is not a directory",
                    directory.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&directory)
                    .map_err(|e| StorageError::io("creating store directory", e))?;
                true
            }
            Err(e) => return Err(StorageError::io("accessing store directory", e)),
        };

        let entries = std::fs::read_dir(&directory)
            .map_err(|e| StorageError::io("listing store directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("listing store directory", e))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
                std::fs::remove_file(&path)
                    .map_err(|e| StorageError::io("removing temporary file", e))?;
            }
        }

        Ok(Self {
            directory,
            block_size,
            is_new,
            open_files: Mutex::new(HashMap::new()),
            io_lock: RwLock::new(()),
            stats: Mutex::new(IoStats::default()),
            metadata: Mutex::new(FileMetadata {
                created_at: Utc::now(),
                modified_at: None,
                last_accessed: None,
            }),
        })
    }

    /// Returns a handle for `file_name`, opening and caching it on first
    /// use. The returned handle shares the cached descriptor.
    fn file(&self, file_name: &str) -> Result<File> {
        if file_name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "file name must not be empty".to_string(),
            ));
        }
        let mut open_files = self.open_files.lock();
        if let Some(f) = open_files.get(file_name) {
            return f
                .try_clone()
                .map_err(|e| StorageError::io("cloning file handle", e));
        }
        let path = self.directory.join(file_name);
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(format!("opening {}", path.display()), e))?;
        let handle = f
            .try_clone()
            .map_err(|e| StorageError::io("cloning file handle", e))?;
        open_files.insert(file_name.to_string(), f);
        Ok(handle)
    }

    /// Reads the block into the page, which must be exactly one block in
    /// size. A short read surfaces as an i/o error whose [`StorageError::is_eof`]
    /// is true.
    pub fn read(&self, blk: &BlockId, page: &crate::page::Page) -> Result<()> {
        let _guard = self.io_lock.read();
        let f = self.file(blk.file_name())?;
        let offset = blk.number() as u64 * self.block_size as u64;
        page.with_raw_mut(|buf| {
            f.read_exact_at(buf, offset)
                .map_err(|e| StorageError::io(format!("reading {blk}"), e))
        })?;
        self.stats.lock().record_read(blk, self.block_size);
        Ok(())
    }

    /// Writes the page to the block and fsyncs the file.
    pub fn write(&self, blk: &BlockId, page: &crate::page::Page) -> Result<()> {
        let _guard = self.io_lock.write();
        let f = self.file(blk.file_name())?;
        let offset = blk.number() as u64 * self.block_size as u64;
        page.with_raw(|buf| {
            f.write_all_at(buf, offset)
                .map_err(|e| StorageError::io(format!("writing {blk}"), e))
        })?;
        f.sync_all()
            .map_err(|e| StorageError::io(format!("syncing {}", blk.file_name()), e))?;
        self.stats.lock().record_write(blk, self.block_size);
        Ok(())
    }

    /// Appends one zeroed block to the file and returns its id.
    pub fn append(&self, file_name: &str) -> Result<BlockId> {
        let _guard = self.io_lock.write();
        let f = self.file(file_name)?;
        let new_blk_num = self.length_of(&f, file_name)?;
        let blk = BlockId::new(file_name, new_blk_num);
        let zeroes = vec![0u8; self.block_size];
        let offset = new_blk_num as u64 * self.block_size as u64;
        f.write_all_at(&zeroes, offset)
            .map_err(|e| StorageError::io(format!("appending {blk}"), e))?;
        f.sync_all()
            .map_err(|e| StorageError::io(format!("syncing {file_name}"), e))?;
        Ok(blk)
    }

    /// Number of whole blocks currently in the file.
    pub fn length(&self, file_name: &str) -> Result<u32> {
        let _guard = self.io_lock.read();
        let f = self.file(file_name)?;
        self.length_of(&f, file_name)
    }

    fn length_of(&self, f: &File, file_name: &str) -> Result<u32> {
        let meta = f
            .metadata()
            .map_err(|e| StorageError::io(format!("statting {file_name}"), e))?;
        Ok((meta.len() / self.block_size as u64) as u32)
    }

    /// Grows the file underlying `blk` to `size` bytes. The size must be
    /// a multiple of the block size; files already at least that large
    /// are left alone.
    pub fn preallocate(&self, blk: &BlockId, size: u64) -> Result<()> {
        if size % self.block_size as u64 != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "preallocation size {size} is not a multiple of block size {}",
                self.block_size
            )));
        }
        let _guard = self.io_lock.write();
        let f = self.file(blk.file_name())?;
        let meta = f
            .metadata()
            .map_err(|e| StorageError::io("statting file for preallocation", e))?;
        if meta.len() >= size {
            return Ok(());
        }
        f.set_len(size)
            .map_err(|e| StorageError::io("preallocating file", e))?;
        f.sync_all()
            .map_err(|e| StorageError::io("syncing preallocated file", e))?;
        Ok(())
    }

    /// Renames the file underlying `blk`, failing if the target exists.
    /// The cached handle is closed, the file renamed and reopened, and
    /// the block id's file name updated in place.
    pub fn rename(&self, blk: &mut BlockId, new_file_name: &str) -> Result<()> {
        if new_file_name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "new file name must not be empty".to_string(),
            ));
        }
        let _guard = self.io_lock.write();

        let old_file_name = blk.file_name().to_string();
        self.open_files.lock().remove(&old_file_name);

        let old_path = self.directory.join(&old_file_name);
        let new_path = self.directory.join(new_file_name);
        if new_path.exists() {
            return Err(StorageError::InvalidArgument(format!(
                "target file already exists: {new_file_name}"
            )));
        }
        std::fs::rename(&old_path, &new_path)
            .map_err(|e| StorageError::io(format!("renaming {old_file_name}"), e))?;

        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&new_path)
            .map_err(|e| StorageError::io("reopening renamed file", e))?;
        self.open_files.lock().insert(new_file_name.to_string(), f);

        blk.set_file_name(new_file_name.to_string());

        let now = Utc::now();
        let mut meta = self.metadata.lock();
        meta.modified_at = Some(now);
        meta.last_accessed = Some(now);
        Ok(())
    }

    /// Closes the cached handle and removes the file.
    pub fn delete(&self, file_name: &str) -> Result<()> {
        let _guard = self.io_lock.write();
        self.open_files.lock().remove(file_name);
        let path = self.directory.join(file_name);
        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(file_name.to_string())
            } else {
                StorageError::io(format!("deleting {file_name}"), e)
            }
        })
    }

    /// Checks that the file's size is a whole number of blocks.
    pub fn validate_file(&self, file_name: &str) -> Result<()> {
        let f = self.file(file_name)?;
        let meta = f
            .metadata()
            .map_err(|e| StorageError::io(format!("statting {file_name}"), e))?;
        if meta.len() % self.block_size as u64 != 0 {
            return Err(StorageError::Corrupted(format!(
                "file {file_name} size {} is not a multiple of block size {}",
                meta.len(),
                self.block_size
            )));
        }
        Ok(())
    }

    /// Closes every cached file handle.
    pub fn close(&self) {
        self.open_files.lock().clear();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether the store directory was created by this open.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn blocks_read(&self) -> u64 {
        self.stats.lock().blocks_read
    }

    pub fn blocks_written(&self) -> u64 {
        self.stats.lock().blocks_written
    }

    pub fn read_trace(&self) -> Vec<TraceEntry> {
        self.stats.lock().read_trace.iter().cloned().collect()
    }

    pub fn write_trace(&self) -> Vec<TraceEntry> {
        self.stats.lock().write_trace.iter().cloned().collect()
    }

    pub fn metadata(&self) -> FileMetadata {
        self.metadata.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use tempfile::tempdir;

    #[test]
    fn open_marks_new_directory_and_cleans_tmp_files() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("db");
        let store = BlockStore::open(&store_dir, 400).unwrap();
        assert!(store.is_new());
        drop(store);

        std::fs::write(store_dir.join("leftover.tmp"), b"junk").unwrap();
        let store = BlockStore::open(&store_dir, 400).unwrap();
        assert!(!store.is_new());
        assert!(!store_dir.join("leftover.tmp").exists());
    }

    #[test]
    fn open_rejects_non_directory_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        std::fs::write(&file_path, b"x").unwrap();
        assert!(matches!(
            BlockStore::open(&file_path, 400),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn write_then_read_round_trips_a_block() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let blk = store.append("data.tbl").unwrap();
        assert_eq!(blk.number(), 0);

        let page = Page::new(400);
        page.set_int(80, 1234).unwrap();
        store.write(&blk, &page).unwrap();

        let read_back = Page::new(400);
        store.read(&blk, &read_back).unwrap();
        assert_eq!(read_back.get_int(80).unwrap(), 1234);
        assert_eq!(store.blocks_read(), 1);
        assert_eq!(store.blocks_written(), 1);
    }

    #[test]
    fn read_of_missing_block_reports_eof() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let page = Page::new(400);
        let err = store.read(&BlockId::new("data.tbl", 7), &page).unwrap_err();
        assert!(err.is_eof());
        // failed reads never bump the counter
        assert_eq!(store.blocks_read(), 0);
    }

    #[test]
    fn append_extends_file_block_by_block() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        assert_eq!(store.append("f").unwrap().number(), 0);
        assert_eq!(store.append("f").unwrap().number(), 1);
        assert_eq!(store.length("f").unwrap(), 2);
    }

    #[test]
    fn preallocate_requires_block_multiple() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let blk = store.append("f").unwrap();
        assert!(matches!(
            store.preallocate(&blk, 999),
            Err(StorageError::InvalidArgument(_))
        ));
        store.preallocate(&blk, 4000).unwrap();
        assert_eq!(store.length("f").unwrap(), 10);
        store.validate_file("f").unwrap();
    }

    #[test]
    fn rename_moves_file_and_updates_block_id() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let mut blk = store.append("old.tbl").unwrap();
        let page = Page::new(400);
        page.set_int(0, 7).unwrap();
        store.write(&blk, &page).unwrap();

        store.rename(&mut blk, "new.tbl").unwrap();
        assert_eq!(blk.file_name(), "new.tbl");
        assert!(store.metadata().modified_at.is_some());

        let read_back = Page::new(400);
        store.read(&blk, &read_back).unwrap();
        assert_eq!(read_back.get_int(0).unwrap(), 7);
    }

    #[test]
    fn rename_refuses_existing_target() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let mut blk = store.append("a").unwrap();
        store.append("b").unwrap();
        assert!(matches!(
            store.rename(&mut blk, "b"),
            Err(StorageError::InvalidArgument(_))
        ));
        assert_eq!(blk.file_name(), "a");
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        store.append("gone").unwrap();
        store.delete("gone").unwrap();
        assert!(matches!(
            store.delete("gone"),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn traces_are_bounded() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        let blk = store.append("f").unwrap();
        let page = Page::new(400);
        for _ in 0..1100 {
            store.read(&blk, &page).unwrap();
        }
        assert_eq!(store.blocks_read(), 1100);
        assert_eq!(store.read_trace().len(), 1000);
    }

    #[test]
    fn empty_file_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 400).unwrap();
        assert!(matches!(
            store.length(""),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
