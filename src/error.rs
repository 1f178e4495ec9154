use std::time::Duration;

use thiserror::Error;

use crate::store::BlockId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Every failure the storage kernel can surface to a caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {offset} + {len} bytes is out of bounds for a page of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("page full: need {needed} bytes but only {available} are usable")]
    PageFull { needed: usize, available: usize },

    #[error("duplicate key")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("invalid slot index {0}")]
    InvalidSlot(usize),

    #[error("malformed cell: {0}")]
    MalformedCell(String),

    #[error("malformed log record: {0}")]
    MalformedRecord(String),

    #[error("corrupted page: {0}")]
    Corrupted(String),

    #[error("log record of {0} bytes does not fit in a freshly appended log block")]
    RecordTooLarge(usize),

    #[error("lock acquisition timed out for {0}")]
    LockTimeout(BlockId),

    #[error("block {0} is not locked")]
    LockNotHeld(BlockId),

    #[error("no buffer became available within {0:?}")]
    BufferWaitTimeout(Duration),

    #[error("no unpinned buffers available for eviction")]
    NoUnpinnedBuffers,

    #[error("buffer is not pinned")]
    UnpinUnpinned,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("multiple failures during finalization: {0:?}")]
    Aggregate(Vec<StorageError>),
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the underlying i/o failure was an unexpected end of file,
    /// i.e. the block does not exist on disk yet.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            StorageError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}
