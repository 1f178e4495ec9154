use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::replacement::PolicyKind;

/// Everything needed to open a store: directory, block size, pool size,
/// replacement policy, and the name of the write-ahead log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub directory: PathBuf,
    pub block_size: usize,
    pub pool_size: usize,
    pub replacement_policy: PolicyKind,
    pub log_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("granite_db"),
            block_size: 4096,
            pool_size: 8,
            replacement_policy: PolicyKind::Lru,
            log_file: "granite.log".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(StorageError::InvalidArgument(
                "block size must be positive".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(StorageError::InvalidArgument(
                "pool size must be positive".to_string(),
            ));
        }
        if self.log_file.is_empty() {
            return Err(StorageError::InvalidArgument(
                "log file name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_block_size() {
        let config = StoreConfig {
            block_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_keeps_defaults_except_directory() {
        let config = StoreConfig::new("/tmp/granite_test");
        assert_eq!(config.directory, PathBuf::from("/tmp/granite_test"));
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.replacement_policy, PolicyKind::Lru);
    }
}
