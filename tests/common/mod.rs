use std::path::Path;

use granite::{Db, PolicyKind, StoreConfig};

/// Initializes test logging once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The standard small-store configuration the scenarios use: 400-byte
/// blocks and a three-frame LRU pool.
pub fn test_config(directory: &Path) -> StoreConfig {
    StoreConfig {
        directory: directory.to_path_buf(),
        block_size: 400,
        pool_size: 3,
        replacement_policy: PolicyKind::Lru,
        log_file: "granite.log".to_string(),
    }
}

pub fn open_db(directory: &Path) -> Db {
    init_logging();
    Db::open(test_config(directory)).unwrap()
}
