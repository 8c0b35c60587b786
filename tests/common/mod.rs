use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;

use garnetdb::storage::buffer::BufferPoolManager;
use garnetdb::transaction::{
    LockManager, LockManagerConfig, TransactionManager, TransactionRegistry,
};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager over a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Lock manager plus transaction manager over a shared registry. Tests that
// drive the deadlock detector by hand pass `run_detector = false` and call
// `detect_once` themselves.
#[allow(dead_code)]
pub fn create_lock_fixture(run_detector: bool) -> (Arc<TransactionManager>, Arc<LockManager>) {
    let registry = TransactionRegistry::new();
    let lock_manager = Arc::new(LockManager::with_config(
        registry.clone(),
        LockManagerConfig {
            run_detector,
            ..LockManagerConfig::default()
        },
    ));
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone(), registry));
    (txn_manager, lock_manager)
}
