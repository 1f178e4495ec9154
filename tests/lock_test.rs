use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use granite::{BlockId, ConcurrencyManager, LockStatus, LockTable, StorageError};
use serial_test::serial;

mod common;

#[test]
#[serial]
fn readers_share_while_writer_waits_its_turn() {
    common::init_logging();
    let table = Arc::new(LockTable::new());
    let blk = BlockId::new("f", 0);
    let writer_acquired = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let table = Arc::clone(&table);
        let blk = blk.clone();
        let writer_acquired = Arc::clone(&writer_acquired);
        readers.push(thread::spawn(move || {
            let cm = ConcurrencyManager::new(table);
            cm.s_lock(&blk).unwrap();
            thread::sleep(Duration::from_millis(100));
            // the writer cannot hold exclusivity while we hold a share
            assert!(!writer_acquired.load(Ordering::SeqCst));
            cm.release().unwrap();
        }));
    }

    // give the readers a head start
    thread::sleep(Duration::from_millis(20));
    let writer = {
        let table = Arc::clone(&table);
        let blk = blk.clone();
        let writer_acquired = Arc::clone(&writer_acquired);
        thread::spawn(move || {
            let cm = ConcurrencyManager::new(table);
            cm.x_lock(&blk).unwrap();
            writer_acquired.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            cm.release().unwrap();
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
    assert!(writer_acquired.load(Ordering::SeqCst));
    assert_eq!(table.info(&blk), LockStatus::Unlocked);
}

#[test]
fn s_lock_times_out_against_a_long_exclusive_holder() {
    let table = Arc::new(LockTable::with_max_wait(Duration::from_millis(300)));
    let blk = BlockId::new("f", 1);
    table.x_lock(&blk).unwrap();

    let started = Instant::now();
    let result = {
        let table = Arc::clone(&table);
        let blk = blk.clone();
        thread::spawn(move || table.s_lock(&blk)).join().unwrap()
    };
    assert!(matches!(result, Err(StorageError::LockTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));
    table.unlock(&blk).unwrap();
}

#[test]
fn releasing_the_last_shared_holder_admits_the_writer() {
    let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(5)));
    let blk = BlockId::new("f", 2);
    for _ in 0..3 {
        table.s_lock(&blk).unwrap();
    }

    // the writer takes its own share first, then upgrades; the upgrade
    // can only run once the three readers are gone
    let writer = {
        let table = Arc::clone(&table);
        let blk = blk.clone();
        thread::spawn(move || {
            let cm = ConcurrencyManager::new(table);
            cm.x_lock(&blk)?;
            Ok::<ConcurrencyManager, StorageError>(cm)
        })
    };

    thread::sleep(Duration::from_millis(50));
    table.unlock(&blk).unwrap();
    table.unlock(&blk).unwrap();
    thread::sleep(Duration::from_millis(50));
    table.unlock(&blk).unwrap();

    let cm = writer.join().unwrap().unwrap();
    assert_eq!(table.info(&blk), LockStatus::Exclusive);
    cm.release().unwrap();
    assert_eq!(table.info(&blk), LockStatus::Unlocked);
}

#[test]
fn two_transactions_cannot_both_hold_exclusive() {
    let table = Arc::new(LockTable::with_max_wait(Duration::from_millis(200)));
    let blk = BlockId::new("f", 3);

    let cm1 = ConcurrencyManager::new(Arc::clone(&table));
    let cm2 = ConcurrencyManager::new(Arc::clone(&table));

    cm1.x_lock(&blk).unwrap();
    assert!(matches!(
        cm2.x_lock(&blk),
        Err(StorageError::LockTimeout(_))
    ));

    cm1.release().unwrap();
    cm2.x_lock(&blk).unwrap();
    cm2.release().unwrap();
}

#[test]
fn reader_ledgers_stack_on_one_block() {
    let table = Arc::new(LockTable::new());
    let cms: Vec<ConcurrencyManager> = (0..4)
        .map(|_| ConcurrencyManager::new(Arc::clone(&table)))
        .collect();
    let blk = BlockId::new("f", 4);

    for cm in &cms {
        cm.s_lock(&blk).unwrap();
    }
    assert_eq!(table.info(&blk), LockStatus::Shared(4));
    for cm in &cms {
        cm.release().unwrap();
    }
    assert_eq!(table.info(&blk), LockStatus::Unlocked);
}
